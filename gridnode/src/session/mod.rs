/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Node sessions with the master registry and its replicas.
//!
//! Each registry gets its own [`SessionKeepAlive`] loop. When the master
//! session is established before the node is activated, sessions with
//! every replica are opened first so that replicas know the node's
//! servers before clients can reach it. Once activated, every new
//! master session synchronizes the node's servers with the registry.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;

use crate::node::Node;
use crate::platform::LoadInfo;
use crate::registry::Identity;
use crate::registry::InternalRegistry;
use crate::registry::NodeSession;
use crate::registry::Query;
use crate::registry::RegistryError;

mod keepalive;

pub use keepalive::KeepAliveState;
pub use keepalive::SessionDriver;
pub use keepalive::SessionKeepAlive;

type KeepAlive = SessionKeepAlive<NodeSessionDriver>;

/// Drives the node's session with one registry.
pub struct NodeSessionDriver {
    node: Arc<Node>,
    queries: Vec<Arc<dyn Query>>,
    manager: Weak<NodeSessionManager>,
    master: bool,
}

impl NodeSessionDriver {
    async fn register(
        &self,
        registry: &Arc<dyn InternalRegistry>,
    ) -> Result<Arc<dyn NodeSession>, RegistryError> {
        registry
            .register_node(
                self.node.info().clone(),
                Arc::clone(&self.node),
                LoadInfo::sample(),
            )
            .await
    }

    /// Register with `registry`, or with the first fresher proxy for it
    /// that a query object knows about.
    async fn register_any(
        &self,
        registry: &mut Arc<dyn InternalRegistry>,
    ) -> Result<Arc<dyn NodeSession>, RegistryError> {
        let first = match self.register(registry).await {
            Ok(session) => return Ok(session),
            Err(e) => e,
        };
        if matches!(first, RegistryError::NodeActive(_)) {
            return Err(first);
        }
        let identity = registry.identity();
        tracing::debug!(registry = %identity, error = %first, "registration failed; looking up the registry");
        for query in &self.queries {
            let candidate = match query.find_registry(&identity).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(registry = %identity, error = %e, "registry lookup failed");
                    continue;
                }
            };
            if Arc::ptr_eq(&candidate, registry) {
                continue;
            }
            match self.register(&candidate).await {
                Ok(session) => {
                    *registry = candidate;
                    return Ok(session);
                }
                Err(e) => {
                    tracing::debug!(registry = %identity, error = %e, "registration with looked up registry failed")
                }
            }
        }
        Err(first)
    }
}

#[async_trait]
impl SessionDriver for NodeSessionDriver {
    async fn create_session(
        &self,
        registry: &mut Arc<dyn InternalRegistry>,
        period: &mut Duration,
    ) -> Option<Arc<dyn NodeSession>> {
        let identity = registry.identity();
        let session = match self.register_any(registry).await {
            Ok(session) => session,
            Err(RegistryError::NodeActive(name)) => {
                tracing::error!(
                    registry = %identity,
                    "a node named `{}` is already registered and active",
                    name
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(registry = %identity, error = %e, "failed to establish node session");
                return None;
            }
        };

        match session.timeout().await {
            Ok(timeout) if !timeout.is_zero() => *period = timeout / 2,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(registry = %identity, error = %e, "failed to get session timeout");
                return None;
            }
        }
        match session.get_observer().await {
            Ok(observer) => self.node.add_observer(session.identity(), observer),
            Err(e) => {
                tracing::warn!(registry = %identity, error = %e, "failed to get registry observer");
                return None;
            }
        }
        tracing::info!(
            registry = %identity,
            period = %humantime::format_duration(*period),
            "established node session"
        );

        if self.master {
            if let Some(manager) = self.manager.upgrade() {
                manager.created_session(registry, &session).await;
                manager.reap_replicas();
            }
        }
        Some(session)
    }

    async fn destroy_session(&self, session: Arc<dyn NodeSession>) {
        self.node.remove_observer(&session.identity());
        match session.destroy().await {
            Ok(()) => tracing::info!(session = %session.identity(), "destroyed node session"),
            Err(e) => {
                tracing::debug!(session = %session.identity(), error = %e, "failed to destroy node session")
            }
        }
        if self.master {
            if let Some(manager) = self.manager.upgrade() {
                manager.reap_replicas();
            }
        }
    }

    async fn keep_alive(&self, session: &Arc<dyn NodeSession>) -> bool {
        let alive = match session.keep_alive(LoadInfo::sample()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %session.identity(), error = %e, "lost node session");
                self.node.remove_observer(&session.identity());
                false
            }
        };
        if self.master {
            if let Some(manager) = self.manager.upgrade() {
                manager.reap_replicas();
            }
        }
        alive
    }
}

#[derive(Default)]
struct ManagerInner {
    master: Option<Arc<KeepAlive>>,
    master_identity: Option<Identity>,
    replicas: BTreeMap<Identity, Arc<KeepAlive>>,
    /// The replica set last pushed by the registry.
    known_replicas: BTreeSet<Identity>,
    activated: bool,
    destroyed: bool,
}

/// Owns the node's session keep-alive loops.
pub struct NodeSessionManager {
    node: Arc<Node>,
    queries: Vec<Arc<dyn Query>>,
    weak_self: Weak<NodeSessionManager>,
    inner: Mutex<ManagerInner>,
}

impl NodeSessionManager {
    pub fn new(node: Arc<Node>, queries: Vec<Arc<dyn Query>>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| Self {
            node,
            queries,
            weak_self: weak_self.clone(),
            inner: Mutex::new(ManagerInner::default()),
        });
        manager.node.set_session_manager(Arc::downgrade(&manager));
        manager
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("session manager mutex poisoned")
    }

    fn driver(&self, master: bool) -> NodeSessionDriver {
        NodeSessionDriver {
            node: Arc::clone(&self.node),
            queries: self.queries.clone(),
            manager: self.weak_self.clone(),
            master,
        }
    }

    /// Start the master session and wait, at most
    /// `create_session_wait`, for the first attempt. True if the
    /// session is established.
    pub async fn create(&self, registry: Arc<dyn InternalRegistry>) -> bool {
        let keep_alive = {
            let mut inner = self.lock();
            if inner.destroyed || inner.master.is_some() {
                tracing::warn!("master session already created");
                return false;
            }
            let identity = registry.identity();
            let keep_alive = KeepAlive::new(
                self.driver(true),
                registry,
                self.node.config().keep_alive_period,
            );
            inner.master = Some(Arc::clone(&keep_alive));
            inner.master_identity = Some(identity);
            keep_alive
        };
        keep_alive.start();
        keep_alive.try_create_session();
        keep_alive
            .wait_try_create_session(Some(self.node.config().create_session_wait))
            .await
    }

    /// Open (or retry) a session with `replica`.
    pub fn create_replica_session(&self, replica: Arc<dyn InternalRegistry>) {
        let identity = replica.identity();
        let mut inner = self.lock();
        if inner.destroyed || inner.master_identity.as_ref() == Some(&identity) {
            return;
        }
        if let Some(keep_alive) = inner.replicas.get(&identity) {
            if keep_alive.state() == KeepAliveState::Disconnected {
                keep_alive.set_registry(replica);
                keep_alive.try_create_session();
            }
            return;
        }
        tracing::debug!(replica = %identity, "creating replica session");
        let keep_alive = KeepAlive::new(
            self.driver(false),
            replica,
            self.node.config().keep_alive_period,
        );
        keep_alive.start();
        keep_alive.try_create_session();
        inner.replicas.insert(identity, keep_alive);
    }

    /// Mark the node as reachable by clients. From now on every new
    /// master session synchronizes servers.
    pub async fn activate(&self) {
        let master = {
            let mut inner = self.lock();
            inner.activated = true;
            inner.master.clone()
        };
        let Some(session) = master.and_then(|m| m.session()) else {
            return;
        };
        self.set_replica_observer(&session).await;
        self.sync_servers(&session).await;
    }

    pub fn is_activated(&self) -> bool {
        self.lock().activated
    }

    async fn created_session(
        &self,
        registry: &Arc<dyn InternalRegistry>,
        session: &Arc<dyn NodeSession>,
    ) {
        if self.is_activated() {
            self.set_replica_observer(session).await;
            self.sync_servers(session).await;
            return;
        }

        // Not activated yet: reach every replica first.
        let replicas = match registry.get_replicas().await {
            Ok(replicas) => replicas,
            Err(e) => {
                tracing::warn!(error = %e, "failed to get replicas");
                return;
            }
        };
        {
            let mut inner = self.lock();
            inner
                .known_replicas
                .extend(replicas.iter().map(|r| r.identity()));
        }
        for replica in replicas {
            self.create_replica_session(replica);
        }
        let pending: Vec<Arc<KeepAlive>> = self.lock().replicas.values().cloned().collect();
        let wait = self.node.config().replica_session_wait;
        futures::future::join_all(
            pending
                .iter()
                .map(|keep_alive| keep_alive.wait_try_create_session(Some(wait))),
        )
        .await;
    }

    async fn set_replica_observer(&self, session: &Arc<dyn NodeSession>) {
        if let Err(e) = session.set_replica_observer(Arc::clone(&self.node)).await {
            tracing::warn!(session = %session.identity(), error = %e, "failed to set replica observer");
        }
    }

    /// Reconcile on-disk servers with the registry, then have the
    /// registry reload every server of this node.
    async fn sync_servers(&self, session: &Arc<dyn NodeSession>) {
        if let Err(e) = self.node.check_consistency(session).await {
            tracing::warn!(error = %e, "consistency check failed");
        }
        if let Err(e) = session.load_servers().await {
            tracing::warn!(session = %session.identity(), error = %e, "failed to reload servers");
        }
    }

    pub fn replica_init(&self, replicas: Vec<Arc<dyn InternalRegistry>>) {
        {
            let mut inner = self.lock();
            inner.known_replicas = replicas.iter().map(|r| r.identity()).collect();
        }
        for replica in replicas {
            self.create_replica_session(replica);
        }
        self.reap_replicas();
    }

    pub fn replica_added(&self, replica: Arc<dyn InternalRegistry>) {
        self.lock().known_replicas.insert(replica.identity());
        self.create_replica_session(replica);
    }

    pub fn replica_removed(&self, replica: Arc<dyn InternalRegistry>) {
        self.lock().known_replicas.remove(&replica.identity());
        self.reap_replicas();
    }

    /// Drop replica sessions that are disconnected and no longer known
    /// to the registry.
    pub fn reap_replicas(&self) {
        let mut inner = self.lock();
        let ManagerInner {
            replicas,
            known_replicas,
            ..
        } = &mut *inner;
        replicas.retain(|identity, keep_alive| {
            if known_replicas.contains(identity) || !keep_alive.terminate_if_disconnected() {
                return true;
            }
            tracing::debug!(replica = %identity, "reaped replica session");
            false
        });
    }

    /// Terminate every session loop, destroying live sessions.
    pub async fn destroy(&self) {
        let loops: Vec<Arc<KeepAlive>> = {
            let mut inner = self.lock();
            inner.destroyed = true;
            let mut loops: Vec<_> = std::mem::take(&mut inner.replicas).into_values().collect();
            loops.extend(inner.master.take());
            loops
        };
        for keep_alive in &loops {
            keep_alive.terminate(true);
        }
        futures::future::join_all(loops.iter().map(|keep_alive| keep_alive.join())).await;
        tracing::info!("node sessions destroyed");
    }

    pub fn master_session(&self) -> Option<Arc<dyn NodeSession>> {
        self.lock().master.as_ref().and_then(|m| m.session())
    }

    /// Wait for the master session. False if there is no master loop or
    /// it was terminated.
    pub async fn wait_for_create(&self) -> bool {
        let master = self.lock().master.clone();
        match master {
            Some(master) => master.wait_for_create().await,
            None => false,
        }
    }

    /// Identities of the registries with a replica session loop.
    pub fn replicas(&self) -> Vec<Identity> {
        self.lock().replicas.keys().cloned().collect()
    }

    pub fn replica_state(&self, replica: &Identity) -> Option<KeepAliveState> {
        self.lock().replicas.get(replica).map(|r| r.state())
    }
}
