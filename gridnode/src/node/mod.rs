/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The node: owns every [`Server`] and [`ServerAdapter`] object,
//! routes load and destroy requests to them, reconciles the on-disk
//! server set against the registry, and fans out state changes to
//! registry observers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::Weak;

use crate::activator::Activator;
use crate::config::NodeConfig;
use crate::descriptor::ServerDescriptor;
use crate::layout;
use crate::platform::NodeInfo;
use crate::registry::AdapterDynamicInfo;
use crate::registry::Identity;
use crate::registry::InternalRegistry;
use crate::registry::NodeObserver;
use crate::registry::NodeSession;
use crate::registry::RegistryError;
use crate::registry::ServerDynamicInfo;
use crate::server::LoadResult;
use crate::server::MASTER_REPLICA;
use crate::server::Reply;
use crate::server::Server;
use crate::server::ServerAdapter;
use crate::server::ServerError;
use crate::session::NodeSessionManager;

mod observer;

use observer::ObserverSet;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl NodeError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

enum Servant {
    Server(Arc<Server>),
    Adapter(Arc<ServerAdapter>),
}

#[derive(Default)]
struct NodeObjects {
    servants: HashMap<Identity, Servant>,
    /// Bumped by every load and destroy.
    serial: u64,
    consistency_done: bool,
    deactivated: bool,
    /// Application name to the ids of its servers.
    applications: BTreeMap<String, BTreeSet<String>>,
}

pub struct Node {
    config: Arc<NodeConfig>,
    info: NodeInfo,
    activator: Arc<Activator>,
    weak_self: Weak<Node>,
    objects: Mutex<NodeObjects>,
    observers: ObserverSet,
    session_manager: OnceLock<Weak<NodeSessionManager>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("name", &self.info.name).finish()
    }
}

impl Node {
    /// Create the node and its `servers` and `tmp` directories.
    pub fn new(config: NodeConfig, activator: Arc<Activator>) -> Result<Arc<Node>, NodeError> {
        for dir in [config.servers_dir(), config.tmp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| NodeError::io(&dir, e))?;
        }
        if let Some(dir) = &config.output_dir {
            std::fs::create_dir_all(dir).map_err(|e| NodeError::io(dir, e))?;
        }
        let info = NodeInfo::current(&config);
        tracing::info!(node = %info.name, data_dir = %config.data_dir.display(), "node created");
        Ok(Arc::new_cyclic(|weak_self| Node {
            observers: ObserverSet::new(info.clone()),
            config: Arc::new(config),
            info,
            activator,
            weak_self: weak_self.clone(),
            objects: Mutex::new(NodeObjects::default()),
            session_manager: OnceLock::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, NodeObjects> {
        self.objects.lock().expect("node mutex poisoned")
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    pub fn activator(&self) -> &Arc<Activator> {
        &self.activator
    }

    // Dispatch.

    pub async fn load_server(
        &self,
        desc: ServerDescriptor,
        replica: &str,
    ) -> Result<LoadResult, ServerError> {
        self.load(desc, replica, false).await
    }

    /// Like [`Self::load_server`], but fails rather than restart a
    /// running server.
    pub async fn load_server_without_restart(
        &self,
        desc: ServerDescriptor,
        replica: &str,
    ) -> Result<LoadResult, ServerError> {
        self.load(desc, replica, true).await
    }

    async fn load(
        &self,
        desc: ServerDescriptor,
        replica: &str,
        no_restart: bool,
    ) -> Result<LoadResult, ServerError> {
        tracing::debug!(server = %desc.id, %replica, no_restart, "load server");
        let desc = Arc::new(desc);
        let (reply, command) =
            self.dispatch(&desc.id, |server| server.load_command(Arc::clone(&desc), replica, no_restart))?;
        if let Some(command) = command {
            command.run().await;
        }
        reply.wait().await
    }

    pub async fn destroy_server(
        &self,
        id: &str,
        uuid: &str,
        revision: u64,
        replica: &str,
    ) -> Result<(), ServerError> {
        self.destroy(id, uuid, revision, replica, false).await
    }

    pub async fn destroy_server_without_restart(
        &self,
        id: &str,
        uuid: &str,
        revision: u64,
        replica: &str,
    ) -> Result<(), ServerError> {
        self.destroy(id, uuid, revision, replica, true).await
    }

    async fn destroy(
        &self,
        id: &str,
        uuid: &str,
        revision: u64,
        replica: &str,
        no_restart: bool,
    ) -> Result<(), ServerError> {
        tracing::debug!(server = %id, %replica, no_restart, "destroy server");
        let (reply, command) =
            self.dispatch(id, |server| server.destroy_command(uuid, revision, replica, no_restart))?;
        match command {
            Some(command) => command.run().await,
            None => {
                if let Ok(server) = self.find_server(id) {
                    if server.is_removed() {
                        self.remove_server(&server);
                    }
                }
            }
        }
        reply.wait().await
    }

    /// Find or create the server `id` and build a command on it. A
    /// server that was destroyed and dropped meanwhile is replaced by a
    /// fresh one.
    fn dispatch<T>(
        &self,
        id: &str,
        build: impl Fn(&Server) -> Result<(Reply<T>, Option<crate::server::Command>), ServerError>,
    ) -> Result<(Reply<T>, Option<crate::server::Command>), ServerError> {
        let identity = Identity::server(&self.config.instance_name, id);
        loop {
            let server = {
                let mut objects = self.lock();
                if objects.deactivated {
                    return Err(ServerError::ObjectNotExist(identity));
                }
                objects.serial += 1;
                let existing = match objects.servants.get(&identity) {
                    Some(Servant::Server(server)) => Some(Arc::clone(server)),
                    _ => None,
                };
                match existing {
                    Some(server) => server,
                    None => {
                        let server = Server::new(
                            id,
                            self.weak_self.clone(),
                            Arc::clone(&self.activator),
                            Arc::clone(&self.config),
                        );
                        objects
                            .servants
                            .insert(identity.clone(), Servant::Server(Arc::clone(&server)));
                        server
                    }
                }
            };
            match build(&server) {
                Err(ServerError::ObjectNotExist(_)) => {
                    tracing::debug!(server = %id, "server was removed; retrying with a new one");
                    self.remove_server(&server);
                }
                result => return result,
            }
        }
    }

    // Adapter registry.

    pub fn find_server(&self, id: &str) -> Result<Arc<Server>, ServerError> {
        let identity = Identity::server(&self.config.instance_name, id);
        let objects = self.lock();
        match objects.servants.get(&identity) {
            Some(Servant::Server(server)) if !objects.deactivated => Ok(Arc::clone(server)),
            _ => Err(ServerError::ObjectNotExist(identity)),
        }
    }

    pub fn find_adapter(&self, server: &str, adapter: &str) -> Result<Arc<ServerAdapter>, ServerError> {
        let identity = Identity::adapter(&self.config.instance_name, server, adapter);
        let objects = self.lock();
        match objects.servants.get(&identity) {
            Some(Servant::Adapter(adapter)) if !objects.deactivated => Ok(Arc::clone(adapter)),
            _ => Err(ServerError::ObjectNotExist(identity)),
        }
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.lock()
            .servants
            .values()
            .filter_map(|servant| match servant {
                Servant::Server(server) => Some(Arc::clone(server)),
                Servant::Adapter(_) => None,
            })
            .collect()
    }

    /// Ids of the loaded servers of `application`.
    pub fn application_servers(&self, application: &str) -> Vec<String> {
        self.lock()
            .applications
            .get(application)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_adapter(&self, adapter: &Arc<ServerAdapter>) {
        self.lock()
            .servants
            .insert(adapter.identity().clone(), Servant::Adapter(Arc::clone(adapter)));
    }

    pub(crate) fn remove_adapter(&self, adapter: &Arc<ServerAdapter>) {
        let mut objects = self.lock();
        let current = matches!(
            objects.servants.get(adapter.identity()),
            Some(Servant::Adapter(current)) if Arc::ptr_eq(current, adapter)
        );
        if current {
            objects.servants.remove(adapter.identity());
        }
    }

    pub(crate) fn remove_server(&self, server: &Arc<Server>) {
        let mut objects = self.lock();
        let current = matches!(
            objects.servants.get(server.identity()),
            Some(Servant::Server(current)) if Arc::ptr_eq(current, server)
        );
        if current {
            objects.servants.remove(server.identity());
        }
        objects.applications.retain(|_, ids| {
            ids.remove(server.id());
            !ids.is_empty()
        });
    }

    pub(crate) fn server_loaded(&self, id: &str, application: &str) {
        let mut objects = self.lock();
        objects.applications.retain(|app, ids| {
            if app != application {
                ids.remove(id);
            }
            !ids.is_empty()
        });
        objects
            .applications
            .entry(application.to_string())
            .or_default()
            .insert(id.to_string());
    }

    // Consistency.

    /// Destroy or remove server directories the registry does not know
    /// about. Runs once per node; later calls return right away.
    pub async fn check_consistency(&self, session: &Arc<dyn NodeSession>) -> Result<(), NodeError> {
        if std::mem::replace(&mut self.lock().consistency_done, true) {
            return Ok(());
        }

        let servers_dir = self.config.servers_dir();
        let attempts = self.config.consistency_check_attempts.max(1);
        for attempt in 1..=attempts {
            let serial = self.lock().serial;
            let on_disk = layout::server_directories(&servers_dir)
                .map_err(|e| NodeError::io(&servers_dir, e))?;
            let registered: BTreeSet<String> = session.get_servers().await?.into_iter().collect();

            let mut replies = Vec::new();
            let mut commands = Vec::new();
            let mut unexpected = Vec::new();
            let mut dropped = Vec::new();
            {
                let objects = self.lock();
                if objects.serial != serial {
                    tracing::debug!(attempt, "servers changed during consistency check; retrying");
                    continue;
                }
                for id in on_disk.difference(&registered) {
                    let identity = Identity::server(&self.config.instance_name, id);
                    if let Some(Servant::Server(server)) = objects.servants.get(&identity) {
                        match server.destroy_command("", 0, MASTER_REPLICA, false) {
                            Ok((_, None)) if server.is_removed() => {
                                // Never loaded: only the directory is left.
                                dropped.push(Arc::clone(server));
                            }
                            Ok((reply, command)) => {
                                replies.push((id.clone(), reply));
                                commands.extend(command);
                                continue;
                            }
                            Err(e) => {
                                tracing::warn!(server = %id, error = %e, "failed to destroy orphan server");
                                continue;
                            }
                        }
                    }
                    let dir = servers_dir.join(id);
                    match layout::can_remove_server_directory(&dir) {
                        Ok(true) => match std::fs::remove_dir_all(&dir) {
                            Ok(()) => tracing::info!(server = %id, "removed orphan server directory"),
                            Err(e) => {
                                tracing::warn!(server = %id, error = %e, "failed to remove orphan server directory")
                            }
                        },
                        Ok(false) => unexpected.push(id.clone()),
                        Err(e) => {
                            tracing::warn!(server = %id, error = %e, "cannot inspect orphan server directory");
                            unexpected.push(id.clone());
                        }
                    }
                }
            }

            for server in &dropped {
                self.remove_server(server);
            }
            for command in commands {
                command.run().await;
            }
            for (id, reply) in replies {
                if let Err(e) = reply.wait().await {
                    tracing::warn!(server = %id, error = %e, "failed to destroy orphan server");
                }
            }
            if !unexpected.is_empty() {
                tracing::warn!(
                    "server directories containing data not created or written by the grid node were not removed: {}",
                    unexpected.join(", ")
                );
            }
            return Ok(());
        }
        tracing::warn!(attempts, "consistency check abandoned: servers kept changing");
        Ok(())
    }

    // Observers.

    pub(crate) fn observer_update_server(&self, info: ServerDynamicInfo) {
        self.observers.update_server(info);
    }

    pub(crate) fn observer_update_adapter(&self, info: AdapterDynamicInfo) {
        self.observers.update_adapter(info);
    }

    /// Subscribe the observer obtained through registry `session`.
    pub fn add_observer(&self, session: Identity, observer: Arc<dyn NodeObserver>) {
        self.observers.add(session, observer);
    }

    pub fn remove_observer(&self, session: &Identity) {
        self.observers.remove(session);
    }

    // Replicas.

    pub(crate) fn set_session_manager(&self, manager: Weak<NodeSessionManager>) {
        if self.session_manager.set(manager).is_err() {
            tracing::error!(node = %self.info.name, "session manager already set");
        }
    }

    fn session_manager(&self) -> Option<Arc<NodeSessionManager>> {
        self.session_manager.get().and_then(Weak::upgrade)
    }

    /// Called by a replica that wants this node to open a session with
    /// it.
    pub fn register_with_replica(&self, replica: Arc<dyn InternalRegistry>) {
        if let Some(manager) = self.session_manager() {
            manager.create_replica_session(replica);
        }
    }

    pub fn replica_init(&self, replicas: Vec<Arc<dyn InternalRegistry>>) {
        if let Some(manager) = self.session_manager() {
            manager.replica_init(replicas);
        }
    }

    pub fn replica_added(&self, replica: Arc<dyn InternalRegistry>) {
        if let Some(manager) = self.session_manager() {
            manager.replica_added(replica);
        }
    }

    pub fn replica_removed(&self, replica: Arc<dyn InternalRegistry>) {
        if let Some(manager) = self.session_manager() {
            manager.replica_removed(replica);
        }
    }

    /// Stop every server and the activator. The node answers
    /// object-not-exist afterwards.
    pub async fn shutdown(&self) {
        let servers = {
            let mut objects = self.lock();
            objects.deactivated = true;
            objects
                .servants
                .values()
                .filter_map(|servant| match servant {
                    Servant::Server(server) => Some(Arc::clone(server)),
                    Servant::Adapter(_) => None,
                })
                .collect::<Vec<_>>()
        };
        tracing::info!(node = %self.info.name, servers = servers.len(), "shutting down node");
        for server in &servers {
            server.cancel_timers();
        }
        self.activator.shutdown();
        self.activator.destroy().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::descriptor::AdapterDescriptor;
    use crate::registry::ServerState;
    use crate::test_utils::FakeObserver;
    use crate::test_utils::FakeSession;
    use crate::test_utils::TestNode;
    use crate::test_utils::sh_descriptor;

    fn with_adapter(mut desc: ServerDescriptor) -> ServerDescriptor {
        desc.adapters.push(AdapterDescriptor {
            id: "A1".to_string(),
            server_lifetime: false,
        });
        desc
    }

    #[tokio::test]
    async fn test_load_then_destroy_round_trip() {
        let node = TestNode::new();
        let result = node
            .node
            .load_server(with_adapter(sh_descriptor("S1", "sleep 30")), MASTER_REPLICA)
            .await
            .unwrap();
        assert_eq!(result.server, Identity::server("GridNode", "S1"));
        assert_eq!(
            result.adapters.get("A1"),
            Some(&Identity::adapter("GridNode", "S1", "A1"))
        );
        assert_eq!(result.activation_timeout, Duration::from_secs(60));

        let server = node.node.find_server("S1").unwrap();
        assert_eq!(server.descriptor().map(|d| d.revision), Some(1));
        let adapters: Vec<_> = server.adapters().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(adapters, vec!["A1".to_string()]);

        let dir = node.node.config().servers_dir().join("S1");
        assert!(dir.join("revision").is_file());
        assert!(node.node.find_adapter("S1", "A1").is_ok());
        assert_eq!(node.node.application_servers("app"), vec!["S1".to_string()]);

        node.node
            .destroy_server("S1", "uuid", 1, MASTER_REPLICA)
            .await
            .unwrap();
        assert!(node.node.find_server("S1").is_err());
        assert!(node.node.find_adapter("S1", "A1").is_err());
        assert!(node.node.application_servers("app").is_empty());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_concurrent_destroys_coalesce() {
        let node = TestNode::new();
        node.node
            .load_server(sh_descriptor("S1", "sleep 30"), MASTER_REPLICA)
            .await
            .unwrap();
        let server = node.node.find_server("S1").unwrap();
        server.start().await.unwrap();

        let destroys = (0..4).map(|_| node.node.destroy_server("S1", "uuid", 1, MASTER_REPLICA));
        let results = futures::future::join_all(destroys).await;
        for result in results {
            result.unwrap();
        }
        assert_eq!(server.get_state(), ServerState::Destroyed);
        assert_eq!(node.launcher.signals().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_after_destroy_creates_new_server() {
        let node = TestNode::new();
        let desc = sh_descriptor("S1", "sleep 30");
        node.node.load_server(desc.clone(), MASTER_REPLICA).await.unwrap();
        let first = node.node.find_server("S1").unwrap();
        node.node
            .destroy_server("S1", "uuid", 1, MASTER_REPLICA)
            .await
            .unwrap();

        node.node.load_server(desc, MASTER_REPLICA).await.unwrap();
        let second = node.node.find_server("S1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.get_state(), ServerState::Inactive);
        // The old object refuses further requests.
        assert!(matches!(
            first.start().await,
            Err(ServerError::ObjectNotExist(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_unknown_server() {
        let node = TestNode::new();
        let observer = FakeObserver::new("o1");
        node.node.add_observer(Identity::new("session", "s1"), observer.clone());
        node.node
            .destroy_server("Nope", "", 0, MASTER_REPLICA)
            .await
            .unwrap();
        assert!(node.node.find_server("Nope").is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observer.server_states("Nope").is_empty());
        assert!(!node.node.config().servers_dir().join("Nope").exists());

        // A later load still gets a working server.
        node.node
            .load_server(sh_descriptor("Nope", "sleep 30"), MASTER_REPLICA)
            .await
            .unwrap();
        assert!(node.node.find_server("Nope").is_ok());
    }

    #[tokio::test]
    async fn test_failed_first_load_leaves_nothing() {
        let node = TestNode::new();
        let observer = FakeObserver::new("o1");
        node.node.add_observer(Identity::new("session", "s1"), observer.clone());

        let mut desc = sh_descriptor("S1", "sleep 30");
        desc.properties.insert("../bad".to_string(), Vec::new());
        assert!(matches!(
            node.node.load_server(desc, MASTER_REPLICA).await,
            Err(ServerError::Deployment { .. })
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(node.node.find_server("S1").is_err());
        assert!(!node.node.config().servers_dir().join("S1").exists());
        assert!(observer.server_states("S1").is_empty());
    }

    #[tokio::test]
    async fn test_running_server_without_restart() {
        let node = TestNode::new();
        let desc = sh_descriptor("S1", "sleep 30");
        node.node.load_server(desc.clone(), MASTER_REPLICA).await.unwrap();
        let server = node.node.find_server("S1").unwrap();
        server.start().await.unwrap();

        assert!(matches!(
            node.node
                .destroy_server_without_restart("S1", "uuid", 1, MASTER_REPLICA)
                .await,
            Err(ServerError::Deployment { .. })
        ));

        // An update that needs a restart stops the server first.
        let mut update = desc.clone();
        update.options = vec!["-c".to_string(), "sleep 20".to_string()];
        node.node.load_server(update, MASTER_REPLICA).await.unwrap();
        assert_eq!(server.get_state(), ServerState::Inactive);
        assert_eq!(node.launcher.signals().len(), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_consistency_sweep() {
        let node = TestNode::new();
        for id in ["S1", "S2"] {
            node.node
                .load_server(sh_descriptor(id, "sleep 30"), MASTER_REPLICA)
                .await
                .unwrap();
        }
        let servers_dir = node.node.config().servers_dir();
        let orphan = servers_dir.join("Orphan");
        std::fs::create_dir_all(orphan.join("config")).unwrap();
        std::fs::create_dir_all(orphan.join("data")).unwrap();
        let keeper = servers_dir.join("Keeper");
        std::fs::create_dir_all(&keeper).unwrap();
        std::fs::write(keeper.join("foo.txt"), b"x").unwrap();

        let session = FakeSession::new("s1");
        session.set_servers(vec!["S1".to_string(), "S2".to_string()]);
        let session: Arc<dyn NodeSession> = session;
        node.node.check_consistency(&session).await.unwrap();

        assert!(!orphan.exists());
        assert!(keeper.join("foo.txt").exists());
        assert!(servers_dir.join("S1").exists());
        assert!(servers_dir.join("S2").exists());
        assert!(logs_contain(
            "server directories containing data not created or written by the grid node were not removed: Keeper"
        ));

        // Once per node.
        std::fs::create_dir_all(servers_dir.join("Late")).unwrap();
        node.node.check_consistency(&session).await.unwrap();
        assert!(servers_dir.join("Late").exists());
    }

    #[tokio::test]
    async fn test_consistency_destroys_loaded_orphan() {
        let node = TestNode::new();
        node.node
            .load_server(sh_descriptor("S1", "sleep 30"), MASTER_REPLICA)
            .await
            .unwrap();
        let session: Arc<dyn NodeSession> = FakeSession::new("s1");
        node.node.check_consistency(&session).await.unwrap();
        assert!(node.node.find_server("S1").is_err());
        assert!(!node.node.config().servers_dir().join("S1").exists());
    }

    #[tokio::test]
    async fn test_shutdown_stops_servers() {
        let node = TestNode::new();
        node.node
            .load_server(sh_descriptor("S1", "sleep 30"), MASTER_REPLICA)
            .await
            .unwrap();
        let server = node.node.find_server("S1").unwrap();
        server.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), node.node.shutdown())
            .await
            .unwrap();
        assert_eq!(server.get_state(), ServerState::Inactive);
        assert!(!node.activator.is_active());
        assert!(node.node.find_server("S1").is_err());
        assert!(matches!(
            node.node
                .load_server(sh_descriptor("S2", "exit 0"), MASTER_REPLICA)
                .await,
            Err(ServerError::ObjectNotExist(_))
        ));
    }
}
