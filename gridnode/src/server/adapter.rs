/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The node-side object of one adapter of a server.
//!
//! It holds the adapter's direct proxy once the server process has
//! registered it, and parks activation requests until then.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tokio::sync::oneshot;

use super::Server;
use super::ServerError;
use crate::node::Node;
use crate::registry::AdapterDynamicInfo;
use crate::registry::DirectProxy;
use crate::registry::Identity;

#[derive(Default)]
struct AdapterInner {
    proxy: Option<DirectProxy>,
    enabled: bool,
    /// Start the server again once its current deactivation completes.
    activate_after_deactivating: bool,
    waiters: Vec<oneshot::Sender<Option<DirectProxy>>>,
    destroyed: bool,
}

impl AdapterInner {
    fn resolve(&mut self, proxy: Option<DirectProxy>) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(proxy.clone());
        }
    }
}

pub struct ServerAdapter {
    id: String,
    identity: Identity,
    server_id: String,
    server: Weak<Server>,
    node: Weak<Node>,
    inner: Mutex<AdapterInner>,
}

impl std::fmt::Debug for ServerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAdapter")
            .field("id", &self.id)
            .field("server", &self.server_id)
            .finish()
    }
}

impl ServerAdapter {
    pub(crate) fn new(
        id: &str,
        identity: Identity,
        server_id: &str,
        server: Weak<Server>,
        node: Weak<Node>,
        enabled: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            identity,
            server_id: server_id.to_string(),
            server,
            node,
            inner: Mutex::new(AdapterInner {
                enabled,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdapterInner> {
        self.inner.lock().expect("adapter mutex poisoned")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Resolve the adapter's direct proxy, starting an on-demand server
    /// if needed. Yields `None` if the server cannot be activated or
    /// does not register the adapter within its activation timeout.
    pub async fn activate(&self) -> Result<Option<DirectProxy>, ServerError> {
        let (rx, first) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(ServerError::ObjectNotExist(self.identity.clone()));
            }
            if let Some(proxy) = &inner.proxy {
                return Ok(Some(proxy.clone()));
            }
            if !inner.enabled {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            (rx, inner.waiters.len() == 1)
        };

        let Some(server) = self.server.upgrade() else {
            self.activation_failed("the server no longer exists");
            return Ok(None);
        };
        if first {
            tracing::debug!(server = %self.server_id, adapter = %self.id, "activating server for adapter");
            match server.start_for_adapter(self) {
                Ok(Some(command)) => command.run().await,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(server = %self.server_id, adapter = %self.id, error = %e, "on-demand activation failed");
                    self.activation_failed(&e.to_string());
                }
            }
        }

        match tokio::time::timeout(server.activation_timeout(), rx).await {
            Ok(Ok(proxy)) => Ok(proxy),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                tracing::debug!(server = %self.server_id, adapter = %self.id, "adapter activation timed out");
                Ok(None)
            }
        }
    }

    pub fn get_direct_proxy(&self) -> Result<DirectProxy, ServerError> {
        let inner = self.lock();
        match (&inner.proxy, inner.enabled) {
            (Some(proxy), true) => Ok(proxy.clone()),
            _ => Err(ServerError::AdapterNotActive(self.id.clone())),
        }
    }

    /// Called by the server process when the adapter is activated
    /// (`Some`) or deactivated (`None`).
    pub fn set_direct_proxy(&self, proxy: Option<DirectProxy>) -> Result<(), ServerError> {
        let changed = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(ServerError::ObjectNotExist(self.identity.clone()));
            }
            if let (Some(current), Some(new)) = (&inner.proxy, &proxy) {
                if current != new {
                    return Err(ServerError::AdapterActive(self.id.clone()));
                }
            }
            let changed = inner.proxy != proxy;
            inner.proxy = proxy.clone();
            if proxy.is_some() {
                inner.resolve(proxy.clone());
            }
            changed
        };
        if !changed {
            return Ok(());
        }

        tracing::debug!(server = %self.server_id, adapter = %self.id, proxy = ?proxy, "direct proxy updated");
        if let Some(server) = self.server.upgrade() {
            let command = if proxy.is_some() {
                server.adapter_activated(&self.id)
            } else {
                server.adapter_deactivated(&self.id)
            };
            if let Some(command) = command {
                command.spawn();
            }
        }
        if let Some(node) = self.node.upgrade() {
            node.observer_update_adapter(self.dynamic_info());
        }
        Ok(())
    }

    pub fn dynamic_info(&self) -> AdapterDynamicInfo {
        AdapterDynamicInfo {
            id: self.id.clone(),
            proxy: self.lock().proxy.clone(),
        }
    }

    /// Fail every pending activation request.
    pub(crate) fn activation_failed(&self, reason: &str) {
        let mut inner = self.lock();
        if !inner.waiters.is_empty() {
            tracing::debug!(server = %self.server_id, adapter = %self.id, %reason, "adapter activation failed");
        }
        inner.resolve(None);
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        inner.enabled = enabled;
        if !enabled {
            inner.resolve(None);
        }
    }

    pub(crate) fn set_activate_after_deactivating(&self) {
        self.lock().activate_after_deactivating = true;
    }

    /// Clear and return the re-activation request.
    pub(crate) fn take_activate_after_deactivating(&self) -> bool {
        std::mem::take(&mut self.lock().activate_after_deactivating)
    }

    /// Forget the proxy once the server process is gone.
    pub(crate) fn clear(&self) -> bool {
        self.lock().proxy.take().is_some()
    }

    pub(crate) fn destroy(&self) {
        let mut inner = self.lock();
        inner.destroyed = true;
        inner.proxy = None;
        inner.resolve(None);
    }
}
