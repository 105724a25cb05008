/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Interfaces to everything the node talks to remotely: registries
//! (master and replicas), their node sessions and observers, registry
//! queries, and the process-control facet registered by a running
//! server.
//!
//! The transport is not defined here. A proxy is an `Arc<dyn Trait>`
//! carrying a stable [`Identity`]; calls complete asynchronously with
//! either a result or a [`RegistryError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::descriptor::Property;
use crate::node::Node;
use crate::platform::LoadInfo;
use crate::platform::NodeInfo;

/// The identity of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub category: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }

    /// `<instance>-Server/<server>`.
    pub fn server(instance: &str, server: &str) -> Self {
        Self::new(format!("{}-Server", instance), server)
    }

    /// `<instance>-ServerAdapter/<server>-<adapter>`.
    pub fn adapter(instance: &str, server: &str, adapter: &str) -> Self {
        Self::new(
            format!("{}-ServerAdapter", instance),
            format!("{}-{}", server, adapter),
        )
    }

    /// `<instance>/InternalRegistry-Master`.
    pub fn master_registry(instance: &str) -> Self {
        Self::new(instance, "InternalRegistry-Master")
    }

    /// `<instance>/InternalRegistry-<replica>`.
    pub fn replica_registry(instance: &str, replica: &str) -> Self {
        Self::new(instance, format!("InternalRegistry-{}", replica))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// The endpoints of an adapter, as registered by the server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectProxy(pub String);

impl fmt::Display for DirectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server state as reported to registries and administrators.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    enum_as_inner::EnumAsInner
)]
pub enum ServerState {
    Inactive,
    Activating,
    ActivationTimedOut,
    Active,
    Deactivating,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDynamicInfo {
    pub id: String,
    pub state: ServerState,
    pub pid: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDynamicInfo {
    pub id: String,
    pub proxy: Option<DirectProxy>,
}

/// Snapshot sent to an observer when it first subscribes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDynamicInfo {
    pub info: NodeInfo,
    pub servers: Vec<ServerDynamicInfo>,
    pub adapters: Vec<AdapterDynamicInfo>,
}

/// Failures of remote calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// The transport failed; the peer may or may not have seen the
    /// call.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Another node with the same name holds a session.
    #[error("node `{0}` is already active")]
    NodeActive(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("object does not exist: {0}")]
    ObjectNotExist(Identity),

    /// Any other failure reported by the remote side.
    #[error("{0}")]
    Remote(String),
}

/// A registry's internal interface, as used by nodes.
#[async_trait]
pub trait InternalRegistry: Send + Sync {
    fn identity(&self) -> Identity;

    /// Open a node session.
    async fn register_node(
        &self,
        info: NodeInfo,
        node: Arc<Node>,
        load: LoadInfo,
    ) -> Result<Arc<dyn NodeSession>, RegistryError>;

    /// Every replica known to this registry, the master included.
    async fn get_replicas(&self) -> Result<Vec<Arc<dyn InternalRegistry>>, RegistryError>;
}

/// A node's lease with one registry.
#[async_trait]
pub trait NodeSession: Send + Sync {
    fn identity(&self) -> Identity;

    async fn keep_alive(&self, load: LoadInfo) -> Result<(), RegistryError>;

    /// The lease timeout. The node refreshes at half this period.
    async fn timeout(&self) -> Result<Duration, RegistryError>;

    async fn get_observer(&self) -> Result<Arc<dyn NodeObserver>, RegistryError>;

    /// Subscribe the node to replica additions and removals.
    async fn set_replica_observer(&self, node: Arc<Node>) -> Result<(), RegistryError>;

    /// Ids of the servers the registry has deployed on this node.
    async fn get_servers(&self) -> Result<Vec<String>, RegistryError>;

    /// Ask the registry to (re)load every server deployed on this
    /// node.
    async fn load_servers(&self) -> Result<(), RegistryError>;

    async fn destroy(&self) -> Result<(), RegistryError>;
}

/// Registry lookup service.
#[async_trait]
pub trait Query: Send + Sync {
    async fn find_registry(
        &self,
        identity: &Identity,
    ) -> Result<Option<Arc<dyn InternalRegistry>>, RegistryError>;

    async fn find_all_registries(&self) -> Result<Vec<Arc<dyn InternalRegistry>>, RegistryError>;
}

/// Receives dynamic state changes of a node's servers and adapters.
#[async_trait]
pub trait NodeObserver: Send + Sync {
    fn identity(&self) -> Identity;

    async fn node_up(&self, info: NodeDynamicInfo) -> Result<(), RegistryError>;

    async fn update_server(&self, node: &str, info: ServerDynamicInfo)
    -> Result<(), RegistryError>;

    async fn update_adapter(
        &self,
        node: &str,
        info: AdapterDynamicInfo,
    ) -> Result<(), RegistryError>;
}

/// The control facet a server process registers with its node.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Ask the process to shut down gracefully.
    async fn shutdown(&self) -> Result<(), RegistryError>;

    /// Write to the process's stdout (`fd == 1`) or stderr (`fd == 2`).
    async fn write_message(&self, message: &str, fd: i32) -> Result<(), RegistryError>;

    /// Push updated properties of one configuration file.
    async fn set_properties(
        &self,
        file: &str,
        properties: Vec<Property>,
    ) -> Result<(), RegistryError>;
}
