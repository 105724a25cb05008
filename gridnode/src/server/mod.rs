/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The node-side object of one deployed server.
//!
//! A [`Server`] owns at most one process (through the [`Activator`])
//! and serializes every administrative operation on it. Operations are
//! modeled as commands (see [`command`]); all of a server's state lives
//! behind a single mutex, and every state change goes through
//! `set_state`, which
//!
//! 1. checks the transition against the table in [`state`],
//! 2. answers the waiters of commands that the transition completes or
//!    aborts,
//! 3. tells observers about the new public state, and
//! 4. picks the next command that may run.
//!
//! The picked command is executed by the caller after the lock is
//! released.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::activator::ActivatorError;
use crate::activator::Activator;
use crate::activator::LaunchSpec;
use crate::activator::ProcessExit;
use crate::activator::ProcessOwner;
use crate::activator::Signal;
use crate::config::DisableOnFailure;
use crate::config::NodeConfig;
use crate::descriptor::ActivationMode;
use crate::descriptor::Property;
use crate::descriptor::ServerDescriptor;
use crate::layout;
use crate::node::Node;
use crate::registry::Identity;
use crate::registry::ProcessControl;
use crate::registry::RegistryError;
use crate::registry::ServerDynamicInfo;
use crate::registry::ServerState;

mod adapter;
mod command;
mod state;

pub use adapter::ServerAdapter;
pub use command::Command;
pub use command::Reply;
use command::DestroyCommand;
use command::LoadCommand;
use command::ServerCommand;
use command::StopCommand;
use command::StopStep;
pub use state::InternalState;

/// Updates issued under this replica name skip the revision check.
pub const MASTER_REPLICA: &str = "Master";

/// Environment variable pointing a server process at its configuration
/// file.
pub const SERVER_CONFIG_ENV: &str = "GRIDNODE_SERVER_CONFIG";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("failed to start server `{id}`: {reason}")]
    Start { id: String, reason: String },

    #[error("failed to stop server `{id}`: {reason}")]
    Stop { id: String, reason: String },

    #[error("failed to deploy server `{id}`: {reason}")]
    Deployment { id: String, reason: String },

    #[error("object does not exist: {0}")]
    ObjectNotExist(Identity),

    #[error("server `{0}` is not active")]
    NotActive(String),

    #[error("bad signal `{0}`")]
    BadSignal(String),

    #[error("failed to signal server `{id}`: {reason}")]
    Signal { id: String, reason: String },

    #[error("adapter `{0}` is already active")]
    AdapterActive(String),

    #[error("adapter `{0}` is not active")]
    AdapterNotActive(String),

    #[error("operation on server `{0}` was abandoned")]
    Canceled(String),

    #[error(transparent)]
    Remote(#[from] RegistryError),
}

/// Answer to a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub server: Identity,
    /// Adapter id to the identity of its node-side object.
    pub adapters: BTreeMap<String, Identity>,
    pub activation_timeout: Duration,
    pub deactivation_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisableReason {
    /// `set_enabled(false)`.
    Admin,
    /// Too many failures; see [`DisableOnFailure`].
    Failure,
}

struct ServerInner {
    state: InternalState,
    desc: Option<Arc<ServerDescriptor>>,
    disabled: Option<DisableReason>,
    /// Recent failure times, oldest first.
    failures: VecDeque<Instant>,

    load: Option<LoadCommand>,
    start: Option<command::StartCommand>,
    stop: Option<StopCommand>,
    destroy: Option<DestroyCommand>,

    adapters: BTreeMap<String, Arc<ServerAdapter>>,
    lifetime_adapters: BTreeSet<String>,
    active_adapters: BTreeSet<String>,
    process: Option<Arc<dyn ProcessControl>>,

    /// Delayed start or re-enable.
    timer: Option<JoinHandle<()>>,
    /// An exit observed while the launch was still being recorded.
    pending_exit: Option<ProcessExit>,
    /// Destroyed and dropped by the node.
    removed: bool,
}

impl ServerInner {
    fn activation(&self) -> ActivationMode {
        match (&self.desc, self.disabled) {
            (_, Some(_)) => ActivationMode::Disabled,
            (Some(desc), None) => desc.activation,
            (None, None) => ActivationMode::Manual,
        }
    }

    fn enabled(&self) -> bool {
        self.activation() != ActivationMode::Disabled
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct Server {
    id: String,
    identity: Identity,
    dir: PathBuf,
    node: Weak<Node>,
    activator: Arc<Activator>,
    config: Arc<NodeConfig>,
    weak_self: Weak<Server>,
    inner: Mutex<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl Server {
    pub(crate) fn new(
        id: &str,
        node: Weak<Node>,
        activator: Arc<Activator>,
        config: Arc<NodeConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id: id.to_string(),
            identity: Identity::server(&config.instance_name, id),
            dir: config.servers_dir().join(id),
            node,
            activator,
            config,
            weak_self: weak_self.clone(),
            inner: Mutex::new(ServerInner {
                state: InternalState::Inactive,
                desc: None,
                disabled: None,
                failures: VecDeque::new(),
                load: None,
                start: None,
                stop: None,
                destroy: None,
                adapters: BTreeMap::new(),
                lifetime_adapters: BTreeSet::new(),
                active_adapters: BTreeSet::new(),
                process: None,
                timer: None,
                pending_exit: None,
                removed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ServerInner> {
        self.inner.lock().expect("server mutex poisoned")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// `<data_dir>/servers/<id>`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn start_error(&self, reason: &str) -> ServerError {
        ServerError::Start {
            id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    fn stop_error(&self, reason: &str) -> ServerError {
        ServerError::Stop {
            id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    fn deployment_error(&self, reason: impl Into<String>) -> ServerError {
        ServerError::Deployment {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }

    /// Whether this server was dropped from the node and refuses requests.
    pub(crate) fn is_removed(&self) -> bool {
        self.lock().removed
    }

    fn check_removed(&self, inner: &ServerInner) -> Result<(), ServerError> {
        if inner.removed {
            return Err(ServerError::ObjectNotExist(self.identity.clone()));
        }
        Ok(())
    }

    fn activation_timeout_of(&self, inner: &ServerInner) -> Duration {
        inner
            .desc
            .as_ref()
            .and_then(|d| d.activation_timeout)
            .unwrap_or(self.config.wait_time)
    }

    fn deactivation_timeout_of(&self, inner: &ServerInner) -> Duration {
        inner
            .desc
            .as_ref()
            .and_then(|d| d.deactivation_timeout)
            .unwrap_or(self.config.wait_time)
    }

    pub fn activation_timeout(&self) -> Duration {
        self.activation_timeout_of(&self.lock())
    }

    fn load_result(&self, inner: &ServerInner) -> LoadResult {
        LoadResult {
            server: self.identity.clone(),
            adapters: inner
                .adapters
                .iter()
                .map(|(id, adapter)| (id.clone(), adapter.identity().clone()))
                .collect(),
            activation_timeout: self.activation_timeout_of(inner),
            deactivation_timeout: self.deactivation_timeout_of(inner),
        }
    }

    /// Updates from replicas must match the deployment we already have.
    fn check_revision(
        &self,
        inner: &ServerInner,
        replica: &str,
        uuid: &str,
        revision: u64,
    ) -> Result<(), ServerError> {
        if replica == MASTER_REPLICA {
            return Ok(());
        }
        let current = if let Some(load) = &inner.load {
            Some((load.desc.uuid.clone(), load.desc.revision))
        } else if let Some(desc) = &inner.desc {
            Some((desc.uuid.clone(), desc.revision))
        } else {
            layout::read_revision(&self.dir).map_err(|e| self.deployment_error(e.to_string()))?
        };
        let Some((current_uuid, current_revision)) = current else {
            return Ok(());
        };
        if current_uuid != uuid {
            return Err(self.deployment_error(format!(
                "server from replica `{}` is from another application (`{}`)",
                replica, uuid
            )));
        }
        if current_revision != revision {
            return Err(self.deployment_error(format!(
                "server from replica `{}` has a different version than the current server version \
                 ({} != {})",
                replica, revision, current_revision
            )));
        }
        Ok(())
    }

    // Load.

    /// Load (or update) the server. Returns the reply to wait on and the
    /// command to run once the caller has released its locks.
    pub(crate) fn load_command(
        &self,
        desc: Arc<ServerDescriptor>,
        replica: &str,
        no_restart: bool,
    ) -> Result<(Reply<LoadResult>, Option<Command>), ServerError> {
        let mut inner = self.lock();
        self.check_removed(&inner)?;
        if desc.id != self.id {
            return Err(self.deployment_error(format!(
                "descriptor is for server `{}`",
                desc.id
            )));
        }
        self.check_revision(&inner, replica, &desc.uuid, desc.revision)?;

        if let Some(load) = inner.load.as_mut() {
            if load.desc.is_updated(&desc) {
                if load.started {
                    return Err(self.deployment_error("the server is being updated"));
                }
                tracing::debug!(server = %self.id, "pending load superseded by a newer descriptor");
                load.desc = desc;
            }
            return Ok((load.waiters.add(&self.id), None));
        }

        let state = inner.state;
        let live = !matches!(
            state,
            InternalState::Destroying | InternalState::Destroyed
        ) && inner.destroy.is_none();
        if let (Some(current), true) = (inner.desc.clone(), live) {
            if !current.is_updated(&desc) {
                if current.uuid != desc.uuid || current.revision != desc.revision {
                    layout::write_revision(&self.dir, &desc)
                        .map_err(|e| self.deployment_error(e.to_string()))?;
                    inner.desc = Some(desc);
                }
                tracing::debug!(server = %self.id, "descriptor unchanged");
                return Ok((Reply::Ready(Ok(self.load_result(&inner))), None));
            }

            if state.is_running() {
                let restart = current.requires_restart(&desc);
                if no_restart && restart {
                    return Err(self.deployment_error(
                        "the server is running and the update requires a restart",
                    ));
                }
                if no_restart && !state.is_deactivating() {
                    let result = self.update_runtime(&mut inner, &current, desc)?;
                    return Ok((Reply::Ready(Ok(result)), None));
                }
                if inner.stop.is_none() && !state.is_deactivating() {
                    inner.stop = Some(StopCommand::default());
                }
            }
        }

        let mut load = LoadCommand::new(desc);
        let reply = load.waiters.add(&self.id);
        inner.load = Some(load);
        let command = self.next_command(&mut inner);
        Ok((reply, command))
    }

    /// Apply a property-only update to a running server.
    fn update_runtime(
        &self,
        inner: &mut ServerInner,
        current: &ServerDescriptor,
        desc: Arc<ServerDescriptor>,
    ) -> Result<LoadResult, ServerError> {
        layout::deploy(&self.dir, &desc).map_err(|e| self.deployment_error(e.to_string()))?;
        let changed: Vec<(String, Vec<Property>)> = desc
            .properties
            .iter()
            .filter(|(file, properties)| current.properties.get(*file) != Some(*properties))
            .map(|(file, properties)| (file.clone(), properties.clone()))
            .collect();
        inner.desc = Some(desc);
        tracing::info!(server = %self.id, files = changed.len(), "updated server without restart");

        if let (Some(process), false) = (inner.process.clone(), changed.is_empty()) {
            let id = self.id.clone();
            tokio::spawn(async move {
                for (file, properties) in changed {
                    if let Err(e) = process.set_properties(&file, properties).await {
                        tracing::warn!(server = %id, %file, error = %e, "failed to push updated properties");
                    }
                }
            });
        }
        Ok(self.load_result(inner))
    }

    /// Create, update or remove adapter objects to match `desc`.
    fn update_adapters(
        &self,
        inner: &mut ServerInner,
        desc: &ServerDescriptor,
    ) -> (Vec<Arc<ServerAdapter>>, Vec<Arc<ServerAdapter>>) {
        let wanted: BTreeSet<&str> = desc.adapters.iter().map(|a| a.id.as_str()).collect();
        let stale: Vec<String> = inner
            .adapters
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        let removed: Vec<Arc<ServerAdapter>> = stale
            .iter()
            .filter_map(|id| inner.adapters.remove(id))
            .collect();

        let enabled = desc.activation != ActivationMode::Disabled && inner.disabled.is_none();
        let mut added = Vec::new();
        for adapter in &desc.adapters {
            if inner.adapters.contains_key(&adapter.id) {
                continue;
            }
            let object = Arc::new(ServerAdapter::new(
                &adapter.id,
                Identity::adapter(&self.config.instance_name, &self.id, &adapter.id),
                &self.id,
                self.weak_self.clone(),
                self.node.clone(),
                enabled,
            ));
            inner.adapters.insert(adapter.id.clone(), Arc::clone(&object));
            added.push(object);
        }

        inner.lifetime_adapters = desc
            .server_lifetime_adapters()
            .map(str::to_string)
            .collect();
        let lifetime = inner.lifetime_adapters.clone();
        inner.active_adapters.retain(|id| lifetime.contains(id));
        (added, removed)
    }

    pub(crate) async fn execute_load(self: Arc<Self>) -> Option<Command> {
        let (desc, previous) = {
            let inner = self.lock();
            if inner.state != InternalState::Loading {
                return None;
            }
            let load = inner.load.as_ref()?;
            (Arc::clone(&load.desc), inner.desc.clone())
        };

        tracing::info!(server = %self.id, revision = desc.revision, "loading server");
        if let Err(e) = layout::deploy(&self.dir, &desc) {
            return self.load_failed(previous, &e.to_string());
        }

        let (added, removed) = {
            let mut inner = self.lock();
            self.update_adapters(&mut inner, &desc)
        };
        if let Some(node) = self.node.upgrade() {
            for adapter in &removed {
                node.remove_adapter(adapter);
            }
            for adapter in &added {
                node.add_adapter(adapter);
            }
            node.server_loaded(&self.id, &desc.application);
        }
        for adapter in &removed {
            adapter.destroy();
        }

        let mut inner = self.lock();
        inner.desc = Some(desc);
        self.sync_enabled(&inner);
        let load = inner.load.take();
        let command = self.set_state(&mut inner, InternalState::Inactive, "");
        if let Some(load) = load {
            load.waiters.finish(Ok(self.load_result(&inner)));
        }
        command
    }

    fn load_failed(&self, previous: Option<Arc<ServerDescriptor>>, reason: &str) -> Option<Command> {
        tracing::warn!(server = %self.id, %reason, "failed to load server");
        if let Some(previous) = &previous {
            if let Err(e) = layout::deploy(&self.dir, previous) {
                tracing::warn!(server = %self.id, error = %e, "failed to restore previous deployment");
            }
        }

        let mut inner = self.lock();
        let load = inner.load.take();
        if previous.is_none() && inner.destroy.is_none() {
            inner.destroy = Some(DestroyCommand {
                load_failure: true,
                clear_dir: true,
                ..Default::default()
            });
        }
        let command = self.set_state(&mut inner, InternalState::Inactive, reason);
        if let Some(load) = load {
            load.waiters.finish(Err(self.deployment_error(reason)));
        }
        command
    }

    /// Whether applying `desc` would restart the running process.
    pub fn check_update(&self, desc: &ServerDescriptor) -> Result<bool, ServerError> {
        let inner = self.lock();
        self.check_removed(&inner)?;
        if desc.id != self.id {
            return Err(self.deployment_error(format!(
                "descriptor is for server `{}`",
                desc.id
            )));
        }
        Ok(match &inner.desc {
            Some(current) if inner.state.is_running() => current.requires_restart(desc),
            _ => false,
        })
    }

    // Destroy.

    pub(crate) fn destroy_command(
        &self,
        uuid: &str,
        revision: u64,
        replica: &str,
        no_restart: bool,
    ) -> Result<(Reply<()>, Option<Command>), ServerError> {
        let mut inner = self.lock();
        self.check_removed(&inner)?;
        self.check_revision(&inner, replica, uuid, revision)?;
        let state = inner.state;
        if inner.desc.is_none()
            && inner.load.is_none()
            && inner.destroy.is_none()
            && matches!(state, InternalState::Inactive | InternalState::Destroyed)
        {
            // Nothing was deployed here: no state change and no observer
            // update. The node drops the servant.
            inner.removed = true;
            return Ok((Reply::Ready(Ok(())), None));
        }
        if let Some(destroy) = inner.destroy.as_mut() {
            return Ok((destroy.waiters.add(&self.id), None));
        }
        if state.is_running() && no_restart {
            return Err(self.deployment_error("the server is running"));
        }

        let mut destroy = DestroyCommand::default();
        let reply = destroy.waiters.add(&self.id);
        inner.destroy = Some(destroy);
        if state.is_running() && !state.is_deactivating() && inner.stop.is_none() {
            inner.stop = Some(StopCommand::default());
        }
        let command = self.next_command(&mut inner);
        Ok((reply, command))
    }

    pub(crate) async fn execute_destroy(self: Arc<Self>) -> Option<Command> {
        let (adapters, clear_dir) = {
            let mut inner = self.lock();
            if inner.state != InternalState::Destroying {
                return None;
            }
            let clear_dir = inner.destroy.as_ref().is_some_and(|d| d.clear_dir);
            inner.lifetime_adapters.clear();
            inner.active_adapters.clear();
            (std::mem::take(&mut inner.adapters), clear_dir)
        };

        tracing::info!(server = %self.id, "destroying server");
        let node = self.node.upgrade();
        for adapter in adapters.values() {
            if let Some(node) = &node {
                node.remove_adapter(adapter);
            }
            adapter.destroy();
        }
        self.remove_directory(clear_dir);

        let (command, remove) = {
            let mut inner = self.lock();
            inner.desc = None;
            inner.failures.clear();
            let command = self.set_state(&mut inner, InternalState::Destroyed, "");
            let remove = command.is_none() && inner.load.is_none();
            inner.removed = remove;
            (command, remove)
        };
        if remove {
            if let Some(node) = &node {
                node.remove_server(&self);
            }
        }
        command
    }

    fn remove_directory(&self, force: bool) {
        if !self.dir.exists() {
            return;
        }
        let removable = force
            || match layout::can_remove_server_directory(&self.dir) {
                Ok(removable) => removable,
                Err(e) => {
                    tracing::warn!(server = %self.id, error = %e, "cannot inspect server directory");
                    false
                }
            };
        if !removable {
            tracing::warn!(
                server = %self.id,
                dir = %self.dir.display(),
                "server directory contains data not created or written by the grid node; not removing it"
            );
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(server = %self.id, "removed server directory"),
            Err(e) => {
                tracing::warn!(server = %self.id, error = %e, "failed to remove server directory")
            }
        }
    }

    // Start.

    /// Administrative start. Also re-enables a server disabled after
    /// repeated failures.
    pub async fn start(&self) -> Result<(), ServerError> {
        let (reply, command) = self.start_command()?;
        if let Some(command) = command {
            command.run().await;
        }
        reply.wait().await
    }

    pub(crate) fn start_command(&self) -> Result<(Reply<()>, Option<Command>), ServerError> {
        let mut inner = self.lock();
        self.check_removed(&inner)?;
        let Some(desc) = inner.desc.clone() else {
            return Err(self.start_error("the server is not loaded"));
        };
        match inner.disabled {
            Some(DisableReason::Failure) => {
                tracing::info!(server = %self.id, "re-enabling server disabled after failures");
                inner.disabled = None;
                inner.failures.clear();
                inner.cancel_timer();
                self.sync_enabled(&inner);
                self.emit(&inner);
            }
            Some(DisableReason::Admin) => return Err(self.start_error("the server is disabled")),
            None => {}
        }
        if desc.activation == ActivationMode::Disabled {
            return Err(self.start_error("the server is disabled"));
        }
        match inner.state {
            InternalState::Active => return Err(self.start_error("the server is already active")),
            InternalState::Destroying | InternalState::Destroyed => {
                return Err(self.start_error("the server is being destroyed"));
            }
            _ => {}
        }
        let reply = inner
            .start
            .get_or_insert_with(Default::default)
            .waiters
            .add(&self.id);
        let command = self.next_command(&mut inner);
        Ok((reply, command))
    }

    /// Start requested by a client resolving `adapter`.
    pub(crate) fn start_for_adapter(
        &self,
        adapter: &ServerAdapter,
    ) -> Result<Option<Command>, ServerError> {
        let mut inner = self.lock();
        self.check_removed(&inner)?;
        match inner.activation() {
            ActivationMode::OnDemand => {}
            // Started by the node itself.
            ActivationMode::Always => return Ok(None),
            _ => return Err(self.start_error("the server is not activated on demand")),
        }
        match inner.state {
            InternalState::Deactivating | InternalState::DeactivatingWaitForProcess => {
                adapter.set_activate_after_deactivating();
                Ok(None)
            }
            InternalState::Destroying | InternalState::Destroyed => {
                Err(self.start_error("the server is being destroyed"))
            }
            InternalState::Inactive | InternalState::Loading => {
                inner.start.get_or_insert_with(Default::default);
                Ok(self.next_command(&mut inner))
            }
            _ => Ok(None),
        }
    }

    fn launch_spec(&self, desc: &ServerDescriptor) -> LaunchSpec {
        let (stdout, stderr) = match &self.config.output_dir {
            Some(dir) => {
                let out = dir.join(format!("{}.out", self.id));
                let err = if self.config.redirect_err_to_out {
                    out.clone()
                } else {
                    dir.join(format!("{}.err", self.id))
                };
                (Some(out), Some(err))
            }
            None => (None, None),
        };
        let mut envs = desc.env_pairs();
        if desc.properties.contains_key(layout::CONFIG_FILE) {
            envs.push((
                SERVER_CONFIG_ENV.to_string(),
                self.dir
                    .join(layout::CONFIG_DIR)
                    .join(layout::CONFIG_FILE)
                    .display()
                    .to_string(),
            ));
        }
        LaunchSpec {
            name: self.id.clone(),
            exe: desc.exe.clone(),
            args: desc.options.clone(),
            pwd: desc.pwd.clone(),
            envs,
            user: desc.user.clone(),
            allow_root: self.config.allow_running_servers_as_root,
            stdout,
            stderr,
        }
    }

    pub(crate) async fn execute_start(self: Arc<Self>) -> Option<Command> {
        let spec = {
            let mut inner = self.lock();
            if inner.state != InternalState::Activating {
                return None;
            }
            match (inner.desc.clone(), inner.enabled()) {
                (Some(desc), true) => self.launch_spec(&desc),
                (None, _) => {
                    return self.set_state(&mut inner, InternalState::Inactive, "the server is not loaded");
                }
                (Some(_), false) => {
                    return self.set_state(&mut inner, InternalState::Inactive, "the server is disabled");
                }
            }
        };

        tracing::info!(server = %self.id, exe = %spec.exe.display(), "activating server");
        let owner: Arc<dyn ProcessOwner> = self.clone();
        let result = self.activator.activate(spec, owner).await;

        let mut inner = self.lock();
        match result {
            Ok(pid) => {
                tracing::debug!(server = %self.id, pid, "server process started");
                let command = self.set_state(&mut inner, InternalState::WaitForActivation, "");
                self.arm_activation_timer(&mut inner);
                if let Some(exit) = inner.pending_exit.take() {
                    return self.handle_exit(&mut inner, exit).or(command);
                }
                command.or_else(|| self.check_activation(&mut inner))
            }
            Err(e) => {
                tracing::warn!(server = %self.id, error = %e, "server activation failed");
                inner.pending_exit = None;
                self.record_failure(&mut inner);
                self.set_state(&mut inner, InternalState::Inactive, &e.to_string())
            }
        }
    }

    fn arm_activation_timer(&self, inner: &mut ServerInner) {
        if inner.state != InternalState::WaitForActivation {
            return;
        }
        let timeout = self.activation_timeout_of(inner);
        let Some(start) = inner.start.as_mut() else {
            return;
        };
        let this = self.weak_self.clone();
        start.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = this.upgrade() {
                this.activation_timed_out(timeout).await;
            }
        }));
    }

    async fn activation_timed_out(&self, timeout: Duration) {
        let command = {
            let mut inner = self.lock();
            if let Some(start) = inner.start.as_mut() {
                // Detach; this task is the timer.
                start.timer = None;
            }
            if inner.state != InternalState::WaitForActivation {
                return;
            }
            tracing::warn!(
                server = %self.id,
                timeout = %humantime::format_duration(timeout),
                "server activation timed out"
            );
            self.record_failure(&mut inner);
            self.set_state(
                &mut inner,
                InternalState::ActivationTimeout,
                "the server activation timed out",
            )
        };
        if let Err(e) = self.activator.kill(&self.id).await {
            tracing::warn!(server = %self.id, error = %e, "failed to kill server after activation timeout");
        }
        if let Some(command) = command {
            command.spawn();
        }
    }

    /// Move to `Active` once every server-lifetime adapter is up and the
    /// process facet (if required) is registered.
    fn check_activation(&self, inner: &mut ServerInner) -> Option<Command> {
        if !matches!(
            inner.state,
            InternalState::WaitForActivation | InternalState::ActivationTimeout
        ) {
            return None;
        }
        let desc = inner.desc.as_ref()?;
        let adapters_up = inner
            .lifetime_adapters
            .iter()
            .all(|id| inner.active_adapters.contains(id));
        let process_up = !desc.process_registered || inner.process.is_some();
        if adapters_up && process_up {
            return self.set_state(inner, InternalState::Active, "");
        }
        None
    }

    pub(crate) fn adapter_activated(&self, adapter: &str) -> Option<Command> {
        let mut inner = self.lock();
        if !inner.lifetime_adapters.contains(adapter) {
            return None;
        }
        inner.active_adapters.insert(adapter.to_string());
        self.check_activation(&mut inner)
    }

    /// A server-lifetime adapter going away means the server is
    /// shutting down.
    pub(crate) fn adapter_deactivated(&self, adapter: &str) -> Option<Command> {
        let mut inner = self.lock();
        if !inner.active_adapters.remove(adapter) {
            return None;
        }
        if inner.state == InternalState::Active && inner.stop.is_none() {
            tracing::info!(server = %self.id, %adapter, "server-lifetime adapter deactivated");
            inner.stop = Some(StopCommand::default());
            return self.next_command(&mut inner);
        }
        None
    }

    /// Register the control facet of the running process.
    pub fn set_process(&self, process: Arc<dyn ProcessControl>) -> Result<(), ServerError> {
        let command = {
            let mut inner = self.lock();
            self.check_removed(&inner)?;
            if !matches!(
                inner.state,
                InternalState::Activating
                    | InternalState::WaitForActivation
                    | InternalState::ActivationTimeout
                    | InternalState::Active
            ) {
                tracing::debug!(server = %self.id, state = %inner.state, "ignoring process registration");
                return Ok(());
            }
            inner.process = Some(process);
            self.check_activation(&mut inner)
        };
        if let Some(command) = command {
            command.spawn();
        }
        Ok(())
    }

    // Stop.

    pub async fn stop(&self) -> Result<(), ServerError> {
        let (reply, command) = self.stop_command()?;
        if let Some(command) = command {
            command.run().await;
        }
        reply.wait().await
    }

    pub(crate) fn stop_command(&self) -> Result<(Reply<()>, Option<Command>), ServerError> {
        let mut inner = self.lock();
        self.check_removed(&inner)?;
        match inner.state {
            InternalState::Inactive | InternalState::Loading => {
                return Err(self.stop_error("the server is already inactive"));
            }
            InternalState::Destroying | InternalState::Destroyed => {
                return Err(self.stop_error("the server is being destroyed"));
            }
            _ => {}
        }
        let reply = inner
            .stop
            .get_or_insert_with(Default::default)
            .waiters
            .add(&self.id);
        let command = self.next_command(&mut inner);
        Ok((reply, command))
    }

    pub(crate) async fn execute_stop(self: Arc<Self>) -> Option<Command> {
        let process = {
            let inner = self.lock();
            if inner.state != InternalState::Deactivating {
                return None;
            }
            inner.process.clone()
        };

        let graceful = process.is_some();
        tracing::info!(server = %self.id, graceful, "deactivating server");
        if let Err(e) = self.activator.deactivate(&self.id, process).await {
            tracing::warn!(server = %self.id, error = %e, "failed to deactivate server");
        }

        let mut inner = self.lock();
        if inner.state != InternalState::Deactivating {
            // Already gone.
            return None;
        }
        let command = if graceful {
            self.set_state(
                &mut inner,
                InternalState::DeactivatingWaitForProcess,
                "",
            )
        } else {
            None
        };
        if let Some(stop) = inner.stop.as_mut() {
            stop.step = if graceful {
                StopStep::Shutdown
            } else {
                StopStep::Terminate
            };
        }
        self.arm_deactivation_timer(&mut inner);
        command
    }

    fn arm_deactivation_timer(&self, inner: &mut ServerInner) {
        let timeout = self.deactivation_timeout_of(inner);
        let Some(stop) = inner.stop.as_mut() else {
            return;
        };
        let this = self.weak_self.clone();
        stop.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = this.upgrade() {
                this.deactivation_timed_out().await;
            }
        }));
    }

    /// Escalate: process shutdown, then `SIGTERM`, then `SIGKILL`.
    async fn deactivation_timed_out(&self) {
        let signal = {
            let mut inner = self.lock();
            let Some(stop) = inner.stop.as_mut() else {
                return;
            };
            stop.timer = None;
            let step = stop.step;
            let signal = match (inner.state, step) {
                (InternalState::DeactivatingWaitForProcess, StopStep::Shutdown) => {
                    let queued = self.set_state(&mut inner, InternalState::Deactivating, "");
                    debug_assert!(queued.is_none(), "command runnable while deactivating");
                    Some((StopStep::Terminate, Signal::Term))
                }
                (InternalState::Deactivating, StopStep::Shutdown | StopStep::Terminate) => {
                    Some((StopStep::Kill, Signal::Kill))
                }
                (InternalState::Deactivating | InternalState::DeactivatingWaitForProcess, StopStep::Kill) => {
                    tracing::error!(server = %self.id, "server process did not exit after SIGKILL");
                    None
                }
                _ => None,
            };
            if let Some((next, _)) = signal {
                if let Some(stop) = inner.stop.as_mut() {
                    stop.step = next;
                }
                self.arm_deactivation_timer(&mut inner);
            }
            signal
        };
        if let Some((_, signal)) = signal {
            tracing::warn!(server = %self.id, %signal, "server deactivation timed out; escalating");
            if let Err(e) = self.activator.send_signal(&self.id, signal).await {
                tracing::warn!(server = %self.id, error = %e, "failed to signal server");
            }
        }
    }

    // Process exit.

    fn handle_exit(&self, inner: &mut ServerInner, exit: ProcessExit) -> Option<Command> {
        let state = inner.state;
        match state {
            InternalState::Deactivating | InternalState::DeactivatingWaitForProcess => {
                tracing::info!(server = %self.id, pid = exit.pid, kind = %exit.kind, "server deactivated");
                self.set_state(inner, InternalState::Inactive, "")
            }
            InternalState::WaitForActivation
            | InternalState::ActivationTimeout
            | InternalState::Active => {
                let message = format!("the server terminated unexpectedly ({})", exit.kind);
                tracing::warn!(server = %self.id, pid = exit.pid, kind = %exit.kind, "server terminated unexpectedly");
                if exit.kind.is_failure() && state != InternalState::ActivationTimeout {
                    self.record_failure(inner);
                }
                let queued = self.set_state(inner, InternalState::Deactivating, &message);
                debug_assert!(queued.is_none(), "command runnable while deactivating");
                self.set_state(inner, InternalState::Inactive, &message)
            }
            _ => {
                tracing::debug!(server = %self.id, pid = exit.pid, %state, "ignoring process exit");
                None
            }
        }
    }

    fn record_failure(&self, inner: &mut ServerInner) {
        if self.config.disable_on_failure == DisableOnFailure::Never {
            return;
        }
        let now = Instant::now();
        inner.failures.push_back(now);
        while inner
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.config.failure_window)
        {
            inner.failures.pop_front();
        }
        let threshold = self.config.failure_threshold.max(1) as usize;
        if inner.failures.len() >= threshold && inner.disabled.is_none() {
            tracing::warn!(
                server = %self.id,
                failures = inner.failures.len(),
                policy = %self.config.disable_on_failure,
                "disabling server after repeated failures"
            );
            inner.disabled = Some(DisableReason::Failure);
            self.sync_enabled(inner);
            self.emit(inner);
        }
    }

    // Enablement.

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ServerError> {
        let command = {
            let mut inner = self.lock();
            self.check_removed(&inner)?;
            let was = inner.enabled();
            if enabled {
                inner.disabled = None;
                inner.failures.clear();
            } else {
                inner.disabled = Some(DisableReason::Admin);
                inner.cancel_timer();
            }
            self.sync_enabled(&inner);
            if was == inner.enabled() {
                None
            } else {
                tracing::info!(server = %self.id, enabled, "server enablement changed");
                self.emit(&inner);
                self.restart_if_always(&mut inner)
            }
        };
        if let Some(command) = command {
            command.run().await;
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled()
    }

    fn sync_enabled(&self, inner: &ServerInner) {
        let enabled = inner.enabled();
        for adapter in inner.adapters.values() {
            adapter.set_enabled(enabled);
        }
    }

    fn restart_if_always(&self, inner: &mut ServerInner) -> Option<Command> {
        if inner.state != InternalState::Inactive
            || inner.activation() != ActivationMode::Always
            || !self.activator.is_active()
        {
            return None;
        }
        inner.start.get_or_insert_with(Default::default);
        self.next_command(inner)
    }

    fn reenable_after_failure(&self) -> Option<Command> {
        let mut inner = self.lock();
        inner.timer = None;
        if inner.disabled != Some(DisableReason::Failure) || inner.removed {
            return None;
        }
        tracing::info!(server = %self.id, "re-enabling server after failure period");
        inner.disabled = None;
        inner.failures.clear();
        self.sync_enabled(&inner);
        self.emit(&inner);
        self.restart_if_always(&mut inner)
    }

    fn delayed_start(&self) -> Option<Command> {
        let mut inner = self.lock();
        inner.timer = None;
        if inner.removed
            || inner.state != InternalState::Inactive
            || !matches!(
                inner.activation(),
                ActivationMode::Always | ActivationMode::Session
            )
            || !self.activator.is_active()
        {
            return None;
        }
        inner.start.get_or_insert_with(Default::default);
        self.next_command(&mut inner)
    }

    fn schedule(&self, inner: &mut ServerInner, delay: Duration, action: fn(&Server) -> Option<Command>) {
        inner.cancel_timer();
        let this = self.weak_self.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let command = this.upgrade().and_then(|this| action(&this));
            if let Some(command) = command {
                command.spawn();
            }
        }));
    }

    /// Arm the delayed start or re-enable timer after the server became
    /// inactive.
    fn schedule_after_inactive(&self, inner: &mut ServerInner, previous: InternalState) {
        inner.cancel_timer();
        if !self.activator.is_active() {
            return;
        }
        let Some(desc) = inner.desc.clone() else {
            return;
        };
        match (inner.disabled, self.config.disable_on_failure) {
            (Some(DisableReason::Failure), DisableOnFailure::For(period)) => {
                self.schedule(inner, period, Server::reenable_after_failure);
                return;
            }
            (Some(_), _) => return,
            (None, _) => {}
        }
        let auto = match desc.activation {
            ActivationMode::Always => true,
            ActivationMode::Session => {
                previous == InternalState::Loading && !desc.session_id.is_empty()
            }
            _ => false,
        };
        if auto {
            self.schedule(inner, self.config.delayed_start, Server::delayed_start);
        }
    }

    /// Cancel the delayed start and re-enable timers.
    pub(crate) fn cancel_timers(&self) {
        self.lock().cancel_timer();
    }

    // State machine.

    fn fail_start(&self, inner: &mut ServerInner, reason: &str) {
        if let Some(start) = inner.start.take_if(|s| s.started()) {
            start.finish(Err(self.start_error(reason)));
            for adapter in inner.adapters.values() {
                adapter.activation_failed(reason);
            }
        }
    }

    fn set_state(
        &self,
        inner: &mut ServerInner,
        next: InternalState,
        reason: &str,
    ) -> Option<Command> {
        self.transition(inner, next, reason);
        self.next_command(inner)
    }

    fn transition(&self, inner: &mut ServerInner, next: InternalState, reason: &str) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::error!(server = %self.id, from = %previous, to = %next, "invalid server state transition");
            return;
        }
        inner.state = next;
        // Tear-down of a failed first load is invisible to observers.
        let quiet = inner.destroy.as_ref().is_some_and(|d| d.load_failure);
        let public_change = previous.public() != next.public();
        if public_change && !quiet {
            tracing::info!(server = %self.id, state = %next.public(), "server state changed");
        } else {
            tracing::debug!(server = %self.id, from = %previous, to = %next, "server state changed");
        }
        if previous == InternalState::Inactive {
            inner.cancel_timer();
        }

        match next {
            InternalState::Inactive => {
                inner.process = None;
                inner.active_adapters.clear();
                inner.pending_exit = None;
                if let Some(stop) = inner.stop.take() {
                    stop.finish(Ok(()));
                }
                let reason = if reason.is_empty() {
                    "the server is inactive"
                } else {
                    reason
                };
                self.fail_start(inner, reason);
                if let Some(node) = self.node.upgrade() {
                    for adapter in inner.adapters.values() {
                        if adapter.clear() && !quiet {
                            node.observer_update_adapter(adapter.dynamic_info());
                        }
                    }
                }
                self.schedule_after_inactive(inner, previous);

                let mut reactivate = false;
                for adapter in inner.adapters.values() {
                    reactivate |= adapter.take_activate_after_deactivating();
                }
                if reactivate && inner.activation() == ActivationMode::OnDemand {
                    inner.start.get_or_insert_with(Default::default);
                }
            }
            InternalState::Active => {
                inner.failures.clear();
                if let Some(start) = inner.start.take() {
                    start.finish(Ok(()));
                }
            }
            InternalState::ActivationTimeout => {
                self.fail_start(inner, reason);
            }
            InternalState::Deactivating | InternalState::DeactivatingWaitForProcess => {
                if !previous.is_deactivating() {
                    let reason = if reason.is_empty() {
                        "the server is being deactivated"
                    } else {
                        reason
                    };
                    self.fail_start(inner, reason);
                }
            }
            InternalState::Destroying => {
                inner.cancel_timer();
                let reason = "the server is being destroyed";
                if let Some(start) = inner.start.take() {
                    start.finish(Err(self.start_error(reason)));
                }
                if let Some(load) = inner.load.take() {
                    load.waiters.finish(Err(self.deployment_error(reason)));
                }
                for adapter in inner.adapters.values() {
                    adapter.activation_failed(reason);
                }
            }
            InternalState::Destroyed => {
                if let Some(destroy) = inner.destroy.take() {
                    destroy.waiters.finish(Ok(()));
                }
            }
            _ => {}
        }

        if public_change && !quiet {
            self.emit(inner);
        }
    }

    /// Pick the next command that may run in the current state, mark it
    /// started, and move to its state.
    fn next_command(&self, inner: &mut ServerInner) -> Option<Command> {
        fn ready<C: ServerCommand>(command: &Option<C>, state: InternalState) -> bool {
            command
                .as_ref()
                .is_some_and(|c| !c.started() && c.can_execute(state))
        }

        let this = self.weak_self.upgrade()?;
        let state = inner.state;
        let (next, command) = if ready(&inner.stop, state) {
            let stop = inner.stop.as_mut()?;
            stop.started = true;
            (stop.next_state(), Command::Stop(this))
        } else if ready(&inner.destroy, state) {
            let destroy = inner.destroy.as_mut()?;
            destroy.started = true;
            (destroy.next_state(), Command::Destroy(this))
        } else if ready(&inner.load, state) {
            let load = inner.load.as_mut()?;
            load.started = true;
            (load.next_state(), Command::Load(this))
        } else if ready(&inner.start, state) {
            let start = inner.start.as_mut()?;
            start.started = true;
            (start.next_state(), Command::Start(this))
        } else {
            return None;
        };
        self.transition(inner, next, "");
        Some(command)
    }

    fn emit(&self, inner: &ServerInner) {
        if let Some(node) = self.node.upgrade() {
            node.observer_update_server(self.dynamic_info_of(inner));
        }
    }

    fn dynamic_info_of(&self, inner: &ServerInner) -> ServerDynamicInfo {
        ServerDynamicInfo {
            id: self.id.clone(),
            state: inner.state.public(),
            pid: self.activator.get_server_pid(&self.id).unwrap_or(0),
            enabled: inner.enabled(),
        }
    }

    // Queries and process interaction.

    pub fn dynamic_info(&self) -> ServerDynamicInfo {
        self.dynamic_info_of(&self.lock())
    }

    pub fn get_state(&self) -> ServerState {
        self.lock().state.public()
    }

    pub fn internal_state(&self) -> InternalState {
        self.lock().state
    }

    /// The pid of the live process, 0 if none.
    pub fn get_pid(&self) -> u32 {
        self.activator.get_server_pid(&self.id).unwrap_or(0)
    }

    pub fn descriptor(&self) -> Option<Arc<ServerDescriptor>> {
        self.lock().desc.clone()
    }

    pub fn adapters(&self) -> Vec<Arc<ServerAdapter>> {
        self.lock().adapters.values().cloned().collect()
    }

    pub fn adapter(&self, id: &str) -> Option<Arc<ServerAdapter>> {
        self.lock().adapters.get(id).cloned()
    }

    pub async fn send_signal(&self, signal: &str) -> Result<(), ServerError> {
        self.activator
            .send_signal_named(&self.id, signal)
            .await
            .map_err(|e| match e {
                ActivatorError::Signal(_) => ServerError::BadSignal(signal.to_string()),
                e => ServerError::Signal {
                    id: self.id.clone(),
                    reason: e.to_string(),
                },
            })
    }

    /// Write `message` to the process's stdout (`fd == 1`) or stderr
    /// (`fd == 2`) through its process facet.
    pub async fn write_message(&self, message: &str, fd: i32) -> Result<(), ServerError> {
        let process = {
            let inner = self.lock();
            match (&inner.process, inner.state) {
                (Some(process), InternalState::Active) => Arc::clone(process),
                _ => return Err(ServerError::NotActive(self.id.clone())),
            }
        };
        Ok(process.write_message(message, fd).await?)
    }
}

#[async_trait]
impl ProcessOwner for Server {
    fn terminated(&self, exit: ProcessExit) {
        let command = {
            let mut inner = self.lock();
            if inner.state == InternalState::Activating {
                inner.pending_exit = Some(exit);
                return;
            }
            self.handle_exit(&mut inner, exit)
        };
        if let Some(command) = command {
            command.spawn();
        }
    }

    async fn stop(&self) {
        match self.stop_command() {
            Ok((reply, command)) => {
                if let Some(command) = command {
                    command.run().await;
                }
                if let Err(e) = reply.wait().await {
                    tracing::warn!(server = %self.id, error = %e, "failed to stop server");
                }
            }
            Err(e) => tracing::debug!(server = %self.id, error = %e, "nothing to stop"),
        }
    }
}
