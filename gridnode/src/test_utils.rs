/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-memory registries, sessions, observers and process facets for
//! tests, plus a node wired to a real process launcher in a temporary
//! directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::activator::Activator;
use crate::activator::LaunchSpec;
use crate::activator::Launched;
use crate::activator::LauncherError;
use crate::activator::NativeLauncher;
use crate::activator::ProcessLauncher;
use crate::activator::Signal;
use crate::config::NodeConfig;
use crate::descriptor::Property;
use crate::descriptor::ServerDescriptor;
use crate::node::Node;
use crate::platform::LoadInfo;
use crate::platform::NodeInfo;
use crate::registry::AdapterDynamicInfo;
use crate::registry::Identity;
use crate::registry::InternalRegistry;
use crate::registry::NodeDynamicInfo;
use crate::registry::NodeObserver;
use crate::registry::NodeSession;
use crate::registry::ProcessControl;
use crate::registry::Query;
use crate::registry::RegistryError;
use crate::registry::ServerDynamicInfo;
use crate::registry::ServerState;
use crate::server::Server;

const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

/// Poll `ready` until it holds, panicking after [`WAIT`].
pub(crate) async fn poll_until(what: &str, mut ready: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !ready() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

pub(crate) async fn wait_for_state(server: &Server, state: ServerState) {
    poll_until(&format!("{} to be {}", server.id(), state), || {
        server.get_state() == state
    })
    .await;
}

/// A manual `/bin/sh -c <script>` server of application `app`.
pub(crate) fn sh_descriptor(id: &str, script: &str) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        application: "app".to_string(),
        uuid: "uuid".to_string(),
        revision: 1,
        exe: PathBuf::from("/bin/sh"),
        options: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ObserverEvent {
    NodeUp(NodeDynamicInfo),
    Server(ServerDynamicInfo),
    Adapter(AdapterDynamicInfo),
}

pub(crate) struct FakeObserver {
    identity: Identity,
    delay: Duration,
    failing: AtomicBool,
    events: Mutex<Vec<ObserverEvent>>,
}

impl FakeObserver {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Self::with_delay(name, Duration::ZERO)
    }

    /// Every push takes `delay` to complete.
    pub(crate) fn with_delay(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity::new("observer", name),
            delay,
            failing: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_events(&self, count: usize) {
        poll_until(&format!("{} observer events", count), || {
            self.events.lock().unwrap().len() >= count
        })
        .await;
    }

    /// The states reported for server `id`, in order.
    pub(crate) fn server_states(&self, id: &str) -> Vec<ServerState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ObserverEvent::Server(info) if info.id == id => Some(info.state),
                _ => None,
            })
            .collect()
    }

    pub(crate) async fn wait_for_server_state(&self, id: &str, state: ServerState) {
        poll_until(&format!("{} to be reported {}", id, state), || {
            self.server_states(id).contains(&state)
        })
        .await;
    }

    async fn record(&self, event: ObserverEvent) -> Result<(), RegistryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::ConnectionLost("observer unreachable".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl NodeObserver for FakeObserver {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn node_up(&self, info: NodeDynamicInfo) -> Result<(), RegistryError> {
        self.record(ObserverEvent::NodeUp(info)).await
    }

    async fn update_server(
        &self,
        _node: &str,
        info: ServerDynamicInfo,
    ) -> Result<(), RegistryError> {
        self.record(ObserverEvent::Server(info)).await
    }

    async fn update_adapter(
        &self,
        _node: &str,
        info: AdapterDynamicInfo,
    ) -> Result<(), RegistryError> {
        self.record(ObserverEvent::Adapter(info)).await
    }
}

pub(crate) struct FakeSession {
    identity: Identity,
    pub(crate) keep_alives: AtomicUsize,
    pub(crate) load_servers: AtomicUsize,
    pub(crate) destroyed: AtomicUsize,
    pub(crate) replica_observers: AtomicUsize,
    failing: AtomicBool,
    timeout: Mutex<Duration>,
    servers: Mutex<Vec<String>>,
    observer: Arc<FakeObserver>,
}

impl FakeSession {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity::new("session", name),
            keep_alives: AtomicUsize::new(0),
            load_servers: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            replica_observers: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            timeout: Mutex::new(Duration::ZERO),
            servers: Mutex::new(Vec::new()),
            observer: FakeObserver::new(name),
        })
    }

    /// The servers the registry claims for this node.
    pub(crate) fn set_servers(&self, servers: Vec<String>) {
        *self.servers.lock().unwrap() = servers;
    }

    /// Fail every call from now on, as if the registry went away.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn observer(&self) -> Arc<FakeObserver> {
        Arc::clone(&self.observer)
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RegistryError::ObjectNotExist(self.identity.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NodeSession for FakeSession {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn keep_alive(&self, _load: LoadInfo) -> Result<(), RegistryError> {
        self.check()?;
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn timeout(&self) -> Result<Duration, RegistryError> {
        self.check()?;
        Ok(*self.timeout.lock().unwrap())
    }

    async fn get_observer(&self) -> Result<Arc<dyn NodeObserver>, RegistryError> {
        self.check()?;
        Ok(self.observer())
    }

    async fn set_replica_observer(&self, _node: Arc<Node>) -> Result<(), RegistryError> {
        self.check()?;
        self.replica_observers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_servers(&self) -> Result<Vec<String>, RegistryError> {
        self.check()?;
        Ok(self.servers.lock().unwrap().clone())
    }

    async fn load_servers(&self) -> Result<(), RegistryError> {
        self.check()?;
        self.load_servers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RegistryError> {
        self.check()?;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeRegistry {
    name: String,
    identity: Identity,
    down: AtomicBool,
    timeout: Mutex<Duration>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    replicas: Mutex<Vec<Arc<FakeRegistry>>>,
}

impl FakeRegistry {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            identity: Identity::replica_registry("GridNode", name),
            down: AtomicBool::new(false),
            timeout: Mutex::new(Duration::ZERO),
            sessions: Mutex::new(Vec::new()),
            replicas: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Session timeout reported by sessions created from now on.
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    pub(crate) fn set_replicas(&self, replicas: Vec<Arc<FakeRegistry>>) {
        *self.replicas.lock().unwrap() = replicas;
    }

    /// Number of successful registrations.
    pub(crate) fn registrations(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.down.load(Ordering::SeqCst) {
            Err(RegistryError::ConnectionLost(format!("{} is down", self.identity)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InternalRegistry for FakeRegistry {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn register_node(
        &self,
        _info: NodeInfo,
        _node: Arc<Node>,
        _load: LoadInfo,
    ) -> Result<Arc<dyn NodeSession>, RegistryError> {
        self.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = FakeSession::new(&format!("{}-{}", self.name, sessions.len() + 1));
        *session.timeout.lock().unwrap() = *self.timeout.lock().unwrap();
        sessions.push(Arc::clone(&session));
        Ok(session)
    }

    async fn get_replicas(&self) -> Result<Vec<Arc<dyn InternalRegistry>>, RegistryError> {
        self.check()?;
        Ok(self
            .replicas
            .lock()
            .unwrap()
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn InternalRegistry>)
            .collect())
    }
}

pub(crate) struct FakeQuery {
    registries: Vec<Arc<FakeRegistry>>,
}

impl FakeQuery {
    pub(crate) fn new(registries: Vec<Arc<FakeRegistry>>) -> Arc<Self> {
        Arc::new(Self { registries })
    }
}

#[async_trait]
impl Query for FakeQuery {
    async fn find_registry(
        &self,
        identity: &Identity,
    ) -> Result<Option<Arc<dyn InternalRegistry>>, RegistryError> {
        Ok(self
            .registries
            .iter()
            .find(|r| &r.identity == identity)
            .map(|r| Arc::clone(r) as Arc<dyn InternalRegistry>))
    }

    async fn find_all_registries(&self) -> Result<Vec<Arc<dyn InternalRegistry>>, RegistryError> {
        Ok(self
            .registries
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn InternalRegistry>)
            .collect())
    }
}

/// A process-control facet that records what it is asked to do.
pub(crate) struct FakeProcess {
    failing: bool,
    /// Signals this server through the activator on shutdown.
    terminate: Option<(Weak<Activator>, String)>,
    shutdowns: AtomicUsize,
    messages: Mutex<Vec<(String, i32)>>,
    properties: Mutex<Vec<(String, Vec<Property>)>>,
}

impl FakeProcess {
    fn build(failing: bool, terminate: Option<(Weak<Activator>, String)>) -> Arc<Self> {
        Arc::new(Self {
            failing,
            terminate,
            shutdowns: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            properties: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::build(false, None)
    }

    /// Every call fails as if the process were unreachable.
    pub(crate) fn failing() -> Arc<Self> {
        Self::build(true, None)
    }

    /// Shuts down by having `activator` send SIGTERM to server `name`.
    pub(crate) fn terminating(activator: &Arc<Activator>, name: &str) -> Arc<Self> {
        Self::build(false, Some((Arc::downgrade(activator), name.to_string())))
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn messages(&self) -> Vec<(String, i32)> {
        self.messages.lock().unwrap().clone()
    }

    pub(crate) fn properties(&self) -> Vec<(String, Vec<Property>)> {
        self.properties.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_properties(&self, count: usize) {
        poll_until(&format!("{} property updates", count), || {
            self.properties.lock().unwrap().len() >= count
        })
        .await;
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.failing {
            Err(RegistryError::ConnectionLost("process unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn shutdown(&self) -> Result<(), RegistryError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if let Some((activator, name)) = &self.terminate {
            if let Some(activator) = activator.upgrade() {
                activator
                    .send_signal(name, Signal::Term)
                    .await
                    .map_err(|e| RegistryError::Remote(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn write_message(&self, message: &str, fd: i32) -> Result<(), RegistryError> {
        self.check()?;
        self.messages.lock().unwrap().push((message.to_string(), fd));
        Ok(())
    }

    async fn set_properties(
        &self,
        file: &str,
        properties: Vec<Property>,
    ) -> Result<(), RegistryError> {
        self.check()?;
        self.properties
            .lock()
            .unwrap()
            .push((file.to_string(), properties));
        Ok(())
    }
}

/// The native launcher, recording every signal it delivers.
pub(crate) struct CountingLauncher {
    inner: NativeLauncher,
    signals: Mutex<Vec<Signal>>,
}

impl CountingLauncher {
    pub(crate) fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for CountingLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, LauncherError> {
        self.inner.launch(spec).await
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), LauncherError> {
        self.signals.lock().unwrap().push(signal);
        self.inner.signal(pid, signal).await
    }
}

/// A node named `node1` rooted in a temporary directory.
pub(crate) struct TestNode {
    pub(crate) launcher: Arc<CountingLauncher>,
    pub(crate) activator: Arc<Activator>,
    pub(crate) node: Arc<Node>,
    // Dropped last.
    pub(crate) dir: TempDir,
}

impl TestNode {
    pub(crate) fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub(crate) fn with_config(configure: impl FnOnce(&mut NodeConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.name = "node1".to_string();
        config.data_dir = dir.path().join("db");
        config.allow_running_servers_as_root = true;
        configure(&mut config);

        let launcher = Arc::new(CountingLauncher {
            inner: NativeLauncher::new(),
            signals: Mutex::new(Vec::new()),
        });
        let activator = Activator::new(launcher.clone());
        let node = Node::new(config, Arc::clone(&activator)).unwrap();
        Self {
            launcher,
            activator,
            node,
            dir,
        }
    }
}
