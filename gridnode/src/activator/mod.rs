/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The activator owns every child OS process of the node.
//!
//! It starts server processes through a [`ProcessLauncher`], keeps a
//! table of live processes keyed by server name (at most one per
//! name), delivers signals, and reports each process exit exactly once
//! to the process's [`ProcessOwner`].
//!
//! Exit notifications are funneled through a single termination
//! listener task, so owners observe terminations one at a time and in
//! the order the listener sees them. The listener runs until the
//! activator is shut down and its process table drains.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::registry::ProcessControl;

mod launcher;
#[cfg(unix)]
mod posix;
mod signal;
#[cfg(windows)]
mod windows;

pub use launcher::ExitKind;
pub use launcher::LaunchSpec;
pub use launcher::Launched;
pub use launcher::LauncherError;
pub use launcher::ProcessLauncher;
#[cfg(unix)]
pub use posix::PosixLauncher;
#[cfg(unix)]
pub use posix::PosixLauncher as NativeLauncher;
pub use signal::Signal;
pub use signal::SignalError;
#[cfg(windows)]
pub use windows::WindowsLauncher;
#[cfg(windows)]
pub use windows::WindowsLauncher as NativeLauncher;

/// Stable id of one process incarnation. A server restarted under the
/// same name gets a new id, so a late exit notification for the old
/// process never touches the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Delivered to the owner when its process exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub kind: ExitKind,
}

/// The object a process belongs to (a server).
#[async_trait]
pub trait ProcessOwner: Send + Sync {
    /// The process exited. Called from the termination listener; must
    /// not block.
    fn terminated(&self, exit: ProcessExit);

    /// Stop the process; used when the activator is destroyed.
    async fn stop(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum ActivatorError {
    #[error("the node is being shut down")]
    ShuttingDown,

    #[error("server `{0}` already has a running process")]
    AlreadyActive(String),

    #[error(transparent)]
    Launcher(#[from] LauncherError),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

struct Process {
    id: ProcessId,
    pid: u32,
    owner: Arc<dyn ProcessOwner>,
}

enum Slot {
    /// A launch is in flight; the name is reserved.
    Launching,
    Running(Process),
}

#[derive(Default)]
struct ActivatorState {
    deactivating: bool,
    processes: HashMap<String, Slot>,
}

enum ListenerEvent {
    Watch {
        name: String,
        id: ProcessId,
        exit_rx: oneshot::Receiver<ExitKind>,
    },
    Interrupt,
}

/// Releases a name reserved by `activate` unless the launch succeeds.
struct Reservation<'a> {
    state: &'a Mutex<ActivatorState>,
    events: &'a mpsc::UnboundedSender<ListenerEvent>,
    name: &'a str,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if matches!(state.processes.get(self.name), Some(Slot::Launching)) {
                state.processes.remove(self.name);
            }
        }
        let _ = self.events.send(ListenerEvent::Interrupt);
    }
}

pub struct Activator {
    launcher: Arc<dyn ProcessLauncher>,
    state: Arc<Mutex<ActivatorState>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    weak_self: Weak<Activator>,
}

impl fmt::Debug for Activator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Activator")
            .field("deactivating", &state.deactivating)
            .field("processes", &state.processes.len())
            .finish()
    }
}

impl Activator {
    /// Create an activator and start its termination listener. Must be
    /// called from within a tokio runtime.
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ActivatorState::default()));
        let listener = tokio::spawn(Self::listen(Arc::clone(&state), events_rx));
        Arc::new_cyclic(|weak_self| Self {
            launcher,
            state,
            events,
            listener: Mutex::new(Some(listener)),
            next_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ActivatorState> {
        self.state.lock().expect("activator mutex poisoned")
    }

    /// Start the process described by `spec` on behalf of `owner` and
    /// return its pid. Fails without registering anything if the
    /// launch fails, if the activator is shutting down, or if `spec.name`
    /// already has a process.
    pub async fn activate(
        &self,
        spec: LaunchSpec,
        owner: Arc<dyn ProcessOwner>,
    ) -> Result<u32, ActivatorError> {
        {
            let mut state = self.lock();
            if state.deactivating {
                return Err(ActivatorError::ShuttingDown);
            }
            if state.processes.contains_key(&spec.name) {
                return Err(ActivatorError::AlreadyActive(spec.name.clone()));
            }
            state.processes.insert(spec.name.clone(), Slot::Launching);
        }
        let mut reservation = Reservation {
            state: &self.state,
            events: &self.events,
            name: &spec.name,
            armed: true,
        };

        tracing::debug!(server = %spec.name, exe = %spec.exe.display(), "activating server");
        let launched = self.launcher.launch(&spec).await?;

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().processes.insert(
            spec.name.clone(),
            Slot::Running(Process {
                id,
                pid: launched.pid,
                owner,
            }),
        );
        reservation.armed = false;

        if self
            .events
            .send(ListenerEvent::Watch {
                name: spec.name.clone(),
                id,
                exit_rx: launched.exit_rx,
            })
            .is_err()
        {
            tracing::error!(
                server = %spec.name,
                "termination listener is not running; exit of pid {} will not be observed",
                launched.pid
            );
        }
        tracing::info!(server = %spec.name, pid = launched.pid, %id, "activated server");
        Ok(launched.pid)
    }

    /// Ask the process of `name` to stop. With a process-control
    /// facet, its `shutdown` is invoked in the background and SIGTERM
    /// is sent only if that call fails; otherwise SIGTERM is sent
    /// right away.
    pub async fn deactivate(
        &self,
        name: &str,
        process: Option<Arc<dyn ProcessControl>>,
    ) -> Result<(), ActivatorError> {
        if self.get_server_pid(name).is_none() {
            tracing::debug!(server = %name, "deactivate: no running process");
            return Ok(());
        }
        let Some(process) = process else {
            tracing::debug!(server = %name, "deactivating server with SIGTERM");
            return self.send_signal(name, Signal::Term).await;
        };

        tracing::debug!(server = %name, "deactivating server through its process facet");
        let this = self.weak_self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let Err(e) = process.shutdown().await else {
                return;
            };
            tracing::warn!(server = %name, error = %e, "process shutdown failed; sending SIGTERM");
            if let Some(this) = this.upgrade() {
                if let Err(e) = this.send_signal(&name, Signal::Term).await {
                    tracing::warn!(server = %name, error = %e, "SIGTERM failed");
                }
            }
        });
        Ok(())
    }

    pub async fn kill(&self, name: &str) -> Result<(), ActivatorError> {
        self.send_signal(name, Signal::Kill).await
    }

    /// Deliver `signal` to the process of `name`. A missing process is
    /// not an error.
    pub async fn send_signal(&self, name: &str, signal: Signal) -> Result<(), ActivatorError> {
        let Some(pid) = self.get_server_pid(name) else {
            tracing::debug!(server = %name, %signal, "no process to signal");
            return Ok(());
        };
        if signal.number().is_none() {
            return Err(SignalError::Unsupported(signal).into());
        }
        tracing::info!(server = %name, pid, %signal, "sending signal");
        Ok(self.launcher.signal(pid, signal).await?)
    }

    /// Like [`Self::send_signal`], with the signal given by name or
    /// number.
    pub async fn send_signal_named(&self, name: &str, signal: &str) -> Result<(), ActivatorError> {
        let signal = Signal::parse(signal)?;
        self.send_signal(name, signal).await
    }

    pub fn get_server_pid(&self, name: &str) -> Option<u32> {
        match self.lock().processes.get(name) {
            Some(Slot::Running(p)) => Some(p.pid),
            _ => None,
        }
    }

    /// False once [`Self::shutdown`] has been called.
    pub fn is_active(&self) -> bool {
        !self.lock().deactivating
    }

    /// Refuse further activations. Idempotent.
    pub fn shutdown(&self) {
        let first = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.deactivating, true)
        };
        if first {
            tracing::info!("activator shutting down");
        }
        let _ = self.events.send(ListenerEvent::Interrupt);
    }

    /// Stop every process and wait for the termination listener to
    /// observe their exit.
    pub async fn destroy(&self) {
        self.shutdown();

        let owners: Vec<Arc<dyn ProcessOwner>> = self
            .lock()
            .processes
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(p) => Some(Arc::clone(&p.owner)),
                Slot::Launching => None,
            })
            .collect();
        futures::future::join_all(owners.iter().map(|owner| owner.stop())).await;

        // Anything launched while the owners were stopping.
        let remaining: Vec<String> = self.lock().processes.keys().cloned().collect();
        for name in remaining {
            if let Err(e) = self.kill(&name).await {
                tracing::warn!(server = %name, error = %e, "failed to kill remaining process");
            }
        }

        let handle = self.listener.lock().expect("listener mutex poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("termination listener failed: {}", e);
            }
        }
        let left = self.lock().processes.len();
        if left != 0 {
            tracing::error!(left, "activator destroyed with live processes");
        }
    }

    async fn listen(
        state: Arc<Mutex<ActivatorState>>,
        mut events: mpsc::UnboundedReceiver<ListenerEvent>,
    ) {
        let mut exits = FuturesUnordered::new();
        loop {
            {
                let state = state.lock().expect("activator mutex poisoned");
                if state.deactivating && state.processes.is_empty() && exits.is_empty() {
                    break;
                }
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(ListenerEvent::Watch { name, id, exit_rx }) => {
                        exits.push(async move {
                            let kind = exit_rx.await.unwrap_or_else(|_| ExitKind::Failed {
                                reason: "exit notification lost".to_string(),
                            });
                            (name, id, kind)
                        });
                    }
                    Some(ListenerEvent::Interrupt) => {}
                    None => {
                        tracing::error!("activator event channel closed; termination listener exiting");
                        break;
                    }
                },
                Some((name, id, kind)) = exits.next(), if !exits.is_empty() => {
                    let process = {
                        let mut state = state.lock().expect("activator mutex poisoned");
                        match state.processes.get(&name) {
                            Some(Slot::Running(p)) if p.id == id => match state.processes.remove(&name) {
                                Some(Slot::Running(p)) => Some(p),
                                _ => None,
                            },
                            _ => None,
                        }
                    };
                    match process {
                        Some(p) => {
                            tracing::info!(server = %name, pid = p.pid, %kind, "server process terminated");
                            p.owner.terminated(ProcessExit { pid: p.pid, kind });
                        }
                        None => {
                            tracing::debug!(server = %name, %id, "ignoring exit of a process no longer tracked");
                        }
                    }
                }
            }
        }
        tracing::debug!("termination listener exited");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::FakeProcess;

    struct TestOwner {
        name: String,
        exits: mpsc::UnboundedSender<ProcessExit>,
        activator: Mutex<Weak<Activator>>,
    }

    impl TestOwner {
        fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessExit>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let owner = Arc::new(Self {
                name: name.to_string(),
                exits: tx,
                activator: Mutex::new(Weak::new()),
            });
            (owner, rx)
        }
    }

    #[async_trait]
    impl ProcessOwner for TestOwner {
        fn terminated(&self, exit: ProcessExit) {
            let _ = self.exits.send(exit);
        }

        async fn stop(&self) {
            let activator = self.activator.lock().unwrap().upgrade();
            if let Some(activator) = activator {
                activator.kill(&self.name).await.unwrap();
            }
        }
    }

    fn sh(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            exe: "/bin/sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            allow_root: true,
            ..Default::default()
        }
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessExit>) -> ProcessExit {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for exit")
            .expect("owner dropped")
    }

    #[tokio::test]
    async fn test_exit_reported_once() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        let (owner, mut exits) = TestOwner::new("S1");
        let pid = activator.activate(sh("S1", "exit 3"), owner).await.unwrap();

        let exit = next_exit(&mut exits).await;
        assert_eq!(exit.pid, pid);
        assert_eq!(exit.kind, ExitKind::Exited { code: 3 });
        assert_eq!(activator.get_server_pid("S1"), None);
        assert!(exits.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_at_most_one_process_per_name() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        let (owner, mut exits) = TestOwner::new("S1");

        let (a, b) = tokio::join!(
            activator.activate(sh("S1", "sleep 30"), owner.clone()),
            activator.activate(sh("S1", "sleep 30"), owner.clone()),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(ActivatorError::AlreadyActive(n)) if n == "S1"))
        );

        activator.kill("S1").await.unwrap();
        let exit = next_exit(&mut exits).await;
        assert!(matches!(exit.kind, ExitKind::Signaled { .. }));

        // The name is free again once the exit has been observed.
        let pid = activator.activate(sh("S1", "exit 0"), owner).await.unwrap();
        assert_eq!(next_exit(&mut exits).await.pid, pid);
    }

    #[tokio::test]
    async fn test_failed_launch_releases_name() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        let (owner, _exits) = TestOwner::new("S1");
        let mut spec = sh("S1", "exit 0");
        spec.exe = "/nonexistent/server".into();
        assert!(matches!(
            activator.activate(spec, owner.clone()).await,
            Err(ActivatorError::Launcher(_))
        ));
        assert!(activator.lock().processes.is_empty());
    }

    #[tokio::test]
    async fn test_signals() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        // Nothing running: not an error.
        activator.send_signal("S1", Signal::Hup).await.unwrap();
        assert!(matches!(
            activator.send_signal_named("S1", "SIGBOGUS").await,
            Err(ActivatorError::Signal(SignalError::Unknown(_)))
        ));

        let (owner, mut exits) = TestOwner::new("S1");
        activator
            .activate(sh("S1", "sleep 30"), owner)
            .await
            .unwrap();
        activator.send_signal_named("S1", "SIGUSR1").await.unwrap();
        let exit = next_exit(&mut exits).await;
        assert_eq!(
            exit.kind,
            ExitKind::Signaled {
                signal: libc::SIGUSR1,
                core_dumped: false
            }
        );
    }

    #[tokio::test]
    async fn test_deactivate_falls_back_to_sigterm() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        let (owner, mut exits) = TestOwner::new("S1");
        activator
            .activate(sh("S1", "sleep 30"), owner)
            .await
            .unwrap();

        let process = FakeProcess::failing();
        activator
            .deactivate("S1", Some(process.clone()))
            .await
            .unwrap();
        let exit = next_exit(&mut exits).await;
        assert_eq!(
            exit.kind,
            ExitKind::Signaled {
                signal: libc::SIGTERM,
                core_dumped: false
            }
        );
        assert_eq!(process.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_and_destroy() {
        let activator = Activator::new(Arc::new(NativeLauncher::new()));
        let (owner, mut exits) = TestOwner::new("S1");
        *owner.activator.lock().unwrap() = Arc::downgrade(&activator);
        activator
            .activate(sh("S1", "sleep 30"), owner.clone())
            .await
            .unwrap();

        activator.shutdown();
        assert!(!activator.is_active());
        assert!(matches!(
            activator.activate(sh("S2", "exit 0"), owner).await,
            Err(ActivatorError::ShuttingDown)
        ));

        tokio::time::timeout(Duration::from_secs(10), activator.destroy())
            .await
            .unwrap();
        assert!(matches!(
            next_exit(&mut exits).await.kind,
            ExitKind::Signaled { .. }
        ));
        assert!(activator.lock().processes.is_empty());
    }
}
