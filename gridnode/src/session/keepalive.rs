/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A keep-alive loop for one registry session.
//!
//! The loop runs on its own task. When idle it waits for the refresh
//! period or for a requested action, then connects, refreshes, or
//! disconnects through a [`SessionDriver`]. A failed refresh drops the
//! session and reconnects right away.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::InternalRegistry;
use crate::registry::NodeSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum KeepAliveState {
    Disconnected,
    Connected,
    /// Connecting, refreshing or disconnecting.
    InProgress,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Connect,
    Disconnect,
    KeepAlive,
    None,
}

/// What waiters observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: KeepAliveState,
    /// An action was requested and has not run yet.
    pending: bool,
}

/// Session operations against one registry.
#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    /// Open a session with `registry`. The driver may replace
    /// `registry` with a fresher proxy and set `period` to the refresh
    /// period the registry asks for.
    async fn create_session(
        &self,
        registry: &mut Arc<dyn InternalRegistry>,
        period: &mut Duration,
    ) -> Option<Arc<dyn NodeSession>>;

    async fn destroy_session(&self, session: Arc<dyn NodeSession>);

    /// Refresh `session`; false if it is lost.
    async fn keep_alive(&self, session: &Arc<dyn NodeSession>) -> bool;
}

struct KeepAliveInner {
    state: KeepAliveState,
    next_action: Action,
    registry: Arc<dyn InternalRegistry>,
    session: Option<Arc<dyn NodeSession>>,
    period: Duration,
    destroy_on_exit: bool,
}

pub struct SessionKeepAlive<D> {
    driver: D,
    inner: Mutex<KeepAliveInner>,
    wake: Notify,
    status: watch::Sender<Status>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: SessionDriver> SessionKeepAlive<D> {
    pub fn new(driver: D, registry: Arc<dyn InternalRegistry>, period: Duration) -> Arc<Self> {
        let (status, _) = watch::channel(Status {
            state: KeepAliveState::Disconnected,
            pending: false,
        });
        Arc::new(Self {
            driver,
            inner: Mutex::new(KeepAliveInner {
                state: KeepAliveState::Disconnected,
                next_action: Action::None,
                registry,
                session: None,
                period,
                destroy_on_exit: false,
            }),
            wake: Notify::new(),
            status,
            task: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, KeepAliveInner> {
        self.inner.lock().expect("keep-alive mutex poisoned")
    }

    fn publish(&self, inner: &KeepAliveInner) {
        self.status.send_replace(Status {
            state: inner.state,
            pending: inner.next_action != Action::None,
        });
    }

    /// Start the keep-alive task.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).run());
        *self.task.lock().expect("keep-alive task mutex poisoned") = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        loop {
            let (pending, period) = {
                let inner = self.lock();
                if inner.state == KeepAliveState::Destroyed {
                    break;
                }
                (inner.next_action != Action::None, inner.period)
            };
            if !pending {
                let _ = tokio::time::timeout(period, self.wake.notified()).await;
            }

            let (action, registry, session, period) = {
                let mut inner = self.lock();
                if inner.state == KeepAliveState::Destroyed {
                    break;
                }
                let action = match std::mem::replace(&mut inner.next_action, Action::None) {
                    Action::None if inner.session.is_some() => Action::KeepAlive,
                    Action::None => Action::Connect,
                    action => action,
                };
                inner.state = KeepAliveState::InProgress;
                self.publish(&inner);
                (
                    action,
                    Arc::clone(&inner.registry),
                    inner.session.clone(),
                    inner.period,
                )
            };

            let mut reconnect = false;
            let session = match (action, session) {
                (Action::Connect, Some(session)) => Some(session),
                (Action::Connect, None) => {
                    let mut registry = registry;
                    let mut period = period;
                    let session = self.driver.create_session(&mut registry, &mut period).await;
                    let mut inner = self.lock();
                    inner.registry = registry;
                    inner.period = period;
                    session
                }
                (Action::KeepAlive, Some(session)) => {
                    if self.driver.keep_alive(&session).await {
                        Some(session)
                    } else {
                        reconnect = true;
                        None
                    }
                }
                (Action::Disconnect, Some(session)) => {
                    self.driver.destroy_session(session).await;
                    None
                }
                _ => None,
            };

            let mut inner = self.lock();
            inner.session = session;
            if inner.state != KeepAliveState::Destroyed {
                inner.state = if inner.session.is_some() {
                    KeepAliveState::Connected
                } else {
                    KeepAliveState::Disconnected
                };
                if reconnect && inner.next_action == Action::None {
                    inner.next_action = Action::Connect;
                }
            }
            self.publish(&inner);
        }

        let session = {
            let mut inner = self.lock();
            if inner.destroy_on_exit {
                inner.session.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            self.driver.destroy_session(session).await;
        }
    }

    fn request(&self, inner: &mut KeepAliveInner, action: Action) {
        inner.next_action = action;
        self.publish(inner);
        self.wake.notify_one();
    }

    /// Connect now, or refresh now if already connected.
    pub fn try_create_session(&self) {
        let mut inner = self.lock();
        if inner.state == KeepAliveState::Destroyed {
            return;
        }
        let action = if inner.session.is_some() {
            Action::KeepAlive
        } else {
            Action::Connect
        };
        self.request(&mut inner, action);
    }

    /// Wait for the outcome of a [`Self::try_create_session`]. `None` or
    /// a zero timeout waits indefinitely. True if a session is
    /// established.
    pub async fn wait_try_create_session(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.status.subscribe();
        let settled = async move {
            rx.wait_for(|s| {
                s.state == KeepAliveState::Destroyed
                    || (!s.pending && s.state != KeepAliveState::InProgress)
            })
            .await
            .map(|s| s.state == KeepAliveState::Connected)
            .unwrap_or(false)
        };
        match timeout {
            Some(timeout) if !timeout.is_zero() => tokio::time::timeout(timeout, settled)
                .await
                .unwrap_or(false),
            _ => settled.await,
        }
    }

    /// Wait until a session is established. False if the loop is
    /// terminated first.
    pub async fn wait_for_create(&self) -> bool {
        let mut rx = self.status.subscribe();
        rx.wait_for(|s| {
            matches!(
                s.state,
                KeepAliveState::Connected | KeepAliveState::Destroyed
            )
        })
        .await
        .map(|s| s.state == KeepAliveState::Connected)
        .unwrap_or(false)
    }

    pub fn destroy_active_session(&self) {
        let mut inner = self.lock();
        if inner.state != KeepAliveState::Destroyed && inner.session.is_some() {
            self.request(&mut inner, Action::Disconnect);
        }
    }

    /// Terminate the loop if it has no session and nothing to do.
    pub fn terminate_if_disconnected(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != KeepAliveState::Disconnected || inner.next_action != Action::None {
            return false;
        }
        inner.state = KeepAliveState::Destroyed;
        self.publish(&inner);
        self.wake.notify_one();
        true
    }

    /// Terminate the loop; with `destroy`, the current session is
    /// destroyed on the way out.
    pub fn terminate(&self, destroy: bool) {
        let mut inner = self.lock();
        inner.state = KeepAliveState::Destroyed;
        inner.destroy_on_exit = destroy;
        self.publish(&inner);
        self.wake.notify_one();
    }

    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .expect("keep-alive task mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("session keep-alive task failed: {}", e);
            }
        }
    }

    pub fn session(&self) -> Option<Arc<dyn NodeSession>> {
        self.lock().session.clone()
    }

    pub fn registry(&self) -> Arc<dyn InternalRegistry> {
        Arc::clone(&self.lock().registry)
    }

    pub fn set_registry(&self, registry: Arc<dyn InternalRegistry>) {
        self.lock().registry = registry;
    }

    pub fn state(&self) -> KeepAliveState {
        self.lock().state
    }
}
