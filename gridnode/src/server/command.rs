/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Server commands.
//!
//! A command is one long-running operation on a server: load, start,
//! stop or destroy. At most one command of each kind exists per server.
//! Callers that ask for an operation already pending join its waiter
//! list and are all answered, in order, when it completes.
//!
//! Commands are recorded under the server's lock. When the state
//! machine decides a command may run, it hands back a [`Command`] that
//! the caller executes after releasing the lock.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::LoadResult;
use super::Server;
use super::ServerError;
use super::state::InternalState;
use crate::descriptor::ServerDescriptor;

type Sender<T> = oneshot::Sender<Result<T, ServerError>>;

/// Pending callers of one command.
pub(crate) struct Waiters<T> {
    senders: Vec<Sender<T>>,
}

impl<T> Default for Waiters<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Waiters<T> {
    pub(crate) fn add(&mut self, id: &str) -> Reply<T> {
        let (tx, rx) = oneshot::channel();
        self.senders.push(tx);
        Reply::Pending {
            id: id.to_string(),
            rx,
        }
    }

    /// Answer every waiter, in registration order.
    pub(crate) fn finish(self, result: Result<T, ServerError>) {
        for tx in self.senders {
            let _ = tx.send(result.clone());
        }
    }
}

/// The answer to a server operation: either known right away or
/// delivered when the pending command completes.
#[derive(Debug)]
pub enum Reply<T> {
    Ready(Result<T, ServerError>),
    Pending {
        id: String,
        rx: oneshot::Receiver<Result<T, ServerError>>,
    },
}

impl<T> Reply<T> {
    pub async fn wait(self) -> Result<T, ServerError> {
        match self {
            Self::Ready(result) => result,
            Self::Pending { id, rx } => rx.await.unwrap_or(Err(ServerError::Canceled(id))),
        }
    }
}

/// What every command kind can tell the state machine.
pub(crate) trait ServerCommand {
    /// Whether the command may run in `state`.
    fn can_execute(&self, state: InternalState) -> bool;

    /// The state the server enters when the command starts running.
    fn next_state(&self) -> InternalState;

    fn started(&self) -> bool;
}

pub(crate) struct LoadCommand {
    pub desc: Arc<ServerDescriptor>,
    pub started: bool,
    pub waiters: Waiters<LoadResult>,
}

impl LoadCommand {
    pub(crate) fn new(desc: Arc<ServerDescriptor>) -> Self {
        Self {
            desc,
            started: false,
            waiters: Waiters::default(),
        }
    }
}

impl ServerCommand for LoadCommand {
    fn can_execute(&self, state: InternalState) -> bool {
        matches!(state, InternalState::Inactive | InternalState::Destroyed)
    }

    fn next_state(&self) -> InternalState {
        InternalState::Loading
    }

    fn started(&self) -> bool {
        self.started
    }
}

#[derive(Default)]
pub(crate) struct StartCommand {
    pub started: bool,
    pub waiters: Waiters<()>,
    /// Activation timeout.
    pub timer: Option<JoinHandle<()>>,
}

impl StartCommand {
    pub(crate) fn finish(mut self, result: Result<(), ServerError>) {
        std::mem::take(&mut self.waiters).finish(result);
    }
}

impl Drop for StartCommand {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl ServerCommand for StartCommand {
    fn can_execute(&self, state: InternalState) -> bool {
        state == InternalState::Inactive
    }

    fn next_state(&self) -> InternalState {
        InternalState::Activating
    }

    fn started(&self) -> bool {
        self.started
    }
}

/// How far a stop has escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub(crate) enum StopStep {
    /// Waiting for the process facet's `shutdown` to take effect.
    #[default]
    Shutdown,
    /// `SIGTERM` sent.
    Terminate,
    /// `SIGKILL` sent.
    Kill,
}

#[derive(Default)]
pub(crate) struct StopCommand {
    pub started: bool,
    pub waiters: Waiters<()>,
    pub step: StopStep,
    /// Deactivation timeout for the current step.
    pub timer: Option<JoinHandle<()>>,
}

impl StopCommand {
    pub(crate) fn finish(mut self, result: Result<(), ServerError>) {
        std::mem::take(&mut self.waiters).finish(result);
    }
}

impl Drop for StopCommand {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl ServerCommand for StopCommand {
    fn can_execute(&self, state: InternalState) -> bool {
        matches!(
            state,
            InternalState::WaitForActivation
                | InternalState::ActivationTimeout
                | InternalState::Active
        )
    }

    fn next_state(&self) -> InternalState {
        InternalState::Deactivating
    }

    fn started(&self) -> bool {
        self.started
    }
}

#[derive(Default)]
pub(crate) struct DestroyCommand {
    pub started: bool,
    pub waiters: Waiters<()>,
    /// Tear-down after a failed first load: the directory is cleared
    /// and observers are not told.
    pub load_failure: bool,
    pub clear_dir: bool,
}

impl ServerCommand for DestroyCommand {
    fn can_execute(&self, state: InternalState) -> bool {
        state == InternalState::Inactive
    }

    fn next_state(&self) -> InternalState {
        InternalState::Destroying
    }

    fn started(&self) -> bool {
        self.started
    }
}

/// A command that is ready to run, bound to its server.
#[must_use = "a command must be executed"]
pub enum Command {
    Load(Arc<Server>),
    Start(Arc<Server>),
    Stop(Arc<Server>),
    Destroy(Arc<Server>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, server) = match self {
            Self::Load(s) => ("Load", s),
            Self::Start(s) => ("Start", s),
            Self::Stop(s) => ("Stop", s),
            Self::Destroy(s) => ("Destroy", s),
        };
        write!(f, "{}({})", kind, server.id())
    }
}

impl Command {
    /// Run this command and every command it makes ready.
    pub async fn run(self) {
        let mut next = Some(self);
        while let Some(command) = next {
            tracing::debug!(?command, "executing");
            next = match command {
                Self::Load(server) => server.execute_load().await,
                Self::Start(server) => server.execute_start().await,
                Self::Stop(server) => server.execute_stop().await,
                Self::Destroy(server) => server.execute_destroy().await,
            };
        }
    }

    /// Run in the background; for callers that cannot await.
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiters_answered_in_order() {
        let mut waiters = Waiters::<u32>::default();
        let replies: Vec<_> = (0..3).map(|_| waiters.add("S1")).collect();
        waiters.finish(Ok(7));
        for reply in replies {
            assert_eq!(reply.wait().await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn test_dropped_waiters_are_canceled() {
        let mut waiters = Waiters::<()>::default();
        let reply = waiters.add("S1");
        drop(waiters);
        assert!(matches!(
            reply.wait().await,
            Err(ServerError::Canceled(id)) if id == "S1"
        ));
    }

    #[test]
    fn test_command_predicates() {
        let load = LoadCommand::new(Arc::new(ServerDescriptor::default()));
        assert!(load.can_execute(InternalState::Destroyed));
        assert!(!load.can_execute(InternalState::Active));
        assert_eq!(load.next_state(), InternalState::Loading);

        let stop = StopCommand::default();
        assert!(stop.can_execute(InternalState::WaitForActivation));
        assert!(!stop.can_execute(InternalState::Activating));
        assert!(!stop.can_execute(InternalState::Inactive));

        assert!(StartCommand::default().can_execute(InternalState::Inactive));
        assert!(!StartCommand::default().can_execute(InternalState::Deactivating));
        assert_eq!(
            DestroyCommand::default().next_state(),
            InternalState::Destroying
        );
    }
}
