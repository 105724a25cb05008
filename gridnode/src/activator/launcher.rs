/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process launching abstraction.
//!
//! A [`ProcessLauncher`] is responsible for the mechanics of running a
//! server process and for reporting its terminal status. Lifecycle
//! bookkeeping (one process per server, owner notification) stays in
//! [`Activator`](super::Activator).
//!
//! - **Spawn errors are synchronous.** `launch` returns only after the
//!   child has exec'd, or with the error that prevented it (bad path,
//!   privilege drop, working directory).
//! - **Terminal status is channel-driven.** [`Launched::exit_rx`]
//!   resolves exactly once with an [`ExitKind`].
//! - **Signals are initiation-only.** `signal` returns without waiting
//!   for the process to exit, and a process that is already gone is
//!   not an error.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::signal::Signal;

/// Everything needed to start one server process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// The server id; used for diagnostics.
    pub name: String,
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub pwd: Option<PathBuf>,
    /// Merged over the node's own environment.
    pub envs: Vec<(String, String)>,
    /// Account to run as. Ignored on Windows.
    pub user: Option<String>,
    pub allow_root: bool,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// How a process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with code.
    Exited { code: i32 },
    /// Killed by signal.
    Signaled { signal: i32, core_dumped: bool },
    /// The launcher could not observe the exit.
    Failed { reason: String },
}

impl ExitKind {
    /// Whether this termination counts as a failure of the server.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Exited { code } => *code != 0,
            Self::Signaled { signal, .. } => {
                Signal::from_number(*signal).is_some_and(|s| s.is_crash())
            }
            Self::Failed { .. } => true,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit status {}", code),
            Self::Signaled {
                signal,
                core_dumped,
            } => {
                match Signal::from_number(*signal) {
                    Some(s) => write!(f, "signal {}", s)?,
                    None => write!(f, "signal {}", signal)?,
                }
                if *core_dumped {
                    f.write_str(" (core dumped)")?;
                }
                Ok(())
            }
            Self::Failed { reason } => write!(f, "unknown termination: {}", reason),
        }
    }
}

/// A running process.
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    /// Fires exactly once with the terminal status.
    pub exit_rx: oneshot::Receiver<ExitKind>,
}

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("invalid launch request: {0}")]
    Invalid(String),

    #[error("failed to launch `{exe}`: {source}")]
    Launch {
        exe: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Privilege(String),

    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a process described by `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, LauncherError>;

    /// Deliver `signal` to the process (and its process group, where
    /// the platform has one).
    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), LauncherError>;
}
