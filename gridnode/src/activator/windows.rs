/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Windows process launcher.
//!
//! Children are created in a new process group so they can receive
//! Ctrl-Break, which stands in for `SIGTERM`. `SIGKILL` maps to
//! `TerminateProcess`. No other signal is supported.

use std::collections::HashSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::Instrument;
use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
use windows_sys::Win32::System::Threading::OpenProcess;
use windows_sys::Win32::System::Threading::PROCESS_TERMINATE;
use windows_sys::Win32::System::Threading::TerminateProcess;

use super::launcher::ExitKind;
use super::launcher::LaunchSpec;
use super::launcher::Launched;
use super::launcher::LauncherError;
use super::launcher::ProcessLauncher;
use super::signal::Signal;

#[derive(Debug, Default)]
pub struct WindowsLauncher {
    children: Arc<Mutex<HashSet<u32>>>,
}

impl WindowsLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn output(path: &Path) -> Result<File, LauncherError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LauncherError::Launch {
                exe: path.display().to_string(),
                source,
            })
    }

    fn terminate(pid: u32) -> Result<(), LauncherError> {
        // SAFETY: plain Win32 calls; the handle is closed before
        // returning.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                // The process is already gone.
                return Ok(());
            }
            let ok = TerminateProcess(handle, 1);
            let err = std::io::Error::last_os_error();
            CloseHandle(handle);
            if ok == 0 {
                return Err(LauncherError::Signal {
                    pid,
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    fn ctrl_break(pid: u32) -> Result<(), LauncherError> {
        // SAFETY: plain Win32 call.
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
            return Err(LauncherError::Signal {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLauncher for WindowsLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, LauncherError> {
        if spec.exe.as_os_str().is_empty() {
            return Err(LauncherError::Invalid(format!(
                "server `{}` has an empty executable path",
                spec.name
            )));
        }

        let mut cmd = tokio::process::Command::new(&spec.exe);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .creation_flags(CREATE_NEW_PROCESS_GROUP);
        if let Some(pwd) = &spec.pwd {
            cmd.current_dir(pwd);
        }
        if let Some(path) = &spec.stdout {
            cmd.stdout(Stdio::from(Self::output(path)?));
        }
        if let Some(path) = &spec.stderr {
            cmd.stderr(Stdio::from(Self::output(path)?));
        }

        let mut child = cmd.spawn().map_err(|source| LauncherError::Launch {
            exe: spec.exe.display().to_string(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(LauncherError::Invalid(format!(
                "server `{}` exited before its pid was known",
                spec.name
            )));
        };
        let span = tracing::debug_span!("process", server = %spec.name, pid);
        span.in_scope(|| tracing::debug!("spawned"));

        self.children
            .lock()
            .expect("children mutex poisoned")
            .insert(pid);

        let (exit_tx, exit_rx) = oneshot::channel();
        let children = Arc::clone(&self.children);
        tokio::spawn(
            async move {
                let kind = match child.wait().await {
                    Ok(status) => match status.code() {
                        Some(code) => ExitKind::Exited { code },
                        None => ExitKind::Failed {
                            reason: "unknown exit status".to_string(),
                        },
                    },
                    Err(e) => ExitKind::Failed {
                        reason: format!("wait failed: {}", e),
                    },
                };
                tracing::debug!(%kind, "exit observed");
                children
                    .lock()
                    .expect("children mutex poisoned")
                    .remove(&pid);
                let _ = exit_tx.send(kind);
            }
            .instrument(span),
        );

        Ok(Launched { pid, exit_rx })
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), LauncherError> {
        match signal {
            Signal::Term => Self::ctrl_break(pid),
            Signal::Kill => Self::terminate(pid),
            other => Err(LauncherError::Signal {
                pid,
                reason: format!("{} is not supported", other),
            }),
        }
    }
}

impl Drop for WindowsLauncher {
    fn drop(&mut self) {
        let children = match self.children.lock() {
            Ok(children) => children.clone(),
            Err(_) => return,
        };
        for pid in children {
            let _ = Self::terminate(pid);
        }
    }
}
