/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! POSIX process launcher.
//!
//! Children run in their own process group so that signals reach the
//! whole tree (wrapper scripts included). When the node runs as root,
//! the child drops to the descriptor's account (supplementary groups,
//! gid, then uid) between fork and exec; any failure there comes back
//! from `launch` through the standard library's close-on-exec error
//! pipe, before the parent returns.
//!
//! Exit is observed by a monitor task awaiting `child.wait()`. On
//! Linux, `wait` occasionally fails with `ECHILD` for a child that is
//! still ours; those failures are retried a few times with backoff.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
#[cfg(target_os = "linux")]
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::unistd::Gid;
use nix::unistd::Pid;
use nix::unistd::Uid;
use nix::unistd::User;
use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::Instrument;

use super::launcher::ExitKind;
use super::launcher::LaunchSpec;
use super::launcher::Launched;
use super::launcher::LauncherError;
use super::launcher::ProcessLauncher;
use super::signal::Signal;

#[cfg(target_os = "linux")]
const ECHILD_RETRIES: u32 = 5;
#[cfg(target_os = "linux")]
const ECHILD_BACKOFF: Duration = Duration::from_millis(10);

/// Launches server processes with `fork`/`exec` via
/// [`tokio::process::Command`].
#[derive(Debug, Default)]
pub struct PosixLauncher {
    /// Pids of live children, for best-effort cleanup on drop. Entries
    /// are removed by the exit monitor.
    children: Arc<Mutex<HashSet<u32>>>,
}

/// The account a child switches to before exec.
struct Credentials {
    name: CString,
    uid: Uid,
    gid: Gid,
}

impl PosixLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn credentials(spec: &LaunchSpec) -> Result<Option<Credentials>, LauncherError> {
        let current = Uid::effective();
        let Some(user) = &spec.user else {
            if current.is_root() && !spec.allow_root {
                return Err(LauncherError::Privilege(
                    "running server as `root` is not allowed".to_string(),
                ));
            }
            return Ok(None);
        };

        let account = User::from_name(user)
            .map_err(|e| {
                LauncherError::Privilege(format!("unable to look up user `{}`: {}", user, e))
            })?
            .ok_or_else(|| LauncherError::Privilege(format!("unknown user account `{}`", user)))?;

        if account.uid.is_root() && !spec.allow_root {
            return Err(LauncherError::Privilege(
                "running server as `root` is not allowed".to_string(),
            ));
        }
        if current.is_root() {
            let name = CString::new(user.as_str())
                .map_err(|_| LauncherError::Invalid(format!("invalid user name `{}`", user)))?;
            return Ok(Some(Credentials {
                name,
                uid: account.uid,
                gid: account.gid,
            }));
        }
        if account.uid != current {
            return Err(LauncherError::Privilege(format!(
                "node has insufficient privileges to load server under user account `{}`",
                user
            )));
        }
        Ok(None)
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

    /// Send `sig` to the process group led by `pid`. A group that no
    /// longer exists is not an error.
    fn send_signal(pid: u32, sig: i32) -> Result<(), LauncherError> {
        let err = |reason: String| LauncherError::Signal { pid, reason };
        let sig = nix::sys::signal::Signal::try_from(sig).map_err(|e| err(e.to_string()))?;
        match nix::sys::signal::killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(err(e.to_string())),
        }
    }
}

fn exit_kind_from_status(status: &ExitStatus) -> ExitKind {
    if let Some(signal) = status.signal() {
        ExitKind::Signaled {
            signal,
            core_dumped: status.core_dumped(),
        }
    } else if let Some(code) = status.code() {
        ExitKind::Exited { code }
    } else {
        ExitKind::Failed {
            reason: "unknown exit status".to_string(),
        }
    }
}

async fn wait_child(child: &mut Child) -> ExitKind {
    #[cfg(target_os = "linux")]
    let mut attempt = 0;
    loop {
        match child.wait().await {
            Ok(status) => return exit_kind_from_status(&status),
            #[cfg(target_os = "linux")]
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) && attempt < ECHILD_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, "wait returned ECHILD; retrying");
                tokio::time::sleep(ECHILD_BACKOFF * attempt).await;
            }
            Err(e) => {
                return ExitKind::Failed {
                    reason: format!("wait failed: {}", e),
                };
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for PosixLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, LauncherError> {
        if spec.exe.as_os_str().is_empty() {
            return Err(LauncherError::Invalid(format!(
                "server `{}` has an empty executable path",
                spec.name
            )));
        }
        let credentials = Self::credentials(spec)?;

        let mut cmd = tokio::process::Command::new(&spec.exe);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(pwd) = &spec.pwd {
            cmd.current_dir(pwd);
        }
        if let Some(path) = &spec.stdout {
            cmd.stdout(Stdio::from(Self::output(path)?));
        }
        if let Some(path) = &spec.stderr {
            cmd.stderr(Stdio::from(Self::output(path)?));
        }

        // SAFETY: runs in the child between fork and exec. Everything
        // it touches was allocated before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(c) = &credentials {
                    if libc::initgroups(c.name.as_ptr(), c.gid.as_raw() as _) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgid(c.gid.as_raw()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(c.uid.as_raw()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
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
                let kind = wait_child(&mut child).await;
                tracing::debug!(%kind, "exit observed");
                children
                    .lock()
                    .expect("children mutex poisoned")
                    .remove(&pid);
                // The activator may be gone during teardown.
                let _ = exit_tx.send(kind);
            }
            .instrument(span),
        );

        Ok(Launched { pid, exit_rx })
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), LauncherError> {
        let number = signal.number().ok_or_else(|| LauncherError::Signal {
            pid,
            reason: format!("{} is not supported", signal),
        })?;
        tracing::debug!(pid, %signal, "sending signal");
        Self::send_signal(pid, number)
    }
}

impl Drop for PosixLauncher {
    fn drop(&mut self) {
        let children = match self.children.lock() {
            Ok(children) => children.clone(),
            Err(_) => return,
        };
        for pid in children {
            if let Err(e) = Self::send_signal(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "failed to kill child on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            name: "test".to_string(),
            exe: "/bin/sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            allow_root: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exit_code() {
        let launcher = PosixLauncher::new();
        let launched = launcher.launch(&sh("exit 7")).await.unwrap();
        assert!(launched.pid > 0);
        let kind = launched.exit_rx.await.unwrap();
        assert_eq!(kind, ExitKind::Exited { code: 7 });
    }

    #[tokio::test]
    async fn test_terminate_group() {
        let launcher = PosixLauncher::new();
        let launched = launcher.launch(&sh("sleep 30")).await.unwrap();
        launcher.signal(launched.pid, Signal::Term).await.unwrap();
        let kind = tokio::time::timeout(Duration::from_secs(10), launched.exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            kind,
            ExitKind::Signaled {
                signal: libc::SIGTERM,
                core_dumped: false
            }
        );
        assert!(launcher.children.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signal_gone_process_is_ok() {
        let launcher = PosixLauncher::new();
        let launched = launcher.launch(&sh("exit 0")).await.unwrap();
        let pid = launched.pid;
        launched.exit_rx.await.unwrap();
        launcher.signal(pid, Signal::Kill).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_errors_are_synchronous() {
        let launcher = PosixLauncher::new();
        let mut spec = sh("exit 0");
        spec.exe = "/nonexistent/server".into();
        assert!(matches!(
            launcher.launch(&spec).await,
            Err(LauncherError::Launch { .. })
        ));

        let mut spec = sh("exit 0");
        spec.pwd = Some("/nonexistent/dir".into());
        assert!(matches!(
            launcher.launch(&spec).await,
            Err(LauncherError::Launch { .. })
        ));

        let mut spec = sh("exit 0");
        spec.exe = "".into();
        assert!(matches!(
            launcher.launch(&spec).await,
            Err(LauncherError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let launcher = PosixLauncher::new();
        let mut spec = sh("exit 0");
        spec.user = Some("no-such-user-gridnode".to_string());
        assert!(matches!(
            launcher.launch(&spec).await,
            Err(LauncherError::Privilege(_))
        ));
    }

    #[tokio::test]
    async fn test_output_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = PosixLauncher::new();
        let mut spec = sh("echo hello; echo oops >&2");
        spec.stdout = Some(dir.path().join("s.out"));
        spec.stderr = Some(dir.path().join("s.err"));
        spec.envs = vec![("GRIDNODE_TEST".to_string(), "1".to_string())];
        let launched = launcher.launch(&spec).await.unwrap();
        launched.exit_rx.await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("s.out")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("s.err")).unwrap(),
            "oops\n"
        );
    }
}
