/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup for the grid node.
//!
//! Every binary or test that wants readable output calls
//! [`initialize_logging`] (or [`initialize_logging_for_test`]) once.
//! Events are rendered in glog format. The level comes from
//! [`GRIDNODE_LOG_ENV`]; when [`GRIDNODE_LOG_DIR_ENV`] is set, output
//! goes to a rolling file in that directory instead of stderr.

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::OnceLock;

pub use tracing;
pub use tracing::Level;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_glog::LocalTime;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;

/// Log level for the node (`error`, `warn`, `info`, `debug`, `trace`).
pub const GRIDNODE_LOG_ENV: &str = "GRIDNODE_LOG";
/// Directory for the rolling log file. Unset means stderr.
pub const GRIDNODE_LOG_DIR_ENV: &str = "GRIDNODE_LOG_DIR";
/// Optional suffix appended to the log file name.
pub const GRIDNODE_LOG_SUFFIX_ENV: &str = "GRIDNODE_LOG_SUFFIX";

const LOG_LEVEL_INFO: &str = "info";
const LOG_LEVEL_DEBUG: &str = "debug";

static FILE_WRITER_GUARD: OnceLock<Arc<(NonBlocking, WorkerGuard)>> = OnceLock::new();

pub mod env {
    /// Where the process is running, which decides the log sink.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Env {
        /// A regular node process.
        Local,
        /// Unit and integration tests.
        Test,
    }

    impl std::fmt::Display for Env {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(match self {
                Self::Local => "local",
                Self::Test => "test",
            })
        }
    }

    impl Env {
        #[cfg(test)]
        pub fn current() -> Self {
            Self::Test
        }

        #[cfg(not(test))]
        pub fn current() -> Self {
            Self::Local
        }
    }
}

/// Given an environment, determine the directory and file prefix for
/// the log file. A non-empty suffix is appended as `_<suffix>`.
pub fn log_file_path(
    env: env::Env,
    dir: Option<&str>,
    suffix: Option<&str>,
) -> Result<(String, String), anyhow::Error> {
    let suffix = suffix
        .filter(|s| !s.is_empty())
        .map(|s| format!("_{}", s))
        .unwrap_or_default();
    match env {
        env::Env::Local => {
            let dir = match dir {
                Some(dir) => dir.to_string(),
                None => {
                    let username = whoami::username();
                    if username.is_empty() {
                        "/tmp/gridnode".to_string()
                    } else {
                        format!("/tmp/{}", username)
                    }
                }
            };
            Ok((dir, format!("gridnode_log{}", suffix)))
        }
        env::Env::Test => Err(anyhow::anyhow!(
            "file writer unsupported for environment {}",
            env
        )),
    }
}

fn try_create_appender(
    path: &str,
    filename: &str,
) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(path)?;
    Ok(RollingFileAppender::builder()
        .filename_prefix(filename)
        .filename_suffix("log")
        .build(path)?)
}

fn writer(env: env::Env) -> Box<dyn Write + Send> {
    let Ok(dir) = std::env::var(GRIDNODE_LOG_DIR_ENV) else {
        return Box::new(std::io::stderr());
    };
    let suffix = std::env::var(GRIDNODE_LOG_SUFFIX_ENV).ok();
    let (path, filename) = match log_file_path(env, Some(&dir), suffix.as_deref()) {
        Ok(p) => p,
        Err(_) => return Box::new(std::io::stderr()),
    };
    match try_create_appender(&path, &filename) {
        Ok(appender) => Box::new(appender),
        Err(e) => {
            eprintln!(
                "unable to create log file in {}: {}. Falling back to stderr",
                path, e
            );
            Box::new(std::io::stderr())
        }
    }
}

fn level_filter(default: &str) -> LevelFilter {
    let level = std::env::var(GRIDNODE_LOG_ENV).unwrap_or_else(|_| default.to_string());
    let level = Level::from_str(&level)
        .or_else(|_| Level::from_str(default))
        .unwrap_or(Level::INFO);
    LevelFilter::from_level(level)
}

/// Set up logging for a node process. Calling this more than once is
/// harmless; later calls are ignored.
pub fn initialize_logging() {
    initialize_logging_impl(env::Env::current());
}

/// Set up logging for tests: stderr, debug level by default.
pub fn initialize_logging_for_test() {
    initialize_logging_impl(env::Env::Test);
}

fn initialize_logging_impl(env: env::Env) {
    use tracing_subscriber::Registry;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = match env {
        env::Env::Local => LOG_LEVEL_INFO,
        env::Env::Test => LOG_LEVEL_DEBUG,
    };

    let guard = FILE_WRITER_GUARD.get_or_init(|| {
        let sink: Box<dyn Write + Send> = match env {
            env::Env::Test => Box::new(std::io::stderr()),
            env::Env::Local => writer(env),
        };
        let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(sink);
        Arc::new((non_blocking, guard))
    });

    let layer = fmt::Layer::default()
        .with_writer(guard.0.clone())
        .event_format(Glog::default().with_timer(LocalTime::default()))
        .fmt_fields(GlogFields::default().compact())
        .with_ansi(false)
        .with_filter(Targets::new().with_default(level_filter(default_level)));

    if let Err(err) = Registry::default().with(layer).try_init() {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_suffix() {
        let (dir, name) = log_file_path(env::Env::Local, Some("/var/log/node"), Some("n1")).unwrap();
        assert_eq!(dir, "/var/log/node");
        assert_eq!(name, "gridnode_log_n1");

        let (_, name) = log_file_path(env::Env::Local, Some("/x"), Some("")).unwrap();
        assert_eq!(name, "gridnode_log");
    }

    #[test]
    fn test_log_file_path_rejects_test_env() {
        assert!(log_file_path(env::Env::Test, None, None).is_err());
    }

    #[test]
    fn test_appender_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested");
        let path = path.to_str().unwrap();
        try_create_appender(path, "gridnode_log").unwrap();
        assert!(std::path::Path::new(path).is_dir());
    }

    #[test]
    fn test_initialize_twice() {
        initialize_logging_for_test();
        initialize_logging_for_test();
        tracing::info!("still alive");
    }
}
