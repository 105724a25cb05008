/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for a grid node.
//!
//! A [`NodeConfig`] starts from defaults, can be loaded from a YAML
//! file, and is then overridden by `GRIDNODE_*` environment
//! variables. Durations are written in humantime form (`"500ms"`,
//! `"1m 30s"`).

use std::env;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// What happens to a server whose process keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DisableOnFailure {
    /// Failures never disable the server.
    Never,
    /// The server stays disabled until it is explicitly re-enabled.
    Indefinitely,
    /// The server is re-enabled automatically after this period.
    For(Duration),
}

impl fmt::Display for DisableOnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::Indefinitely => f.write_str("indefinitely"),
            Self::For(d) => write!(f, "{}", humantime::format_duration(*d)),
        }
    }
}

impl FromStr for DisableOnFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "never" | "0" => Ok(Self::Never),
            "indefinitely" | "-1" => Ok(Self::Indefinitely),
            other => humantime::parse_duration(other)
                .map(Self::For)
                .map_err(|e| e.to_string()),
        }
    }
}

impl TryFrom<String> for DisableOnFailure {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DisableOnFailure> for String {
    fn from(value: DisableOnFailure) -> Self {
        value.to_string()
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// The node name, used when registering with registries.
    pub name: String,
    /// The grid instance name; prefixes every identity this node
    /// creates.
    pub instance_name: String,
    /// Root of the on-disk state (`servers/`, `tmp/`).
    pub data_dir: PathBuf,
    /// When set, server stdout/stderr go to `<output_dir>/<id>.out`
    /// and `<output_dir>/<id>.err`.
    pub output_dir: Option<PathBuf>,
    /// Send stderr to the `.out` file as well.
    pub redirect_err_to_out: bool,
    /// Activation and deactivation timeout for servers that don't
    /// declare their own.
    #[serde(with = "duration_str")]
    pub wait_time: Duration,
    /// Keep-alive period used until a registry reports a session
    /// timeout.
    #[serde(with = "duration_str")]
    pub keep_alive_period: Duration,
    /// How long node startup waits for the first master session.
    #[serde(with = "duration_str")]
    pub create_session_wait: Duration,
    /// How long to wait for replica sessions before the node adapter
    /// is activated.
    #[serde(with = "duration_str")]
    pub replica_session_wait: Duration,
    /// Delay before an `always` server is started again.
    #[serde(with = "duration_str")]
    pub delayed_start: Duration,
    pub disable_on_failure: DisableOnFailure,
    /// Failures within `failure_window` needed to disable a server.
    pub failure_threshold: u32,
    #[serde(with = "duration_str")]
    pub failure_window: Duration,
    pub allow_running_servers_as_root: bool,
    /// Upper bound on consistency-check retries caused by concurrent
    /// loads and destroys.
    pub consistency_check_attempts: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "node".to_string()),
            instance_name: "GridNode".to_string(),
            data_dir: PathBuf::from("db"),
            output_dir: None,
            redirect_err_to_out: false,
            wait_time: Duration::from_secs(60),
            keep_alive_period: Duration::from_secs(10),
            create_session_wait: Duration::from_secs(3),
            replica_session_wait: Duration::from_secs(5),
            delayed_start: Duration::from_millis(500),
            disable_on_failure: DisableOnFailure::Never,
            failure_threshold: 1,
            failure_window: Duration::from_secs(60),
            allow_running_servers_as_root: false,
            consistency_check_attempts: 10,
        }
    }
}

fn parse_env<T>(key: &str, apply: impl FnOnce(T)) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Ok(value) = env::var(key) else {
        return Ok(());
    };
    match value.parse::<T>() {
        Ok(parsed) => {
            apply(parsed);
            Ok(())
        }
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            reason: e.to_string(),
        }),
    }
}

struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        humantime::parse_duration(s).map(HumanDuration)
    }
}

impl NodeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load configuration from a YAML file. Keys that are absent keep
    /// their defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Defaults, then the YAML file (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Write this configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Apply `GRIDNODE_*` overrides. Invalid values are logged and
    /// ignored.
    pub fn apply_env(&mut self) {
        let results = [
            parse_env("GRIDNODE_NAME", |v: String| self.name = v),
            parse_env("GRIDNODE_INSTANCE_NAME", |v: String| self.instance_name = v),
            parse_env("GRIDNODE_DATA_DIR", |v: PathBuf| self.data_dir = v),
            parse_env("GRIDNODE_OUTPUT_DIR", |v: PathBuf| self.output_dir = Some(v)),
            parse_env("GRIDNODE_REDIRECT_ERR_TO_OUT", |v: bool| {
                self.redirect_err_to_out = v
            }),
            parse_env("GRIDNODE_WAIT_TIME", |v: HumanDuration| self.wait_time = v.0),
            parse_env("GRIDNODE_KEEP_ALIVE_PERIOD", |v: HumanDuration| {
                self.keep_alive_period = v.0
            }),
            parse_env("GRIDNODE_CREATE_SESSION_WAIT", |v: HumanDuration| {
                self.create_session_wait = v.0
            }),
            parse_env("GRIDNODE_REPLICA_SESSION_WAIT", |v: HumanDuration| {
                self.replica_session_wait = v.0
            }),
            parse_env("GRIDNODE_DELAYED_START", |v: HumanDuration| {
                self.delayed_start = v.0
            }),
            parse_env("GRIDNODE_DISABLE_ON_FAILURE", |v: DisableOnFailure| {
                self.disable_on_failure = v
            }),
            parse_env("GRIDNODE_FAILURE_THRESHOLD", |v: u32| {
                self.failure_threshold = v
            }),
            parse_env("GRIDNODE_FAILURE_WINDOW", |v: HumanDuration| {
                self.failure_window = v.0
            }),
            parse_env("GRIDNODE_ALLOW_RUNNING_SERVERS_AS_ROOT", |v: bool| {
                self.allow_running_servers_as_root = v
            }),
            parse_env("GRIDNODE_CONSISTENCY_CHECK_ATTEMPTS", |v: u32| {
                self.consistency_check_attempts = v
            }),
        ];
        for result in results {
            if let Err(e) = result {
                tracing::error!("ignoring environment override: {}", e);
            }
        }
    }

    /// Directory holding every deployed server.
    pub fn servers_dir(&self) -> PathBuf {
        self.data_dir.join("servers")
    }

    /// Scratch directory.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.wait_time, Duration::from_secs(60));
        assert_eq!(config.create_session_wait, Duration::from_secs(3));
        assert_eq!(config.replica_session_wait, Duration::from_secs(5));
        assert_eq!(config.disable_on_failure, DisableOnFailure::Never);
        assert_eq!(config.consistency_check_attempts, 10);
        assert_eq!(config.servers_dir(), PathBuf::from("db/servers"));
    }

    #[test]
    fn test_disable_on_failure_parse() {
        assert_eq!(
            "never".parse::<DisableOnFailure>().unwrap(),
            DisableOnFailure::Never
        );
        assert_eq!(
            "-1".parse::<DisableOnFailure>().unwrap(),
            DisableOnFailure::Indefinitely
        );
        assert_eq!(
            "30s".parse::<DisableOnFailure>().unwrap(),
            DisableOnFailure::For(Duration::from_secs(30))
        );
        assert!("soon".parse::<DisableOnFailure>().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");

        let mut config = NodeConfig::default();
        config.name = "node1".to_string();
        config.wait_time = Duration::from_millis(1500);
        config.disable_on_failure = DisableOnFailure::For(Duration::from_secs(120));
        config.output_dir = Some(PathBuf::from("/var/log/servers"));
        config.to_yaml(&path).unwrap();

        let loaded = NodeConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_yaml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "name: n2\nwait_time: 5s\nfailure_threshold: 3\n").unwrap();

        let loaded = NodeConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.name, "n2");
        assert_eq!(loaded.wait_time, Duration::from_secs(5));
        assert_eq!(loaded.failure_threshold, 3);
        assert_eq!(loaded.keep_alive_period, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_env_reports_bad_values() {
        // Use a key nothing else reads so concurrent tests are unaffected.
        let key = "GRIDNODE_TEST_ONLY_BAD_VALUE";
        env::set_var(key, "abc");
        let mut seen = None;
        let result = parse_env(key, |v: u32| seen = Some(v));
        env::remove_var(key);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        assert!(seen.is_none());
    }
}
