/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Deployment descriptors for servers, as handed to the node by the
//! registry. Descriptors arrive fully expanded; the node never
//! interprets templates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// How a server gets started.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActivationMode {
    /// Started as soon as it is loaded, and restarted whenever it
    /// becomes inactive.
    Always,
    /// Started when the registry allocates it to a client session.
    Session,
    /// Started when a client resolves one of its adapters.
    OnDemand,
    /// Started only by an explicit administrative request.
    #[default]
    Manual,
    /// Never started.
    Disabled,
}

/// A single `name=value` configuration property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An object adapter hosted by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub id: String,
    /// The server is only considered active once every server
    /// lifetime adapter has registered its endpoints, and is
    /// considered to be shutting down when one of them goes away.
    pub server_lifetime: bool,
}

/// The deployment description of one server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDescriptor {
    pub id: String,
    pub application: String,
    /// Application identity and revision; together they detect stale
    /// updates coming from registry replicas.
    pub uuid: String,
    pub revision: u64,
    /// Set when the server is allocated to a client session.
    pub session_id: String,
    pub exe: PathBuf,
    pub pwd: Option<PathBuf>,
    /// The account the process runs as (POSIX only).
    pub user: Option<String>,
    pub activation: ActivationMode,
    pub activation_timeout: Option<Duration>,
    pub deactivation_timeout: Option<Duration>,
    /// The process registers a process-control facet, and the server
    /// isn't active until it does.
    pub process_registered: bool,
    pub options: Vec<String>,
    /// `NAME=VALUE` strings merged into the inherited environment.
    pub envs: Vec<String>,
    pub logs: Vec<PathBuf>,
    pub adapters: Vec<AdapterDescriptor>,
    /// Hosted services; each gets its own `data_<service>` directory.
    pub services: Vec<String>,
    /// Configuration file name (`config`, `config_<service>`) to the
    /// properties written in it.
    pub properties: BTreeMap<String, Vec<Property>>,
}

impl ServerDescriptor {
    fn without_bookkeeping(&self) -> Self {
        Self {
            uuid: String::new(),
            revision: 0,
            ..self.clone()
        }
    }

    fn without_runtime_settings(&self) -> Self {
        Self {
            properties: BTreeMap::new(),
            logs: Vec::new(),
            ..self.without_bookkeeping()
        }
    }

    /// Whether `other` describes a different deployment. Only the
    /// application uuid and revision are ignored.
    pub fn is_updated(&self, other: &ServerDescriptor) -> bool {
        self.without_bookkeeping() != other.without_bookkeeping()
    }

    /// Whether moving from `self` to `other` needs the process to be
    /// restarted. Properties and log files can be updated on a live
    /// process.
    pub fn requires_restart(&self, other: &ServerDescriptor) -> bool {
        self.without_runtime_settings() != other.without_runtime_settings()
    }

    /// The adapters whose registration gates server activation.
    pub fn server_lifetime_adapters(&self) -> impl Iterator<Item = &str> {
        self.adapters
            .iter()
            .filter(|a| a.server_lifetime)
            .map(|a| a.id.as_str())
    }

    /// Parsed environment overrides. Entries without `=` are passed as
    /// empty variables.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.envs
            .iter()
            .map(|e| match e.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (e.clone(), String::new()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor {
            id: "S1".to_string(),
            application: "app".to_string(),
            uuid: "u1".to_string(),
            revision: 1,
            exe: PathBuf::from("/bin/sh"),
            adapters: vec![
                AdapterDescriptor {
                    id: "A1".to_string(),
                    server_lifetime: true,
                },
                AdapterDescriptor {
                    id: "A2".to_string(),
                    server_lifetime: false,
                },
            ],
            properties: BTreeMap::from([(
                "config".to_string(),
                vec![Property::new("Key", "1")],
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn test_revision_bump_is_not_an_update() {
        let a = descriptor();
        let mut b = a.clone();
        b.revision = 7;
        b.uuid = "u2".to_string();
        assert!(!a.is_updated(&b));
        assert!(!a.requires_restart(&b));
    }

    #[test]
    fn test_property_change_does_not_require_restart() {
        let a = descriptor();
        let mut b = a.clone();
        b.properties
            .get_mut("config")
            .unwrap()
            .push(Property::new("Other", "2"));
        b.logs.push(PathBuf::from("/var/log/s1.log"));
        assert!(a.is_updated(&b));
        assert!(!a.requires_restart(&b));
    }

    #[test]
    fn test_option_change_requires_restart() {
        let a = descriptor();
        let mut b = a.clone();
        b.options.push("--verbose".to_string());
        assert!(a.requires_restart(&b));
    }

    #[test]
    fn test_lifetime_adapters_and_envs() {
        let mut d = descriptor();
        d.envs = vec!["A=1".to_string(), "B=x=y".to_string(), "C".to_string()];
        assert_eq!(d.server_lifetime_adapters().collect::<Vec<_>>(), vec!["A1"]);
        assert_eq!(
            d.env_pairs(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("C".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_activation_mode_names() {
        assert_eq!(ActivationMode::OnDemand.to_string(), "on-demand");
        assert_eq!(
            "always".parse::<ActivationMode>().unwrap(),
            ActivationMode::Always
        );
    }
}
