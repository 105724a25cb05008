/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Static host information and load sampling sent to registries.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::config::NodeConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub machine: String,
    pub nproc: usize,
    pub data_dir: PathBuf,
}

impl NodeInfo {
    pub fn current(config: &NodeConfig) -> Self {
        Self {
            name: config.name.clone(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            machine: std::env::consts::ARCH.to_string(),
            nproc: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            data_dir: config.data_dir.clone(),
        }
    }
}

/// Load averages over 1, 5 and 15 minutes; negative when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub avg1: f32,
    pub avg5: f32,
    pub avg15: f32,
}

impl LoadInfo {
    pub const UNKNOWN: LoadInfo = LoadInfo {
        avg1: -1.0,
        avg5: -1.0,
        avg15: -1.0,
    };

    #[cfg(unix)]
    pub fn sample() -> Self {
        let mut avg = [0f64; 3];
        // SAFETY: `avg` has room for the three samples requested.
        let n = unsafe { libc::getloadavg(avg.as_mut_ptr(), 3) };
        if n != 3 {
            return Self::UNKNOWN;
        }
        Self {
            avg1: avg[0] as f32,
            avg5: avg[1] as f32,
            avg15: avg[2] as f32,
        }
    }

    #[cfg(not(unix))]
    pub fn sample() -> Self {
        Self::UNKNOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info() {
        let mut config = NodeConfig::default();
        config.name = "n1".to_string();
        let info = NodeInfo::current(&config);
        assert_eq!(info.name, "n1");
        assert!(info.nproc >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_load_sample() {
        let load = LoadInfo::sample();
        assert!(load.avg1 >= 0.0);
    }
}
