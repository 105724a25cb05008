/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The on-disk layout of a deployed server.
//!
//! ```text
//! <data_dir>/servers/<id>/
//!     config/config            properties of the server
//!     config/config_<service>  properties of one hosted service
//!     revision                 application uuid and revision
//!     data/                    scratch space of the server
//!     data_<service>/          scratch space of one service
//! ```
//!
//! Anything else found in a server directory was not put there by the
//! node, and the node refuses to delete such a directory.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

use crate::descriptor::ServerDescriptor;

pub const CONFIG_DIR: &str = "config";
pub const CONFIG_FILE: &str = "config";
pub const REVISION_FILE: &str = "revision";
pub const DATA_DIR: &str = "data";

fn is_config_file_name(name: &str) -> bool {
    name == CONFIG_FILE
        || name
            .strip_prefix("config_")
            .is_some_and(|svc| !svc.is_empty() && !svc.contains(['/', '\\']) && svc != "..")
}

fn data_dir_name(service: &str) -> String {
    format!("{}_{}", DATA_DIR, service)
}

/// Write `desc` to the server directory `dir`: configuration files,
/// revision file, and data directories. Configuration files of a
/// previous deployment that `desc` no longer has are removed. Data
/// directories are never removed.
pub fn deploy(dir: &Path, desc: &ServerDescriptor) -> io::Result<()> {
    let config_dir = dir.join(CONFIG_DIR);
    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(dir.join(DATA_DIR))?;
    for service in &desc.services {
        fs::create_dir_all(dir.join(data_dir_name(service)))?;
    }

    for (file, properties) in &desc.properties {
        if !is_config_file_name(file) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid configuration file name `{}`", file),
            ));
        }
        let mut out = fs::File::create(config_dir.join(file))?;
        writeln!(out, "#")?;
        writeln!(out, "# Configuration file of server `{}`.", desc.id)?;
        writeln!(out, "# Written by the grid node; do not edit.")?;
        writeln!(out, "#")?;
        for property in properties {
            writeln!(out, "{}={}", property.name, property.value)?;
        }
    }

    for entry in fs::read_dir(&config_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_config_file_name(&name) && !desc.properties.contains_key(&name) {
            tracing::debug!(server = %desc.id, file = %name, "removing stale configuration file");
            fs::remove_file(entry.path())?;
        }
    }

    write_revision(dir, desc)
}

pub fn write_revision(dir: &Path, desc: &ServerDescriptor) -> io::Result<()> {
    let mut out = fs::File::create(dir.join(REVISION_FILE))?;
    writeln!(out, "#")?;
    writeln!(
        out,
        "# This server belongs to the application `{}`.",
        desc.application
    )?;
    writeln!(out, "#")?;
    writeln!(out, "uuid: {}", desc.uuid)?;
    writeln!(out, "revision: {}", desc.revision)?;
    Ok(())
}

/// The uuid and revision recorded in `dir`, if there is a revision
/// file.
pub fn read_revision(dir: &Path) -> io::Result<Option<(String, u64)>> {
    let text = match fs::read_to_string(dir.join(REVISION_FILE)) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut uuid = String::new();
    let mut revision = 0;
    for line in text.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("uuid:") {
            uuid = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("revision:") {
            revision = value.trim().parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid revision `{}`", value.trim()),
                )
            })?;
        }
    }
    Ok(Some((uuid, revision)))
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Whether `dir` holds nothing but what the node itself writes: a
/// `config` directory with configuration files, a `revision` file, and
/// empty data directories.
pub fn can_remove_server_directory(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        let recognized = if name == CONFIG_DIR && file_type.is_dir() {
            let mut only_config = true;
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if !file.file_type()?.is_file()
                    || !is_config_file_name(&file.file_name().to_string_lossy())
                {
                    only_config = false;
                    break;
                }
            }
            only_config
        } else if name == REVISION_FILE {
            file_type.is_file()
        } else if name == DATA_DIR || name.starts_with("data_") {
            file_type.is_dir() && is_empty_dir(&entry.path())?
        } else {
            false
        };
        if !recognized {
            tracing::debug!(dir = %dir.display(), entry = %name, "unrecognized server directory entry");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Names of the server directories under `servers_dir`.
pub fn server_directories(servers_dir: &Path) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(servers_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
