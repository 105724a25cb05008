/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A grid node: deploys servers described by a registry, runs their
//! processes, and keeps lease sessions with the master registry and
//! its replicas.
//!
//! The main pieces, leaves first:
//!
//! - [`activator`]: owns child OS processes and reports their exit.
//! - [`server`]: the per-server state machine and its commands
//!   (load, start, stop, destroy), plus per-adapter proxy holders.
//! - [`node`]: routes load/destroy requests to servers, reconciles
//!   the on-disk server set against the registry, and fans out state
//!   changes to registry observers.
//! - [`session`]: keep-alive sessions with the master registry and
//!   every replica.
//!
//! Registries, observers and server processes are reached through
//! the traits in [`registry`].

pub mod activator;
pub mod config;
pub mod descriptor;
pub mod layout;
pub mod node;
pub mod platform;
pub mod registry;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

pub use activator::Activator;
pub use config::NodeConfig;
pub use descriptor::ServerDescriptor;
pub use node::Node;
pub use server::Server;
pub use session::NodeSessionManager;
