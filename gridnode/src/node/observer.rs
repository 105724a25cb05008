/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fan-out of dynamic server and adapter state to registry observers.
//!
//! Every observer has its own FIFO queue with at most one push in
//! flight. Observers are registered per registry session; an observer
//! reachable through two sessions still gets each update once.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::platform::NodeInfo;
use crate::registry::AdapterDynamicInfo;
use crate::registry::Identity;
use crate::registry::NodeDynamicInfo;
use crate::registry::NodeObserver;
use crate::registry::RegistryError;
use crate::registry::ServerDynamicInfo;
use crate::registry::ServerState;

#[derive(Debug, Clone)]
enum Update {
    NodeUp(NodeDynamicInfo),
    Server(ServerDynamicInfo),
    Adapter(AdapterDynamicInfo),
}

struct Queue {
    /// Bumped whenever the queue is reset, so that a push completing
    /// for an older queue does not dequeue from the new one.
    epoch: u64,
    observer: Arc<dyn NodeObserver>,
    pending: VecDeque<Update>,
}

struct ObserverInner {
    info: NodeInfo,
    /// Session identity to the observer obtained through it.
    observers: BTreeMap<Identity, Arc<dyn NodeObserver>>,
    /// Keyed by observer identity.
    queues: BTreeMap<Identity, Queue>,
    servers: BTreeMap<String, ServerDynamicInfo>,
    adapters: BTreeMap<String, AdapterDynamicInfo>,
    next_epoch: u64,
}

impl ObserverInner {
    fn snapshot(&self) -> NodeDynamicInfo {
        NodeDynamicInfo {
            info: self.info.clone(),
            servers: self.servers.values().cloned().collect(),
            adapters: self.adapters.values().cloned().collect(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ObserverSet {
    inner: Arc<Mutex<ObserverInner>>,
}

impl ObserverSet {
    pub(crate) fn new(info: NodeInfo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObserverInner {
                info,
                observers: BTreeMap::new(),
                queues: BTreeMap::new(),
                servers: BTreeMap::new(),
                adapters: BTreeMap::new(),
                next_epoch: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObserverInner> {
        self.inner.lock().expect("observer mutex poisoned")
    }

    /// Subscribe `observer` on behalf of `session`. Any stale queue for
    /// the observer is dropped and `node_up` is sent first.
    pub(crate) fn add(&self, session: Identity, observer: Arc<dyn NodeObserver>) {
        let mut inner = self.lock();
        let key = observer.identity();
        tracing::debug!(%session, observer = %key, "adding observer");
        inner.observers.insert(session, Arc::clone(&observer));

        inner.next_epoch += 1;
        let epoch = inner.next_epoch;
        let snapshot = inner.snapshot();
        inner.queues.insert(
            key.clone(),
            Queue {
                epoch,
                observer,
                pending: VecDeque::from([Update::NodeUp(snapshot)]),
            },
        );
        self.drain(key, epoch);
    }

    pub(crate) fn remove(&self, session: &Identity) {
        let mut inner = self.lock();
        let Some(observer) = inner.observers.remove(session) else {
            return;
        };
        let key = observer.identity();
        tracing::debug!(%session, observer = %key, "removing observer");
        if !inner.observers.values().any(|o| o.identity() == key) {
            inner.queues.remove(&key);
        }
    }

    pub(crate) fn update_server(&self, info: ServerDynamicInfo) {
        let mut inner = self.lock();
        match info.state {
            ServerState::Inactive | ServerState::Destroyed => {
                inner.servers.remove(&info.id);
            }
            _ => {
                inner.servers.insert(info.id.clone(), info.clone());
            }
        }
        self.enqueue(&mut inner, Update::Server(info));
    }

    pub(crate) fn update_adapter(&self, info: AdapterDynamicInfo) {
        let mut inner = self.lock();
        if info.proxy.is_some() {
            inner.adapters.insert(info.id.clone(), info.clone());
        } else {
            inner.adapters.remove(&info.id);
        }
        self.enqueue(&mut inner, Update::Adapter(info));
    }

    fn enqueue(&self, inner: &mut ObserverInner, update: Update) {
        let mut sent = BTreeSet::new();
        let observers: Vec<Arc<dyn NodeObserver>> = inner.observers.values().cloned().collect();
        for observer in observers {
            let key = observer.identity();
            if !sent.insert(key.clone()) {
                continue;
            }
            if !inner.queues.contains_key(&key) {
                inner.next_epoch += 1;
                let epoch = inner.next_epoch;
                inner.queues.insert(
                    key.clone(),
                    Queue {
                        epoch,
                        observer,
                        pending: VecDeque::new(),
                    },
                );
            }
            let Some(queue) = inner.queues.get_mut(&key) else {
                continue;
            };
            queue.pending.push_back(update.clone());
            if queue.pending.len() == 1 {
                let epoch = queue.epoch;
                self.drain(key, epoch);
            }
        }
    }

    /// Push the queue of `key` until it is empty, one update at a time.
    fn drain(&self, key: Identity, epoch: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (observer, update, node) = {
                    let inner = this.lock();
                    let Some(queue) = inner.queues.get(&key).filter(|q| q.epoch == epoch) else {
                        return;
                    };
                    let Some(update) = queue.pending.front().cloned() else {
                        return;
                    };
                    (Arc::clone(&queue.observer), update, inner.info.name.clone())
                };

                let result = send(&*observer, &node, update).await;

                let mut inner = this.lock();
                let Some(queue) = inner.queues.get_mut(&key).filter(|q| q.epoch == epoch) else {
                    return;
                };
                if let Err(e) = result {
                    tracing::warn!(observer = %key, error = %e, "failed to update observer; dropping its queue");
                    inner.queues.remove(&key);
                    return;
                }
                queue.pending.pop_front();
                if queue.pending.is_empty() {
                    return;
                }
            }
        });
    }
}

async fn send(
    observer: &dyn NodeObserver,
    node: &str,
    update: Update,
) -> Result<(), RegistryError> {
    match update {
        Update::NodeUp(info) => observer.node_up(info).await,
        Update::Server(info) => observer.update_server(node, info).await,
        Update::Adapter(info) => observer.update_adapter(node, info).await,
    }
}
