//! Standalone discovery backend
//!
//! Answers the discovery protocol from memory, optionally persisting every
//! change to a JSON file so registrations survive a restart.
//!
//! Like etcd, every change bumps one registry-wide index. Nodes carry
//! `createdIndex`/`modifiedIndex`, replies carry the current index, and a
//! `wait=true` read parks until a change at or after `waitIndex` (or the
//! next change, without one) shows up under the watched key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::backend::{
    is_watch, query_flag, query_index, DiscoveryBackend, QueryParams, RegistryKey, Reply,
};
use crate::error::{DiscoveryError, Result};
use crate::types::{EtcdError, EtcdNode, EtcdResponse};

/// Changes kept for watchers that come back with an older `waitIndex`
const HISTORY_LIMIT: usize = 1000;

/// A registered member's peer URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub value: String,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
}

/// One discovery token: expected size and registered members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub size: u32,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub size_index: u64,
    #[serde(default)]
    pub machines: BTreeMap<String, Member>,
}

impl ClusterEntry {
    fn listing(&self, token: &str) -> EtcdNode {
        let nodes = self
            .machines
            .iter()
            .map(|(name, member)| {
                EtcdNode::value(RegistryKey::Machine(name.clone()).path(token), &member.value)
                    .with_index(member.created_index, member.modified_index)
            })
            .collect();
        EtcdNode::dir(RegistryKey::Cluster.path(token), nodes)
            .with_index(self.created_index, self.created_index)
    }
}

#[derive(Debug, Clone)]
struct Event {
    index: u64,
    token: String,
    key: String,
    response: EtcdResponse,
}

impl Event {
    fn matches(&self, token: &str, path: &str, recursive: bool) -> bool {
        self.token == token
            && (self.key == path
                || (recursive
                    && self
                        .key
                        .strip_prefix(path)
                        .is_some_and(|rest| rest.starts_with('/'))))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterEntry>,
    #[serde(skip)]
    history: VecDeque<Event>,
    /// First index the history is complete from
    #[serde(skip)]
    history_start: u64,
}

impl Registry {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn record(&mut self, token: &str, key: String, response: EtcdResponse) {
        self.history.push_back(Event {
            index: self.index,
            token: token.to_string(),
            key,
            response,
        });
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.history_start = dropped.index + 1;
            }
        }
    }

    /// First recorded change at or after `from` under `path`
    fn find_event(&self, token: &str, path: &str, recursive: bool, from: u64) -> Result<Option<Reply>> {
        if from < self.history_start {
            return Err(DiscoveryError::etcd(EtcdError::event_index_cleared(
                from,
                self.history_start,
                self.index,
            )));
        }
        Ok(self
            .history
            .iter()
            .find(|e| e.index >= from && e.matches(token, path, recursive))
            .map(|e| Reply::ok(e.response.clone()).with_index(self.index)))
    }
}

/// In-process discovery registry
pub struct StandaloneDiscovery {
    registry: RwLock<Registry>,
    path: Option<PathBuf>,
    changed: Notify,
    closed: AtomicBool,
}

impl StandaloneDiscovery {
    /// A registry that lives only in memory
    pub fn new() -> Self {
        Self::with_registry(Registry::default(), None)
    }

    fn with_registry(registry: Registry, path: Option<PathBuf>) -> Self {
        Self {
            registry: RwLock::new(registry),
            path,
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A registry persisted to `path`, loading it if it exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut registry: Registry = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| DiscoveryError::Storage(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str(&data)
                .map_err(|e| DiscoveryError::Storage(format!("{}: {}", path.display(), e)))?
        } else {
            Registry::default()
        };
        // changes from before the restart are gone
        registry.history_start = registry.index + 1;
        info!(path = %path.display(), index = registry.index, "opened standalone discovery registry");
        Ok(Self::with_registry(registry, Some(path)))
    }

    pub fn entry(&self, token: &str) -> Option<ClusterEntry> {
        self.registry.read().ok()?.clusters.get(token).cloned()
    }

    /// Current registry index
    pub fn index(&self) -> u64 {
        self.registry.read().map(|r| r.index).unwrap_or_default()
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(registry)
            .map_err(|e| DiscoveryError::Storage(e.to_string()))?;
        std::fs::write(path, data)
            .map_err(|e| DiscoveryError::Storage(format!("{}: {}", path.display(), e)))
    }

    fn read(&self, token: &str, key: &RegistryKey) -> Result<Reply> {
        let registry = self.registry.read().map_err(lock_poisoned)?;
        let entry = registry
            .clusters
            .get(token)
            .ok_or_else(|| not_found(token, &RegistryKey::Cluster))?;

        let node = match key {
            RegistryKey::Cluster => entry.listing(token),
            RegistryKey::Size => EtcdNode::value(key.path(token), entry.size.to_string())
                .with_index(entry.created_index, entry.size_index),
            RegistryKey::Machine(name) => {
                let member = entry
                    .machines
                    .get(name)
                    .ok_or_else(|| not_found(token, key))?;
                EtcdNode::value(key.path(token), &member.value)
                    .with_index(member.created_index, member.modified_index)
            }
        };
        Ok(Reply::ok(EtcdResponse::new("get", node)).with_index(registry.index))
    }

    async fn watch(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply> {
        let recursive = query_flag(query, "recursive") == Some(true);
        let path = key.path(token);
        let mut from = query_index(query, "waitIndex")?;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(DiscoveryError::Closed);
            }
            {
                let registry = self.registry.read().map_err(lock_poisoned)?;
                if !registry.clusters.contains_key(token) {
                    return Err(not_found(token, &RegistryKey::Cluster));
                }
                let wait_from = *from.get_or_insert(registry.index + 1);
                if let Some(reply) = registry.find_event(token, &path, recursive, wait_from)? {
                    return Ok(reply);
                }
            }
            debug!(token = %token, key = %path, "discovery watch waiting");
            notified.await;
        }
    }
}

impl Default for StandaloneDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_poisoned<E: std::fmt::Display>(e: E) -> DiscoveryError {
    DiscoveryError::Storage(format!("lock poisoned: {}", e))
}

fn not_found(token: &str, key: &RegistryKey) -> DiscoveryError {
    DiscoveryError::etcd(EtcdError::key_not_found(key.path(token)))
}

#[async_trait]
impl DiscoveryBackend for StandaloneDiscovery {
    fn name(&self) -> &'static str {
        "standalone"
    }

    async fn create_cluster(&self, token: &str, size: u32) -> Result<()> {
        {
            let mut registry = self.registry.write().map_err(lock_poisoned)?;
            if registry.clusters.contains_key(token) {
                return Err(DiscoveryError::etcd(EtcdError::node_exists(
                    RegistryKey::Cluster.path(token),
                )));
            }
            let index = registry.next_index();
            registry.clusters.insert(
                token.to_string(),
                ClusterEntry {
                    size,
                    created_index: index,
                    size_index: index,
                    machines: BTreeMap::new(),
                },
            );
            self.persist(&registry)?;
        }
        self.changed.notify_waiters();
        info!(token = %token, size, "registered discovery token");
        Ok(())
    }

    async fn get(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply> {
        if is_watch(query) {
            return self.watch(token, key, query).await;
        }
        self.read(token, key)
    }

    async fn put(
        &self,
        token: &str,
        key: &RegistryKey,
        value: &str,
        query: &QueryParams,
    ) -> Result<Reply> {
        let prev_exist = query_flag(query, "prevExist");
        let reply = {
            let mut guard = self.registry.write().map_err(lock_poisoned)?;
            let registry = &mut *guard;
            if !registry.clusters.contains_key(token) {
                return Err(not_found(token, &RegistryKey::Cluster));
            }

            let reply = match key {
                RegistryKey::Cluster => {
                    return Err(DiscoveryError::etcd(EtcdError::not_file(key.path(token))))
                }
                RegistryKey::Size => {
                    let size = value.trim().parse().map_err(|_| {
                        DiscoveryError::etcd(EtcdError::invalid_field(format!(
                            "size {:?} is not a number",
                            value
                        )))
                    })?;
                    if prev_exist == Some(false) {
                        return Err(DiscoveryError::etcd(EtcdError::node_exists(key.path(token))));
                    }
                    let index = registry.next_index();
                    let created = match registry.clusters.get_mut(token) {
                        Some(entry) => {
                            entry.size = size;
                            entry.size_index = index;
                            entry.created_index
                        }
                        None => index,
                    };
                    let body = EtcdResponse::new(
                        "set",
                        EtcdNode::value(key.path(token), value).with_index(created, index),
                    );
                    registry.record(token, key.path(token), body.clone());
                    Reply::ok(body).with_index(index)
                }
                RegistryKey::Machine(name) => {
                    let exists = registry
                        .clusters
                        .get(token)
                        .is_some_and(|entry| entry.machines.contains_key(name));
                    let action = match (prev_exist, exists) {
                        (Some(false), true) => {
                            return Err(DiscoveryError::etcd(EtcdError::node_exists(
                                key.path(token),
                            )))
                        }
                        (Some(true), false) => return Err(not_found(token, key)),
                        (Some(false), false) => "create",
                        (Some(true), true) => "update",
                        (None, _) => "set",
                    };

                    let index = registry.next_index();
                    let mut created = index;
                    if let Some(entry) = registry.clusters.get_mut(token) {
                        let member = entry.machines.entry(name.clone()).or_insert_with(|| Member {
                            created_index: index,
                            ..Default::default()
                        });
                        member.value = value.to_string();
                        member.modified_index = index;
                        created = member.created_index;
                    }
                    debug!(token = %token, machine = %name, action, index, "registered discovery member");

                    let body = EtcdResponse::new(
                        action,
                        EtcdNode::value(key.path(token), value).with_index(created, index),
                    );
                    registry.record(token, key.path(token), body.clone());
                    if exists {
                        Reply::ok(body).with_index(index)
                    } else {
                        Reply::created(body).with_index(index)
                    }
                }
            };
            self.persist(registry)?;
            reply
        };
        self.changed.notify_waiters();
        Ok(reply)
    }

    async fn delete(&self, token: &str, key: &RegistryKey, _query: &QueryParams) -> Result<Reply> {
        let RegistryKey::Machine(name) = key else {
            return Err(DiscoveryError::etcd(EtcdError::not_file(key.path(token))));
        };
        let reply = {
            let mut registry = self.registry.write().map_err(lock_poisoned)?;
            let removed = registry
                .clusters
                .get_mut(token)
                .ok_or_else(|| not_found(token, &RegistryKey::Cluster))?
                .machines
                .remove(name)
                .ok_or_else(|| not_found(token, key))?;

            let index = registry.next_index();
            let body = EtcdResponse::new(
                "delete",
                EtcdNode::key(key.path(token)).with_index(removed.created_index, index),
            );
            registry.record(token, key.path(token), body.clone());
            self.persist(&registry)?;
            Reply::ok(body).with_index(index)
        };
        self.changed.notify_waiters();
        debug!(token = %token, machine = %name, "removed discovery member");
        Ok(reply)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}
