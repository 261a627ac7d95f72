//! Host registry backed by the cluster directory
//!
//! ```text
//! <cluster dir>/
//!   cluster.json          cluster-wide defaults
//!   <serial>/conf.json    one record per host, serial lower-cased
//! ```
//!
//! Records may be edited by hand or by other tools while mayu runs. Every
//! read refreshes the cache first: a changed directory modification time
//! triggers a full rescan, otherwise each cached record whose file is newer
//! than the copy in memory is reloaded. Refresh and lookup happen under one
//! lock, and every change to the cache bumps a generation counter.

mod record;

pub use record::{CLUSTER_CONF_FILE, HOST_CONF_FILE};

use mayu_common::{normalize_mac, normalize_serial, Host};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::changelog::{ChangeLog, ChangeLogError};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("host not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock poisoned: {0}")]
    Lock(String),

    #[error("change log: {0}")]
    ChangeLog(#[from] ChangeLogError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster-wide defaults stored in `cluster.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub default_etcd_cluster_token: String,

    /// Deprecated, converted to `DefaultEtcdClusterToken` at startup
    #[serde(
        rename = "EtcdDiscoveryURL",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub etcd_discovery_url: String,
}

struct CachedHost {
    host: Host,
    mod_time: SystemTime,
}

#[derive(Default)]
struct HostCache {
    hosts: HashMap<String, CachedHost>,
    by_mac: HashMap<String, String>,
    by_addr: HashMap<Ipv4Addr, String>,
    scanned_mod_time: Option<SystemTime>,
    generation: u64,
}

impl HostCache {
    fn rebuild_indexes(&mut self) {
        self.by_mac.clear();
        self.by_addr.clear();
        for (serial, cached) in &self.hosts {
            for mac in &cached.host.mac_addresses {
                self.by_mac.insert(normalize_mac(mac), serial.clone());
            }
            // hosts without an address yet stay out of the address index
            if let Some(addr) = cached.host.internal_addr {
                self.by_addr.insert(addr, serial.clone());
            }
        }
        self.generation += 1;
    }

    fn get(&self, serial: &str) -> Option<Host> {
        self.hosts.get(serial).map(|c| c.host.clone())
    }

    fn sorted_hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.values().map(|c| c.host.clone()).collect();
        hosts.sort_by(|a, b| a.serial.cmp(&b.serial));
        hosts
    }
}

/// The registry of all hosts in a cluster directory
pub struct Cluster {
    base_dir: PathBuf,
    config: RwLock<ClusterConfig>,
    cache: Mutex<HostCache>,
    log: Arc<dyn ChangeLog>,
}

impl Cluster {
    /// Create a new cluster directory with an empty `cluster.json`
    pub fn create(base_dir: impl AsRef<Path>, log: Arc<dyn ChangeLog>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).map_err(|source| ClusterError::Io {
                path: base_dir.clone(),
                source,
            })?;
        }
        log.init(&base_dir)?;

        let cluster = Self::with_config(base_dir, ClusterConfig::default(), log);
        cluster.commit("initial commit")?;
        info!(dir = %cluster.base_dir.display(), "created cluster directory");
        Ok(cluster)
    }

    /// Open an existing cluster directory
    pub fn open(base_dir: impl AsRef<Path>, log: Arc<dyn ChangeLog>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let config = record::read_json(&base_dir.join(CLUSTER_CONF_FILE))?;
        let cluster = Self::with_config(base_dir, config, log);
        cluster.refresh()?;
        info!(
            dir = %cluster.base_dir.display(),
            hosts = cluster.generation_and_len().1,
            "opened cluster directory"
        );
        Ok(cluster)
    }

    /// Open the cluster directory, creating it when there is no `cluster.json`
    pub fn open_or_create(base_dir: impl AsRef<Path>, log: Arc<dyn ChangeLog>) -> Result<Self> {
        if base_dir.as_ref().join(CLUSTER_CONF_FILE).exists() {
            Self::open(base_dir, log)
        } else {
            Self::create(base_dir, log)
        }
    }

    fn with_config(base_dir: PathBuf, config: ClusterConfig, log: Arc<dyn ChangeLog>) -> Self {
        Self {
            base_dir,
            config: RwLock::new(config),
            cache: Mutex::new(HostCache::default()),
            log,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> ClusterConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Change the cluster config and commit it
    pub fn update_config<F>(&self, message: &str, f: F) -> Result<ClusterConfig>
    where
        F: FnOnce(&mut ClusterConfig),
    {
        let updated = {
            let mut config = self
                .config
                .write()
                .map_err(|e| ClusterError::Lock(e.to_string()))?;
            f(&mut config);
            config.clone()
        };
        self.commit(message)?;
        Ok(updated)
    }

    /// Persist `cluster.json` and record it in the change log
    pub fn commit(&self, message: &str) -> Result<()> {
        let path = self.base_dir.join(CLUSTER_CONF_FILE);
        record::write_json(&path, &self.config())?;
        self.log.record(&self.base_dir, &path, message)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HostCache>> {
        self.cache
            .lock()
            .map_err(|e| ClusterError::Lock(e.to_string()))
    }

    /// Lock the cache and bring it up to date with the directory
    fn refreshed(&self) -> Result<MutexGuard<'_, HostCache>> {
        let mut cache = self.lock()?;
        self.refresh_locked(&mut cache)?;
        Ok(cache)
    }

    /// Bring the cache up to date with the cluster directory
    pub fn refresh(&self) -> Result<()> {
        self.refreshed().map(|_| ())
    }

    fn refresh_locked(&self, cache: &mut HostCache) -> Result<()> {
        let dir_mod_time = record::modified(&self.base_dir)?;

        if cache.scanned_mod_time != Some(dir_mod_time) {
            // a failed scan keeps the previous cache
            cache.hosts = self.scan()?;
            cache.scanned_mod_time = Some(dir_mod_time);
            cache.rebuild_indexes();
            debug!(hosts = cache.hosts.len(), generation = cache.generation, "rescanned cluster directory");
            return Ok(());
        }

        let mut changed = false;
        for (serial, cached) in cache.hosts.iter_mut() {
            let host_dir = self.base_dir.join(serial);
            let mod_time = match record::modified(&record::host_conf_path(&host_dir)) {
                Ok(t) => t,
                Err(e) => {
                    warn!(serial = %serial, error = %e, "cannot stat host record");
                    continue;
                }
            };
            if mod_time > cached.mod_time {
                match record::load_host(&host_dir) {
                    Ok((host, mod_time)) => {
                        debug!(serial = %serial, "reloaded changed host record");
                        *cached = CachedHost { host, mod_time };
                        changed = true;
                    }
                    Err(e) => warn!(serial = %serial, error = %e, "unable to reload host record"),
                }
            }
        }
        if changed {
            cache.rebuild_indexes();
        }
        Ok(())
    }

    /// Load every `<dir>/conf.json`, skipping hidden and unreadable entries
    fn scan(&self) -> Result<HashMap<String, CachedHost>> {
        let entries = fs::read_dir(&self.base_dir).map_err(|source| ClusterError::Io {
            path: self.base_dir.clone(),
            source,
        })?;

        let mut hosts = HashMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let conf = record::host_conf_path(&entry.path());
            if !conf.exists() {
                continue;
            }
            match record::load_host(&entry.path()) {
                Ok((host, mod_time)) => {
                    hosts.insert(normalize_serial(&name), CachedHost { host, mod_time });
                }
                Err(e) => warn!(path = %conf.display(), error = %e, "unable to process host record"),
            }
        }
        Ok(hosts)
    }

    /// Current cache generation and host count
    pub fn generation_and_len(&self) -> (u64, usize) {
        self.lock()
            .map(|c| (c.generation, c.hosts.len()))
            .unwrap_or_default()
    }

    /// Run a lookup on a refreshed cache. Registry errors are logged and
    /// reported as "not found".
    fn lookup<T>(&self, what: &str, f: impl FnOnce(&HostCache) -> Option<T>) -> Option<T> {
        match self.refreshed() {
            Ok(cache) => f(&cache),
            Err(e) => {
                warn!(lookup = what, error = %e, "host registry unavailable");
                None
            }
        }
    }

    pub fn host_by_serial(&self, serial: &str) -> Option<Host> {
        let serial = normalize_serial(serial);
        self.lookup("serial", |cache| cache.get(&serial))
    }

    pub fn host_by_mac(&self, mac: &str) -> Option<Host> {
        let mac = normalize_mac(mac);
        self.lookup("mac", |cache| {
            cache.by_mac.get(&mac).and_then(|serial| cache.get(serial))
        })
    }

    pub fn host_by_internal_addr(&self, addr: Ipv4Addr) -> Option<Host> {
        self.lookup("internal address", |cache| {
            cache.by_addr.get(&addr).and_then(|serial| cache.get(serial))
        })
    }

    /// All hosts ordered by serial. If the directory cannot be read the
    /// last known hosts are returned.
    pub fn all_hosts(&self) -> Vec<Host> {
        let mut cache = match self.lock() {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "host registry unavailable");
                return Vec::new();
            }
        };
        if let Err(e) = self.refresh_locked(&mut cache) {
            warn!(error = %e, "refresh failed, listing cached hosts");
        }
        cache.sorted_hosts()
    }

    pub fn filter_hosts<P>(&self, predicate: P) -> Vec<Host>
    where
        P: Fn(&Host) -> bool,
    {
        self.all_hosts().into_iter().filter(|h| predicate(h)).collect()
    }

    /// Profile name to number of hosts in it
    pub fn profile_count(&self) -> HashMap<String, usize> {
        let mut count = HashMap::new();
        for host in self.all_hosts() {
            if !host.profile.is_empty() {
                *count.entry(host.profile).or_insert(0) += 1;
            }
        }
        count
    }

    /// Get or create the host with `serial`
    pub fn create_host(&self, serial: &str) -> Result<Host> {
        self.create_host_with(serial, |_, _| Ok::<(), ClusterError>(()))
            .map(|(host, _)| host)
    }

    /// Get or create the host with `serial`. A new host is passed to `init`
    /// together with all existing hosts before it is written; if `init` fails
    /// nothing is written. Returns the host and whether it was created.
    pub fn create_host_with<F, E>(&self, serial: &str, init: F) -> std::result::Result<(Host, bool), E>
    where
        F: FnOnce(&mut Host, &[Host]) -> std::result::Result<(), E>,
        E: From<ClusterError>,
    {
        let serial = normalize_serial(serial);
        let mut cache = self.refreshed()?;
        if let Some(existing) = cache.get(&serial) {
            return Ok((existing, false));
        }

        let mut host = Host::new(&serial);
        let others = cache.sorted_hosts();
        init(&mut host, &others)?;

        self.store_locked(&mut cache, &host, &format!("created host {}", serial))?;
        info!(serial = %serial, internal_addr = ?host.internal_addr, profile = %host.profile, "created host");
        Ok((host, true))
    }

    /// Mutate a host and commit it, all under the registry lock
    pub fn update_host<F>(&self, serial: &str, message: &str, f: F) -> Result<Host>
    where
        F: FnOnce(&mut Host),
    {
        self.try_update_host(serial, message, |host| {
            f(host);
            Ok::<(), ClusterError>(())
        })
    }

    /// Like [`Cluster::update_host`] with a fallible mutation; on error
    /// nothing is written.
    pub fn try_update_host<F, E>(&self, serial: &str, message: &str, f: F) -> std::result::Result<Host, E>
    where
        F: FnOnce(&mut Host) -> std::result::Result<(), E>,
        E: From<ClusterError>,
    {
        let serial = normalize_serial(serial);
        let mut cache = self.refreshed()?;
        let mut host = cache
            .get(&serial)
            .ok_or_else(|| ClusterError::NotFound(serial.clone()))?;
        f(&mut host)?;
        self.store_locked(&mut cache, &host, message)?;
        Ok(host)
    }

    /// Mutate every host with access to a snapshot of all hosts, committing
    /// those that changed. Hosts are visited in the order of `order`.
    pub fn update_all_hosts<F, K, E>(&self, message: &str, order: K, mut f: F) -> std::result::Result<usize, E>
    where
        F: FnMut(&mut Host, &[Host]) -> std::result::Result<(), E>,
        K: Fn(&Host) -> Option<Ipv4Addr>,
        E: From<ClusterError>,
    {
        let mut cache = self.refreshed()?;
        let mut hosts = cache.sorted_hosts();
        hosts.sort_by_key(|h| order(h).map(u32::from));

        let mut updated = 0;
        for i in 0..hosts.len() {
            let mut host = hosts[i].clone();
            f(&mut host, &hosts)?;
            if host != hosts[i] {
                self.store_locked(&mut cache, &host, message)?;
                hosts[i] = host;
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn store_locked(&self, cache: &mut HostCache, host: &Host, message: &str) -> Result<()> {
        let host_dir = self.base_dir.join(&host.serial);
        let mod_time = record::save_host(&host_dir, host)?;
        self.log
            .record(&self.base_dir, &record::host_conf_path(&host_dir), message)?;

        cache.hosts.insert(
            host.serial.clone(),
            CachedHost {
                host: host.clone(),
                mod_time,
            },
        );
        cache.rebuild_indexes();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
