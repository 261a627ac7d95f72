//! On-disk JSON records of the cluster directory

use mayu_common::Host;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{ClusterError, Result};

pub const CLUSTER_CONF_FILE: &str = "cluster.json";
pub const HOST_CONF_FILE: &str = "conf.json";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ClusterError + '_ {
    move |source| ClusterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&data).map_err(|source| ClusterError::Record {
        path: path.to_path_buf(),
        source,
    })
}

/// Full rewrite, pretty-printed
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value).map_err(|source| ClusterError::Record {
        path: path.to_path_buf(),
        source,
    })?;
    data.push(b'\n');
    fs::write(path, data).map_err(io_error(path))
}

pub fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(io_error(path))
}

pub fn host_conf_path(host_dir: &Path) -> PathBuf {
    host_dir.join(HOST_CONF_FILE)
}

/// Load a host record and the modification time it was read at
pub fn load_host(host_dir: &Path) -> Result<(Host, SystemTime)> {
    let path = host_conf_path(host_dir);
    let mod_time = modified(&path)?;
    let host = read_json(&path)?;
    Ok((host, mod_time))
}

/// Write a host record, creating its directory, and return the new
/// modification time
pub fn save_host(host_dir: &Path, host: &Host) -> Result<SystemTime> {
    if !host_dir.exists() {
        fs::create_dir_all(host_dir).map_err(io_error(host_dir))?;
    }
    let path = host_conf_path(host_dir);
    write_json(&path, host)?;
    modified(&path)
}
