//! The Host type - one managed machine as recorded in the cluster directory.
//!
//! Field names on the wire are the PascalCase names used by existing
//! `conf.json` records, so cluster directories written by earlier mayu
//! releases load unchanged.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::Error;

/// Name of the profile used when no configured profile has capacity left.
pub const DEFAULT_PROFILE: &str = "default";

/// Normalize a serial for lookups and directory names
pub fn normalize_serial(serial: &str) -> String {
    serial.trim().to_lowercase()
}

/// Normalize MAC address to lowercase with colons
pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace('-', ":")
}

/// Generate a random machine id (16 random bytes, hex encoded)
pub fn generate_machine_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hostname derived from the internal address: `10.0.0.1` becomes `10-0-0-1`.
pub fn hostname_for(addr: Ipv4Addr) -> String {
    addr.to_string().replace('.', "-")
}

/// Host lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Created, nothing reported yet
    #[default]
    Unknown,
    /// Waiting for (re)installation on next PXE boot
    Configured,
    /// Install configuration handed out
    Installing,
    /// Installer reported completion
    Installed,
    /// Installed system booted and reported its versions
    Running,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Unknown => "unknown",
            HostState::Configured => "configured",
            HostState::Installing => "installing",
            HostState::Installed => "installed",
            HostState::Running => "running",
        }
    }

    /// Installed and running hosts must not be offered PXE again.
    pub fn is_provisioned(&self) -> bool {
        matches!(self, HostState::Installed | HostState::Running)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(HostState::Unknown),
            "configured" => Ok(HostState::Configured),
            "installing" => Ok(HostState::Installing),
            "installed" => Ok(HostState::Installed),
            "running" => Ok(HostState::Running),
            other => Err(Error::InvalidState(other.to_string())),
        }
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A node within the mayu cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Host {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    #[serde(skip_serializing_if = "is_false")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mac_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_addr: Option<Ipv4Addr>,
    /// One address per configured extra NIC, keyed by interface name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_addrs: BTreeMap<String, Ipv4Addr>,
    #[serde(rename = "IPMIAddr", skip_serializing_if = "Option::is_none")]
    pub ipmi_addr: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(rename = "MachineID", skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    #[serde(rename = "ConnectedNIC", skip_serializing_if = "String::is_empty")]
    pub connected_nic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_boot: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etcd_cluster_token: String,
    /// Merged over `templates_env` when rendering this host's configuration
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, serde_json::Value>,

    pub state: HostState,

    #[serde(skip_serializing_if = "is_false")]
    pub keep_disk_data: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fleet_metadata: Vec<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub cabinet: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub machine_on_cabinet: u32,

    #[serde(alias = "CoreOSVersion", skip_serializing_if = "String::is_empty")]
    pub flatcar_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mayu_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etcd_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
}

impl Host {
    /// A freshly created, enabled host with a new machine id.
    pub fn new(serial: &str) -> Self {
        Self {
            serial: normalize_serial(serial),
            enabled: true,
            machine_id: generate_machine_id(),
            ..Default::default()
        }
    }

    /// Assign the internal address and the hostname derived from it
    pub fn assign_internal_addr(&mut self, addr: Ipv4Addr) {
        self.internal_addr = Some(addr);
        self.hostname = hostname_for(addr);
    }

    pub fn has_mac(&self, mac: &str) -> bool {
        let mac = normalize_mac(mac);
        self.mac_addresses.iter().any(|m| normalize_mac(m) == mac)
    }

    /// Copy the version report of a booted host
    pub fn record_versions(&mut self, report: &Host) {
        self.flatcar_version = report.flatcar_version.clone();
        self.mayu_version = report.mayu_version.clone();
        self.etcd_version = report.etcd_version.clone();
        self.docker_version = report.docker_version.clone();
    }
}
