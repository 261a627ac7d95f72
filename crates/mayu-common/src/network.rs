//! Cluster network and profile settings, as read from the mayu config file.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::error::Error;

/// An inclusive IPv4 address range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Default for IpRange {
    fn default() -> Self {
        Self {
            start: Ipv4Addr::UNSPECIFIED,
            end: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl IpRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn is_unset(&self) -> bool {
        self.start.is_unspecified() && self.end.is_unspecified()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkRoute {
    #[serde(default)]
    pub destination_cidr: String,
    #[serde(default)]
    pub route_hop: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkModel {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub vlan_id: String,
    #[serde(default)]
    pub bond_mode: String,
    #[serde(default)]
    pub bond_interface_match: String,
}

/// One network interface of the provisioned machines
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    #[serde(default)]
    pub interface_name: String,
    #[serde(default)]
    pub ip_range: IpRange,
    #[serde(default)]
    pub subnet_size: String,
    #[serde(default)]
    pub subnet_gateway: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub routes: Vec<NetworkRoute>,
    #[serde(default)]
    pub network_model: NetworkModel,
}

impl NetworkInterface {
    fn validate(&self, field: &str) -> Result<(), Error> {
        if u32::from(self.ip_range.start) > u32::from(self.ip_range.end) {
            return Err(Error::InvalidNetwork(format!(
                "{}: range start {} is after end {}",
                field, self.ip_range.start, self.ip_range.end
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PxeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pxe_interface: NetworkInterface,
}

/// Cluster network settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Network {
    /// Address the boot and admin servers are reachable on
    #[serde(default)]
    pub bind_addr: String,
    #[serde(default)]
    pub pxe: PxeSettings,
    #[serde(default)]
    pub primary_nic: NetworkInterface,
    #[serde(default)]
    pub extra_nics: Vec<NetworkInterface>,
    /// Boot with UEFI instead of legacy BIOS
    #[serde(default)]
    pub uefi: bool,
    /// NTP servers for installed machines
    #[serde(default)]
    pub ntp: Vec<String>,
}

impl Network {
    pub fn validate(&self) -> Result<(), Error> {
        if self.primary_nic.ip_range.is_unset() {
            return Err(Error::InvalidNetwork(
                "primary_nic.ip_range is required".to_string(),
            ));
        }
        self.primary_nic.validate("primary_nic")?;
        self.pxe.pxe_interface.validate("pxe.pxe_interface")?;
        for nic in &self.extra_nics {
            if nic.interface_name.is_empty() {
                return Err(Error::InvalidNetwork(
                    "extra_nics entries need an interface_name".to_string(),
                ));
            }
            nic.validate(&format!("extra_nics.{}", nic.interface_name))?;
        }
        Ok(())
    }
}

/// A named, quantity-bounded class of machines
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub quantity: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disable_engine: bool,
    #[serde(default, alias = "coreos_version")]
    pub flatcar_version: String,
    #[serde(default)]
    pub etcd_cluster_token: String,
}
