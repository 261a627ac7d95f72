//! Shared types for the mayu provisioning service.
//!
//! A [`Host`] is one managed machine: its persisted identity, network
//! assignment and lifecycle [`HostState`]. The [`network`] module holds the
//! cluster network and profile settings every component is constructed with.

pub mod error;
pub mod host;
pub mod network;

pub use error::Error;
pub use host::*;
pub use network::{IpRange, Network, NetworkInterface, NetworkModel, NetworkRoute, Profile, PxeSettings};
