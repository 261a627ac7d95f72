//! mayu dnsmasq supervisor
//!
//! mayu does not answer DHCP or TFTP itself. It renders a configuration for
//! an external `dnsmasq` process and keeps that process running. Hosts that
//! are already installed or running are written into the configuration as
//! ignored, so a provisioned machine that reboots does not fall back into the
//! PXE boot protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                DnsmasqSupervisor                    │
//! │  ┌───────────────────────────────────────────────┐  │
//! │  │   update_configuration(network, ignore-list)  │  │
//! │  │   template → <base>.conf                      │  │
//! │  └───────────────────────────────────────────────┘  │
//! │                       │                             │
//! │                       ▼                             │
//! │  ┌───────────────────────────────────────────────┐  │
//! │  │   restart: kill running child, spawn new one  │  │
//! │  │   dnsmasq -k -d --conf-file --dhcp-leasefile  │  │
//! │  └───────────────────────────────────────────────┘  │
//! │                       │                             │
//! │                       ▼                             │
//! │  ┌───────────────────────────────────────────────┐  │
//! │  │   stdout/stderr lines → tracing               │  │
//! │  └───────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mayu_dnsmasq::{DnsmasqConfig, DnsmasqSupervisor, RestartPolicy};
//!
//! let supervisor = DnsmasqSupervisor::new(DnsmasqConfig::default());
//! supervisor.start_with_retry(&RestartPolicy::default()).await?;
//! supervisor.update_configuration(&network, &ignored_macs).await?;
//! ```

pub mod config;
pub mod error;
pub mod supervisor;

pub use config::{DnsmasqConfig, RestartPolicy};
pub use error::{DnsmasqError, Result};
pub use supervisor::DnsmasqSupervisor;
