//! Provisioning orchestrator
//!
//! Drives hosts through their lifecycle:
//!
//! - first contact (`/ignition` or `/first-stage-script`) creates the host,
//!   picking a profile and allocating its addresses
//! - facts submission merges MACs, connected NIC and IPMI address, moves
//!   the host to `installing` and renders its install configuration
//! - `set_installed` moves it to `installed` and takes its MACs out of
//!   dnsmasq, `boot_complete` moves it to `running`
//!
//! Every mutation goes through [`Cluster::update_host`] and is persisted
//! before the call returns. That means file writes and, with git enabled,
//! a commit; async callers go through [`ProvisioningService::blocking`].

use chrono::Utc;
use mayu_common::{normalize_mac, Host, HostState, DEFAULT_PROFILE};
use mayu_dnsmasq::{DnsmasqError, DnsmasqSupervisor};
use mayu_ipxe::{BootMode, IpxeConfig, IpxeError, IpxeScriptGenerator};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterError};
use crate::config::{ConfigError, MayuConfig, ServerOptions};
use crate::ipalloc::{in_range, next_free, AllocError};
use crate::renderer::{DocumentKind, FirstStageContext, RenderContext, RenderError, Renderer};

/// Serial reported by every KVM guest
const KVM_STATIC_SERIAL: &str = "0123456789";
/// iPXE truncates VMware serials, so they are not unique
const VMWARE_IDENTIFIER: &str = "VMware";

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("host doesn't exist")]
    UnknownHost(String),

    #[error("no serial ? :/")]
    NoSerial,

    #[error(transparent)]
    Cluster(ClusterError),

    #[error("address allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("generating {kind} config failed: {source}")]
    Render {
        kind: DocumentKind,
        #[source]
        source: RenderError,
    },

    #[error("generating boot script failed: {0}")]
    BootScript(#[from] IpxeError),

    #[error("dnsmasq: {0}")]
    Dnsmasq(#[from] DnsmasqError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("registry task failed: {0}")]
    Task(String),
}

impl From<ClusterError> for ProvisioningError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(serial) => ProvisioningError::UnknownHost(serial),
            other => ProvisioningError::Cluster(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProvisioningError::Task(e.to_string()))?
}

/// Hardware facts reported by the installer
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostFacts {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub net_devs: Vec<NetDev>,
    #[serde(default, rename = "ConnectedNIC")]
    pub connected_nic: String,
    #[serde(default, rename = "IPMIAddress")]
    pub ipmi_address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetDev {
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
}

/// Pick the identifier of a booting machine. Serials that are known not to
/// be unique fall back to the SMBIOS uuid.
pub fn choose_serial(serial: &str, uuid: &str) -> Option<String> {
    let chosen = if serial.is_empty()
        || serial == KVM_STATIC_SERIAL
        || serial.contains(VMWARE_IDENTIFIER)
    {
        uuid
    } else {
        serial
    };
    let chosen = chosen.trim();
    (!chosen.is_empty()).then(|| chosen.to_string())
}

pub struct ProvisioningService {
    cluster: Arc<Cluster>,
    config: RwLock<Arc<MayuConfig>>,
    options: Arc<ServerOptions>,
    dnsmasq: Arc<DnsmasqSupervisor>,
    renderer: Arc<dyn Renderer>,
    /// Serializes dnsmasq reconfiguration
    dnsmasq_update: tokio::sync::Mutex<()>,
}

impl ProvisioningService {
    pub fn new(
        cluster: Arc<Cluster>,
        config: MayuConfig,
        options: Arc<ServerOptions>,
        dnsmasq: Arc<DnsmasqSupervisor>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            cluster,
            config: RwLock::new(Arc::new(config)),
            options,
            dnsmasq,
            renderer,
            dnsmasq_update: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Run registry work on the blocking pool, away from the async workers
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&ProvisioningService) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let svc = self.clone();
        run_blocking(move || f(&svc)).await
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn config(&self) -> Arc<MayuConfig> {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn api_url(&self) -> String {
        self.options.api_url(&self.config().network)
    }

    pub fn pxe_url(&self) -> String {
        self.options.pxe_url(&self.config().network)
    }

    /// Validate, persist and activate a new configuration
    pub async fn replace_config(&self, new: MayuConfig) -> Result<()> {
        new.validate()?;
        new.save(&self.options.config_file)?;
        match self.config.write() {
            Ok(mut config) => *config = Arc::new(new),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(new),
        }
        info!(path = %self.options.config_file.display(), "configuration replaced");
        self.update_dnsmasq().await
    }

    /// The iPXE script every machine chain-loads first
    pub fn boot_script(&self) -> Result<String> {
        let mut config = IpxeConfig::new(self.pxe_url())
            .with_autologin(self.options.flatcar_autologin)
            .with_rescue_shell(self.options.systemd_shell);
        if self.options.console_tty {
            config = config.with_console("ttyS0");
        }
        for param in &self.options.kernel_params {
            config = config.with_kernel_param(param.as_str());
        }
        let mode = if self.options.use_ignition {
            BootMode::Ignition
        } else {
            BootMode::FirstStage
        };
        Ok(IpxeScriptGenerator::new(config).generate(mode)?)
    }

    /// Get or create the host with `serial`. A new host gets a profile, an
    /// internal address, one address per extra NIC and an etcd token.
    pub fn maybe_create_host(&self, serial: &str) -> Result<Host> {
        let config = self.config();
        let default_token = self.cluster.config().default_etcd_cluster_token;

        let (host, created) = self.cluster.create_host_with(serial, |host, others| {
            let mut count: HashMap<String, usize> = HashMap::new();
            for other in others.iter().filter(|h| !h.profile.is_empty()) {
                *count.entry(other.profile.clone()).or_insert(0) += 1;
            }

            let profile = config.next_profile(&count);
            host.profile = profile
                .map(|p| p.name.clone())
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
            host.fleet_metadata = profile.map(|p| p.tags.clone()).unwrap_or_default();
            host.flatcar_version = profile
                .map(|p| p.flatcar_version.clone())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| config.default_flatcar_version.clone());
            host.etcd_cluster_token = profile
                .map(|p| p.etcd_cluster_token.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| default_token.clone());

            let taken: HashSet<Ipv4Addr> = others.iter().filter_map(|h| h.internal_addr).collect();
            host.assign_internal_addr(next_free(&config.network.primary_nic.ip_range, &taken)?);

            for nic in &config.network.extra_nics {
                let taken = addrs_on_nic(others, &nic.interface_name);
                let addr = next_free(&nic.ip_range, &taken)?;
                host.additional_addrs.insert(nic.interface_name.clone(), addr);
            }
            Ok::<(), ProvisioningError>(())
        })?;

        if created {
            info!(
                serial = %host.serial,
                profile = %host.profile,
                internal_addr = ?host.internal_addr,
                "registered new host"
            );
        }
        Ok(host)
    }

    fn update<F>(&self, serial: &str, message: &str, f: F) -> Result<Host>
    where
        F: FnOnce(&mut Host),
    {
        Ok(self.cluster.update_host(serial, message, f)?)
    }

    /// One-phase boot: create the host if needed and hand out its ignition
    pub fn ignition(&self, serial: &str) -> Result<String> {
        let host = self.maybe_create_host(serial)?;
        let host = self.update(&host.serial, "updated host state to installing", |h| {
            h.state = HostState::Installing;
            if let Some(addr) = h.internal_addr {
                h.assign_internal_addr(addr);
            }
        })?;
        info!(serial = %host.serial, "generating ignition config");
        self.render(&host, DocumentKind::Ignition)
    }

    /// Two-phase boot: the script that collects facts and installs the image
    pub fn first_stage_script(&self, serial: &str) -> Result<String> {
        let host = self.maybe_create_host(serial)?;
        let ctx = build_first_stage_context(&host, &self.config(), &self.options);
        debug!(serial = %host.serial, "generating first stage script");
        self.renderer
            .render_first_stage(&ctx)
            .map_err(|source| ProvisioningError::Render {
                kind: DocumentKind::CloudConfig,
                source,
            })
    }

    /// Merge reported facts, mark the host installing and render its final
    /// configuration
    pub fn submit_facts(&self, facts: &HostFacts, kind: DocumentKind) -> Result<String> {
        let serial = facts.serial.trim();
        if serial.is_empty() {
            return Err(ProvisioningError::NoSerial);
        }
        let host = self.maybe_create_host(serial)?;
        let host = self.update(&host.serial, "updated host facts, state installing", |h| {
            h.mac_addresses = facts
                .net_devs
                .iter()
                .map(|d| normalize_mac(&d.mac_address))
                .collect();
            if !facts.connected_nic.is_empty() {
                h.connected_nic = facts.connected_nic.clone();
            }
            if facts.ipmi_address.is_some() {
                h.ipmi_addr = facts.ipmi_address;
            }
            h.state = HostState::Installing;
        })?;
        info!(serial = %host.serial, macs = host.mac_addresses.len(), kind = %kind, "host submitted facts");
        self.render(&host, kind)
    }

    pub fn render_context(&self, host: &Host) -> RenderContext {
        let default_token = self.cluster.config().default_etcd_cluster_token;
        build_render_context(host, &self.config(), &self.options, &default_token)
    }

    pub fn render(&self, host: &Host, kind: DocumentKind) -> Result<String> {
        self.renderer
            .render(kind, &self.render_context(host))
            .map_err(|source| ProvisioningError::Render { kind, source })
    }

    /// The installer finished; stop offering PXE to the host
    pub async fn install_complete(&self, serial: &str) -> Result<Host> {
        let cluster = self.cluster.clone();
        let serial = serial.to_string();
        let host = run_blocking(move || {
            Ok(cluster.update_host(&serial, "updated state to installed", |h| {
                h.state = HostState::Installed;
            })?)
        })
        .await?;
        info!(serial = %host.serial, "host finished installing");
        if let Err(e) = self.update_dnsmasq().await {
            warn!(serial = %host.serial, error = %e, "failed to update dnsmasq after install");
        }
        Ok(host)
    }

    /// The installed system booted and reported its versions
    pub fn boot_complete(&self, serial: &str, report: &Host) -> Result<Host> {
        let host = self.update(serial, "updated host state to running", |h| {
            h.state = HostState::Running;
            h.last_boot = Some(Utc::now());
            h.record_versions(report);
        })?;
        info!(serial = %host.serial, flatcar_version = %host.flatcar_version, "host finished booting");
        Ok(host)
    }

    /// Set the state by hand. `running` is only ever reported by the host
    /// itself, so it is recorded as `configured`.
    pub fn set_state(&self, serial: &str, state: HostState) -> Result<Host> {
        let state = match state {
            HostState::Running => HostState::Configured,
            other => other,
        };
        self.update(serial, &format!("updated host state to {}", state), |h| {
            h.state = state;
        })
    }

    /// Reinstall on next boot, wiping the disks
    pub fn mark_fresh(&self, serial: &str) -> Result<Host> {
        self.update(serial, "host flagged as fresh", |h| {
            h.state = HostState::Configured;
            h.keep_disk_data = false;
        })
    }

    /// Reinstall on next boot, keeping the data on the disks
    pub fn mark_reconfigure(&self, serial: &str) -> Result<Host> {
        self.update(serial, "host flagged for reconfiguration", |h| {
            h.state = HostState::Configured;
            h.keep_disk_data = true;
        })
    }

    pub fn set_metadata(&self, serial: &str, metadata: Vec<String>) -> Result<Host> {
        self.update(serial, "updated host metadata", |h| h.fleet_metadata = metadata)
    }

    /// Set the cabinet, and the position within it when given
    pub fn set_cabinet(
        &self,
        serial: &str,
        cabinet: u32,
        machine_on_cabinet: Option<u32>,
    ) -> Result<Host> {
        self.update(serial, "updated host cabinet", |h| {
            h.cabinet = cabinet;
            if let Some(position) = machine_on_cabinet {
                h.machine_on_cabinet = position;
            }
        })
    }

    pub fn set_provider_id(&self, serial: &str, provider_id: String) -> Result<Host> {
        self.update(serial, "updated host provider id", |h| h.provider_id = provider_id)
    }

    pub fn set_ipmi_addr(&self, serial: &str, addr: Option<Ipv4Addr>) -> Result<Host> {
        self.update(serial, "updated host ipmi address", |h| h.ipmi_addr = addr)
    }

    pub fn set_etcd_cluster_token(&self, serial: &str, token: String) -> Result<Host> {
        self.update(serial, "updated host etcd cluster token", |h| {
            h.etcd_cluster_token = token
        })
    }

    /// Set a per-host template value
    pub fn override_property(
        &self,
        serial: &str,
        property: &str,
        value: serde_json::Value,
    ) -> Result<Host> {
        self.update(serial, &format!("override host property {}", property), |h| {
            h.overrides.insert(property.to_string(), value);
        })
    }

    /// MACs of hosts that must not be offered PXE any more
    pub fn ignored_macs(&self) -> Vec<String> {
        provisioned_macs(&self.cluster)
    }

    /// Re-render the dnsmasq configuration and restart it
    pub async fn update_dnsmasq(&self) -> Result<()> {
        let _guard = self.dnsmasq_update.lock().await;
        let config = self.config();
        let cluster = self.cluster.clone();
        let ignored = run_blocking(move || Ok(provisioned_macs(&cluster))).await?;
        self.dnsmasq
            .update_configuration(&config.network, &ignored)
            .await?;
        Ok(())
    }

    /// Give every host an address on every extra NIC, replacing addresses
    /// outside the NIC's range. Hosts are visited in internal address order.
    pub fn reconcile_additional_addrs(&self) -> Result<usize> {
        let config = self.config();
        if config.network.extra_nics.is_empty() {
            return Ok(0);
        }

        let updated = self.cluster.update_all_hosts(
            "assigned extra NIC addresses",
            |h| h.internal_addr,
            |host, hosts| {
                for nic in &config.network.extra_nics {
                    let current = host.additional_addrs.get(&nic.interface_name).copied();
                    if current.is_some_and(|addr| in_range(&nic.ip_range, addr)) {
                        continue;
                    }
                    let taken = addrs_on_nic(hosts, &nic.interface_name);
                    let addr = next_free(&nic.ip_range, &taken)?;
                    info!(
                        serial = %host.serial,
                        nic = %nic.interface_name,
                        previous = ?current,
                        addr = %addr,
                        "assigned extra NIC address"
                    );
                    host.additional_addrs.insert(nic.interface_name.clone(), addr);
                }
                Ok::<(), ProvisioningError>(())
            },
        )?;
        Ok(updated)
    }
}

/// Template values for `host`. Host overrides win over `templates_env`.
pub fn build_render_context(
    host: &Host,
    config: &MayuConfig,
    options: &ServerOptions,
    default_token: &str,
) -> RenderContext {
    let token = if host.etcd_cluster_token.is_empty() {
        default_token
    } else {
        host.etcd_cluster_token.as_str()
    };
    let mayu_url = options.api_url(&config.network);

    let mut templates_env = config.templates_env.clone();
    for (key, value) in &host.overrides {
        templates_env.insert(key.clone(), value.clone());
    }

    RenderContext {
        host: host.clone(),
        etcd_discovery_url: format!("{}/{}", options.discovery_url(&config.network), token),
        cluster_network: config.network.clone(),
        mayu_host: config.network.bind_addr.clone(),
        mayu_port: options.api_port,
        post_boot_url: format!("{}/admin/host/{}/boot_complete", mayu_url, host.serial),
        mayu_url,
        no_tls: options.no_tls,
        templates_env,
        files: Default::default(),
    }
}

/// URLs the first-stage installer of `host` calls back on
pub fn build_first_stage_context(
    host: &Host,
    config: &MayuConfig,
    options: &ServerOptions,
) -> FirstStageContext {
    let mayu_url = options.api_url(&config.network);
    let pxe_url = options.pxe_url(&config.network);
    FirstStageContext {
        host_info_helper_url: format!("{}/hostinfo-helper", pxe_url),
        cloud_config_url: format!("{}/final-cloud-config.yaml", pxe_url),
        install_image_url: format!("{}/images/{}/install_image.bin.bz2", pxe_url, host.serial),
        set_installed_url: format!("{}/admin/host/{}/set_installed", mayu_url, host.serial),
        mayu_url,
        mayu_version: options.version.clone(),
        machine_id: host.machine_id.clone(),
    }
}

fn provisioned_macs(cluster: &Cluster) -> Vec<String> {
    cluster
        .filter_hosts(|h| h.state.is_provisioned())
        .into_iter()
        .flat_map(|h| h.mac_addresses)
        .collect()
}

fn addrs_on_nic(hosts: &[Host], nic: &str) -> HashSet<Ipv4Addr> {
    hosts
        .iter()
        .filter_map(|h| h.additional_addrs.get(nic).copied())
        .collect()
}
