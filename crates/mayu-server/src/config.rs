//! Server options and the cluster configuration file

use mayu_common::{Network, Profile};
use mayu_dnsmasq::{DnsmasqConfig, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode configuration: {0}")]
    Encode(#[from] serde_yaml::Error),

    #[error("no default_flatcar_version specified")]
    MissingDefaultVersion,

    #[error("api port and pxe port must differ (both are {0})")]
    SamePorts(u16),

    #[error("TLS serving is not supported, run with --no-tls behind a TLS terminating proxy")]
    TlsUnsupported,

    #[error("external etcd discovery url is set and internal etcd discovery is activated, choose one")]
    DiscoveryAmbiguous,

    #[error("internal etcd discovery is deactivated and no external discovery url is given")]
    DiscoveryMissing,

    #[error("internal etcd discovery proxies to etcd but no etcd endpoint is given")]
    MissingEtcdEndpoint,

    #[error("invalid network configuration: {0}")]
    InvalidNetwork(#[from] mayu_common::Error),
}

/// The cluster configuration file (`config.yaml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MayuConfig {
    #[serde(default, alias = "default_coreos_version")]
    pub default_flatcar_version: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Free-form values handed to every template
    #[serde(default)]
    pub templates_env: BTreeMap<String, serde_json::Value>,
}

impl MayuConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_flatcar_version.is_empty() {
            return Err(ConfigError::MissingDefaultVersion);
        }
        self.network.validate()?;
        Ok(())
    }

    /// First profile that has room left, going by the current host count
    pub fn next_profile(&self, count: &std::collections::HashMap<String, usize>) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| count.get(&p.name).copied().unwrap_or(0) < p.quantity)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// Process-level settings, filled from command line flags
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub config_file: PathBuf,
    pub cluster_dir: PathBuf,
    pub bind_address: String,
    pub api_port: u16,
    pub pxe_port: u16,

    pub dnsmasq: DnsmasqConfig,
    pub dnsmasq_retries: u32,

    pub images_cache_dir: PathBuf,
    pub ignition_config: PathBuf,
    pub first_stage_script: PathBuf,
    pub last_stage_config: PathBuf,
    pub template_snippets: PathBuf,
    pub files_dir: PathBuf,
    pub static_html_path: PathBuf,
    /// Boot with ignition in one phase instead of the first-stage installer
    pub use_ignition: bool,

    pub etcd_quorum_size: u32,
    pub etcd_endpoint: String,
    /// CA bundle trusted for an https etcd endpoint
    pub etcd_ca_file: Option<PathBuf>,
    /// External discovery service, used when internal discovery is off
    pub etcd_discovery: String,
    pub use_internal_etcd_discovery: bool,
    /// Keep discovery entries in the cluster directory instead of etcd
    pub standalone_discovery: bool,

    pub no_git: bool,
    /// Only plain HTTP is served; advertised URLs follow this flag
    pub no_tls: bool,

    pub console_tty: bool,
    /// Appended to the kernel command line of every PXE boot
    pub kernel_params: Vec<String>,
    pub flatcar_autologin: bool,
    pub systemd_shell: bool,

    pub version: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/mayu/config.yaml"),
            cluster_dir: PathBuf::from("cluster"),
            bind_address: "0.0.0.0".to_string(),
            api_port: 4080,
            pxe_port: 4081,
            dnsmasq: DnsmasqConfig::default(),
            dnsmasq_retries: 3,
            images_cache_dir: PathBuf::from("./images"),
            ignition_config: PathBuf::from("./templates/ignition.yaml"),
            first_stage_script: PathBuf::from("./templates/first_stage_script.sh"),
            last_stage_config: PathBuf::from("./templates/last_stage_cloudconfig.yaml"),
            template_snippets: PathBuf::from("./templates/snippets/"),
            files_dir: PathBuf::from("./files"),
            static_html_path: PathBuf::from("./static_html"),
            use_ignition: true,
            etcd_quorum_size: 3,
            etcd_endpoint: "http://127.0.0.1:2379".to_string(),
            etcd_ca_file: None,
            etcd_discovery: String::new(),
            use_internal_etcd_discovery: true,
            standalone_discovery: false,
            no_git: false,
            no_tls: true,
            console_tty: false,
            kernel_params: Vec::new(),
            flatcar_autologin: false,
            systemd_shell: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_port == self.pxe_port {
            return Err(ConfigError::SamePorts(self.api_port));
        }
        if !self.no_tls {
            return Err(ConfigError::TlsUnsupported);
        }
        match (self.etcd_discovery.is_empty(), self.use_internal_etcd_discovery) {
            (false, true) => return Err(ConfigError::DiscoveryAmbiguous),
            (true, false) => return Err(ConfigError::DiscoveryMissing),
            _ => {}
        }
        if self.use_internal_etcd_discovery
            && !self.standalone_discovery
            && self.etcd_endpoint.is_empty()
        {
            return Err(ConfigError::MissingEtcdEndpoint);
        }
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        if self.no_tls {
            "http"
        } else {
            "https"
        }
    }

    /// Base URL of the admin API as seen by the machines
    pub fn api_url(&self, network: &Network) -> String {
        format!("{}://{}:{}", self.scheme(), network.bind_addr, self.api_port)
    }

    /// Base URL of the boot server as seen by the machines
    pub fn pxe_url(&self, network: &Network) -> String {
        format!("{}://{}:{}", self.scheme(), network.bind_addr, self.pxe_port)
    }

    /// Discovery base URL; a token is appended to form a cluster URL
    pub fn discovery_url(&self, network: &Network) -> String {
        if self.use_internal_etcd_discovery {
            format!("{}/etcd", self.api_url(network))
        } else {
            self.etcd_discovery.trim_end_matches('/').to_string()
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_attempts: self.dnsmasq_retries.max(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}
