//! Test helpers for mayu-server
//!
//! [`TestEnv`] lays out a complete mayu installation in a temporary
//! directory: config file, cluster directory, templates, an images cache
//! and a dnsmasq that is just `true`.

use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use mayu_common::{IpRange, Network, NetworkInterface, Profile};
use mayu_discovery::StandaloneDiscovery;
use mayu_dnsmasq::{DnsmasqConfig, DnsmasqSupervisor};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::changelog::{ChangeLog, NoopChangeLog};
use crate::cluster::Cluster;
use crate::config::{MayuConfig, ServerOptions};
use crate::provisioning::ProvisioningService;
use crate::renderer::{SnippetCache, TemplateRenderer};
use crate::AppState;

const IGNITION: &str = "hostname: {{ host.Hostname }}\nstate: {{ host.State }}\n";
const LAST_STAGE: &str = "#cloud-config\nhostname: {{ host.Hostname }}\n";
const FIRST_STAGE: &str = "#!/bin/sh\n\
    # machine {{ machine_id }}\n\
    curl -X PUT {{ set_installed_url }}\n";
const DNSMASQ: &str = "dhcp-range={{ network.primary_nic.ip_range.start }},{{ network.primary_nic.ip_range.end }}\n\
    {% for mac in ignored_hosts %}dhcp-host={{ mac }},ignore\n{% endfor %}";

pub struct TestEnv {
    dir: TempDir,
    pub cluster: Arc<Cluster>,
    state: AppState,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_change_log(Arc::new(NoopChangeLog))
    }

    /// An env whose cluster records changes through `log`
    pub fn with_change_log(log: Arc<dyn ChangeLog>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        std::fs::write(root.join("ignition.yaml"), IGNITION).unwrap();
        std::fs::write(root.join("last_stage.yaml"), LAST_STAGE).unwrap();
        std::fs::write(root.join("first_stage.sh"), FIRST_STAGE).unwrap();
        std::fs::write(root.join("dnsmasq_template.conf"), DNSMASQ).unwrap();

        let images = root.join("images").join("1409.7.0");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("coreos_production_pxe.vmlinuz"), "kernel").unwrap();
        std::fs::write(images.join("coreos_production_pxe_image.cpio.gz"), "initrd").unwrap();

        std::fs::create_dir_all(root.join("static_html")).unwrap();
        std::fs::write(root.join("static_html").join("infopusher"), "#!/bin/sh").unwrap();

        let cluster =
            Cluster::create(root.join("cluster"), log).unwrap();
        cluster
            .update_config("default token", |c| {
                c.default_etcd_cluster_token = "default-token".to_string()
            })
            .unwrap();
        let cluster = Arc::new(cluster);

        let config = test_config();
        config.save(root.join("config.yaml")).unwrap();

        let options = Arc::new(test_options(root));
        let state = AppState {
            provisioning: Arc::new(build_service(&cluster, config, options.clone())),
            discovery: Arc::new(StandaloneDiscovery::new()),
            options,
        };

        Self {
            dir,
            cluster,
            state,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The configuration written to `config.yaml`
    pub fn config(&self) -> MayuConfig {
        test_config()
    }

    /// Options the env's service runs with
    pub fn options(&self) -> ServerOptions {
        test_options(self.path())
    }

    /// A service over the shared cluster with a different configuration
    pub fn service(&self, config: MayuConfig) -> ProvisioningService {
        self.service_with(config, self.options())
    }

    pub fn service_with(&self, config: MayuConfig, options: ServerOptions) -> ProvisioningService {
        build_service(&self.cluster, config, Arc::new(options))
    }

    pub fn dnsmasq_conf(&self) -> PathBuf {
        self.path().join("dnsmasq.mayu.conf")
    }

    pub fn app_state(&self) -> AppState {
        self.state.clone()
    }

    pub fn boot_app(&self) -> Router {
        crate::boot_app(self.app_state())
    }

    pub fn admin_app(&self) -> Router {
        crate::api_app(self.app_state())
    }
}

/// The service behind the env's routers
pub fn test_service(env: &TestEnv) -> ProvisioningService {
    env.service(env.config())
}

pub async fn body_string(resp: Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn test_config() -> MayuConfig {
    let mut templates_env = BTreeMap::new();
    templates_env.insert("cluster_name".to_string(), serde_json::json!("lab"));
    templates_env.insert("region".to_string(), serde_json::json!("lab"));

    MayuConfig {
        default_flatcar_version: "1409.7.0".to_string(),
        network: Network {
            bind_addr: "10.0.1.254".to_string(),
            primary_nic: NetworkInterface {
                interface_name: "eth0".to_string(),
                ip_range: IpRange::new(Ipv4Addr::new(10, 0, 1, 1), Ipv4Addr::new(10, 0, 1, 100)),
                ..Default::default()
            },
            extra_nics: vec![NetworkInterface {
                interface_name: "eth1".to_string(),
                ip_range: IpRange::new(
                    Ipv4Addr::new(192, 168, 1, 1),
                    Ipv4Addr::new(192, 168, 1, 10),
                ),
                ..Default::default()
            }],
            ..Default::default()
        },
        profiles: vec![
            Profile {
                name: "core".to_string(),
                quantity: 1,
                tags: vec!["role-core=true".to_string()],
                ..Default::default()
            },
            Profile {
                name: "worker".to_string(),
                quantity: 1,
                flatcar_version: "1520.0.0".to_string(),
                etcd_cluster_token: "worker-token".to_string(),
                ..Default::default()
            },
        ],
        templates_env,
    }
}

fn test_options(root: &Path) -> ServerOptions {
    ServerOptions {
        config_file: root.join("config.yaml"),
        cluster_dir: root.join("cluster"),
        dnsmasq: DnsmasqConfig {
            executable: PathBuf::from("true"),
            template: root.join("dnsmasq_template.conf"),
            tftp_root: root.join("tftproot"),
            pxe_port: 4081,
            base_file: root.join("dnsmasq.mayu"),
        },
        dnsmasq_retries: 1,
        images_cache_dir: root.join("images"),
        ignition_config: root.join("ignition.yaml"),
        first_stage_script: root.join("first_stage.sh"),
        last_stage_config: root.join("last_stage.yaml"),
        template_snippets: root.join("snippets"),
        files_dir: root.join("files"),
        static_html_path: root.join("static_html"),
        standalone_discovery: true,
        no_git: true,
        ..Default::default()
    }
}

fn build_service(
    cluster: &Arc<Cluster>,
    config: MayuConfig,
    options: Arc<ServerOptions>,
) -> ProvisioningService {
    let renderer = TemplateRenderer::new(
        &options.ignition_config,
        &options.last_stage_config,
        &options.first_stage_script,
        &options.files_dir,
        SnippetCache::default(),
    );
    let dnsmasq = Arc::new(DnsmasqSupervisor::new(options.dnsmasq.clone()));
    ProvisioningService::new(cluster.clone(), config, options, dnsmasq, Arc::new(renderer))
}
