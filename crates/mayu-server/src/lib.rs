//! mayu provisioning server
//!
//! Two HTTP listeners share one [`AppState`]:
//!
//! - the boot server (`--pxe-port`) answers machines that PXE boot: boot
//!   script, ignition, first-stage script, facts submission and images
//! - the API server (`--api-port`) carries the admin API and the etcd
//!   discovery registry
//!
//! [`run`] wires the cluster directory, the configuration, the discovery
//! backend and the supervised dnsmasq together and serves until Ctrl+C.

pub mod api;
pub mod boot;
pub mod changelog;
pub mod client;
pub mod cluster;
pub mod config;
pub mod etcd;
pub mod images;
pub mod ipalloc;
pub mod provisioning;
pub mod renderer;

#[cfg(test)]
mod test_helpers;

use anyhow::Context;
use axum::Router;
use mayu_common::Host;
use mayu_discovery::{
    fetch_token, generate_token, DiscoveryBackend, DiscoveryError, ProxyDiscovery,
    StandaloneDiscovery,
};
use mayu_dnsmasq::{DnsmasqError, DnsmasqSupervisor};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::changelog::{ChangeLog, GitChangeLog, NoopChangeLog};
use crate::cluster::{Cluster, ClusterError};
use crate::config::{ConfigError, MayuConfig, ServerOptions};
use crate::provisioning::{
    build_first_stage_context, build_render_context, ProvisioningError, ProvisioningService,
};
use crate::renderer::{
    DocumentKind, RenderError, Renderer, SnippetCache, TemplateRenderer,
};

/// File the standalone discovery registry persists to, inside the cluster dir
pub const DISCOVERY_FILE: &str = "discovery.json";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cluster directory: {0}")]
    Cluster(#[from] ClusterError),

    #[error("etcd discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("deprecated discovery URL {url} does not belong to the configured registry {expected}")]
    DiscoveryMismatch { url: String, expected: String },

    #[error("templates: {0}")]
    Render(#[from] RenderError),

    #[error("dnsmasq: {0}")]
    Dnsmasq(#[from] DnsmasqError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

#[derive(Clone)]
pub struct AppState {
    pub provisioning: Arc<ProvisioningService>,
    pub discovery: Arc<dyn DiscoveryBackend>,
    pub options: Arc<ServerOptions>,
}

/// Routes served on the boot port
pub fn boot_app(state: AppState) -> Router {
    boot::boot_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Routes served on the API port
pub fn api_app(state: AppState) -> Router {
    api::admin_router()
        .merge(etcd::discovery_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn change_log(options: &ServerOptions) -> Arc<dyn ChangeLog> {
    if options.no_git {
        Arc::new(NoopChangeLog)
    } else {
        Arc::new(GitChangeLog)
    }
}

fn discovery_backend(options: &ServerOptions) -> Result<Arc<dyn DiscoveryBackend>, StartupError> {
    // external discovery with no etcd to proxy to still answers locally
    if options.standalone_discovery || options.etcd_endpoint.is_empty() {
        let path = options.cluster_dir.join(DISCOVERY_FILE);
        Ok(Arc::new(StandaloneDiscovery::open(path)?))
    } else {
        Ok(Arc::new(ProxyDiscovery::new(
            &options.etcd_endpoint,
            options.etcd_ca_file.as_deref(),
        )?))
    }
}

fn is_node_exists(e: &DiscoveryError) -> bool {
    e.error_code() == Some(mayu_discovery::types::ERROR_NODE_EXIST)
}

/// Make sure the cluster has a default etcd token, converting the
/// deprecated discovery URL if one is stored
async fn ensure_default_token(
    cluster: &Cluster,
    options: &ServerOptions,
    discovery: &dyn DiscoveryBackend,
) -> Result<(), StartupError> {
    let current = cluster.config();

    if !current.etcd_discovery_url.is_empty() {
        let url = current.etcd_discovery_url.trim_end_matches('/');
        let (base, token) = url.rsplit_once('/').unwrap_or(("", url));
        if options.use_internal_etcd_discovery {
            match discovery.create_cluster(token, options.etcd_quorum_size).await {
                Ok(()) => {}
                Err(e) if is_node_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            let expected = options.etcd_discovery.trim_end_matches('/');
            if base != expected {
                return Err(StartupError::DiscoveryMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                });
            }
        }
        let token = token.to_string();
        cluster.update_config("converted etcd discovery URL to token", |c| {
            c.default_etcd_cluster_token = token;
            c.etcd_discovery_url.clear();
        })?;
        info!(url = %url, "converted deprecated etcd discovery URL");
        return Ok(());
    }

    if !current.default_etcd_cluster_token.is_empty() {
        return Ok(());
    }

    let token = if options.use_internal_etcd_discovery {
        let token = generate_token();
        discovery
            .create_cluster(&token, options.etcd_quorum_size)
            .await?;
        token
    } else {
        let client = reqwest::Client::new();
        fetch_token(&client, &options.etcd_discovery, options.etcd_quorum_size).await?
    };
    cluster.update_config("generated default etcd cluster token", |c| {
        c.default_etcd_cluster_token = token.clone();
    })?;
    info!(token = %token, "generated default etcd cluster token");
    Ok(())
}

fn template_renderer(options: &ServerOptions) -> Result<TemplateRenderer, StartupError> {
    let snippets = SnippetCache::load(&options.template_snippets)?;
    Ok(TemplateRenderer::new(
        &options.ignition_config,
        &options.last_stage_config,
        &options.first_stage_script,
        &options.files_dir,
        snippets,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("received Ctrl+C, shutting down");
}

async fn serve(
    name: &'static str,
    addr: String,
    app: Router,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {} server to {}", name, addr))?;
    info!(server = name, addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
        .with_context(|| format!("{} server error", name))
}

/// Start mayu and serve until interrupted
pub async fn run(options: ServerOptions) -> anyhow::Result<()> {
    options.validate().map_err(StartupError::from)?;
    let config = MayuConfig::load(&options.config_file).map_err(StartupError::from)?;
    config.validate().map_err(StartupError::from)?;
    info!(
        config = %options.config_file.display(),
        version = %options.version,
        default_flatcar_version = %config.default_flatcar_version,
        "starting mayu"
    );

    let cluster = Arc::new(
        Cluster::open_or_create(&options.cluster_dir, change_log(&options))
            .map_err(StartupError::from)?,
    );
    let discovery = discovery_backend(&options)?;
    info!(backend = discovery.name(), "etcd discovery backend ready");
    ensure_default_token(&cluster, &options, discovery.as_ref()).await?;

    let renderer: Arc<dyn Renderer> = Arc::new(template_renderer(&options)?);
    let dnsmasq = Arc::new(DnsmasqSupervisor::new(options.dnsmasq.clone()));
    let options = Arc::new(options);
    let provisioning = Arc::new(ProvisioningService::new(
        cluster.clone(),
        config,
        options.clone(),
        dnsmasq.clone(),
        renderer,
    ));

    let reconciled = provisioning
        .reconcile_additional_addrs()
        .map_err(StartupError::from)?;
    if reconciled > 0 {
        info!(hosts = reconciled, "assigned missing extra NIC addresses");
    }

    dnsmasq
        .write_configuration(&provisioning.config().network, &provisioning.ignored_macs())
        .await
        .map_err(StartupError::from)?;
    dnsmasq
        .start_with_retry(&options.restart_policy())
        .await
        .map_err(StartupError::from)?;

    let state = AppState {
        provisioning,
        discovery: discovery.clone(),
        options: options.clone(),
    };

    // pending discovery watches would otherwise hold graceful shutdown open
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        discovery.shutdown();
        let _ = stop_tx.send(true);
    });

    let api = serve(
        "api",
        format!("{}:{}", options.bind_address, options.api_port),
        api_app(state.clone()),
        stop_rx.clone(),
    );
    let pxe = serve(
        "pxe",
        format!("{}:{}", options.bind_address, options.pxe_port),
        boot_app(state),
        stop_rx,
    );
    let result = tokio::try_join!(api, pxe);

    dnsmasq.stop().await;
    if let Err(ref e) = result {
        warn!(error = %e, "server stopped with an error");
    }
    result.map(|_| ())
}

/// Render the configured templates for a placeholder host, so template
/// errors show up before a machine boots
pub fn show_templates(options: &ServerOptions) -> anyhow::Result<String> {
    let config = MayuConfig::load(&options.config_file).map_err(StartupError::from)?;
    let renderer = template_renderer(options)?;

    let mut host = Host::new("0000000000");
    let start = config.network.primary_nic.ip_range.start;
    host.assign_internal_addr(if start.is_unspecified() {
        Ipv4Addr::new(10, 0, 0, 1)
    } else {
        start
    });
    host.flatcar_version = config.default_flatcar_version.clone();
    for nic in &config.network.extra_nics {
        host.additional_addrs
            .insert(nic.interface_name.clone(), nic.ip_range.start);
    }

    let ctx = build_render_context(&host, &config, options, "0123456789abcdef0123456789abcdef");
    let mut out = String::new();

    let kind = if options.use_ignition {
        DocumentKind::Ignition
    } else {
        DocumentKind::CloudConfig
    };
    out.push_str(&format!("# {} config\n", kind));
    out.push_str(
        &renderer
            .render(kind, &ctx)
            .with_context(|| format!("rendering {} config", kind))?,
    );
    out.push('\n');

    if !options.use_ignition {
        let first_stage = build_first_stage_context(&host, &config, options);
        out.push_str("# first stage script\n");
        out.push_str(
            &renderer
                .render_first_stage(&first_stage)
                .context("rendering first stage script")?,
        );
    }
    Ok(out)
}
