// mayu: PXE provisioning for bare-metal Flatcar clusters
mod ctl;

use clap::{ArgAction, Args, Parser, Subcommand};
use ctl::CtlArgs;
use color_eyre::eyre::{eyre, Result};
use mayu_server::config::ServerOptions;
use mayu_server::{run, show_templates};
use std::io::stderr;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bare-metal provisioning: PXE boot, host registry and etcd discovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Debug logging
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the boot and API servers (default action)
    Serve,
    /// Render the configured templates for a placeholder host and print them
    ShowTemplates,
    /// Talk to a running mayu through its admin API
    Ctl(CtlArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Cluster configuration file
    #[arg(long = "config", env = "MAYU_CONFIG", default_value = "/etc/mayu/config.yaml")]
    config_file: PathBuf,

    /// Directory holding cluster.json and one directory per host
    #[arg(long = "cluster-directory", default_value = "cluster")]
    cluster_dir: PathBuf,

    #[arg(long, default_value_t = 4080)]
    api_port: u16,

    #[arg(long, default_value_t = 4081)]
    pxe_port: u16,

    #[arg(long = "http-bind-address", default_value = "0.0.0.0")]
    bind_address: String,

    /// dnsmasq executable
    #[arg(long, default_value = "/usr/sbin/dnsmasq")]
    dnsmasq: PathBuf,

    #[arg(long, default_value = "./templates/dnsmasq_template.conf")]
    dnsmasq_template: PathBuf,

    /// Times to try spawning dnsmasq before giving up
    #[arg(long, default_value_t = 3)]
    dnsmasq_retries: u32,

    #[arg(long = "tftproot", default_value = "./tftproot")]
    tftp_root: PathBuf,

    #[arg(long, default_value = "./images")]
    images_cache_dir: PathBuf,

    #[arg(long, default_value = "./templates/ignition.yaml")]
    ignition_config: PathBuf,

    #[arg(long, default_value = "./templates/first_stage_script.sh")]
    first_stage_script: PathBuf,

    #[arg(long, default_value = "./templates/last_stage_cloudconfig.yaml")]
    last_stage_config: PathBuf,

    #[arg(long, default_value = "./templates/snippets/")]
    template_snippets: PathBuf,

    /// Files rendered and embedded into ignition documents
    #[arg(long, default_value = "./files")]
    files_dir: PathBuf,

    #[arg(long, default_value = "./static_html")]
    static_html_path: PathBuf,

    /// Boot machines straight into an ignition install
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_ignition: bool,

    /// Default size of new etcd discovery tokens
    #[arg(long, default_value_t = 3)]
    etcd_quorum_size: u32,

    #[arg(long, env = "MAYU_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    etcd_endpoint: String,

    /// External discovery registry, instead of the built-in one
    #[arg(long, default_value = "")]
    etcd_discovery: String,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_internal_etcd_discovery: bool,

    /// Keep discovery entries in the cluster directory instead of etcd
    #[arg(long, default_value_t = false)]
    standalone_discovery: bool,

    /// Don't record cluster directory changes in git
    #[arg(long, default_value_t = false)]
    no_git: bool,

    /// Must stay true; terminate TLS in a proxy in front of mayu
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    no_tls: bool,

    /// CA certificate for the etcd endpoint
    #[arg(long = "etcd-cafile")]
    etcd_ca_file: Option<PathBuf>,

    /// Extra kernel parameter for booting machines (repeatable)
    #[arg(long = "kernel-param")]
    kernel_params: Vec<String>,

    /// Kernel console on ttyS0
    #[arg(long, default_value_t = false)]
    console_tty: bool,

    #[arg(long, default_value_t = false)]
    flatcar_autologin: bool,

    /// Rescue shell in the initramfs on failure
    #[arg(long, default_value_t = false)]
    systemd_shell: bool,
}

impl ServeArgs {
    fn into_options(self) -> ServerOptions {
        let mut options = ServerOptions {
            config_file: self.config_file,
            cluster_dir: self.cluster_dir,
            bind_address: self.bind_address,
            api_port: self.api_port,
            pxe_port: self.pxe_port,
            dnsmasq_retries: self.dnsmasq_retries,
            images_cache_dir: self.images_cache_dir,
            ignition_config: self.ignition_config,
            first_stage_script: self.first_stage_script,
            last_stage_config: self.last_stage_config,
            template_snippets: self.template_snippets,
            files_dir: self.files_dir,
            static_html_path: self.static_html_path,
            use_ignition: self.use_ignition,
            etcd_quorum_size: self.etcd_quorum_size,
            etcd_endpoint: self.etcd_endpoint,
            etcd_discovery: self.etcd_discovery,
            use_internal_etcd_discovery: self.use_internal_etcd_discovery,
            standalone_discovery: self.standalone_discovery,
            no_git: self.no_git,
            no_tls: self.no_tls,
            etcd_ca_file: self.etcd_ca_file,
            kernel_params: self.kernel_params,
            console_tty: self.console_tty,
            flatcar_autologin: self.flatcar_autologin,
            systemd_shell: self.systemd_shell,
            ..Default::default()
        };
        options.dnsmasq.executable = self.dnsmasq;
        options.dnsmasq.template = self.dnsmasq_template;
        options.dnsmasq.tftp_root = self.tftp_root;
        options.dnsmasq.pxe_port = options.pxe_port;
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    let default_directives = format!(
        "mayu={level},mayu_server={level},mayu_dnsmasq={level},mayu_discovery={level},mayu_ipxe={level},tower_http={level},hyper=warn,reqwest=warn",
        level = level
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let options = cli.serve.into_options();

    match cli.command {
        Some(Commands::Ctl(args)) => ctl::run(args).await?,
        Some(Commands::ShowTemplates) => {
            debug!(?options, "parsed options");
            let rendered = show_templates(&options).map_err(|e| eyre!("{:#}", e))?;
            print!("{}", rendered);
        }
        Some(Commands::Serve) | None => {
            debug!(?options, "parsed options");
            if let Err(e) = run(options).await {
                error!("mayu failed: {:#}", e);
                return Err(eyre!("{:#}", e));
            }
        }
    }
    Ok(())
}
