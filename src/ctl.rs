// mayu ctl: admin API commands
use clap::{Args, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result, WrapErr};
use mayu_common::{Host, HostState};
use mayu_server::client::MayuClient;
use mayu_server::config::MayuConfig;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CtlArgs {
    /// Admin API of the mayu to talk to
    #[arg(long, env = "MAYU_URL", default_value = "http://127.0.0.1:4080")]
    mayu_url: String,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand, Debug)]
enum CtlCommand {
    /// List all hosts
    List {
        #[arg(long, default_value_t = false)]
        no_legend: bool,
    },
    /// Print one host
    Status { serial: String },
    /// Change a host field
    Set {
        serial: String,
        #[arg(value_enum)]
        key: HostKey,
        value: String,
    },
    /// Set a per-host template value; JSON values are kept as JSON
    Override {
        serial: String,
        property: String,
        value: String,
    },
    /// Reinstall on next boot, keeping disk data
    Reconfigure { serial: String },
    /// Reinstall on next boot, wiping the disks
    Fresh { serial: String },
    /// Report the end of an installation
    Installed { serial: String },
    /// Report a finished boot with the running versions
    BootComplete {
        serial: String,
        #[arg(long, default_value = "")]
        flatcar_version: String,
        #[arg(long, default_value = "")]
        etcd_version: String,
        #[arg(long, default_value = "")]
        docker_version: String,
    },
    /// Print or replace the cluster configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the configuration as YAML
    Get,
    /// Replace the configuration with a YAML file
    Set { file: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum HostKey {
    /// Comma separated fleet metadata
    Metadata,
    Providerid,
    Ipmiaddr,
    /// `<cabinet>` or `<cabinet>:<position>`
    Cabinet,
    State,
    Etcdtoken,
}

pub async fn run(args: CtlArgs) -> Result<()> {
    let client = MayuClient::new(&args.mayu_url)?;

    match args.command {
        CtlCommand::List { no_legend } => {
            let hosts = client.list().await?;
            print!("{}", host_table(&hosts, !no_legend));
        }
        CtlCommand::Status { serial } => {
            let host = client.status(&serial).await?;
            print!("{}", serde_yaml::to_string(&host)?);
        }
        CtlCommand::Set { serial, key, value } => set(&client, &serial, key, &value).await?,
        CtlCommand::Override {
            serial,
            property,
            value,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            client.override_property(&serial, &property, value).await?;
        }
        CtlCommand::Reconfigure { serial } => client.mark_reconfigure(&serial).await?,
        CtlCommand::Fresh { serial } => client.mark_fresh(&serial).await?,
        CtlCommand::Installed { serial } => client.set_installed(&serial).await?,
        CtlCommand::BootComplete {
            serial,
            flatcar_version,
            etcd_version,
            docker_version,
        } => {
            let report = Host {
                flatcar_version,
                etcd_version,
                docker_version,
                ..Default::default()
            };
            client.boot_complete(&serial, &report).await?;
        }
        CtlCommand::Config { command } => match command {
            ConfigCommand::Get => {
                let config = client.config().await?;
                print!("{}", serde_yaml::to_string(&config)?);
            }
            ConfigCommand::Set { file } => {
                let config = MayuConfig::load(&file)
                    .wrap_err_with(|| format!("reading {}", file.display()))?;
                client.set_config(&config).await?;
            }
        },
    }
    Ok(())
}

async fn set(client: &MayuClient, serial: &str, key: HostKey, value: &str) -> Result<()> {
    match key {
        HostKey::Metadata => {
            let metadata = split_list(value);
            client.set_metadata(serial, &metadata).await?;
        }
        HostKey::Providerid => client.set_provider_id(serial, value).await?,
        HostKey::Ipmiaddr => {
            let addr: Ipv4Addr = value
                .parse()
                .wrap_err_with(|| format!("invalid IPMI address {}", value))?;
            client.set_ipmi_addr(serial, addr).await?;
        }
        HostKey::Cabinet => {
            let (cabinet, position) = parse_cabinet(value)?;
            client.set_cabinet(serial, cabinet, position).await?;
        }
        HostKey::State => {
            let state: HostState = value.parse().map_err(|e| eyre!("{}", e))?;
            client.set_state(serial, state).await?;
        }
        HostKey::Etcdtoken => client.set_etcd_cluster_token(serial, value).await?,
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `4` or `4:2`; a missing position is sent as 0 and leaves it unchanged
fn parse_cabinet(value: &str) -> Result<(u32, u32)> {
    let (cabinet, position) = match value.split_once(':') {
        Some((cabinet, position)) => (cabinet, Some(position)),
        None => (value, None),
    };
    let cabinet = cabinet
        .trim()
        .parse::<u32>()
        .wrap_err_with(|| format!("invalid cabinet {}", value))?;
    let position = match position {
        Some(p) => p
            .trim()
            .parse::<u32>()
            .wrap_err_with(|| format!("invalid cabinet position {}", value))?,
        None => 0,
    };
    Ok((cabinet, position))
}

fn host_table(hosts: &[Host], legend: bool) -> String {
    let mut rows: Vec<[String; 7]> = Vec::with_capacity(hosts.len() + 1);
    if legend {
        rows.push(
            ["SERIAL", "PROFILE", "IP", "IPMI", "STATE", "FLATCAR", "LASTBOOT"].map(String::from),
        );
    }
    for host in hosts {
        rows.push([
            host.serial.clone(),
            host.profile.clone(),
            host.internal_addr.map(|a| a.to_string()).unwrap_or_default(),
            host.ipmi_addr.map(|a| a.to_string()).unwrap_or_default(),
            host.state.to_string(),
            host.flatcar_version.clone(),
            host.last_boot
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
        ]);
    }

    let mut widths = [0usize; 7];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}
