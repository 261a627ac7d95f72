//! dnsmasq supervisor configuration and config file rendering

use mayu_common::Network;
use minijinja::{context, Environment};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DnsmasqError, Result};

/// Settings for the supervised dnsmasq process
#[derive(Debug, Clone, Serialize)]
pub struct DnsmasqConfig {
    /// Path of the dnsmasq binary
    pub executable: PathBuf,
    /// Template the configuration file is rendered from
    pub template: PathBuf,
    /// Directory served over TFTP (iPXE binaries)
    pub tftp_root: PathBuf,
    /// Port of the boot HTTP server
    pub pxe_port: u16,
    /// `<base>.conf` and `<base>.lease` are derived from this
    pub base_file: PathBuf,
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/usr/sbin/dnsmasq"),
            template: PathBuf::from("./templates/dnsmasq_template.conf"),
            tftp_root: PathBuf::from("./tftproot"),
            pxe_port: 4081,
            base_file: PathBuf::from("/tmp/dnsmasq.mayu"),
        }
    }
}

impl DnsmasqConfig {
    pub fn conf_file(&self) -> PathBuf {
        with_suffix(&self.base_file, ".conf")
    }

    pub fn lease_file(&self) -> PathBuf {
        with_suffix(&self.base_file, ".lease")
    }

    /// Foreground, no daemonizing, logging to stderr
    pub fn args(&self) -> Vec<String> {
        vec![
            "-k".to_string(),
            "-d".to_string(),
            format!("--conf-file={}", self.conf_file().display()),
            format!("--dhcp-leasefile={}", self.lease_file().display()),
        ]
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// How often and how patiently dnsmasq is (re)spawned
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Fail on the first spawn error
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`, doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Render the dnsmasq configuration.
///
/// The template sees `network`, `global` (this config) and `ignored_hosts`,
/// the MAC addresses that must not be offered PXE.
pub fn render_configuration(
    template: &str,
    config: &DnsmasqConfig,
    network: &Network,
    ignored_hosts: &[String],
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("dnsmasq", template)
        .map_err(|e| DnsmasqError::Template(e.to_string()))?;
    let tmpl = env
        .get_template("dnsmasq")
        .map_err(|e| DnsmasqError::Template(e.to_string()))?;
    tmpl.render(context! {
        network => network,
        global => config,
        ignored_hosts => ignored_hosts,
    })
    .map_err(|e| DnsmasqError::Template(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mayu_common::IpRange;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_args() {
        let config = DnsmasqConfig::default();
        assert_eq!(
            config.args(),
            vec![
                "-k",
                "-d",
                "--conf-file=/tmp/dnsmasq.mayu.conf",
                "--dhcp-leasefile=/tmp/dnsmasq.mayu.lease",
            ]
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
    }

    #[test]
    fn test_render_ignore_list() {
        let mut network = Network::default();
        network.bind_addr = "10.0.1.254".to_string();
        network.pxe.pxe_interface.ip_range =
            IpRange::new(Ipv4Addr::new(10, 0, 3, 1), Ipv4Addr::new(10, 0, 3, 20));

        let template = "dhcp-range={{ network.pxe.pxe_interface.ip_range.start }},{{ network.pxe.pxe_interface.ip_range.end }}\n\
                        dhcp-boot=http://{{ network.bind_addr }}:{{ global.pxe_port }}/ipxebootscript\n\
                        {% for mac in ignored_hosts %}dhcp-host={{ mac }},ignore\n{% endfor %}";
        let rendered = render_configuration(
            template,
            &DnsmasqConfig::default(),
            &network,
            &["00:11:22:33:44:55".to_string()],
        )
        .unwrap();

        assert!(rendered.contains("dhcp-range=10.0.3.1,10.0.3.20"));
        assert!(rendered.contains("dhcp-boot=http://10.0.1.254:4081/ipxebootscript"));
        assert!(rendered.contains("dhcp-host=00:11:22:33:44:55,ignore"));
    }

    #[test]
    fn test_render_bad_template() {
        let err = render_configuration(
            "{% for %}",
            &DnsmasqConfig::default(),
            &Network::default(),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DnsmasqError::Template(_)));
    }
}
