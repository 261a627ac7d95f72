//! dnsmasq process lifecycle

use mayu_common::Network;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{render_configuration, DnsmasqConfig, RestartPolicy};
use crate::error::{DnsmasqError, Result};

/// Handle on a spawned dnsmasq. Dropping `kill` terminates the process.
struct RunningDnsmasq {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Owns the external dnsmasq process
pub struct DnsmasqSupervisor {
    config: DnsmasqConfig,
    running: Mutex<Option<RunningDnsmasq>>,
}

impl DnsmasqSupervisor {
    pub fn new(config: DnsmasqConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DnsmasqConfig {
        &self.config
    }

    /// Spawn dnsmasq. A process that is already running is left alone.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        *running = Some(self.spawn()?);
        Ok(())
    }

    /// Spawn dnsmasq, retrying spawn failures with exponential backoff
    pub async fn start_with_retry(&self, policy: &RestartPolicy) -> Result<()> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.start().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_spawn_failure() && attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        component = "dnsmasq",
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "failed to start dnsmasq, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if attempts > 1 => {
                    return Err(DnsmasqError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Kill the running dnsmasq (if any) and spawn a new one
    pub async fn restart(&self) -> Result<()> {
        info!(component = "dnsmasq", "restarting dnsmasq");
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            terminate(previous).await;
        }
        *running = Some(self.spawn()?);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(previous) = self.running.lock().await.take() {
            terminate(previous).await;
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    /// Render the configuration file, then restart dnsmasq to pick it up
    pub async fn update_configuration(
        &self,
        network: &Network,
        ignored_hosts: &[String],
    ) -> Result<()> {
        info!(
            component = "dnsmasq",
            ignored = ignored_hosts.len(),
            "updating dnsmasq configuration"
        );
        self.write_configuration(network, ignored_hosts).await?;
        self.restart().await
    }

    /// Render the configuration file without touching the process
    pub async fn write_configuration(
        &self,
        network: &Network,
        ignored_hosts: &[String],
    ) -> Result<PathBuf> {
        let template = tokio::fs::read_to_string(&self.config.template)
            .await
            .map_err(|source| DnsmasqError::TemplateRead {
                path: self.config.template.clone(),
                source,
            })?;
        let rendered = render_configuration(&template, &self.config, network, ignored_hosts)?;

        let path = self.config.conf_file();
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|source| DnsmasqError::WriteConfig {
                path: path.clone(),
                source,
            })?;
        info!(component = "dnsmasq", path = %path.display(), "wrote dnsmasq configuration");
        Ok(path)
    }

    fn spawn(&self) -> Result<RunningDnsmasq> {
        info!(
            component = "dnsmasq",
            executable = %self.config.executable.display(),
            "starting dnsmasq"
        );

        let mut child = Command::new(&self.config.executable)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!(component = "dnsmasq", error = %source, "failed to start dnsmasq");
                DnsmasqError::SpawnFailed {
                    executable: self.config.executable.clone(),
                    source,
                }
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_output(stderr));
        }

        let pid = child.id();
        let (kill, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, kill_rx));
        Ok(RunningDnsmasq { pid, kill, monitor })
    }
}

/// Forward each output line of dnsmasq into the log
async fn pipe_output<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(component = "dnsmasq", "{}", line);
    }
}

/// Wait for the child to exit, or kill it when asked to
async fn monitor(mut child: Child, kill_rx: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => info!(component = "dnsmasq", %status, "dnsmasq exited"),
            Ok(status) => error!(component = "dnsmasq", %status, "dnsmasq exited unexpectedly"),
            Err(e) => error!(component = "dnsmasq", error = %e, "failed to wait for dnsmasq"),
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(component = "dnsmasq", error = %e, "failed to kill dnsmasq");
            }
        }
    }
}

async fn terminate(running: RunningDnsmasq) {
    // the monitor may already have seen the process exit
    let _ = running.kill.send(());
    if let Err(e) = running.monitor.await {
        warn!(component = "dnsmasq", error = %e, "dnsmasq monitor task failed");
    }
}
