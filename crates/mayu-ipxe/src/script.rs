//! iPXE script generation
//!
//! This module renders the boot scripts handed to iPXE. Placeholders such as
//! `${uuid}` and `${serial}` are expanded by iPXE on the booting machine.

use crate::error::{IpxeError, Result};
use tracing::debug;

/// Placeholder replaced by the first-stage kernel with the machine's serial
pub const SERIAL_PLACEHOLDER: &str = "__SERIAL__";

const DEBUG_KERNEL_PARAMS: &str = "systemd.journald.max_level_console=debug verbose log_buf_len=10M";

/// Boot mode for iPXE scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Single-phase install driven by an ignition document
    Ignition,
    /// Two-phase install driven by the first-stage script
    FirstStage,
}

/// Configuration for iPXE script generation
#[derive(Debug, Clone, Default)]
pub struct IpxeConfig {
    /// Base URL of the boot server (e.g., http://10.0.1.254:4081)
    pub base_url: String,

    /// Extra kernel parameters appended after the built-in ones
    pub kernel_params: Vec<String>,

    /// Console device (e.g., "ttyS0")
    pub console: Option<String>,

    /// Log in automatically on the console of the live system
    pub autologin: bool,

    /// Drop into a shell in the initramfs on failure
    pub rescue_shell: bool,

    /// Verbose kernel and journald logging
    pub verbose: bool,
}

impl IpxeConfig {
    /// Create a new config with base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            verbose: true,
            ..Default::default()
        }
    }

    /// Set console configuration
    pub fn with_console(mut self, console: impl Into<String>) -> Self {
        self.console = Some(console.into());
        self
    }

    /// Add kernel parameter
    pub fn with_kernel_param(mut self, param: impl Into<String>) -> Self {
        self.kernel_params.push(param.into());
        self
    }

    pub fn with_autologin(mut self, autologin: bool) -> Self {
        self.autologin = autologin;
        self
    }

    pub fn with_rescue_shell(mut self, rescue_shell: bool) -> Self {
        self.rescue_shell = rescue_shell;
        self
    }

    /// Enable verbose boot
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn base_url(&self) -> Result<&str> {
        let base = self.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(IpxeError::MissingConfig("base_url".to_string()));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(IpxeError::InvalidUrl(self.base_url.clone()));
        }
        Ok(base)
    }
}

/// iPXE script generator
#[derive(Debug, Clone)]
pub struct IpxeScriptGenerator {
    config: IpxeConfig,
}

impl IpxeScriptGenerator {
    /// Create a new script generator
    pub fn new(config: IpxeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IpxeConfig {
        &self.config
    }

    /// Generate an iPXE script for the given boot mode
    pub fn generate(&self, mode: BootMode) -> Result<String> {
        let base = self.config.base_url()?;
        debug!(mode = ?mode, base_url = %base, "generating iPXE script");

        let kernel = match mode {
            BootMode::Ignition => format!(
                "kernel {base}/images/vmlinuz flatcar.first_boot=1 initrd=initrd.cpio.gz \
                 flatcar.config.url={base}/ignition?uuid=${{uuid}}&serial=${{serial}}{params}",
                base = base,
                params = self.kernel_params_string(),
            ),
            BootMode::FirstStage => format!(
                "kernel {base}/images/vmlinuz maybe-install-coreos=stable mayu={base} \
                 next-script={base}/first-stage-script/{placeholder}{params}",
                base = base,
                placeholder = SERIAL_PLACEHOLDER,
                params = self.kernel_params_string(),
            ),
        };

        let mut script = self.script_header();
        script.push_str(&kernel);
        script.push('\n');
        script.push_str(&format!("initrd {}/images/initrd.cpio.gz\n", base));
        script.push_str("boot\n");
        Ok(script)
    }

    fn script_header(&self) -> String {
        "#!ipxe\ndhcp\n".to_string()
    }

    /// Kernel parameters with a leading space, or empty
    fn kernel_params_string(&self) -> String {
        let mut params = Vec::new();

        if self.config.verbose {
            params.push(DEBUG_KERNEL_PARAMS.to_string());
        }
        if let Some(ref console) = self.config.console {
            params.push(format!("console={}", console));
        }
        if self.config.autologin {
            params.push("flatcar.autologin".to_string());
        }
        if self.config.rescue_shell {
            params.push("rd.shell".to_string());
        }
        params.extend(self.config.kernel_params.iter().cloned());

        if params.is_empty() {
            String::new()
        } else {
            format!(" {}", params.join(" "))
        }
    }
}
