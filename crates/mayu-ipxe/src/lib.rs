//! mayu iPXE Script Generation
//!
//! Machines PXE-boot into iPXE, which fetches `/ipxebootscript` from mayu.
//! The script loads the Flatcar PXE kernel and initrd and tells the kernel
//! where to fetch its install configuration.
//!
//! # Boot Modes
//!
//! - **Ignition**: single-phase install, the kernel fetches an ignition
//!   document keyed by the machine's `${uuid}` and `${serial}`
//! - **FirstStage**: two-phase install, the live system runs the
//!   first-stage script which pushes host facts and installs to disk
//!
//! # Example
//!
//! ```
//! use mayu_ipxe::{BootMode, IpxeConfig, IpxeScriptGenerator};
//!
//! let config = IpxeConfig::new("http://10.0.1.254:4081")
//!     .with_console("ttyS0")
//!     .with_autologin(true);
//!
//! let generator = IpxeScriptGenerator::new(config);
//! let script = generator.generate(BootMode::Ignition).unwrap();
//!
//! assert!(script.starts_with("#!ipxe"));
//! assert!(script.contains("flatcar.config.url=http://10.0.1.254:4081/ignition?uuid=${uuid}&serial=${serial}"));
//! ```

pub mod error;
pub mod script;

pub use error::*;
pub use script::*;
