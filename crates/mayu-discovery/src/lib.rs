//! mayu etcd discovery
//!
//! Implements the legacy etcd discovery protocol so that unmodified etcd
//! members can assemble a cluster from a token URL such as
//! `http://10.0.1.254:4080/etcd/<token>`.
//!
//! Two backends implement [`DiscoveryBackend`]:
//!
//! - [`StandaloneDiscovery`] answers the protocol from its own store,
//!   optionally persisted to a JSON file, including `wait=true` watches
//! - [`ProxyDiscovery`] forwards every request to the keys API of a real
//!   etcd under `/v2/keys/_etcd/registry/`
//!
//! # Example
//!
//! ```
//! use mayu_discovery::{generate_token, is_valid_token};
//!
//! let token = generate_token();
//! assert_eq!(token.len(), 32);
//! assert!(is_valid_token(&token));
//! ```

pub mod backend;
pub mod error;
pub mod proxy;
pub mod standalone;
pub mod token;
pub mod types;

pub use backend::{is_watch, DiscoveryBackend, QueryParams, RegistryKey, Reply};
pub use error::{DiscoveryError, Result};
pub use proxy::{load_root_certificate, ProxyDiscovery};
pub use standalone::StandaloneDiscovery;
pub use token::{fetch_token, generate_token, is_valid_token};
pub use types::{EtcdError, EtcdNode, EtcdResponse};
