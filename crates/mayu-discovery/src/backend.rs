//! The discovery backend interface shared by the standalone and proxy modes

use async_trait::async_trait;

use crate::error::{DiscoveryError, Result};
use crate::types::{EtcdError, EtcdResponse};

/// Query string of the incoming request, in order
pub type QueryParams = Vec<(String, String)>;

/// Key below a token's registry directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryKey {
    /// The token directory itself
    Cluster,
    /// `_config/size`
    Size,
    /// A registered member
    Machine(String),
}

impl RegistryKey {
    /// Key path as etcd reports it
    pub fn path(&self, token: &str) -> String {
        match self {
            RegistryKey::Cluster => format!("/_etcd/registry/{}", token),
            RegistryKey::Size => format!("/_etcd/registry/{}/_config/size", token),
            RegistryKey::Machine(name) => format!("/_etcd/registry/{}/{}", token, name),
        }
    }
}

/// A successful reply, with the HTTP status to answer with
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: EtcdResponse,
    /// Registry index at the time of the reply, sent as `X-Etcd-Index`
    pub index: Option<u64>,
}

impl Reply {
    pub fn ok(body: EtcdResponse) -> Self {
        Self {
            status: 200,
            body,
            index: None,
        }
    }

    pub fn created(body: EtcdResponse) -> Self {
        Self {
            status: 201,
            body,
            index: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }
}

/// Look up a flag such as `prevExist` in the query
pub fn query_flag(query: &QueryParams, name: &str) -> Option<bool> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| v.parse().ok())
}

/// Look up a numeric parameter such as `waitIndex`
pub fn query_index(query: &QueryParams, name: &str) -> Result<Option<u64>> {
    match query.iter().find(|(k, _)| k == name) {
        None => Ok(None),
        Some((_, v)) => v.parse().map(Some).map_err(|_| {
            DiscoveryError::etcd(EtcdError::invalid_field(format!(
                "{} {:?} is not a number",
                name, v
            )))
        }),
    }
}

/// A `wait=true` read, held open until the key changes
pub fn is_watch(query: &QueryParams) -> bool {
    query_flag(query, "wait") == Some(true)
}

/// Storage for discovery tokens
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Register a new token with the expected cluster size
    async fn create_cluster(&self, token: &str, size: u32) -> Result<()>;

    async fn get(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply>;

    async fn put(
        &self,
        token: &str,
        key: &RegistryKey,
        value: &str,
        query: &QueryParams,
    ) -> Result<Reply>;

    async fn delete(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply>;

    /// Release pending watches so the server can stop
    fn shutdown(&self) {}
}
