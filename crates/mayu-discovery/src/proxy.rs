//! Proxy discovery backend
//!
//! Forwards discovery requests to the v2 keys API of an etcd cluster,
//! storing tokens under `/_etcd/registry/<token>` exactly like the public
//! discovery service does. Watches (`wait=true`) are forwarded without a
//! deadline since etcd holds them open until a member registers.

use async_trait::async_trait;
use reqwest::{Certificate, Client, Method, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{is_watch, DiscoveryBackend, QueryParams, RegistryKey, Reply};
use crate::error::{DiscoveryError, Result};
use crate::types::{EtcdError, EtcdResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Load a PEM CA bundle to trust for the etcd endpoint
pub fn load_root_certificate(path: &Path) -> Result<Certificate> {
    let certificate_error = |reason: String| DiscoveryError::Certificate {
        path: path.display().to_string(),
        reason,
    };
    let pem = std::fs::read(path).map_err(|e| certificate_error(e.to_string()))?;
    if !String::from_utf8_lossy(&pem).contains("-----BEGIN CERTIFICATE-----") {
        return Err(certificate_error("no PEM certificate found".to_string()));
    }
    Certificate::from_pem(&pem).map_err(|e| certificate_error(e.to_string()))
}

/// Discovery backed by a real etcd
pub struct ProxyDiscovery {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl ProxyDiscovery {
    /// `ca_file` is trusted in addition to the system roots
    pub fn new(endpoint: &str, ca_file: Option<&Path>) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| DiscoveryError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(DiscoveryError::InvalidUrl(endpoint.to_string()));
        }
        let mut builder = Client::builder();
        if let Some(path) = ca_file {
            builder = builder.add_root_certificate(load_root_certificate(path)?);
            info!(ca_file = %path.display(), "trusting CA bundle for etcd");
        }
        let client = builder
            .build()
            .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Deadline for requests other than watches
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `<endpoint>/v2/keys/_etcd/registry/<token>[/...]?<query>`
    fn key_url(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Url {
        let mut url = self.endpoint.clone();
        let path = format!("/v2/keys{}", key.path(token));
        url.set_path(&path);
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        url
    }

    /// Send once, and once more if the first attempt failed transiently.
    /// A watch has no deadline, so only a failed connect is retried.
    async fn send(&self, method: Method, url: Url, value: Option<&str>, watch: bool) -> Result<Reply> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut req = self.client.request(method.clone(), url.clone());
            if !watch {
                req = req.timeout(self.request_timeout);
            }
            if let Some(value) = value {
                req = req
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(
                        url::form_urlencoded::Serializer::new(String::new())
                            .append_pair("value", value)
                            .finish(),
                    );
            }
            debug!(method = %method, url = %url, attempt, watch, "proxying discovery request to etcd");

            match req.send().await {
                Ok(resp) if is_transient_status(resp.status()) && attempt == 1 => {
                    warn!(status = %resp.status(), url = %url, "etcd unavailable, retrying");
                }
                Ok(resp) => return decode(resp).await,
                Err(e) if (e.is_connect() || (e.is_timeout() && !watch)) && attempt == 1 => {
                    warn!(error = %e, url = %url, "etcd request failed, retrying");
                }
                Err(e) => return Err(DiscoveryError::Upstream(e.to_string())),
            }
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn decode(resp: reqwest::Response) -> Result<Reply> {
    let status = resp.status();
    let index = resp
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = resp
        .bytes()
        .await
        .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;

    if status.is_success() {
        let body: EtcdResponse = serde_json::from_slice(&body)
            .map_err(|e| DiscoveryError::Upstream(format!("unexpected etcd reply: {}", e)))?;
        return Ok(Reply {
            status: status.as_u16(),
            body,
            index,
        });
    }

    match serde_json::from_slice::<EtcdError>(&body) {
        Ok(error) => Err(DiscoveryError::Etcd {
            status: status.as_u16(),
            error,
        }),
        Err(_) => Err(DiscoveryError::Upstream(format!(
            "etcd answered {}: {}",
            status,
            String::from_utf8_lossy(&body).trim()
        ))),
    }
}

#[async_trait]
impl DiscoveryBackend for ProxyDiscovery {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn create_cluster(&self, token: &str, size: u32) -> Result<()> {
        let dir = vec![
            ("dir".to_string(), "true".to_string()),
            ("prevExist".to_string(), "false".to_string()),
        ];
        self.send(
            Method::PUT,
            self.key_url(token, &RegistryKey::Cluster, &dir),
            None,
            false,
        )
        .await?;

        let no_prev = vec![("prevExist".to_string(), "false".to_string())];
        self.send(
            Method::PUT,
            self.key_url(token, &RegistryKey::Size, &no_prev),
            Some(&size.to_string()),
            false,
        )
        .await?;
        Ok(())
    }

    async fn get(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply> {
        self.send(Method::GET, self.key_url(token, key, query), None, is_watch(query))
            .await
    }

    async fn put(
        &self,
        token: &str,
        key: &RegistryKey,
        value: &str,
        query: &QueryParams,
    ) -> Result<Reply> {
        self.send(Method::PUT, self.key_url(token, key, query), Some(value), false)
            .await
    }

    async fn delete(&self, token: &str, key: &RegistryKey, query: &QueryParams) -> Result<Reply> {
        self.send(Method::DELETE, self.key_url(token, key, query), None, false)
            .await
    }
}
