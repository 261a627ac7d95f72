//! Typed client for the admin API
//!
//! Used by `mayu ctl` to inspect and steer a running mayu, and by installed
//! machines to report `boot_complete`.

use mayu_common::{Host, HostState};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::MayuConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid mayu URL: {0}")]
    InvalidUrl(String),

    #[error("request to mayu failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("mayu answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("cannot encode or decode mayu payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("host {0} not found")]
    HostNotFound(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct MayuClient {
    client: Client,
    base: Url,
}

impl MayuClient {
    /// `base_url` is the API server, e.g. `http://10.0.1.254:4080`
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.url(segments);
        debug!(url = %url, "mayu admin request");
        let resp = Self::check(self.client.get(url).send().await?).await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    async fn put_json<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<()> {
        let url = self.url(segments);
        debug!(url = %url, "mayu admin request");
        let req = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn put_empty(&self, segments: &[&str]) -> Result<()> {
        let url = self.url(segments);
        debug!(url = %url, "mayu admin request");
        Self::check(self.client.put(url).send().await?).await?;
        Ok(())
    }

    async fn put_host<B: Serialize + ?Sized>(&self, serial: &str, action: &str, body: &B) -> Result<()> {
        self.put_json(&["admin", "host", serial, action], body).await
    }

    pub async fn list(&self) -> Result<Vec<Host>> {
        self.get_json(&["admin", "hosts"]).await
    }

    pub async fn status(&self, serial: &str) -> Result<Host> {
        self.list()
            .await?
            .into_iter()
            .find(|h| h.serial.eq_ignore_ascii_case(serial))
            .ok_or_else(|| ClientError::HostNotFound(serial.to_string()))
    }

    pub async fn set_metadata(&self, serial: &str, metadata: &[String]) -> Result<()> {
        self.put_host(serial, "set_metadata", &json!({ "FleetMetadata": metadata }))
            .await
    }

    pub async fn set_provider_id(&self, serial: &str, provider_id: &str) -> Result<()> {
        self.put_host(serial, "set_provider_id", &json!({ "ProviderId": provider_id }))
            .await
    }

    pub async fn set_ipmi_addr(&self, serial: &str, addr: Ipv4Addr) -> Result<()> {
        self.put_host(serial, "set_ipmi_addr", &json!({ "IPMIAddr": addr }))
            .await
    }

    /// Position 0 leaves the machine's position in the cabinet unchanged
    pub async fn set_cabinet(&self, serial: &str, cabinet: u32, position: u32) -> Result<()> {
        self.put_host(
            serial,
            "set_cabinet",
            &json!({ "Cabinet": cabinet, "MachineOnCabinet": position }),
        )
        .await
    }

    pub async fn set_state(&self, serial: &str, state: HostState) -> Result<()> {
        self.put_host(serial, "set_state", &json!({ "State": state }))
            .await
    }

    pub async fn set_etcd_cluster_token(&self, serial: &str, token: &str) -> Result<()> {
        self.put_host(serial, "set_etcd_cluster_token", &json!({ "EtcdClusterToken": token }))
            .await
    }

    pub async fn override_property(
        &self,
        serial: &str,
        property: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.put_host(serial, "override", &json!({ "property": property, "value": value }))
            .await
    }

    /// Report a finished boot, with the versions in `report`
    pub async fn boot_complete(&self, serial: &str, report: &Host) -> Result<()> {
        self.put_host(serial, "boot_complete", report).await
    }

    pub async fn set_installed(&self, serial: &str) -> Result<()> {
        self.put_empty(&["admin", "host", serial, "set_installed"]).await
    }

    pub async fn mark_fresh(&self, serial: &str) -> Result<()> {
        self.put_empty(&["admin", "host", serial, "mark_fresh"]).await
    }

    pub async fn mark_reconfigure(&self, serial: &str) -> Result<()> {
        self.put_empty(&["admin", "host", serial, "mark_reconfigure"])
            .await
    }

    pub async fn config(&self) -> Result<MayuConfig> {
        self.get_json(&["admin", "mayu_config"]).await
    }

    pub async fn set_config(&self, config: &MayuConfig) -> Result<()> {
        self.put_json(&["admin", "mayu_config"], config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestEnv;

    async fn serve(env: &TestEnv) -> MayuClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::api_app(env.app_state());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        MayuClient::new(&format!("http://{}", addr)).unwrap()
    }

    #[test]
    fn test_urls() {
        let client = MayuClient::new("http://10.0.1.254:4080").unwrap();
        assert_eq!(
            client.url(&["admin", "host", "abc 1", "set_state"]).as_str(),
            "http://10.0.1.254:4080/admin/host/abc%201/set_state"
        );
        let client = MayuClient::new("http://10.0.1.254:4080/mayu/").unwrap();
        assert_eq!(
            client.url(&["admin", "hosts"]).as_str(),
            "http://10.0.1.254:4080/mayu/admin/hosts"
        );
        assert!(matches!(
            MayuClient::new("mailto:ops@example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_host_setters() {
        let env = TestEnv::new();
        env.cluster.create_host("abc123").unwrap();
        let client = serve(&env).await;

        client.set_provider_id("abc123", "rack-7").await.unwrap();
        client
            .set_ipmi_addr("abc123", Ipv4Addr::new(10, 9, 0, 7))
            .await
            .unwrap();
        client
            .set_metadata("abc123", &["role=db".to_string()])
            .await
            .unwrap();
        client.set_cabinet("abc123", 4, 2).await.unwrap();
        client.set_etcd_cluster_token("abc123", "tok").await.unwrap();
        client
            .override_property("abc123", "docker_version", json!("1.12.6"))
            .await
            .unwrap();
        client.set_state("abc123", HostState::Running).await.unwrap();

        let host = client.status("ABC123").await.unwrap();
        assert_eq!(host.provider_id, "rack-7");
        assert_eq!(host.ipmi_addr, Some(Ipv4Addr::new(10, 9, 0, 7)));
        assert_eq!(host.fleet_metadata, vec!["role=db".to_string()]);
        assert_eq!((host.cabinet, host.machine_on_cabinet), (4, 2));
        assert_eq!(host.etcd_cluster_token, "tok");
        assert_eq!(host.overrides["docker_version"], "1.12.6");
        assert_eq!(host.state, HostState::Configured);
    }

    #[tokio::test]
    async fn test_lifecycle_calls() {
        let env = TestEnv::new();
        env.cluster.create_host("abc123").unwrap();
        env.cluster.create_host("def456").unwrap();
        let client = serve(&env).await;

        let serials: Vec<String> = client.list().await.unwrap().into_iter().map(|h| h.serial).collect();
        assert_eq!(serials, vec!["abc123", "def456"]);

        client.mark_reconfigure("abc123").await.unwrap();
        assert!(client.status("abc123").await.unwrap().keep_disk_data);
        client.mark_fresh("abc123").await.unwrap();
        assert!(!client.status("abc123").await.unwrap().keep_disk_data);

        client.set_installed("abc123").await.unwrap();
        assert_eq!(client.status("abc123").await.unwrap().state, HostState::Installed);

        let report = Host {
            flatcar_version: "1632.3.0".to_string(),
            etcd_version: "3.3.1".to_string(),
            ..Default::default()
        };
        client.boot_complete("abc123", &report).await.unwrap();
        let host = client.status("abc123").await.unwrap();
        assert_eq!(host.state, HostState::Running);
        assert_eq!(host.etcd_version, "3.3.1");
    }

    #[tokio::test]
    async fn test_errors() {
        let env = TestEnv::new();
        let client = serve(&env).await;

        match client.set_provider_id("nope", "x").await.unwrap_err() {
            ClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "host doesn't exist");
            }
            other => panic!("expected status error, got {:?}", other),
        }
        assert!(matches!(
            client.status("nope").await,
            Err(ClientError::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_config() {
        let env = TestEnv::new();
        let client = serve(&env).await;

        let mut config = client.config().await.unwrap();
        assert_eq!(config.default_flatcar_version, "1409.7.0");
        assert_eq!(config.profiles.len(), 2);

        config.default_flatcar_version = "1632.3.0".to_string();
        client.set_config(&config).await.unwrap();
        assert_eq!(
            client.config().await.unwrap().default_flatcar_version,
            "1632.3.0"
        );

        config.default_flatcar_version.clear();
        assert!(matches!(
            client.set_config(&config).await,
            Err(ClientError::Status { .. })
        ));
    }
}
