//! Boot protocol served to PXE-booting machines

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{info, warn};

use crate::images;
use crate::provisioning::{choose_serial, HostFacts, ProvisioningError};
use crate::renderer::DocumentKind;
use crate::AppState;

pub fn boot_router() -> Router<AppState> {
    Router::new()
        .route("/", get(welcome))
        .route("/ipxebootscript", get(ipxe_boot_script))
        .route("/ignition", get(ignition))
        .route("/first-stage-script/{serial}", get(first_stage_script))
        .route("/final-cloud-config.yaml", post(final_cloud_config))
        .route("/final-ignition-config.json", post(final_ignition_config))
        .route("/hostinfo-helper", get(host_info_helper))
        .route("/images/{name}", get(images::image))
        .route("/images/{serial}/{name}", get(images::host_image))
}

async fn welcome(State(state): State<AppState>) -> String {
    format!("this is the iPXE server of mayu {}", state.options.version)
}

fn text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn ipxe_boot_script(State(state): State<AppState>) -> Response {
    match state.provisioning.boot_script() {
        Ok(script) => text(script),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct IgnitionQuery {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    serial: String,
}

async fn ignition(State(state): State<AppState>, Query(query): Query<IgnitionQuery>) -> Response {
    let Some(serial) = choose_serial(&query.serial, &query.uuid) else {
        warn!(uuid = %query.uuid, serial = %query.serial, "ignition request without serial");
        return ProvisioningError::NoSerial.into_response();
    };
    match state
        .provisioning
        .blocking(move |svc| svc.ignition(&serial))
        .await
    {
        Ok(doc) => ([(header::CONTENT_TYPE, "application/json")], doc).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn first_stage_script(State(state): State<AppState>, Path(serial): Path<String>) -> Response {
    match state
        .provisioning
        .blocking(move |svc| svc.first_stage_script(&serial))
        .await
    {
        Ok(script) => text(script),
        Err(e) => e.into_response(),
    }
}

fn parse_facts(body: &[u8]) -> Result<HostFacts, Response> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "undecodable host facts");
        (StatusCode::BAD_REQUEST, e.to_string()).into_response()
    })
}

async fn final_cloud_config(State(state): State<AppState>, body: Bytes) -> Response {
    let facts = match parse_facts(&body) {
        Ok(facts) => facts,
        Err(response) => return response,
    };
    info!(serial = %facts.serial, "generating a final stage cloud config");
    match state
        .provisioning
        .blocking(move |svc| svc.submit_facts(&facts, DocumentKind::CloudConfig))
        .await
    {
        Ok(doc) => text(doc),
        Err(e) => e.into_response(),
    }
}

async fn final_ignition_config(State(state): State<AppState>, body: Bytes) -> Response {
    let facts = match parse_facts(&body) {
        Ok(facts) => facts,
        Err(response) => return response,
    };
    info!(serial = %facts.serial, "generating a final ignition config");
    match state
        .provisioning
        .blocking(move |svc| svc.submit_facts(&facts, DocumentKind::Ignition))
        .await
    {
        Ok(doc) => ([(header::CONTENT_TYPE, "application/json")], doc).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn host_info_helper(State(state): State<AppState>) -> Response {
    let path = state.options.static_html_path.join("infopusher");
    images::serve_file(&path, "application/octet-stream").await
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{body_string, TestEnv};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_welcome() {
        let env = TestEnv::new();
        let resp = env.boot_app().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.starts_with("this is the iPXE server of mayu "));
    }

    #[tokio::test]
    async fn test_boot_script() {
        let env = TestEnv::new();
        let resp = env.boot_app().oneshot(get("/ipxebootscript")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.starts_with("#!ipxe\n"));
        assert!(body.contains("kernel http://10.0.1.254:4081/images/vmlinuz"));
    }

    #[tokio::test]
    async fn test_ignition_creates_host() {
        let env = TestEnv::new();
        let app = env.boot_app();

        let resp = app
            .clone()
            .oneshot(get("/ignition?uuid=u-1&serial=0123456789"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["hostname"], "10-0-1-1");
        assert_eq!(doc["state"], "installing");

        // the static KVM serial is replaced by the uuid
        assert!(env.cluster.host_by_serial("u-1").is_some());
        assert!(env.cluster.host_by_serial("0123456789").is_none());
    }

    #[tokio::test]
    async fn test_ignition_without_serial() {
        let env = TestEnv::new();
        let resp = env.boot_app().oneshot(get("/ignition")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(resp).await, "no serial ? :/");
    }

    #[tokio::test]
    async fn test_ignition_render_failure() {
        let env = TestEnv::new();
        std::fs::write(env.path().join("ignition.yaml"), "{{ broken").unwrap();
        let resp = env.boot_app().oneshot(get("/ignition?serial=abc")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(resp)
            .await
            .starts_with("generating ignition config failed: "));
    }

    #[tokio::test]
    async fn test_final_cloud_config() {
        let env = TestEnv::new();
        let facts = serde_json::json!({
            "Serial": "ABC123",
            "NetDevs": [{"MacAddress": "aa:bb:cc:dd:ee:01"}, {"MacAddress": "aa:bb:cc:dd:ee:02"}],
            "ConnectedNIC": "eth0",
            "IPMIAddress": "10.9.0.1",
        });
        let resp = env
            .boot_app()
            .oneshot(post_json("/final-cloud-config.yaml", facts))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("hostname: 10-0-1-1"));

        let host = env.cluster.host_by_mac("aa:bb:cc:dd:ee:02").unwrap();
        assert_eq!(host.serial, "abc123");
        assert_eq!(host.connected_nic, "eth0");
    }

    #[tokio::test]
    async fn test_final_config_bad_body() {
        let env = TestEnv::new();
        let req = Request::builder()
            .method("POST")
            .uri("/final-ignition-config.json")
            .body(Body::from("not json"))
            .unwrap();
        let resp = env.boot_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = env
            .boot_app()
            .oneshot(post_json("/final-ignition-config.json", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(resp).await, "no serial ? :/");
    }

    #[tokio::test]
    async fn test_first_stage_script() {
        let env = TestEnv::new();
        let resp = env
            .boot_app()
            .oneshot(get("/first-stage-script/ABC123"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("http://10.0.1.254:4080/admin/host/abc123/set_installed"));
        let host = env.cluster.host_by_serial("abc123").unwrap();
        assert!(body.contains(&host.machine_id));
    }

    #[tokio::test]
    async fn test_images() {
        let env = TestEnv::new();
        let resp = env.boot_app().oneshot(get("/images/vmlinuz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "6");
        assert_eq!(body_string(resp).await, "kernel");

        let resp = env
            .boot_app()
            .oneshot(get("/images/abc123/initrd.cpio.gz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "initrd");

        let resp = env
            .boot_app()
            .oneshot(get("/images/install_image.bin.bz2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = env.boot_app().oneshot(get("/images/secrets")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_host_info_helper() {
        let env = TestEnv::new();
        let resp = env.boot_app().oneshot(get("/hostinfo-helper")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "9");
        assert_eq!(body_string(resp).await, "#!/bin/sh");
    }
}
