//! Administrative API
//!
//! All host mutations answer `202 Accepted` with an empty body. An unknown
//! serial is a `400` before the body is looked at.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use mayu_common::Host;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::{ConfigError, MayuConfig};
use crate::provisioning::{ProvisioningError, ProvisioningService};
use crate::AppState;

impl IntoResponse for ProvisioningError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProvisioningError::UnknownHost(_) | ProvisioningError::NoSerial => {
                StatusCode::BAD_REQUEST
            }
            ProvisioningError::Config(
                ConfigError::Read { .. } | ConfigError::Write { .. } | ConfigError::Encode(_),
            ) => StatusCode::INTERNAL_SERVER_ERROR,
            ProvisioningError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/admin/hosts", get(list_hosts))
        .route("/admin/mayu_config", get(get_config).put(put_config))
        .route("/admin/host/{serial}/boot_complete", put(boot_complete))
        .route("/admin/host/{serial}/set_installed", put(set_installed))
        .route("/admin/host/{serial}/set_metadata", put(set_metadata))
        .route("/admin/host/{serial}/mark_fresh", put(mark_fresh))
        .route("/admin/host/{serial}/mark_reconfigure", put(mark_reconfigure))
        .route("/admin/host/{serial}/set_provider_id", put(set_provider_id))
        .route("/admin/host/{serial}/set_ipmi_addr", put(set_ipmi_addr))
        .route("/admin/host/{serial}/set_cabinet", put(set_cabinet))
        .route("/admin/host/{serial}/set_state", put(set_state))
        .route(
            "/admin/host/{serial}/set_etcd_cluster_token",
            put(set_etcd_cluster_token),
        )
        .route("/admin/host/{serial}/override", put(override_property))
}

async fn list_hosts(State(state): State<AppState>) -> Response {
    match state
        .provisioning
        .blocking(|svc| Ok(svc.cluster().all_hosts()))
        .await
    {
        Ok(hosts) => Json(hosts).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_config(State(state): State<AppState>) -> Json<MayuConfig> {
    Json(state.provisioning.config().as_ref().clone())
}

async fn put_config(State(state): State<AppState>, body: Bytes) -> Response {
    let config: MayuConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unable to parse json data in mayu_config request: {}", e),
            )
                .into_response()
        }
    };
    match state.provisioning.replace_config(config).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

fn host_missing() -> Response {
    (StatusCode::BAD_REQUEST, "host doesn't exist").into_response()
}

fn accepted(result: Result<Host, ProvisioningError>) -> Response {
    match result {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Check the host exists, decode the body, then apply `f`, all on the
/// blocking pool since every step touches the cluster directory
async fn apply<T, F>(state: AppState, serial: String, action: &'static str, body: Bytes, f: F) -> Response
where
    T: DeserializeOwned + 'static,
    F: FnOnce(&ProvisioningService, &str, T) -> Result<Host, ProvisioningError> + Send + 'static,
{
    state
        .provisioning
        .blocking(move |svc| Ok(apply_blocking(svc, &serial, action, &body, f)))
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

fn apply_blocking<T, F>(svc: &ProvisioningService, serial: &str, action: &str, body: &[u8], f: F) -> Response
where
    T: DeserializeOwned,
    F: FnOnce(&ProvisioningService, &str, T) -> Result<Host, ProvisioningError>,
{
    if svc.cluster().host_by_serial(serial).is_none() {
        return host_missing();
    }
    let payload: T = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(serial, action, error = %e, "undecodable request body");
            return (
                StatusCode::BAD_REQUEST,
                format!("unable to parse json data in {} request", action),
            )
                .into_response();
        }
    };
    match f(svc, serial, payload) {
        Ok(host) => {
            info!(serial = %host.serial, action, state = %host.state, "host updated");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn boot_complete(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "boot_complete", body, |svc, serial, report: Host| {
        svc.boot_complete(serial, &report)
    })
    .await
}

async fn set_installed(State(state): State<AppState>, Path(serial): Path<String>) -> Response {
    accepted(state.provisioning.install_complete(&serial).await)
}

async fn set_metadata(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "set_metadata", body, |svc, serial, payload: Host| {
        svc.set_metadata(serial, payload.fleet_metadata)
    })
    .await
}

async fn mark_fresh(State(state): State<AppState>, Path(serial): Path<String>) -> Response {
    accepted(
        state
            .provisioning
            .blocking(move |svc| svc.mark_fresh(&serial))
            .await,
    )
}

async fn mark_reconfigure(State(state): State<AppState>, Path(serial): Path<String>) -> Response {
    accepted(
        state
            .provisioning
            .blocking(move |svc| svc.mark_reconfigure(&serial))
            .await,
    )
}

async fn set_provider_id(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "set_provider_id", body, |svc, serial, payload: Host| {
        svc.set_provider_id(serial, payload.provider_id)
    })
    .await
}

async fn set_ipmi_addr(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "set_ipmi_addr", body, |svc, serial, payload: Host| {
        svc.set_ipmi_addr(serial, payload.ipmi_addr)
    })
    .await
}

async fn set_cabinet(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "set_cabinet", body, |svc, serial, payload: Host| {
        let position = (payload.machine_on_cabinet != 0).then_some(payload.machine_on_cabinet);
        svc.set_cabinet(serial, payload.cabinet, position)
    })
    .await
}

async fn set_state(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "set_state", body, |svc, serial, payload: Host| {
        svc.set_state(serial, payload.state)
    })
    .await
}

async fn set_etcd_cluster_token(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(
        state,
        serial,
        "set_etcd_cluster_token",
        body,
        |svc, serial, payload: Host| svc.set_etcd_cluster_token(serial, payload.etcd_cluster_token),
    )
    .await
}

#[derive(Debug, Deserialize)]
struct Override {
    property: String,
    value: serde_json::Value,
}

async fn override_property(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    body: Bytes,
) -> Response {
    apply(state, serial, "override", body, |svc, serial, payload: Override| {
        svc.override_property(serial, &payload.property, payload.value)
    })
    .await
}
