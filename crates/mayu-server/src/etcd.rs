//! etcd discovery endpoints
//!
//! Speaks the v2 discovery protocol over whichever [`DiscoveryBackend`] the
//! server was started with. Token paths that are not 32 lowercase hex
//! characters are not routed.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use mayu_discovery::{
    generate_token, is_valid_token, DiscoveryError, QueryParams, RegistryKey, Reply,
};
use tracing::{error, info};

use crate::AppState;

const DOCS_URL: &str = "https://github.com/giantswarm/mayu/blob/master/docs/etcd-discovery.md";
const ETCD_INDEX_HEADER: &str = "x-etcd-index";

pub fn discovery_router() -> Router<AppState> {
    Router::new()
        .route("/etcd", get(docs))
        .route("/etcd/new", put(new_cluster))
        .route("/etcd/{token}", get(get_cluster))
        .route("/etcd/{token}/_config/size", get(get_size).put(put_size))
        .route(
            "/etcd/{token}/{machine}",
            get(get_machine).put(put_machine).delete(delete_machine),
        )
}

async fn docs() -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, DOCS_URL)]).into_response()
}

fn form_value(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

fn parse_pairs(raw: &[u8]) -> QueryParams {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

async fn new_cluster(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let mut pairs = parse_pairs(query.unwrap_or_default().as_bytes());
    pairs.extend(parse_pairs(&body));

    let size = match form_value(&pairs, "size").filter(|s| !s.is_empty()) {
        Some(s) => match s.parse::<u32>() {
            Ok(size) => size,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        None => state.options.etcd_quorum_size,
    };

    let token = generate_token();
    if let Err(e) = state.discovery.create_cluster(&token, size).await {
        error!(token = %token, error = %e, "cannot store discovery token");
        return (
            StatusCode::BAD_REQUEST,
            format!("Unable to store token in etcd '{}'", e),
        )
            .into_response();
    }

    info!(token = %token, size, backend = state.discovery.name(), "new etcd cluster created");
    format!("{}/etcd/{}", state.provisioning.api_url(), token).into_response()
}

fn reply(result: Result<Reply, DiscoveryError>) -> Response {
    match result {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            let mut resp = (status, Json(reply.body)).into_response();
            if let Some(index) = reply.index {
                resp.headers_mut()
                    .insert(ETCD_INDEX_HEADER, HeaderValue::from(index));
            }
            resp
        }
        Err(DiscoveryError::Etcd { status, error }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            (status, Json(error)).into_response()
        }
        Err(DiscoveryError::Closed) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(e) => {
            error!(error = %e, "discovery request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error proxying request to etcd '{}'", e),
            )
                .into_response()
        }
    }
}

fn token_not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

/// `value` from the form body, or from the query as etcd also accepts
fn put_value(query: &QueryParams, body: &[u8]) -> String {
    form_value(&parse_pairs(body), "value")
        .or_else(|| form_value(query, "value"))
        .unwrap_or_default()
}

async fn get_key(state: &AppState, token: &str, key: RegistryKey, query: Option<String>) -> Response {
    if !is_valid_token(token) {
        return token_not_found();
    }
    let query = parse_pairs(query.unwrap_or_default().as_bytes());
    reply(state.discovery.get(token, &key, &query).await)
}

async fn put_key(
    state: &AppState,
    token: &str,
    key: RegistryKey,
    query: Option<String>,
    body: &[u8],
) -> Response {
    if !is_valid_token(token) {
        return token_not_found();
    }
    let query = parse_pairs(query.unwrap_or_default().as_bytes());
    let value = put_value(&query, body);
    reply(state.discovery.put(token, &key, &value, &query).await)
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(token): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    get_key(&state, &token, RegistryKey::Cluster, query).await
}

async fn get_size(
    State(state): State<AppState>,
    Path(token): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    get_key(&state, &token, RegistryKey::Size, query).await
}

async fn put_size(
    State(state): State<AppState>,
    Path(token): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    put_key(&state, &token, RegistryKey::Size, query, &body).await
}

async fn get_machine(
    State(state): State<AppState>,
    Path((token, machine)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    get_key(&state, &token, RegistryKey::Machine(machine), query).await
}

async fn put_machine(
    State(state): State<AppState>,
    Path((token, machine)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    put_key(&state, &token, RegistryKey::Machine(machine), query, &body).await
}

async fn delete_machine(
    State(state): State<AppState>,
    Path((token, machine)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    if !is_valid_token(&token) {
        return token_not_found();
    }
    let query = parse_pairs(query.unwrap_or_default().as_bytes());
    reply(
        state
            .discovery
            .delete(&token, &RegistryKey::Machine(machine), &query)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{body_string, TestEnv};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn new_token(env: &TestEnv, body: &str) -> String {
        let resp = env
            .admin_app()
            .oneshot(request("PUT", "/etcd/new", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let url = body_string(resp).await;
        let token = url
            .strip_prefix("http://10.0.1.254:4080/etcd/")
            .unwrap()
            .to_string();
        assert_eq!(token.len(), 32);
        token
    }

    #[tokio::test]
    async fn test_docs_redirect() {
        let env = TestEnv::new();
        let resp = env
            .admin_app()
            .oneshot(request("GET", "/etcd", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert!(resp.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .ends_with("etcd-discovery.md"));
    }

    #[tokio::test]
    async fn test_new_cluster_size() {
        let env = TestEnv::new();
        let token = new_token(&env, "size=5").await;
        let resp = env
            .admin_app()
            .oneshot(request("GET", &format!("/etcd/{}/_config/size", token), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["node"]["value"], "5");

        // the quorum size applies when none is given
        let token = new_token(&env, "").await;
        let resp = env
            .admin_app()
            .oneshot(request("GET", &format!("/etcd/{}/_config/size", token), ""))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["node"]["value"], "3");

        let resp = env
            .admin_app()
            .oneshot(request("PUT", "/etcd/new", "size=lots"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_member_registration() {
        let env = TestEnv::new();
        let token = new_token(&env, "size=3").await;
        let app = env.admin_app();
        let member = format!("/etcd/{}/m1", token);

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("{}?prevExist=false", member),
                "value=m1%3Dhttp%3A%2F%2F10.0.1.1%3A2380",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("{}?prevExist=false", member),
                "value=m1%3Dhttp%3A%2F%2F10.0.1.1%3A2380",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["errorCode"], 105);

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/etcd/{}", token), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["node"]["nodes"][0]["value"], "m1=http://10.0.1.1:2380");

        let resp = app
            .clone()
            .oneshot(request("DELETE", &member, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(request("GET", &member, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_watch_returns_next_member() {
        let env = TestEnv::new();
        let token = new_token(&env, "size=2").await;
        let app = env.admin_app();

        let resp = app
            .clone()
            .oneshot(request("PUT", &format!("/etcd/{}/m1", token), "value=m1%3Dhttp%3A%2F%2F10.0.1.1%3A2380"))
            .await
            .unwrap();
        let index: u64 = resp.headers()["x-etcd-index"].to_str().unwrap().parse().unwrap();

        let watch = tokio::spawn(app.clone().oneshot(request(
            "GET",
            &format!("/etcd/{}?wait=true&recursive=true&waitIndex={}", token, index + 1),
            "",
        )));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!watch.is_finished());

        let resp = app
            .oneshot(request("PUT", &format!("/etcd/{}/m2", token), "value=m2%3Dhttp%3A%2F%2F10.0.1.2%3A2380"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = tokio::time::timeout(std::time::Duration::from_secs(2), watch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-etcd-index"));
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["node"]["value"], "m2=http://10.0.1.2:2380");
        assert_eq!(body["node"]["modifiedIndex"], index + 1);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_tokens() {
        let env = TestEnv::new();
        let resp = env
            .admin_app()
            .oneshot(request("GET", "/etcd/0123456789abcdef0123456789abcdef", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["errorCode"], 100);

        let resp = env
            .admin_app()
            .oneshot(request("GET", "/etcd/NOT-A-TOKEN", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(resp).await, "");
    }
}
