//! Discovery tokens

use rand::RngCore;
use tracing::info;

use crate::error::{DiscoveryError, Result};

/// 16 random bytes, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Tokens are exactly 32 lowercase hex characters
pub fn is_valid_token(token: &str) -> bool {
    token.len() == 32 && token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Ask an external discovery service (`<url>/new`) for a fresh token
pub async fn fetch_token(client: &reqwest::Client, discovery_url: &str, size: u32) -> Result<String> {
    let base = discovery_url.trim_end_matches('/');
    let resp = client
        .put(format!("{}/new", base))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(format!("size={}", size))
        .send()
        .await
        .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;

    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;
    if !status.is_success() {
        return Err(DiscoveryError::Upstream(format!(
            "{} answered {}: {}",
            base,
            status,
            body.trim()
        )));
    }

    let token = body
        .trim()
        .trim_start_matches(&format!("{}/", base))
        .to_string();
    info!(discovery_url = %base, token = %token, "fetched etcd discovery token");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::put, Router};

    #[test]
    fn test_generated_tokens() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(is_valid_token(&token));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_token_validation() {
        assert!(is_valid_token("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_token("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_token("0123456789abcdef"));
        assert!(!is_valid_token("0123456789abcdef0123456789abcdeg"));
    }

    #[tokio::test]
    async fn test_fetch_token_strips_base_url() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{}", addr);
        let reply = format!("{}/0123456789abcdef0123456789abcdef", base);
        let app = Router::new().route(
            "/new",
            put(move || {
                let reply = reply.clone();
                async move { reply }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let token = fetch_token(&reqwest::Client::new(), &base, 3).await.unwrap();
        assert_eq!(token, "0123456789abcdef0123456789abcdef");
    }
}
