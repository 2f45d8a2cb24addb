use axum::response::{IntoResponse, Json};
use serde_json::json;

pub const AETHER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /status
pub async fn status_handler() -> impl IntoResponse {
    Json(json!({
        "name": "aether-gateway",
        "version": AETHER_VERSION,
    }))
}

/// GET /health
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "gateway": "ok",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!AETHER_VERSION.is_empty());
    }
}
