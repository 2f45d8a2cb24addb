use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Fallback handler for unmatched routes
pub async fn handle_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "message": "Route not found",
                "type": "invalid_request_error",
                "code": "route_not_found",
            }
        })),
    )
}
