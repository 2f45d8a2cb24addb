use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::str::FromStr;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::tier::ResourceKind;
use crate::usage::middleware::{identity_from_headers, RequestIdentity, USER_ID_HEADER};
use crate::usage::UsageDecision;

fn parse_kind(raw: &str) -> Result<ResourceKind, Error> {
    ResourceKind::from_str(raw).map_err(|_| {
        Error::new(ErrorDetails::UnknownResourceKind {
            kind: raw.to_string(),
        })
    })
}

fn require_identity(headers: &HeaderMap) -> Result<RequestIdentity, Error> {
    identity_from_headers(headers).ok_or_else(|| {
        Error::new(ErrorDetails::Auth {
            message: format!("Missing `{USER_ID_HEADER}` header"),
        })
    })
}

/// GET /v1/usage/{kind}
///
/// Reads the current usage snapshot. Rollover of a stale period happens as a
/// side effect of this read.
pub async fn get_usage_handler(
    State(app): State<AppStateData>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let kind = parse_kind(&kind)?;
    let identity = require_identity(&headers)?;

    let usage = app
        .usage_counter
        .get_usage_info(&identity.user_id, identity.tier, kind)
        .await?;

    let header_map = usage.to_headers(None).to_header_map();
    let mut response = Json(usage).into_response();
    response.headers_mut().extend(header_map);
    Ok(response)
}

/// POST /v1/usage/{kind}/consume
///
/// The check-and-consume boundary for services producing rate-limited
/// actions. Returns 200 with the updated snapshot when allowed, 429 with a
/// structured denial otherwise. Both carry quota headers.
pub async fn consume_usage_handler(
    State(app): State<AppStateData>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let kind = parse_kind(&kind)?;
    let identity = require_identity(&headers)?;

    let decision = app
        .usage_counter
        .try_consume(&identity.user_id, identity.tier, kind)
        .await;

    let (status, retry_after) = match &decision {
        UsageDecision::Allowed { .. } => (StatusCode::OK, None),
        UsageDecision::Denied { usage, .. } => {
            let now = chrono::Utc::now().timestamp();
            let reset = usage.to_headers(None).reset;
            (
                StatusCode::TOO_MANY_REQUESTS,
                Some(u64::try_from(reset.saturating_sub(now)).unwrap_or(0)),
            )
        }
    };

    let header_map = decision.usage().to_headers(retry_after).to_header_map();
    let mut response = (status, Json(decision)).into_response();
    response.headers_mut().extend(header_map);
    Ok(response)
}
