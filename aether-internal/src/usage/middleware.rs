use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::tier::{ResourceKind, Tier};
use crate::usage::counter::UsageCounter;
use crate::usage::{DenialReason, UsageDecision, UsageInfo};

pub const USER_ID_HEADER: &str = "x-aether-user-id";
pub const TIER_HEADER: &str = "x-aether-tier";

/// Identity resolved by the upstream authentication layer.
///
/// The gateway trusts these headers; verifying them is the auth proxy's job.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub user_id: String,
    pub tier: Tier,
}

pub fn identity_from_headers(headers: &axum::http::HeaderMap) -> Option<RequestIdentity> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    // Absent tier header means the most restrictive tier, same as an
    // unrecognized tier name
    let tier = headers
        .get(TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Tier::parse_lossy)
        .unwrap_or(Tier::Standard);

    Some(RequestIdentity { user_id, tier })
}

pub fn extract_identity(request: &Request) -> Result<RequestIdentity, QuotaError> {
    identity_from_headers(request.headers()).ok_or(QuotaError::IdentityMissing)
}

/// Quota-gating middleware.
///
/// Consumes one unit of the configured resource kind before the inner
/// handler runs, and stamps quota headers on the response. A denial
/// short-circuits with a structured 429.
pub async fn quota_middleware(
    State((counter, kind)): State<(Arc<UsageCounter>, ResourceKind)>,
    request: Request,
    next: Next,
) -> Result<Response, QuotaError> {
    let identity = extract_identity(&request)?;

    match counter
        .try_consume(&identity.user_id, identity.tier, kind)
        .await
    {
        UsageDecision::Allowed { usage } => {
            debug!(
                user_id = identity.user_id,
                kind = %kind,
                remaining = usage.remaining,
                "Quota check passed"
            );

            let mut response = next.run(request).await;
            response
                .headers_mut()
                .extend(usage.to_headers(None).to_header_map());
            Ok(response)
        }
        UsageDecision::Denied { reason, usage } => {
            warn!(
                user_id = identity.user_id,
                kind = %kind,
                reason = reason.as_str(),
                "Quota exceeded"
            );
            Err(QuotaError::Exceeded { reason, usage })
        }
    }
}

/// Quota gating specific errors
#[derive(Debug)]
pub enum QuotaError {
    Exceeded {
        reason: DenialReason,
        usage: UsageInfo,
    },
    IdentityMissing,
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        match self {
            QuotaError::Exceeded { reason, usage } => {
                let retry_after = retry_after_seconds(&usage);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    serde_json::json!({
                        "error": {
                            "message": denial_message(reason, &usage),
                            "type": "rate_limit_error",
                            "code": reason.as_str(),
                        },
                        "usage": usage,
                    })
                    .to_string(),
                )
                    .into_response();

                let header_map = usage.to_headers(Some(retry_after)).to_header_map();
                response.headers_mut().extend(header_map);

                response
            }
            QuotaError::IdentityMissing => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({
                    "error": {
                        "message": format!(
                            "No user identity provided. The `{USER_ID_HEADER}` header must be set by the authentication layer."
                        ),
                        "type": "authentication_error",
                        "code": "identity_missing",
                    }
                })
                .to_string(),
            )
                .into_response(),
        }
    }
}

fn denial_message(reason: DenialReason, usage: &UsageInfo) -> String {
    match reason {
        DenialReason::PeriodLimitReached => match usage.limit {
            Some(limit) => format!(
                "You have used all {limit} {} credits for this period. The quota resets on {}.",
                usage.kind, usage.period_end
            ),
            None => "Quota exhausted for this period".to_string(),
        },
        DenialReason::UsageUnavailable => {
            "Usage state is temporarily unavailable; request denied".to_string()
        }
    }
}

fn retry_after_seconds(usage: &UsageInfo) -> u64 {
    let now = chrono::Utc::now().timestamp();
    u64::try_from(usage.to_headers(None).reset.saturating_sub(now)).unwrap_or(0)
}
