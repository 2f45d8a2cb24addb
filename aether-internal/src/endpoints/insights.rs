use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::insight::cooldown::CooldownDecision;
use crate::insight::fingerprint::{fingerprint, BehavioralSnapshot};
use crate::insight::{InsightCategory, InsightResult};
use crate::usage::middleware::{identity_from_headers, USER_ID_HEADER};

#[derive(Debug, Default, Deserialize)]
pub struct InsightRequestBody {
    /// Bypass the cooldown check. The generation is still recorded, so a
    /// forced regeneration re-arms the window.
    #[serde(default)]
    pub force: bool,

    #[serde(flatten)]
    pub data: BehavioralSnapshot,
}

#[derive(Debug, Serialize)]
struct InsightResponse {
    insight_id: Uuid,
    category: InsightCategory,
    #[serde(flatten)]
    result: InsightResult,
}

/// POST /v1/insights/{category}
///
/// Cooldown check, then generation, then recording, in that order: an
/// attempt that never produces a genuine insight leaves the cooldown state
/// untouched.
pub async fn generate_insight_handler(
    State(app): State<AppStateData>,
    Path(category): Path<String>,
    headers: HeaderMap,
    Json(body): Json<InsightRequestBody>,
) -> Result<Response, Error> {
    let category = InsightCategory::from_str(&category).map_err(|_| {
        Error::new(ErrorDetails::UnknownInsightCategory { category })
    })?;
    let identity = identity_from_headers(&headers).ok_or_else(|| {
        Error::new(ErrorDetails::Auth {
            message: format!("Missing `{USER_ID_HEADER}` header"),
        })
    })?;

    let candidate_fingerprint = fingerprint(category, &body.data);

    if body.force {
        app.insight_metrics.record_forced();
    } else {
        match app
            .cooldown_tracker
            .can_generate(&identity.user_id, category, &candidate_fingerprint)
            .await?
        {
            CooldownDecision::Allow => {}
            CooldownDecision::Blocked { remaining } => {
                app.insight_metrics.record_cooldown_block();
                let remaining_seconds = u64::try_from(remaining.num_seconds().max(1)).unwrap_or(1);
                let response_body = InsightResponse {
                    insight_id: Uuid::now_v7(),
                    category,
                    result: InsightResult::OnCooldown { remaining_seconds },
                };
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(response_body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&remaining_seconds.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
                return Ok(response);
            }
        }
    }

    let insight = app.insight_generator.generate(category, &body.data).await;

    let result = if insight.fallback {
        app.insight_metrics.record_fallback();
        InsightResult::Fallback {
            text: insight.text,
            confidence: insight.confidence,
        }
    } else {
        app.insight_metrics.record_generated();
        // Only genuine generations re-arm the window: after a fallback the
        // user may retry for a real insight without waiting out the cooldown.
        if let Err(e) = app
            .cooldown_tracker
            .record_generation(&identity.user_id, category, &candidate_fingerprint, Utc::now())
            .await
        {
            // The insight exists; losing the cooldown record is preferable
            // to discarding the generation.
            warn!(
                user_id = identity.user_id,
                category = %category,
                error = %e,
                "Failed to record insight generation"
            );
        }
        InsightResult::Generated {
            text: insight.text,
            confidence: insight.confidence,
        }
    };

    Ok(Json(InsightResponse {
        insight_id: Uuid::now_v7(),
        category,
        result,
    })
    .into_response())
}
