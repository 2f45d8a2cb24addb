use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use url::Url;

use crate::config_parser::GeneratorConfig;
use crate::error::{Error, ErrorDetails};
use crate::insight::fingerprint::BehavioralSnapshot;
use crate::insight::InsightCategory;

const PROVIDER_TYPE: &str = "openrouter";

/// Confidence reported for genuine model output
const GENERATED_CONFIDENCE: f64 = 0.85;
/// Confidence reported for canned fallback insights; strictly lower than
/// `GENERATED_CONFIDENCE` so callers can rank them
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// One produced insight. `fallback` marks the canned degradation path.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedInsight {
    pub text: String,
    pub confidence: f64,
    pub fallback: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Calls the external text-generation service with retry, backoff, and a
/// per-attempt deadline, degrading to a deterministic category fallback when
/// every attempt fails. The caller always receives a usable insight; raw
/// upstream errors never escape this type.
pub struct InsightGenerator {
    client: Client,
    completions_url: Url,
    api_key: Option<SecretString>,
    config: GeneratorConfig,
}

impl InsightGenerator {
    pub fn new(client: Client, config: GeneratorConfig) -> Result<Self, Error> {
        let base = Url::parse(&config.api_base).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid generator api_base `{}`: {e}", config.api_base),
            })
        })?;
        let completions_url = base.join("chat/completions").map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to construct completions URL: {e}"),
            })
        })?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            warn!(
                env_var = config.api_key_env,
                "No generator API key configured; requests will be sent unauthenticated"
            );
        }

        Ok(Self {
            client,
            completions_url,
            api_key,
            config,
        })
    }

    /// Generate an insight for `category` from `data`.
    ///
    /// Transient upstream failures are retried with exponential backoff
    /// (tokio sleep, so only this task is suspended). Once the retry budget
    /// is exhausted the category fallback is returned instead of an error.
    pub async fn generate(
        &self,
        category: InsightCategory,
        data: &BehavioralSnapshot,
    ) -> GeneratedInsight {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: build_messages(category, data),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.base_backoff_ms))
            .with_factor(2.0)
            .with_max_times(self.config.max_retries);

        let result = (|| async { self.attempt_once(&request).await })
            .retry(backoff)
            .when(Error::is_transient)
            .notify(|err: &Error, dur: Duration| {
                warn!(
                    category = %category,
                    error = %err,
                    backoff_ms = dur.as_millis() as u64,
                    "Retrying insight generation"
                );
            })
            .await;

        match result {
            Ok(text) => {
                debug!(category = %category, "Generated insight");
                GeneratedInsight {
                    text,
                    confidence: GENERATED_CONFIDENCE,
                    fallback: false,
                }
            }
            Err(e) => {
                warn!(
                    category = %category,
                    error = %e,
                    "Insight generation exhausted retries, serving fallback"
                );
                GeneratedInsight {
                    text: fallback_text(category).to_string(),
                    confidence: FALLBACK_CONFIDENCE,
                    fallback: true,
                }
            }
        }
    }

    /// One bounded attempt against the upstream service
    async fn attempt_once(&self, request: &ChatCompletionRequest) -> Result<String, Error> {
        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);

        let mut builder = self
            .client
            .post(self.completions_url.clone())
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = timeout(attempt_timeout, builder.send())
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::GenerationTimeout {
                    timeout_ms: self.config.attempt_timeout_ms,
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::GenerationServer {
                    message: format!("Error sending request to {PROVIDER_TYPE}: {e}"),
                })
            })?;

        let status = response.status();
        let body = timeout(attempt_timeout, response.text())
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::GenerationTimeout {
                    timeout_ms: self.config.attempt_timeout_ms,
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::GenerationServer {
                    message: format!("Error reading response from {PROVIDER_TYPE}: {e}"),
                })
            })?;

        if !status.is_success() {
            // 5xx and 429 are worth retrying; other client errors are not
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::new(ErrorDetails::GenerationServer {
                    message: format!("{PROVIDER_TYPE} returned {status}: {body}"),
                }));
            }
            return Err(Error::new(ErrorDetails::GenerationClient {
                message: body,
                status_code: Some(status),
            }));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            Error::new(ErrorDetails::GenerationServer {
                message: format!("Failed to parse {PROVIDER_TYPE} response: {e}"),
            })
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                Error::new(ErrorDetails::GenerationServer {
                    message: format!("{PROVIDER_TYPE} response contained no content"),
                })
            })
    }
}

fn build_messages(category: InsightCategory, data: &BehavioralSnapshot) -> Vec<ChatMessage> {
    let mut summary = format!("Messages analyzed: {}.", data.message_count);
    for (pattern, count) in &data.pattern_counts {
        summary.push_str(&format!(" {pattern}: {count}."));
    }
    vec![
        ChatMessage {
            role: "system",
            content: system_prompt(category).to_string(),
        },
        ChatMessage {
            role: "user",
            content: summary,
        },
    ]
}

fn system_prompt(category: InsightCategory) -> &'static str {
    match category {
        InsightCategory::Communication => {
            "You analyze chat behavior. Write one short, warm insight about how this person communicates."
        }
        InsightCategory::Personality => {
            "You analyze chat behavior. Write one short, warm insight about this person's personality."
        }
        InsightCategory::Behavioral => {
            "You analyze chat behavior. Write one short, warm insight about this person's usage patterns."
        }
        InsightCategory::Emotional => {
            "You analyze chat behavior. Write one short, warm insight about this person's emotional expression."
        }
        InsightCategory::Growth => {
            "You analyze chat behavior. Write one short, warm insight about how this person has grown recently."
        }
    }
}

/// Deterministic per-category fallback, served when the upstream service is
/// unavailable
fn fallback_text(category: InsightCategory) -> &'static str {
    match category {
        InsightCategory::Communication => {
            "You have a distinctive way of expressing yourself in conversation. Keep exploring it."
        }
        InsightCategory::Personality => {
            "Your conversations show a curious and engaged personality."
        }
        InsightCategory::Behavioral => {
            "Your usage patterns show you are building a consistent habit of reflection."
        }
        InsightCategory::Emotional => {
            "You bring genuine feeling into your conversations, and it shows."
        }
        InsightCategory::Growth => {
            "Looking back over your recent conversations, there is steady growth in how you engage."
        }
    }
}
