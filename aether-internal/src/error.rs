use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::fmt::Display;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    /// Whether retrying the operation could plausibly succeed.
    ///
    /// Used by the insight generator to decide between another backoff
    /// attempt and giving up to the fallback path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.get_details(),
            ErrorDetails::GenerationServer { .. } | ErrorDetails::GenerationTimeout { .. }
        )
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Auth {
        message: String,
    },
    Config {
        message: String,
    },
    /// Upstream generation service rejected the request (4xx). Not retried.
    GenerationClient {
        message: String,
        status_code: Option<StatusCode>,
    },
    /// Upstream generation service failed in a way that may be transient
    /// (5xx, connection error, malformed body).
    GenerationServer {
        message: String,
    },
    /// A single generation attempt exceeded its deadline.
    GenerationTimeout {
        timeout_ms: u64,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    Serialization {
        message: String,
    },
    /// The usage/cooldown store failed to read or write.
    Store {
        message: String,
    },
    /// A store operation exceeded its deadline.
    StoreTimeout {
        operation: String,
        timeout_ms: u64,
    },
    UnknownInsightCategory {
        category: String,
    },
    UnknownResourceKind {
        kind: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Auth { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::GenerationClient { .. } => tracing::Level::WARN,
            ErrorDetails::GenerationServer { .. } => tracing::Level::WARN,
            ErrorDetails::GenerationTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::Store { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::UnknownInsightCategory { .. } => tracing::Level::WARN,
            ErrorDetails::UnknownResourceKind { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Auth { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::GenerationClient { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::GenerationServer { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UnknownInsightCategory { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::UnknownResourceKind { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Short machine-readable code included in error response bodies
    fn code(&self) -> &'static str {
        match self {
            ErrorDetails::AppState { .. } => "app_state",
            ErrorDetails::Auth { .. } => "unauthorized",
            ErrorDetails::Config { .. } => "config",
            ErrorDetails::GenerationClient { .. } => "generation_client_error",
            ErrorDetails::GenerationServer { .. } => "generation_server_error",
            ErrorDetails::GenerationTimeout { .. } => "generation_timeout",
            ErrorDetails::InternalError { .. } => "internal_error",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::Serialization { .. } => "serialization",
            ErrorDetails::Store { .. } => "store_error",
            ErrorDetails::StoreTimeout { .. } => "store_timeout",
            ErrorDetails::UnknownInsightCategory { .. } => "unknown_insight_category",
            ErrorDetails::UnknownResourceKind { .. } => "unknown_resource_kind",
        }
    }

    /// Log the error using the `tracing` library
    fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Failed to initialize application state: {message}")
            }
            ErrorDetails::Auth { message } => write!(f, "{message}"),
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::GenerationClient {
                message,
                status_code,
            } => match status_code {
                Some(code) => write!(f, "Generation request rejected ({code}): {message}"),
                None => write!(f, "Generation request rejected: {message}"),
            },
            ErrorDetails::GenerationServer { message } => {
                write!(f, "Generation service error: {message}")
            }
            ErrorDetails::GenerationTimeout { timeout_ms } => {
                write!(f, "Generation attempt timed out after {timeout_ms}ms")
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::Store { message } => write!(f, "Store error: {message}"),
            ErrorDetails::StoreTimeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "Store operation `{operation}` timed out after {timeout_ms}ms")
            }
            ErrorDetails::UnknownInsightCategory { category } => {
                write!(f, "Unknown insight category: {category}")
            }
            ErrorDetails::UnknownResourceKind { kind } => {
                write!(f, "Unknown resource kind: {kind}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": if status.is_server_error() { "internal_error" } else { "invalid_request_error" },
                "code": self.get_details().code(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = Error::new_without_logging(ErrorDetails::Auth {
            message: "missing user identity".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err = Error::new_without_logging(ErrorDetails::UnknownResourceKind {
            kind: "widgets".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = Error::new_without_logging(ErrorDetails::GenerationClient {
            message: "bad model".to_string(),
            status_code: Some(StatusCode::UNPROCESSABLE_ENTITY),
        });
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::new_without_logging(ErrorDetails::GenerationServer {
            message: "503".to_string(),
        })
        .is_transient());
        assert!(
            Error::new_without_logging(ErrorDetails::GenerationTimeout { timeout_ms: 1000 })
                .is_transient()
        );
        assert!(!Error::new_without_logging(ErrorDetails::GenerationClient {
            message: "invalid key".to_string(),
            status_code: Some(StatusCode::UNAUTHORIZED),
        })
        .is_transient());
        assert!(!Error::new_without_logging(ErrorDetails::Store {
            message: "connection refused".to_string(),
        })
        .is_transient());
    }
}
