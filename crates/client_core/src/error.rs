use shared::{
    domain::{EventId, EventStatus},
    error::{ApiError, ErrorCode},
    lifecycle::TransitionError,
};
use thiserror::Error;

const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong, please try again.";

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("cannot move event from {from} to {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },
    #[error("permission denied: {0}")]
    Unauthorized(String),
    #[error("not signed in{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Unauthenticated(Option<String>),
    #[error("not eligible: {0}")]
    NotEligible(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("another change to event {0} is still in flight")]
    MutationInFlight(EventId),
    #[error("remote store unavailable: {detail}")]
    RemoteUnavailable {
        detail: String,
        /// Text the store put in the failing response, if any.
        message: Option<String>,
    },
    #[error("request rejected ({status}): {}", message.as_deref().unwrap_or("no message"))]
    Rejected {
        status: u16,
        message: Option<String>,
    },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("response superseded by a newer action")]
    StaleResponseDiscarded,
}

impl CoordinatorError {
    /// Maps a decoded store error onto the client taxonomy.
    pub fn from_api_error(err: ApiError) -> Self {
        let described = || {
            err.message
                .clone()
                .unwrap_or_else(|| format!("status {}", err.status))
        };
        match err.code {
            ErrorCode::Unauthorized => CoordinatorError::Unauthenticated(err.message),
            ErrorCode::Forbidden => CoordinatorError::Unauthorized(described()),
            ErrorCode::NotFound => CoordinatorError::NotFound(described()),
            ErrorCode::Validation => CoordinatorError::Validation(described()),
            ErrorCode::Conflict => CoordinatorError::NotEligible(described()),
            ErrorCode::Unavailable => CoordinatorError::RemoteUnavailable {
                detail: described(),
                message: err.message,
            },
            ErrorCode::Internal if err.status >= 500 => CoordinatorError::RemoteUnavailable {
                detail: described(),
                message: err.message,
            },
            ErrorCode::RateLimited | ErrorCode::Internal => CoordinatorError::Rejected {
                status: err.status,
                message: err.message,
            },
        }
    }

    /// Transport failure with no response from the store.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        CoordinatorError::RemoteUnavailable {
            detail: detail.into(),
            message: None,
        }
    }

    pub fn from_response(status: u16, body: &[u8]) -> Self {
        Self::from_api_error(ApiError::from_body(status, body))
    }

    /// Only transport-level failures are worth another attempt, and only for reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::RemoteUnavailable { .. })
    }

    /// Errors that must never reach the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, CoordinatorError::StaleResponseDiscarded)
    }

    pub fn user_message(&self) -> String {
        match self {
            CoordinatorError::Rejected { message, .. }
            | CoordinatorError::RemoteUnavailable { message, .. } => message
                .clone()
                .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string()),
            CoordinatorError::MalformedResponse(_) => GENERIC_FAILURE_MESSAGE.to_string(),
            CoordinatorError::Unauthenticated(message) => message
                .clone()
                .unwrap_or_else(|| "Please sign in to continue.".to_string()),
            CoordinatorError::StaleResponseDiscarded => String::new(),
            other => other.to_string(),
        }
    }
}

impl From<TransitionError> for CoordinatorError {
    fn from(value: TransitionError) -> Self {
        CoordinatorError::InvalidTransition {
            from: value.from,
            to: value.to,
        }
    }
}

impl From<reqwest::Error> for CoordinatorError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return CoordinatorError::MalformedResponse(value.to_string());
        }
        if let Some(status) = value.status() {
            return CoordinatorError::from_api_error(ApiError::new(status.as_u16(), None));
        }
        CoordinatorError::unavailable(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_prefer_the_store_text() {
        let err = CoordinatorError::from_response(401, br#"{"message":"Token expirado"}"#);
        assert_eq!(err, CoordinatorError::Unauthenticated(Some("Token expirado".into())));
        assert_eq!(err.user_message(), "Token expirado");
        assert_eq!(
            CoordinatorError::Unauthenticated(None).user_message(),
            "Please sign in to continue."
        );

        let err = CoordinatorError::from_response(500, br#"{"error":"database offline"}"#);
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "database offline");
        assert_eq!(
            CoordinatorError::unavailable("connection reset").user_message(),
            GENERIC_FAILURE_MESSAGE
        );
    }

    #[test]
    fn only_stale_responses_are_silent() {
        assert!(CoordinatorError::StaleResponseDiscarded.is_silent());
        assert!(!CoordinatorError::unavailable("timeout").is_silent());
        assert!(!CoordinatorError::Unauthenticated(None).is_silent());
    }
}
