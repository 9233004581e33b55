use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            400 | 422 => ErrorCode::Validation,
            409 => ErrorCode::Conflict,
            429 => ErrorCode::RateLimited,
            502..=504 => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        }
    }
}

/// Error reported by the remote event store, decoded from a non-success response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?} ({status}): {}", message.as_deref().unwrap_or("no message"))]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(status: u16, message: Option<String>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message,
        }
    }

    /// Builds an error from a raw response body. The store answers with either
    /// `{"message": ...}` or `{"error": ...}`; anything else leaves the message empty.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(ErrorBody::into_message);
        Self::new(status, message)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.message
            .or(self.error)
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_taken_from_either_field() {
        let err = ApiError::from_body(409, br#"{"message":"Evento lotado"}"#);
        assert_eq!(err.code, ErrorCode::Conflict);
        assert_eq!(err.message.as_deref(), Some("Evento lotado"));

        let err = ApiError::from_body(400, br#"{"error":" capacity must be positive "}"#);
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message.as_deref(), Some("capacity must be positive"));
    }

    #[test]
    fn unreadable_bodies_leave_message_empty() {
        let bodies: [&[u8]; 3] = [b"", b"<html>Bad Gateway</html>", br#"{"message":"  "}"#];
        for body in bodies {
            let err = ApiError::from_body(502, body);
            assert_eq!(err.code, ErrorCode::Unavailable);
            assert!(err.message.is_none());
        }
        assert_eq!(ErrorCode::from_status(418), ErrorCode::Internal);
    }
}
