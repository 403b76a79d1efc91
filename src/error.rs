use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

// ─── Wire reason codes ──────────────────────────────────────────────────────

/// Stable reason code carried in every failed acknowledgment.
///
/// These are the only failure values a client ever sees; internal error
/// types (`DirectoryError`, `StoreError`) collapse into one of these at the
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AlreadyExists,
    NotFound,
    InvalidName,
    InvalidPassword,
    AuthRequired,
    Locked,
    VipUsernameRequired,
    VipCodeRequired,
    InvalidOrExhausted,
    NoCapacity,
    CodeSpaceExhausted,
    /// The durable registry write failed; the in-memory mutation was rolled
    /// back and the operation did not take effect.
    StorageFailure,
    /// The inbound frame failed schema validation before reaching any
    /// business logic.
    BadRequest,
}

impl ErrorCode {
    /// Stable string form, identical to the serialized representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidName => "INVALID_NAME",
            Self::InvalidPassword => "INVALID_PASSWORD",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::Locked => "LOCKED",
            Self::VipUsernameRequired => "VIP_USERNAME_REQUIRED",
            Self::VipCodeRequired => "VIP_CODE_REQUIRED",
            Self::InvalidOrExhausted => "INVALID_OR_EXHAUSTED",
            Self::NoCapacity => "NO_CAPACITY",
            Self::CodeSpaceExhausted => "CODE_SPACE_EXHAUSTED",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::BadRequest => "BAD_REQUEST",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Store errors ───────────────────────────────────────────────────────────

/// Failure inside a [`crate::store::RegistryStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry encode: {0}")]
    Encode(#[from] serde_json::Error),
}

// ─── Directory errors ───────────────────────────────────────────────────────

/// Failure of a Room Directory operation.
///
/// Every variant maps onto exactly one wire [`ErrorCode`]; the directory
/// never panics across its boundary.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("room name is already claimed")]
    AlreadyExists,

    #[error("room name failed normalization")]
    InvalidName,

    #[error("room is not claimed")]
    NotFound,

    #[error("password mismatch")]
    InvalidPassword,

    #[error("could not find an unused code after bounded retries")]
    CodeSpaceExhausted,

    #[error("code is unknown or exhausted")]
    InvalidOrExhausted,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl DirectoryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyExists => ErrorCode::AlreadyExists,
            Self::InvalidName => ErrorCode::InvalidName,
            Self::NotFound => ErrorCode::NotFound,
            Self::InvalidPassword => ErrorCode::InvalidPassword,
            Self::CodeSpaceExhausted => ErrorCode::CodeSpaceExhausted,
            Self::InvalidOrExhausted => ErrorCode::InvalidOrExhausted,
            Self::Hash(_) | Self::Storage(_) => ErrorCode::StorageFailure,
        }
    }
}

// ─── ApiError (REST surface) ────────────────────────────────────────────────

/// Structured error for the REST endpoints, serialized as:
///
/// ```json
/// {
///   "error": {
///     "code": "INVALID_OR_EXHAUSTED",
///     "message": "Code is unknown or exhausted.",
///     "status": 400
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        } else if self.status.is_client_error() {
            tracing::warn!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl ApiError {
    /// 404 — the named room is not claimed in the directory.
    pub fn room_not_found(room: &str) -> Self {
        Self {
            code: "NOT_FOUND",
            message: format!("Room '{room}' is not claimed."),
            status: StatusCode::NOT_FOUND,
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        let code = err.code();
        let status = match code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            code: code.as_str(),
            message: err.to_string(),
            status,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn code_serialization_is_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::VipUsernameRequired).unwrap();
        assert_eq!(json, "\"VIP_USERNAME_REQUIRED\"");

        let parsed: ErrorCode = serde_json::from_str("\"NO_CAPACITY\"").unwrap();
        assert_eq!(parsed, ErrorCode::NoCapacity);
    }

    #[test]
    fn as_str_matches_serde() {
        for code in [
            ErrorCode::AlreadyExists,
            ErrorCode::Locked,
            ErrorCode::CodeSpaceExhausted,
            ErrorCode::StorageFailure,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn directory_error_maps_to_code() {
        assert_eq!(DirectoryError::AlreadyExists.code(), ErrorCode::AlreadyExists);
        assert_eq!(
            DirectoryError::InvalidOrExhausted.code(),
            ErrorCode::InvalidOrExhausted
        );

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = DirectoryError::Storage(StoreError::Io(io));
        assert_eq!(err.code(), ErrorCode::StorageFailure);
    }

    #[tokio::test]
    async fn api_error_json_structure() {
        let response = ApiError::room_not_found("demo").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], "NOT_FOUND");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn directory_error_to_api_error() {
        let api: ApiError = DirectoryError::InvalidOrExhausted.into();
        assert_eq!(api.code, "INVALID_OR_EXHAUSTED");
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
    }
}
