//! Error types for the qdbapi client.
//!
//! # Design
//! The service reports failures inside a successful HTTP response as a numeric
//! `errcode` plus `errtext`. Authentication-class codes get a dedicated `Auth`
//! variant because callers almost always need to re-authenticate rather than
//! inspect the code. Every other server-side rejection lands in `Api` with a
//! stable `ErrorCode` that can be classified (conflict, permission, not found).
//! Failures that never reached the service, or whose reply could not be
//! understood, have their own variants.

use std::fmt;

/// Numeric error code embedded in every XML response. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const UNKNOWN: ErrorCode = ErrorCode(1);
    pub const INVALID_INPUT: ErrorCode = ErrorCode(2);
    pub const INSUFFICIENT_PERMISSIONS: ErrorCode = ErrorCode(3);
    pub const BAD_TICKET: ErrorCode = ErrorCode(4);
    pub const UNIMPLEMENTED: ErrorCode = ErrorCode(5);
    pub const INVALID_CHOICE: ErrorCode = ErrorCode(9);
    pub const INVALID_FIELD_TYPE: ErrorCode = ErrorCode(10);
    pub const UNPARSEABLE_XML: ErrorCode = ErrorCode(11);
    pub const WRONG_DBID: ErrorCode = ErrorCode(14);
    pub const UNKNOWN_CREDENTIALS: ErrorCode = ErrorCode(20);
    pub const UNKNOWN_USER: ErrorCode = ErrorCode(21);
    pub const SIGN_IN_REQUIRED: ErrorCode = ErrorCode(22);
    pub const NO_SUCH_RECORD: ErrorCode = ErrorCode(30);
    pub const NO_SUCH_FIELD: ErrorCode = ErrorCode(31);
    pub const NO_SUCH_DATABASE: ErrorCode = ErrorCode(32);
    pub const NO_SUCH_QUERY: ErrorCode = ErrorCode(33);
    pub const NO_SUCH_REPORT: ErrorCode = ErrorCode(37);
    pub const UPDATE_CONFLICT: ErrorCode = ErrorCode(60);
    pub const ITEM_NOT_FOUND: ErrorCode = ErrorCode(81);
    pub const ACCESS_DENIED: ErrorCode = ErrorCode(83);
    pub const MUST_BE_ADMIN: ErrorCode = ErrorCode(150);

    pub fn is_success(self) -> bool {
        self == ErrorCode::SUCCESS
    }

    /// Coarse grouping used for programmatic handling.
    pub fn class(self) -> ErrorClass {
        match self.0 {
            0 => ErrorClass::Success,
            4 | 20 | 21 | 22 => ErrorClass::Auth,
            3 | 83 | 150 => ErrorClass::Permission,
            60 => ErrorClass::Conflict,
            30 | 31 | 32 | 33 | 37 | 81 => ErrorClass::NotFound,
            2 | 6 | 9 | 10 | 11 | 14 | 50 | 51 => ErrorClass::InvalidInput,
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of an `ErrorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    Auth,
    Permission,
    Conflict,
    NotFound,
    InvalidInput,
    Other,
}

/// Errors returned by the request builder, response parser and session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad credentials, or a ticket the service no longer accepts.
    #[error("authentication failed (code {code}): {message}")]
    Auth { code: ErrorCode, message: String },

    /// The service rejected the operation.
    #[error("API error {code}: {message}{}", detail_suffix(.detail))]
    Api {
        code: ErrorCode,
        message: String,
        detail: Option<String>,
    },

    /// The request never produced an HTTP response (DNS, TLS, timeout, reset).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The opaque user data echoed by the service did not match what was sent.
    #[error("user data mismatch: sent {expected:?}, received {received:?}")]
    Integrity {
        expected: String,
        received: Option<String>,
    },

    /// The service answered with a non-2xx HTTP status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response could not be decoded into the expected shape.
    #[error("malformed response: {0}")]
    Deserialization(String),

    /// The request was rejected locally before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build the error for a non-zero `errcode` reported by the service.
    pub fn from_api(code: ErrorCode, message: impl Into<String>, detail: Option<String>) -> Self {
        let message = message.into();
        match code.class() {
            ErrorClass::Auth => Error::Auth { code, message },
            _ => Error::Api {
                code,
                message,
                detail,
            },
        }
    }

    /// The service error code, when the failure came from the service.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Auth { code, .. } | Error::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Stale update id on an edit.
    pub fn is_conflict(&self) -> bool {
        self.code().map(|c| c.class() == ErrorClass::Conflict).unwrap_or(false)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code().map(|c| c.class() == ErrorClass::Permission).unwrap_or(false)
    }

    pub fn is_not_found(&self) -> bool {
        self.code().map(|c| c.class() == ErrorClass::NotFound).unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
}

/// Wrap any displayable decoding failure.
pub(crate) fn malformed(e: impl fmt::Display) -> Error {
    Error::Deserialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_codes_become_auth_errors() {
        for code in [4, 20, 21, 22] {
            let err = Error::from_api(ErrorCode(code), "nope", None);
            assert!(matches!(err, Error::Auth { .. }), "code {code}");
        }
    }

    #[test]
    fn update_conflict_is_conflict_class() {
        let err = Error::from_api(ErrorCode::UPDATE_CONFLICT, "Update conflict detected", None);
        assert!(err.is_conflict());
        assert!(!err.is_permission_denied());
        assert_eq!(err.code(), Some(ErrorCode(60)));
    }

    #[test]
    fn permission_and_not_found_classes() {
        assert!(Error::from_api(ErrorCode(3), "x", None).is_permission_denied());
        assert!(Error::from_api(ErrorCode(150), "x", None).is_permission_denied());
        assert!(Error::from_api(ErrorCode(32), "x", None).is_not_found());
        assert!(!Error::Transport("reset".into()).is_not_found());
    }

    #[test]
    fn api_error_display_includes_detail() {
        let err = Error::from_api(ErrorCode(31), "No such field", Some("fid 99".into()));
        assert_eq!(err.to_string(), "API error 31: No such field (fid 99)");
        let err = Error::from_api(ErrorCode(31), "No such field", None);
        assert_eq!(err.to_string(), "API error 31: No such field");
    }
}
