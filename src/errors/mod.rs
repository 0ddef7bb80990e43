//! Error handling module for the skein core.
//!
//! Provides the error taxonomy surfaced by every component, with stable codes for the
//! presentation layer. Nothing here is fatal: every variant degrades to a denied or
//! erroring view state.

use thiserror::Error;

use crate::models::Epoch;

/// Error codes as constants to avoid stringly-typed errors.
#[allow(dead_code)]
pub mod codes {
    pub const AUTH_ERROR: &str = "AUTH_ERROR";
    pub const ROLE_RESOLUTION_ERROR: &str = "ROLE_RESOLUTION_ERROR";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const TRANSIENT_NETWORK: &str = "TRANSIENT_NETWORK";
    pub const UPLOAD_ERROR: &str = "UPLOAD_ERROR";
    pub const NOT_SIGNED_IN: &str = "NOT_SIGNED_IN";
    pub const STALE_EPOCH: &str = "STALE_EPOCH";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
}

/// Core error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Identity provider rejected the credential. Surfaced verbatim, never retried.
    #[error("{message}")]
    Auth { message: String },

    /// Profile fetch failed; the effective role defaults to `user`.
    #[error("role resolution failed for {identity_id}: {cause}")]
    RoleResolution { identity_id: String, cause: String },

    /// Store rejected an operation for authorization reasons.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Query, write or upload hiccup. Retry policy belongs to the caller.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Partial transfer. Carries enough detail for a fresh retry.
    #[error("upload of {path} failed after {bytes_transferred} bytes: {cause}")]
    Upload {
        path: String,
        bytes_transferred: u64,
        cause: String,
    },

    #[error("not signed in")]
    NotSignedIn,

    /// A delayed result belongs to an identity epoch that is no longer active.
    #[error("result from epoch {origin} discarded, current epoch is {current}")]
    StaleEpoch { origin: Epoch, current: Epoch },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn auth(message: impl Into<String>) -> Self {
        CoreError::Auth {
            message: message.into(),
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Auth { .. } => codes::AUTH_ERROR,
            CoreError::RoleResolution { .. } => codes::ROLE_RESOLUTION_ERROR,
            CoreError::Permission(_) => codes::PERMISSION_DENIED,
            CoreError::TransientNetwork(_) => codes::TRANSIENT_NETWORK,
            CoreError::Upload { .. } => codes::UPLOAD_ERROR,
            CoreError::NotSignedIn => codes::NOT_SIGNED_IN,
            CoreError::StaleEpoch { .. } => codes::STALE_EPOCH,
            CoreError::NotFound(_) => codes::NOT_FOUND,
            CoreError::Validation(_) => codes::VALIDATION_ERROR,
            CoreError::Config(_) => codes::CONFIG_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// A permission failure implies the cached role may be stale.
    pub fn requires_gate_reevaluation(&self) -> bool {
        matches!(self, CoreError::Permission(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        CoreError::Validation(format!("JSON error: {}", err))
    }
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::auth("bad password").error_code(), codes::AUTH_ERROR);
        assert_eq!(CoreError::NotSignedIn.error_code(), codes::NOT_SIGNED_IN);
        assert_eq!(
            CoreError::Upload {
                path: "uploads/a/b/c".to_string(),
                bytes_transferred: 10,
                cause: "reset".to_string(),
            }
            .error_code(),
            codes::UPLOAD_ERROR
        );
    }

    #[test]
    fn test_auth_message_is_verbatim() {
        let err = CoreError::auth("auth/wrong-password");
        assert_eq!(err.message(), "auth/wrong-password");
    }

    #[test]
    fn test_only_permission_triggers_reevaluation() {
        assert!(CoreError::Permission("rules".into()).requires_gate_reevaluation());
        assert!(!CoreError::TransientNetwork("timeout".into()).requires_gate_reevaluation());
        assert!(!CoreError::RoleResolution {
            identity_id: "u1".into(),
            cause: "offline".into()
        }
        .requires_gate_reevaluation());
    }

    #[test]
    fn test_stale_epoch_display() {
        let err = CoreError::StaleEpoch {
            origin: Epoch::new(1),
            current: Epoch::new(2),
        };
        assert_eq!(
            err.to_string(),
            "result from epoch 1 discarded, current epoch is 2"
        );
    }
}
