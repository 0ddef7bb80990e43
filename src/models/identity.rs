//! Identity model as issued by the identity provider.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic counter bumped on every identity change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the identity was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Provenance {
    Password,
    Federated { provider: String },
}

/// An authenticated principal. Immutable; replaced wholesale on sign-in/out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub provenance: Provenance,
}

impl Identity {
    /// Two identities denote the same principal when their ids match.
    pub fn same_principal(&self, other: &Identity) -> bool {
        self.id == other.id
    }
}

/// Credential presented to the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Existing email/password account.
    EmailPassword { email: String, password: String },
    /// Create an email/password account and sign in.
    CreateAccount { email: String, password: String },
    /// Token issued by a federated provider (e.g. "google.com").
    Federated { provider: String, token: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::EmailPassword { email, .. } => f
                .debug_struct("EmailPassword")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Credential::CreateAccount { email, .. } => f
                .debug_struct("CreateAccount")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Federated { provider, .. } => f
                .debug_struct("Federated")
                .field("provider", provider)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_next_is_monotonic() {
        let e = Epoch::ZERO;
        assert!(e.next() > e);
        assert_eq!(e.next().next().value(), 2);
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let cred = Credential::EmailPassword {
            email: "a@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", cred);
        assert!(printed.contains("a@example.com"));
        assert!(!printed.contains("hunter2"));
    }
}
