//! Profile record stored at `users/{identity id}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{fields, Identity, Role};
use crate::ports::{Document, Fields};

/// A user's profile document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

impl UserProfile {
    pub fn from_document(doc: &Document) -> Self {
        let text = |name: &str| {
            doc.fields
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            id: doc.id.clone(),
            email: text(fields::EMAIL),
            display_name: text(fields::DISPLAY_NAME),
            role: Role::from_profile_value(doc.fields.get(fields::ROLE)),
        }
    }
}

/// Fields refreshed on every sign-in.
pub fn profile_refresh_fields(identity: &Identity, now: DateTime<Utc>) -> Fields {
    let mut patch = Fields::new();
    patch.insert(
        fields::EMAIL.to_string(),
        Value::String(identity.email.clone().unwrap_or_default()),
    );
    patch.insert(
        fields::DISPLAY_NAME.to_string(),
        Value::String(identity.display_name.clone().unwrap_or_default()),
    );
    patch.insert(
        fields::UPDATED_AT.to_string(),
        Value::String(now.to_rfc3339()),
    );
    patch
}

/// Fields written when the profile does not exist yet. New profiles always start as `user`.
pub fn profile_create_fields(identity: &Identity, now: DateTime<Utc>) -> Fields {
    let mut patch = profile_refresh_fields(identity, now);
    patch.insert(
        fields::ROLE.to_string(),
        Value::String(Role::User.as_str().to_string()),
    );
    patch.insert(
        fields::CREATED_AT.to_string(),
        Value::String(now.to_rfc3339()),
    );
    patch
}
