//! Record model covering projects and stash items.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::{Document, Fields};

/// Field names shared with the document store.
pub mod fields {
    pub const OWNER_ID: &str = "ownerId";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const FILES: &str = "files";
    pub const NAME: &str = "name";
    pub const NOTES: &str = "notes";
    pub const STATUS: &str = "status";
    pub const ROLE: &str = "role";
    pub const EMAIL: &str = "email";
    pub const DISPLAY_NAME: &str = "displayName";
}

/// Collection names shared with the document store.
pub mod collections {
    pub const USERS: &str = "users";
    pub const PROJECTS: &str = "projects";
    pub const STASH: &str = "stash";
}

/// A file attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub path: String,
    pub url: String,
}

/// A record owned by one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub owner_id: Option<String>,
    /// Free-form attributes, excluding the structural fields below.
    pub attributes: Fields,
    pub files: Vec<FileDescriptor>,
    /// `None` while a server timestamp is still pending.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn from_document(doc: Document) -> Self {
        let Document { id, mut fields } = doc;

        let owner_id = fields
            .remove(fields::OWNER_ID)
            .and_then(|v| v.as_str().map(str::to_string));
        let created_at = fields
            .remove(fields::CREATED_AT)
            .as_ref()
            .and_then(parse_timestamp);
        let updated_at = fields
            .remove(fields::UPDATED_AT)
            .as_ref()
            .and_then(parse_timestamp);
        let files = fields
            .remove(fields::FILES)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Self {
            id,
            owner_id,
            attributes: fields,
            files,
            created_at,
            updated_at,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn name(&self) -> Option<&str> {
        self.attribute(fields::NAME).and_then(Value::as_str)
    }

    pub fn is_owned_by(&self, identity_id: &str) -> bool {
        self.owner_id.as_deref() == Some(identity_id)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Snapshot order: newest `createdAt` first, ties broken by ascending id.
/// Records with a pending timestamp sort ahead of everything else.
pub fn snapshot_order(a: &Record, b: &Record) -> Ordering {
    let by_time = match (a.created_at, b.created_at) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(ta), Some(tb)) => tb.cmp(&ta),
    };
    by_time.then_with(|| a.id.cmp(&b.id))
}
