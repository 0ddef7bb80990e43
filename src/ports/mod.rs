//! Capability interfaces consumed by the core.
//!
//! The identity provider, document store and blob store are external collaborators.
//! Only the field names documented in [`crate::models::fields`] cross this boundary;
//! no wire format is implied.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::CoreResult;
use crate::models::{Blob, BlobMetadata, Credential, Identity};
use crate::observe::{Listener, Unsubscribe};

/// Document body.
pub type Fields = serde_json::Map<String, Value>;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

/// Ordering hint passed to the store. The core re-sorts snapshots itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// A live query description.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

/// Receives the full result set (or an error) on every change.
pub type SnapshotCallback = Box<dyn Fn(CoreResult<Vec<Document>>) + Send + Sync>;

/// Handle on an open live query.
pub trait LiveQuery: Send + Sync {
    fn on_snapshot(&self, callback: SnapshotCallback) -> Unsubscribe;
}

/// External identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_credential(&self, credential: &Credential) -> CoreResult<Identity>;

    async fn sign_out(&self) -> CoreResult<()>;

    /// Delivers the current state on registration and on every change afterwards.
    fn on_state_change(&self, listener: Listener<Option<Identity>>) -> Unsubscribe;
}

/// External document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn query(&self, query: &DocumentQuery) -> CoreResult<Arc<dyn LiveQuery>>;

    async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Document>>;

    /// One-shot filtered read.
    async fn find(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> CoreResult<Vec<Document>>;

    /// Insert with a store-generated id.
    async fn create(&self, collection: &str, fields: Fields) -> CoreResult<String>;

    /// Merge `patch` into the document, creating it if absent.
    async fn write(&self, collection: &str, id: &str, patch: Fields) -> CoreResult<()>;

    /// Atomically add `value` to the array at `field` unless an equal element is
    /// present, then merge `patch`. Fails with `NotFound` if the document is gone.
    /// Returns whether the value was added; `patch` is applied only in that case.
    async fn append_unique(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
        patch: Fields,
    ) -> CoreResult<bool>;

    async fn delete(&self, collection: &str, id: &str) -> CoreResult<()>;

    async fn count_of(&self, collection: &str, filters: &[Filter]) -> CoreResult<u64>;
}

/// Progress reported by an in-flight transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Complete {
        bytes_transferred: u64,
    },
    Failed(crate::errors::CoreError),
    Cancelled,
}

/// An in-flight resumable upload.
pub struct ResumableUpload {
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
    /// Requests an abort; the transfer answers with [`TransferEvent::Cancelled`].
    pub cancel: Unsubscribe,
}

/// External blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn begin_resumable_upload(
        &self,
        path: &str,
        blob: Blob,
        metadata: BlobMetadata,
    ) -> CoreResult<ResumableUpload>;

    async fn resolve_download_locator(&self, path: &str) -> CoreResult<String>;
}
