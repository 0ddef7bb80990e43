//! Blob payloads handed to the upload coordinator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Source blob for an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl Blob {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn content_type_or_default(&self) -> String {
        self.content_type
            .clone()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }
}

/// Metadata sent alongside the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub content_type: String,
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadState {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Complete | UploadState::Failed | UploadState::Cancelled
        )
    }
}
