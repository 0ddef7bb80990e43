//! In-memory blob store with chunked, pausable transfers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::errors::{CoreError, CoreResult};
use crate::models::{Blob, BlobMetadata};
use crate::observe::Unsubscribe;
use crate::ports::{BlobStore, ResumableUpload, TransferEvent};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A completed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Default)]
struct BlobState {
    objects: HashMap<String, StoredBlob>,
    denied_prefixes: Vec<String>,
    fail_next_after: Option<u64>,
}

struct BlobInner {
    state: Mutex<BlobState>,
    chunk_size: usize,
    paused: watch::Sender<bool>,
}

struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Blob store held entirely in memory.
#[derive(Clone)]
pub struct MemoryBlobStore {
    inner: Arc<BlobInner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(BlobInner {
                state: Mutex::new(BlobState::default()),
                chunk_size: chunk_size.max(1),
                paused,
            }),
        }
    }

    /// Hold every transfer before its next chunk.
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Reject uploads under `prefix` with a permission error.
    pub fn deny_prefix(&self, prefix: &str) {
        self.inner
            .state
            .lock()
            .denied_prefixes
            .push(prefix.to_string());
    }

    /// Drop the connection of the next transfer once it has sent more than `bytes`.
    pub fn fail_next_after(&self, bytes: u64) {
        self.inner.state.lock().fail_next_after = Some(bytes);
    }

    pub fn object(&self, path: &str) -> Option<StoredBlob> {
        self.inner.state.lock().objects.get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.state.lock().objects.len()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_until_running(paused: &mut watch::Receiver<bool>, cancel: &CancelSignal) {
    loop {
        if cancel.is_cancelled() || !*paused.borrow_and_update() {
            return;
        }
        tokio::select! {
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = cancel.notify.notified() => {}
        }
    }
}

async fn run_transfer(
    inner: Arc<BlobInner>,
    path: String,
    blob: Blob,
    metadata: BlobMetadata,
    tx: mpsc::UnboundedSender<TransferEvent>,
    cancel: Arc<CancelSignal>,
    fail_after: Option<u64>,
) {
    let total = blob.size();
    let mut sent = 0u64;
    let mut paused = inner.paused.subscribe();

    let _ = tx.send(TransferEvent::Progress {
        bytes_transferred: 0,
        total_bytes: total,
    });

    loop {
        wait_until_running(&mut paused, &cancel).await;
        if cancel.is_cancelled() {
            let _ = tx.send(TransferEvent::Cancelled);
            return;
        }
        if sent >= total {
            break;
        }

        sent += (inner.chunk_size as u64).min(total - sent);
        if let Some(limit) = fail_after {
            if sent > limit {
                let _ = tx.send(TransferEvent::Failed(CoreError::TransientNetwork(
                    "connection reset during transfer".to_string(),
                )));
                return;
            }
        }
        let _ = tx.send(TransferEvent::Progress {
            bytes_transferred: sent,
            total_bytes: total,
        });
        tokio::task::yield_now().await;
    }

    inner.state.lock().objects.insert(
        path,
        StoredBlob {
            data: blob.data,
            content_type: metadata.content_type,
        },
    );
    let _ = tx.send(TransferEvent::Complete {
        bytes_transferred: total,
    });
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn begin_resumable_upload(
        &self,
        path: &str,
        blob: Blob,
        metadata: BlobMetadata,
    ) -> CoreResult<ResumableUpload> {
        if path.is_empty() || path.split('/').any(|segment| segment.is_empty() || segment == "..") {
            return Err(CoreError::Validation(format!("invalid object path: {}", path)));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::TransientNetwork("no async runtime available for transfer".to_string())
        })?;

        let (denied, fail_after) = {
            let mut state = self.inner.state.lock();
            let denied = state
                .denied_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()));
            (denied, state.fail_next_after.take())
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(CancelSignal {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });

        if denied {
            let _ = tx.send(TransferEvent::Failed(CoreError::Permission(format!(
                "not authorized to write {}",
                path
            ))));
        } else {
            runtime.spawn(run_transfer(
                self.inner.clone(),
                path.to_string(),
                blob,
                metadata,
                tx,
                cancel.clone(),
                fail_after,
            ));
        }

        Ok(ResumableUpload {
            events: rx,
            cancel: Unsubscribe::new(move || cancel.cancel()),
        })
    }

    async fn resolve_download_locator(&self, path: &str) -> CoreResult<String> {
        if self.inner.state.lock().objects.contains_key(path) {
            Ok(format!("memory://{}", path))
        } else {
            Err(CoreError::NotFound(format!("object {}", path)))
        }
    }
}
