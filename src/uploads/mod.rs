//! Resumable uploads bound to the epoch they were started in.
//!
//! An upload keeps running across identity changes; its outcome is tagged with the
//! starting epoch and owner, and [`UploadOutcome::into_current`] refuses to hand a
//! stale outcome to the caller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::{CoreError, CoreResult};
use crate::models::{Blob, BlobMetadata, Epoch, FileDescriptor, UploadState};
use crate::observe::{Listener, Unsubscribe};
use crate::ports::{BlobStore, ResumableUpload, TransferEvent};
use crate::session::SessionMonitor;

const MAX_FILENAME_LEN: usize = 120;

/// Lower-case, collapse whitespace runs to `-`, keep only `[a-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('-');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        for lower in c.to_lowercase() {
            if lower == '.' && out.ends_with('.') {
                continue;
            }
            if lower.is_ascii_alphanumeric() || matches!(lower, '.' | '-' | '_') {
                out.push(lower);
            }
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '-');
    let truncated: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    if truncated.is_empty() {
        "file".to_string()
    } else {
        truncated
    }
}

/// `{prefix}/{owner}/{record}/{token}-{sanitized name}`.
pub fn object_path(prefix: &str, owner_id: &str, record_id: &str, token: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}/{}-{}",
        prefix,
        owner_id,
        record_id,
        token,
        sanitize_filename(file_name)
    )
}

fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (transferred as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    /// Original file name, as chosen by the user.
    pub name: String,
    pub path: String,
    pub url: String,
    pub size: u64,
    pub content_type: String,
}

impl CompletedUpload {
    pub fn to_file_descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            name: self.name.clone(),
            path: self.path.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadResult {
    Completed(CompletedUpload),
    Failed(CoreError),
    Cancelled,
}

/// Terminal result of an upload together with the epoch and owner it started under.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub epoch: Epoch,
    pub owner_id: String,
    pub record_id: String,
    pub result: UploadResult,
}

impl UploadOutcome {
    /// The result, if the identity that started the upload is still current.
    pub fn into_current(self, session: &SessionMonitor) -> CoreResult<UploadResult> {
        session.ensure_current(self.epoch).inspect_err(|_| {
            tracing::warn!(
                epoch = %self.epoch,
                record = %self.record_id,
                "Upload outcome belongs to an ended session; not applied"
            )
        })?;
        Ok(self.result)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.result, UploadResult::Completed(_))
    }
}

/// Handle on one running upload.
pub struct UploadHandle {
    path: String,
    epoch: Epoch,
    owner_id: String,
    record_id: String,
    state: Arc<Mutex<UploadState>>,
    cancel_requested: Arc<AtomicBool>,
    cancel: Unsubscribe,
    outcome: oneshot::Receiver<UploadOutcome>,
}

impl UploadHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn state(&self) -> UploadState {
        *self.state.lock()
    }

    /// Abort the transfer. The result resolves to [`UploadResult::Cancelled`].
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel.unsubscribe();
    }

    pub async fn result(self) -> UploadOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => UploadOutcome {
                epoch: self.epoch,
                owner_id: self.owner_id,
                record_id: self.record_id,
                result: UploadResult::Failed(CoreError::Upload {
                    path: self.path,
                    bytes_transferred: 0,
                    cause: "upload task stopped without a result".to_string(),
                }),
            },
        }
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Transfer {
    name: String,
    path: String,
    size: u64,
    content_type: String,
    epoch: Epoch,
    owner_id: String,
    record_id: String,
}

impl Transfer {
    fn failure(&self, err: CoreError, bytes_transferred: u64) -> CoreError {
        match err {
            CoreError::Permission(_) | CoreError::Upload { .. } => err,
            CoreError::TransientNetwork(cause) => CoreError::Upload {
                path: self.path.clone(),
                bytes_transferred,
                cause,
            },
            other => CoreError::Upload {
                path: self.path.clone(),
                bytes_transferred,
                cause: other.to_string(),
            },
        }
    }
}

pub struct UploadCoordinator {
    blobs: Arc<dyn BlobStore>,
    session: Arc<SessionMonitor>,
    prefix: String,
    in_flight: Arc<AtomicUsize>,
}

impl UploadCoordinator {
    pub fn new(blobs: Arc<dyn BlobStore>, session: Arc<SessionMonitor>, prefix: impl Into<String>) -> Self {
        Self {
            blobs,
            session,
            prefix: prefix.into(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start uploading `blob` as an attachment of `record_id`, owned by the current identity.
    pub fn start(&self, blob: Blob, record_id: &str, on_progress: Listener<u8>) -> CoreResult<UploadHandle> {
        let (epoch, identity) = self.session.require_identity()?;
        let record_id = record_id.trim();
        if record_id.is_empty() || record_id.contains('/') {
            return Err(CoreError::Validation(format!("invalid record id: {:?}", record_id)));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::TransientNetwork("no async runtime available for upload".to_string())
        })?;

        let token = uuid::Uuid::new_v4().to_string();
        let path = object_path(&self.prefix, &identity.id, record_id, &token, &blob.name);
        let content_type = blob.content_type_or_default();
        let transfer = Transfer {
            name: blob.name.clone(),
            path: path.clone(),
            size: blob.size(),
            content_type: content_type.clone(),
            epoch,
            owner_id: identity.id.clone(),
            record_id: record_id.to_string(),
        };

        let upload = self
            .blobs
            .begin_resumable_upload(&path, blob, BlobMetadata { content_type })?;
        tracing::info!(%path, %epoch, size = transfer.size, "Upload started");

        let state = Arc::new(Mutex::new(UploadState::Pending));
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let cancel = upload.cancel.clone();
        let (tx, rx) = oneshot::channel();

        let guard = InFlight::enter(&self.in_flight);
        let blobs = self.blobs.clone();
        let task_state = state.clone();
        let task_cancel = cancel_requested.clone();
        runtime.spawn(async move {
            let outcome = drive(upload, blobs, transfer, on_progress, task_state, task_cancel).await;
            drop(guard);
            let _ = tx.send(outcome);
        });

        Ok(UploadHandle {
            path,
            epoch,
            owner_id: identity.id,
            record_id: record_id.to_string(),
            state,
            cancel_requested,
            cancel,
            outcome: rx,
        })
    }

    /// Uploads whose outcome has not been produced yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

async fn drive(
    mut upload: ResumableUpload,
    blobs: Arc<dyn BlobStore>,
    transfer: Transfer,
    on_progress: Listener<u8>,
    state: Arc<Mutex<UploadState>>,
    cancel_requested: Arc<AtomicBool>,
) -> UploadOutcome {
    let mut last_pct: Option<u8> = None;
    let mut transferred = 0u64;
    let mut report = |pct: u8| {
        if last_pct.map_or(true, |last| pct > last) {
            last_pct = Some(pct);
            on_progress(&pct);
        }
    };

    let result = loop {
        match upload.events.recv().await {
            Some(TransferEvent::Progress {
                bytes_transferred,
                total_bytes,
            }) => {
                transferred = transferred.max(bytes_transferred);
                *state.lock() = UploadState::InProgress;
                report(percent(transferred, total_bytes));
            }
            Some(TransferEvent::Complete { bytes_transferred }) => {
                transferred = transferred.max(bytes_transferred);
                report(100);
                break match blobs.resolve_download_locator(&transfer.path).await {
                    Ok(url) => UploadResult::Completed(CompletedUpload {
                        name: transfer.name.clone(),
                        path: transfer.path.clone(),
                        url,
                        size: transfer.size,
                        content_type: transfer.content_type.clone(),
                    }),
                    Err(err) => UploadResult::Failed(transfer.failure(err, transferred)),
                };
            }
            Some(TransferEvent::Failed(err)) => {
                break UploadResult::Failed(transfer.failure(err, transferred));
            }
            Some(TransferEvent::Cancelled) => break UploadResult::Cancelled,
            None if cancel_requested.load(Ordering::SeqCst) => break UploadResult::Cancelled,
            None => {
                break UploadResult::Failed(CoreError::Upload {
                    path: transfer.path.clone(),
                    bytes_transferred: transferred,
                    cause: "transfer ended without a result".to_string(),
                });
            }
        }
    };

    *state.lock() = match &result {
        UploadResult::Completed(_) => UploadState::Complete,
        UploadResult::Failed(_) => UploadState::Failed,
        UploadResult::Cancelled => UploadState::Cancelled,
    };
    match &result {
        UploadResult::Completed(done) => {
            tracing::info!(path = %done.path, size = done.size, "Upload complete")
        }
        UploadResult::Failed(err) => tracing::warn!(
            path = %transfer.path,
            code = err.error_code(),
            "Upload failed: {}",
            err
        ),
        UploadResult::Cancelled => tracing::info!(path = %transfer.path, "Upload cancelled"),
    }

    UploadOutcome {
        epoch: transfer.epoch,
        owner_id: transfer.owner_id,
        record_id: transfer.record_id,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlobStore, MemoryIdentityProvider};
    use crate::models::{Credential, Identity};
    use crate::observe::listener;
    use crate::ports::IdentityProvider;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Chart  v2.PDF"), "my-chart-v2.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a\\b/c.txt"), "abc.txt");
        assert_eq!(sanitize_filename("   "), "file");
        assert_eq!(sanitize_filename("ÄÖ"), "file");
        assert_eq!(sanitize_filename("a...b"), "a.b");
        assert_eq!(sanitize_filename("x.,.y"), "x.y");
    }

    #[test]
    fn test_object_path_layout() {
        assert_eq!(
            object_path("uploads", "u1", "p1", "tok", "Hat Pattern.pdf"),
            "uploads/u1/p1/tok-hat-pattern.pdf"
        );
    }

    #[test]
    fn test_percent_rounds_and_clamps() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(5, 3), 100);
    }

    struct Fixture {
        provider: Arc<MemoryIdentityProvider>,
        blobs: MemoryBlobStore,
        session: Arc<SessionMonitor>,
        coordinator: UploadCoordinator,
        ann: Identity,
    }

    async fn signed_in(chunk_size: usize) -> Fixture {
        let provider = Arc::new(MemoryIdentityProvider::new());
        let ann = provider.register_password_account("ann@example.com", "secret1", "Ann");
        let blobs = MemoryBlobStore::with_chunk_size(chunk_size);
        let session = Arc::new(SessionMonitor::new(provider.as_ref()));
        let coordinator = UploadCoordinator::new(Arc::new(blobs.clone()), session.clone(), "uploads");
        provider
            .sign_in_with_credential(&Credential::EmailPassword {
                email: "ann@example.com".into(),
                password: "secret1".into(),
            })
            .await
            .unwrap();
        Fixture {
            provider,
            blobs,
            session,
            coordinator,
            ann,
        }
    }

    fn progress_sink() -> (Arc<Mutex<Vec<u8>>>, Listener<u8>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, listener(move |pct: &u8| sink.lock().push(*pct)))
    }

    #[tokio::test]
    async fn test_upload_completes_with_progress() {
        let f = signed_in(4).await;
        let (seen, on_progress) = progress_sink();

        let handle = f
            .coordinator
            .start(
                Blob::new("Chart 1.txt", "0123456789").with_content_type("text/plain"),
                "p1",
                on_progress,
            )
            .unwrap();
        let path = handle.path().to_string();
        assert!(path.starts_with(&format!("uploads/{}/p1/", f.ann.id)));
        assert!(path.ends_with("-chart-1.txt"));

        let outcome = handle.result().await;
        let UploadResult::Completed(done) = outcome.clone().into_current(&f.session).unwrap() else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(done.url, format!("memory://{}", path));
        assert_eq!(done.size, 10);
        assert_eq!(done.content_type, "text/plain");
        assert_eq!(done.to_file_descriptor().name, "Chart 1.txt");
        assert_eq!(*seen.lock(), vec![0, 40, 80, 100]);
        assert_eq!(f.blobs.object(&path).unwrap().content_type, "text/plain");
        assert_eq!(f.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_requires_sign_in() {
        let f = signed_in(4).await;
        f.provider.sign_out().await.unwrap();
        let (_, on_progress) = progress_sink();
        let err = f
            .coordinator
            .start(Blob::new("a.txt", "x"), "p1", on_progress)
            .err()
            .unwrap();
        assert_eq!(err, CoreError::NotSignedIn);
    }

    #[tokio::test]
    async fn test_cancel_resolves_cancelled() {
        let f = signed_in(4).await;
        f.blobs.pause();
        let (_, on_progress) = progress_sink();
        let handle = f
            .coordinator
            .start(Blob::new("a.txt", "0123456789"), "p1", on_progress)
            .unwrap();

        handle.cancel();
        handle.cancel();
        let outcome = handle.result().await;
        assert_eq!(outcome.result, UploadResult::Cancelled);
        assert_eq!(f.blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_bytes() {
        let f = signed_in(4).await;
        f.blobs.fail_next_after(4);
        let (_, on_progress) = progress_sink();
        let handle = f
            .coordinator
            .start(Blob::new("a.txt", "0123456789"), "p1", on_progress)
            .unwrap();

        let outcome = handle.result().await;
        let UploadResult::Failed(CoreError::Upload {
            bytes_transferred,
            cause,
            ..
        }) = &outcome.result
        else {
            panic!("expected upload failure, got {:?}", outcome.result);
        };
        assert_eq!(*bytes_transferred, 4);
        assert!(cause.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_denied_path_keeps_permission_error() {
        let f = signed_in(4).await;
        f.blobs.deny_prefix("uploads/");
        let (_, on_progress) = progress_sink();
        let handle = f
            .coordinator
            .start(Blob::new("a.txt", "x"), "p1", on_progress)
            .unwrap();

        let outcome = handle.result().await;
        assert!(matches!(
            outcome.result,
            UploadResult::Failed(CoreError::Permission(_))
        ));
        assert!(matches!(
            outcome.result,
            UploadResult::Failed(ref e) if e.requires_gate_reevaluation()
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_record_id() {
        let f = signed_in(4).await;
        let (_, on_progress) = progress_sink();
        assert!(matches!(
            f.coordinator.start(Blob::new("a.txt", "x"), "a/b", on_progress),
            Err(CoreError::Validation(_))
        ));
    }
}
