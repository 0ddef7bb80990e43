//! Owner-scoped record mutations.

use std::sync::Arc;

use serde_json::Value;

use crate::clock::Clock;
use crate::errors::{CoreError, CoreResult};
use crate::models::{collections, fields, Epoch, FileDescriptor, Identity, Record};
use crate::ports::{DocumentStore, Fields};
use crate::session::SessionMonitor;
use crate::uploads::{UploadOutcome, UploadResult};

pub const DEFAULT_PROJECT_STATUS: &str = "in progress";

const STRUCTURAL: [&str; 4] = [
    fields::OWNER_ID,
    fields::CREATED_AT,
    fields::UPDATED_AT,
    fields::FILES,
];

fn strip_structural(mut attributes: Fields) -> Fields {
    for key in STRUCTURAL {
        attributes.remove(key);
    }
    attributes
}

pub struct RecordService {
    documents: Arc<dyn DocumentStore>,
    session: Arc<SessionMonitor>,
    clock: Arc<dyn Clock>,
}

impl RecordService {
    pub fn new(documents: Arc<dyn DocumentStore>, session: Arc<SessionMonitor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            documents,
            session,
            clock,
        }
    }

    /// Create a record owned by the current identity. Returns the new id.
    pub async fn create(&self, collection: &str, attributes: Fields) -> CoreResult<String> {
        let (epoch, identity) = self.session.require_identity()?;
        let mut doc = strip_structural(attributes);

        let name = doc
            .get(fields::NAME)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(CoreError::Validation("Please enter a name".to_string()));
        }
        doc.insert(fields::NAME.to_string(), Value::String(name));
        if collection == collections::PROJECTS && !doc.contains_key(fields::STATUS) {
            doc.insert(
                fields::STATUS.to_string(),
                Value::String(DEFAULT_PROJECT_STATUS.to_string()),
            );
        }

        let now = Value::String(self.clock.now().to_rfc3339());
        doc.insert(fields::OWNER_ID.to_string(), Value::String(identity.id.clone()));
        doc.insert(fields::CREATED_AT.to_string(), now.clone());
        doc.insert(fields::UPDATED_AT.to_string(), now);
        doc.insert(fields::FILES.to_string(), Value::Array(Vec::new()));

        self.session.ensure_current(epoch)?;
        let id = self.documents.create(collection, doc).await?;
        tracing::info!(%collection, %id, owner = %identity.id, "Record created");
        Ok(id)
    }

    /// Load a record owned by the current identity.
    pub async fn get(&self, collection: &str, id: &str) -> CoreResult<Record> {
        let (_, identity) = self.session.require_identity()?;
        self.load_owned(collection, id, &identity).await
    }

    /// Merge `patch` into an owned record and bump `updatedAt`.
    pub async fn update(&self, collection: &str, id: &str, patch: Fields) -> CoreResult<()> {
        let (epoch, identity) = self.session.require_identity()?;
        self.load_owned(collection, id, &identity).await?;

        let mut patch = strip_structural(patch);
        if let Some(value) = patch.get(fields::NAME) {
            let name = match value.as_str().map(str::trim) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => return Err(CoreError::Validation("Name cannot be empty".to_string())),
            };
            patch.insert(fields::NAME.to_string(), Value::String(name));
        }
        patch.insert(
            fields::UPDATED_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );

        self.write_current(epoch, collection, id, patch).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> CoreResult<()> {
        let (epoch, identity) = self.session.require_identity()?;
        self.load_owned(collection, id, &identity).await?;
        self.session.ensure_current(epoch)?;
        self.documents.delete(collection, id).await?;
        tracing::info!(%collection, %id, "Record deleted");
        Ok(())
    }

    /// Append a completed upload to the record's file list.
    ///
    /// Outcomes from an ended session are rejected with `StaleEpoch`.
    pub async fn attach_file(&self, collection: &str, outcome: UploadOutcome) -> CoreResult<FileDescriptor> {
        let epoch = outcome.epoch;
        let record_id = outcome.record_id.clone();
        let completed = match outcome.into_current(&self.session)? {
            UploadResult::Completed(completed) => completed,
            UploadResult::Failed(err) => return Err(err),
            UploadResult::Cancelled => {
                return Err(CoreError::Validation("Upload was cancelled".to_string()))
            }
        };

        let (_, identity) = self.session.require_identity()?;
        self.load_owned(collection, &record_id, &identity).await?;

        let descriptor = completed.to_file_descriptor();
        let mut stamp = Fields::new();
        stamp.insert(
            fields::UPDATED_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        self.session.ensure_current(epoch)?;
        let appended = self
            .documents
            .append_unique(
                collection,
                &record_id,
                fields::FILES,
                serde_json::to_value(&descriptor)?,
                stamp,
            )
            .await?;
        if !appended {
            tracing::debug!(%collection, record = %record_id, path = %descriptor.path, "File already attached");
            return Ok(descriptor);
        }

        tracing::info!(%collection, record = %record_id, path = %descriptor.path, "File attached");
        Ok(descriptor)
    }

    async fn load_owned(&self, collection: &str, id: &str, identity: &Identity) -> CoreResult<Record> {
        let doc = self
            .documents
            .get(collection, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{}/{}", collection, id)))?;
        let record = Record::from_document(doc);
        if !record.is_owned_by(&identity.id) {
            return Err(CoreError::Permission(format!(
                "{}/{} belongs to another account",
                collection, id
            )));
        }
        Ok(record)
    }

    async fn write_current(&self, epoch: Epoch, collection: &str, id: &str, patch: Fields) -> CoreResult<()> {
        self.session.ensure_current(epoch)?;
        self.documents.write(collection, id, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryDocumentStore, MemoryIdentityProvider};
    use crate::models::Credential;
    use crate::ports::IdentityProvider;
    use crate::ports::{DocumentQuery, Filter, LiveQuery};
    use crate::uploads::CompletedUpload;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    struct Fixture {
        provider: Arc<MemoryIdentityProvider>,
        store: MemoryDocumentStore,
        clock: Arc<ManualClock>,
        session: Arc<SessionMonitor>,
        records: RecordService,
        ann: Identity,
    }

    async fn signed_in() -> Fixture {
        let provider = Arc::new(MemoryIdentityProvider::new());
        let ann = provider.register_password_account("ann@example.com", "secret1", "Ann");
        provider.register_password_account("bob@example.com", "secret1", "Bob");
        let store = MemoryDocumentStore::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let session = Arc::new(SessionMonitor::new(provider.as_ref()));
        let records = RecordService::new(Arc::new(store.clone()), session.clone(), clock.clone());
        let f = Fixture {
            provider,
            store,
            clock,
            session,
            records,
            ann,
        };
        sign_in(&f, "ann@example.com").await;
        f
    }

    async fn sign_in(f: &Fixture, email: &str) {
        f.provider
            .sign_in_with_credential(&Credential::EmailPassword {
                email: email.into(),
                password: "secret1".into(),
            })
            .await
            .unwrap();
    }

    fn completed(f: &Fixture, record_id: &str, epoch: Epoch) -> UploadOutcome {
        completed_named(f, record_id, epoch, "chart.pdf")
    }

    fn completed_named(f: &Fixture, record_id: &str, epoch: Epoch, name: &str) -> UploadOutcome {
        UploadOutcome {
            epoch,
            owner_id: f.ann.id.clone(),
            record_id: record_id.to_string(),
            result: UploadResult::Completed(CompletedUpload {
                name: name.into(),
                path: format!("uploads/{}/{}/t-{}", f.ann.id, record_id, name),
                url: "memory://chart".into(),
                size: 3,
                content_type: "application/pdf".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_create_sets_structural_fields() {
        let f = signed_in().await;
        let id = f
            .records
            .create(
                "projects",
                fields(json!({"name": "  Cabled hat ", "ownerId": "someone-else", "notes": ""})),
            )
            .await
            .unwrap();

        let doc = f.store.document("projects", &id).unwrap();
        assert_eq!(doc["ownerId"], json!(f.ann.id));
        assert_eq!(doc["name"], "Cabled hat");
        assert_eq!(doc["status"], DEFAULT_PROJECT_STATUS);
        assert_eq!(doc["createdAt"], "2024-05-01T12:00:00+00:00");
        assert_eq!(doc["files"], json!([]));
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let f = signed_in().await;
        let err = f
            .records
            .create("stash", fields(json!({"name": "   "})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at_and_checks_owner() {
        let f = signed_in().await;
        let id = f
            .records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        f.records
            .update("projects", &id, fields(json!({"status": "done", "createdAt": "1999-01-01T00:00:00Z"})))
            .await
            .unwrap();
        let doc = f.store.document("projects", &id).unwrap();
        assert_eq!(doc["status"], "done");
        assert_eq!(doc["createdAt"], "2024-05-01T12:00:00+00:00");
        assert_eq!(doc["updatedAt"], "2024-05-01T12:05:00+00:00");

        sign_in(&f, "bob@example.com").await;
        assert!(matches!(
            f.records.update("projects", &id, Fields::new()).await,
            Err(CoreError::Permission(_))
        ));
        assert!(matches!(
            f.records.delete("projects", &id).await,
            Err(CoreError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn test_update_rejects_non_string_name() {
        let f = signed_in().await;
        let id = f
            .records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();

        for patch in [json!({"name": null}), json!({"name": 5}), json!({"name": "  "})] {
            assert!(matches!(
                f.records.update("projects", &id, fields(patch)).await,
                Err(CoreError::Validation(_))
            ));
        }
        f.records
            .update("projects", &id, fields(json!({"name": " Lace socks "})))
            .await
            .unwrap();
        assert_eq!(f.store.document("projects", &id).unwrap()["name"], "Lace socks");
    }

    #[tokio::test]
    async fn test_delete_missing_record() {
        let f = signed_in().await;
        assert!(matches!(
            f.records.delete("projects", "nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_file_appends_once() {
        let f = signed_in().await;
        let id = f
            .records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();
        let epoch = f.session.epoch();

        f.records.attach_file("projects", completed(&f, &id, epoch)).await.unwrap();
        f.records.attach_file("projects", completed(&f, &id, epoch)).await.unwrap();

        let record = f.records.get("projects", &id).await.unwrap();
        assert_eq!(record.files.len(), 1);
        assert_eq!(record.files[0].name, "chart.pdf");
    }

    /// Store whose reads yield to the scheduler before returning.
    struct YieldingStore(MemoryDocumentStore);

    #[async_trait]
    impl DocumentStore for YieldingStore {
        fn query(&self, query: &DocumentQuery) -> CoreResult<Arc<dyn LiveQuery>> {
            self.0.query(query)
        }

        async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<crate::ports::Document>> {
            let doc = self.0.get(collection, id).await;
            tokio::task::yield_now().await;
            doc
        }

        async fn find(
            &self,
            collection: &str,
            filters: &[Filter],
            limit: Option<usize>,
        ) -> CoreResult<Vec<crate::ports::Document>> {
            self.0.find(collection, filters, limit).await
        }

        async fn create(&self, collection: &str, fields: Fields) -> CoreResult<String> {
            self.0.create(collection, fields).await
        }

        async fn write(&self, collection: &str, id: &str, patch: Fields) -> CoreResult<()> {
            self.0.write(collection, id, patch).await
        }

        async fn append_unique(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            value: Value,
            patch: Fields,
        ) -> CoreResult<bool> {
            self.0.append_unique(collection, id, field, value, patch).await
        }

        async fn delete(&self, collection: &str, id: &str) -> CoreResult<()> {
            self.0.delete(collection, id).await
        }

        async fn count_of(&self, collection: &str, filters: &[Filter]) -> CoreResult<u64> {
            self.0.count_of(collection, filters).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_attaches_keep_every_file() {
        let f = signed_in().await;
        let records = RecordService::new(
            Arc::new(YieldingStore(f.store.clone())),
            f.session.clone(),
            f.clock.clone(),
        );
        let id = records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();
        let epoch = f.session.epoch();

        let (first, second) = tokio::join!(
            records.attach_file("projects", completed_named(&f, &id, epoch, "chart.pdf")),
            records.attach_file("projects", completed_named(&f, &id, epoch, "gauge.jpg")),
        );
        first.unwrap();
        second.unwrap();

        let record = records.get("projects", &id).await.unwrap();
        let mut names: Vec<String> = record.files.iter().map(|file| file.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["chart.pdf".to_string(), "gauge.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_attach_file_to_deleted_record() {
        let f = signed_in().await;
        let id = f
            .records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();
        let outcome = completed(&f, &id, f.session.epoch());
        f.records.delete("projects", &id).await.unwrap();

        assert!(matches!(
            f.records.attach_file("projects", outcome).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(f.store.document("projects", &id).is_none());
    }

    #[tokio::test]
    async fn test_attach_file_rejects_stale_outcome() {
        let f = signed_in().await;
        let id = f
            .records
            .create("projects", fields(json!({"name": "Socks"})))
            .await
            .unwrap();
        let outcome = completed(&f, &id, f.session.epoch());

        f.provider.sign_out().await.unwrap();
        sign_in(&f, "ann@example.com").await;

        assert!(matches!(
            f.records.attach_file("projects", outcome).await,
            Err(CoreError::StaleEpoch { .. })
        ));
        assert_eq!(f.store.document("projects", &id).unwrap()["files"], json!([]));
    }
}
