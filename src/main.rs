//! Skein demo
//!
//! Wires the in-memory adapters into a core context and walks through one session:
//! sign in, live projects view, create a record, attach a file, totals, sign out.

use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skein::aggregate::SumSpec;
use skein::clock::SystemClock;
use skein::config::Config;
use skein::memory::{MemoryBlobStore, MemoryDocumentStore, MemoryIdentityProvider};
use skein::models::{collections, Blob, Credential};
use skein::observe::listener;
use skein::ports::Fields;
use skein::subscriptions::{LiveEvent, QueryScope, ScopeKey};
use skein::uploads::UploadResult;
use skein::CoreContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting skein demo");
    tracing::info!("Role TTL: {}s", config.role_ttl.num_seconds());
    tracing::info!("Upload prefix: {}", config.upload_prefix);

    // Seed the in-memory identity provider
    let provider = Arc::new(MemoryIdentityProvider::new());
    provider.register_password_account("knitter@example.com", "purl-two-together", "Demo Knitter");

    let documents = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let core = CoreContext::new(config, provider, documents, blobs, Arc::new(SystemClock));

    let identity = core
        .auth
        .sign_in(&Credential::EmailPassword {
            email: "knitter@example.com".to_string(),
            password: "purl-two-together".to_string(),
        })
        .await?;

    let gate = core.signed_in_gate();
    let grant = match gate.evaluate().await.grant() {
        Some(grant) => grant.clone(),
        None => return Err("signed-in gate did not grant access".into()),
    };
    tracing::info!(identity = %identity.id, role = grant.role().as_str(), "Access granted");

    let projects = core.subscriptions.subscribe(
        QueryScope::owned(collections::PROJECTS),
        listener(|event: &LiveEvent| match event {
            LiveEvent::Snapshot(snapshot) => {
                tracing::info!(count = snapshot.len(), "Projects snapshot")
            }
            LiveEvent::Error(err) => tracing::warn!("Projects view error: {}", err),
            LiveEvent::Ended => tracing::info!("Projects view ended"),
        }),
    )?;

    let mut attributes = Fields::new();
    attributes.insert("name".to_string(), json!("Cabled hat"));
    attributes.insert("notes".to_string(), json!("Worsted, 4.5mm"));
    let project_id = core.records.create(collections::PROJECTS, attributes).await?;

    let upload = core.uploads.start(
        Blob::new("Hat Chart.txt", "k2, p2 repeat to end").with_content_type("text/plain"),
        &project_id,
        listener(|pct: &u8| tracing::debug!(percent = *pct, "Upload progress")),
    )?;
    let outcome = upload.result().await;
    if matches!(outcome.result, UploadResult::Completed(_)) {
        let file = core.records.attach_file(collections::PROJECTS, outcome).await?;
        tracing::info!(path = %file.path, url = %file.url, "Attached file");
    } else {
        tracing::warn!(?outcome, "Upload did not complete");
    }

    if let Some(aggregate) = core
        .aggregates
        .derive(&ScopeKey::owned(collections::PROJECTS), &SumSpec::field("rows"))
    {
        tracing::info!(count = aggregate.count, "Projects aggregate");
    }
    let totals = core.totals(&grant).await?;
    tracing::info!(?totals, "Dashboard totals");

    projects.unsubscribe();
    core.auth.sign_out().await?;
    core.shutdown();

    Ok(())
}
