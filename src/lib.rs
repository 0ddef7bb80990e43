//! Skein core
//!
//! Session, authorization and live-sync core for a craft-project client. The
//! presentation layer calls into a [`CoreContext`]; the identity provider, document
//! store and blob store are reached through the traits in [`ports`].

pub mod aggregate;
pub mod auth;
pub mod clock;
pub mod config;
pub mod errors;
pub mod gate;
pub mod memory;
pub mod models;
pub mod observe;
pub mod ports;
pub mod records;
pub mod roles;
pub mod session;
pub mod subscriptions;
pub mod uploads;

use std::sync::Arc;

use clock::Clock;
use config::Config;
use gate::{AccessGate, Requirement};
use models::Role;
use ports::{BlobStore, DocumentStore, IdentityProvider};

/// Everything the presentation layer needs, constructed once at start-up.
pub struct CoreContext {
    pub config: Arc<Config>,
    pub provider: Arc<dyn IdentityProvider>,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
    pub session: Arc<session::SessionMonitor>,
    pub roles: Arc<roles::RoleResolver>,
    pub role_admin: roles::RoleAdmin,
    pub subscriptions: Arc<subscriptions::SubscriptionManager>,
    pub aggregates: aggregate::AggregationEngine,
    pub uploads: uploads::UploadCoordinator,
    pub auth: auth::AuthFlow,
    pub records: records::RecordService,
}

impl CoreContext {
    pub fn new(
        config: Config,
        provider: Arc<dyn IdentityProvider>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let session = Arc::new(session::SessionMonitor::new(provider.as_ref()));
        let roles = Arc::new(roles::RoleResolver::new(
            documents.clone(),
            session.clone(),
            clock.clone(),
            config.profile_collection.clone(),
            config.role_ttl,
        ));
        let role_admin = roles::RoleAdmin::new(
            documents.clone(),
            session.clone(),
            clock.clone(),
            config.profile_collection.clone(),
        );
        let subscriptions = Arc::new(subscriptions::SubscriptionManager::new(
            documents.clone(),
            session.clone(),
        ));
        let aggregates = aggregate::AggregationEngine::new(subscriptions.clone());
        let uploads = uploads::UploadCoordinator::new(
            blobs.clone(),
            session.clone(),
            config.upload_prefix.clone(),
        );
        let auth = auth::AuthFlow::new(
            provider.clone(),
            documents.clone(),
            config.profile_collection.clone(),
            clock.clone(),
        );
        let records = records::RecordService::new(documents.clone(), session.clone(), clock.clone());

        tracing::info!(
            role_ttl_secs = config.role_ttl.num_seconds(),
            upload_prefix = %config.upload_prefix,
            "Core context ready"
        );

        Self {
            config,
            provider,
            documents,
            blobs,
            clock,
            session,
            roles,
            role_admin,
            subscriptions,
            aggregates,
            uploads,
            auth,
            records,
        }
    }

    /// Gate for admin-only views. Permission errors from live queries reset it.
    pub fn admin_gate(&self) -> AccessGate {
        AccessGate::new(self.session.clone(), self.roles.clone(), Requirement::Role(Role::Admin))
            .watching(&self.subscriptions)
    }

    /// Gate for views that only need someone signed in.
    pub fn signed_in_gate(&self) -> AccessGate {
        AccessGate::new(self.session.clone(), self.roles.clone(), Requirement::SignedIn)
            .watching(&self.subscriptions)
    }

    /// Dashboard totals for the holder of `grant`.
    pub async fn totals(&self, grant: &gate::AccessGrant) -> errors::CoreResult<aggregate::Totals> {
        aggregate::fetch_totals(self.documents.as_ref(), &self.session, grant).await
    }

    /// Close every live channel and stop listening to the identity provider.
    pub fn shutdown(&self) {
        self.subscriptions.teardown_all();
        self.subscriptions.detach();
        self.roles.detach();
        self.session.detach();
        tracing::info!("Core context shut down");
    }
}
