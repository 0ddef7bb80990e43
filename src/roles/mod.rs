//! Role resolution and administration.
//!
//! Roles live on the profile record (`users/{id}.role`). The resolver memoizes per
//! identity for a configurable TTL; a remote change is only observed after the TTL
//! elapses, after an explicit refresh, or after a sign-out/sign-in cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::clock::Clock;
use crate::errors::{CoreError, CoreResult};
use crate::gate::AccessGrant;
use crate::models::{fields, Epoch, Identity, Role, UserProfile};
use crate::observe::{listener, Unsubscribe};
use crate::ports::{DocumentStore, Fields, Filter};
use crate::session::{SessionChange, SessionMonitor};

/// Outcome of a role lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleResolution {
    /// The profile was read (or served from cache).
    Resolved(Role),
    /// The profile could not be read. `role` is always `User`.
    Defaulted { role: Role, error: CoreError },
}

impl RoleResolution {
    /// The role to act on.
    pub fn role(&self) -> Role {
        match self {
            RoleResolution::Resolved(role) => *role,
            RoleResolution::Defaulted { role, .. } => *role,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, RoleResolution::Resolved(_))
    }

    pub fn error(&self) -> Option<&CoreError> {
        match self {
            RoleResolution::Resolved(_) => None,
            RoleResolution::Defaulted { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRole {
    role: Role,
    fetched_at: DateTime<Utc>,
    epoch: Epoch,
}

type RoleCache = Arc<Mutex<HashMap<String, CachedRole>>>;

/// Fetches and caches roles.
pub struct RoleResolver {
    documents: Arc<dyn DocumentStore>,
    session: Arc<SessionMonitor>,
    clock: Arc<dyn Clock>,
    collection: String,
    ttl: Duration,
    cache: RoleCache,
    fetch_lock: tokio::sync::Mutex<()>,
    session_listener: Unsubscribe,
}

impl RoleResolver {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        session: Arc<SessionMonitor>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let cache: RoleCache = Arc::new(Mutex::new(HashMap::new()));

        let weak = Arc::downgrade(&cache);
        let session_listener = session.on_change(listener(move |change: &SessionChange| {
            let Some(cache) = weak.upgrade() else {
                return;
            };
            let keep = change.current.as_ref().map(|i| i.id.as_str());
            let mut cache = cache.lock();
            let before = cache.len();
            cache.retain(|id, _| Some(id.as_str()) == keep);
            if before != cache.len() {
                tracing::debug!(
                    epoch = %change.epoch,
                    dropped = before - cache.len(),
                    "Role cache trimmed on identity change"
                );
            }
        }));

        Self {
            documents,
            session,
            clock,
            collection: collection.into(),
            ttl,
            cache,
            fetch_lock: tokio::sync::Mutex::new(()),
            session_listener,
        }
    }

    /// Resolve the role for `identity`, at most one remote fetch per fresh cache entry.
    pub async fn resolve(&self, identity: &Identity) -> RoleResolution {
        if let Some(role) = self.fresh(&identity.id) {
            return RoleResolution::Resolved(role);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(role) = self.fresh(&identity.id) {
            return RoleResolution::Resolved(role);
        }
        self.fetch(identity).await
    }

    /// Drop the cached entry and fetch again.
    pub async fn refresh(&self, identity: &Identity) -> RoleResolution {
        self.invalidate(&identity.id);
        self.resolve(identity).await
    }

    pub fn invalidate(&self, identity_id: &str) {
        if self.cache.lock().remove(identity_id).is_some() {
            tracing::debug!(identity = identity_id, "Role cache entry invalidated");
        }
    }

    /// Cached role, if one is still within its TTL.
    pub fn cached_role(&self, identity_id: &str) -> Option<Role> {
        self.fresh(identity_id)
    }

    pub fn cached_identities(&self) -> usize {
        self.cache.lock().len()
    }

    /// Stop reacting to identity changes. Called once at shutdown.
    pub fn detach(&self) {
        self.session_listener.unsubscribe();
        self.cache.lock().clear();
    }

    fn fresh(&self, identity_id: &str) -> Option<Role> {
        let now = self.clock.now();
        let epoch = self.session.epoch();
        self.cache
            .lock()
            .get(identity_id)
            .filter(|entry| entry.epoch == epoch && now - entry.fetched_at < self.ttl)
            .map(|entry| entry.role)
    }

    async fn fetch(&self, identity: &Identity) -> RoleResolution {
        let epoch = self.session.epoch();

        match self.documents.get(&self.collection, &identity.id).await {
            Ok(profile) => {
                let role = Role::from_profile_value(
                    profile.as_ref().and_then(|doc| doc.fields.get(fields::ROLE)),
                );

                let snapshot = self.session.snapshot();
                let still_current = snapshot.epoch == epoch
                    && snapshot
                        .identity
                        .as_ref()
                        .is_some_and(|current| current.same_principal(identity));
                if still_current {
                    self.cache.lock().insert(
                        identity.id.clone(),
                        CachedRole {
                            role,
                            fetched_at: self.clock.now(),
                            epoch,
                        },
                    );
                } else {
                    tracing::warn!(
                        identity = %identity.id,
                        fetched_in = %epoch,
                        current = %snapshot.epoch,
                        "Role fetched across an identity change; not cached"
                    );
                }
                RoleResolution::Resolved(role)
            }
            Err(err) => {
                tracing::warn!(
                    identity = %identity.id,
                    code = err.error_code(),
                    "Role resolution failed, defaulting to user: {}",
                    err
                );
                RoleResolution::Defaulted {
                    role: Role::User,
                    error: CoreError::RoleResolution {
                        identity_id: identity.id.clone(),
                        cause: err.to_string(),
                    },
                }
            }
        }
    }
}

/// Administrator actions on other identities' profiles.
pub struct RoleAdmin {
    documents: Arc<dyn DocumentStore>,
    session: Arc<SessionMonitor>,
    clock: Arc<dyn Clock>,
    collection: String,
}

impl RoleAdmin {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        session: Arc<SessionMonitor>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            documents,
            session,
            clock,
            collection: collection.into(),
        }
    }

    fn authorize(&self, grant: &AccessGrant) -> CoreResult<()> {
        grant.ensure_role(Role::Admin)?;
        self.session.ensure_current(grant.epoch())
    }

    /// Set `users/{target}.role`. Takes effect for the target on their next resolution.
    pub async fn set_role(&self, grant: &AccessGrant, target_id: &str, role: Role) -> CoreResult<()> {
        self.authorize(grant)?;
        let target_id = target_id.trim();
        if target_id.is_empty() {
            return Err(CoreError::Validation("Target identity id is required".to_string()));
        }

        let mut patch = Fields::new();
        patch.insert(
            fields::ROLE.to_string(),
            Value::String(role.as_str().to_string()),
        );
        patch.insert(
            fields::UPDATED_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        self.documents
            .write(&self.collection, target_id, patch)
            .await?;

        tracing::info!(
            admin = grant.identity_id(),
            target = target_id,
            role = role.as_str(),
            "Role updated"
        );
        Ok(())
    }

    /// Look a profile up by its (lower-cased) email.
    pub async fn find_by_email(&self, grant: &AccessGrant, email: &str) -> CoreResult<Option<UserProfile>> {
        self.authorize(grant)?;
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(CoreError::Validation("Email is required".to_string()));
        }
        let docs = self
            .documents
            .find(&self.collection, &[Filter::eq(fields::EMAIL, email)], Some(1))
            .await?;
        Ok(docs.first().map(UserProfile::from_document))
    }

    pub async fn list_profiles(&self, grant: &AccessGrant) -> CoreResult<Vec<UserProfile>> {
        self.authorize(grant)?;
        let docs = self.documents.find(&self.collection, &[], None).await?;
        Ok(docs.iter().map(UserProfile::from_document).collect())
    }
}
