//! Sign-in flow.
//!
//! Signs in through the identity provider, then makes sure the identity has a profile
//! record. The profile is created exactly once, on first sign-in, with role `user`.

use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::errors::CoreResult;
use crate::models::{profile_create_fields, profile_refresh_fields, Credential, Identity};
use crate::ports::{DocumentStore, IdentityProvider};

/// What ensure-profile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStatus {
    Created,
    Refreshed,
}

/// Sign-in / sign-out entry points for the presentation layer.
pub struct AuthFlow {
    provider: Arc<dyn IdentityProvider>,
    documents: Arc<dyn DocumentStore>,
    profile_collection: String,
    clock: Arc<dyn Clock>,
}

impl AuthFlow {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        documents: Arc<dyn DocumentStore>,
        profile_collection: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            documents,
            profile_collection: profile_collection.into(),
            clock,
        }
    }

    /// Sign in and ensure the profile record. Provider rejections are returned as-is.
    pub async fn sign_in(&self, credential: &Credential) -> CoreResult<Identity> {
        let identity = self
            .provider
            .sign_in_with_credential(credential)
            .await
            .inspect_err(|e| tracing::warn!(code = e.error_code(), "Sign-in rejected: {}", e))?;

        let status = ensure_profile(
            self.documents.as_ref(),
            &self.profile_collection,
            &identity,
            self.clock.as_ref(),
        )
        .await?;
        tracing::info!(identity = %identity.id, ?status, "Signed in");

        Ok(identity)
    }

    pub async fn sign_out(&self) -> CoreResult<()> {
        self.provider.sign_out().await?;
        tracing::info!("Signed out");
        Ok(())
    }
}

/// Create the profile on first sign-in, otherwise refresh email and display name.
pub async fn ensure_profile(
    documents: &dyn DocumentStore,
    collection: &str,
    identity: &Identity,
    clock: &dyn Clock,
) -> CoreResult<ProfileStatus> {
    let now = clock.now();
    match documents.get(collection, &identity.id).await? {
        None => {
            documents
                .write(collection, &identity.id, profile_create_fields(identity, now))
                .await?;
            tracing::info!(identity = %identity.id, "Created profile");
            Ok(ProfileStatus::Created)
        }
        Some(_) => {
            documents
                .write(collection, &identity.id, profile_refresh_fields(identity, now))
                .await?;
            Ok(ProfileStatus::Refreshed)
        }
    }
}

/// Perform constant-time string comparison.
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    a_bytes.ct_eq(b_bytes).into()
}
