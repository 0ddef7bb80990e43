//! In-memory identity provider.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::constant_time_compare;
use crate::errors::{CoreError, CoreResult};
use crate::models::{Credential, Identity, Provenance};
use crate::observe::{Listener, ListenerSet, Unsubscribe};
use crate::ports::IdentityProvider;

const MIN_PASSWORD_LEN: usize = 6;

struct PasswordAccount {
    password: String,
    identity: Identity,
}

#[derive(Default)]
struct ProviderState {
    accounts: HashMap<String, PasswordAccount>,
    federated: HashMap<(String, String), Identity>,
    current: Option<Identity>,
}

/// Identity provider backed by a local account table.
pub struct MemoryIdentityProvider {
    state: Mutex<ProviderState>,
    listeners: ListenerSet<Option<Identity>>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState::default()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn register_password_account(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Identity {
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.trim().to_lowercase()),
            display_name: Some(display_name.to_string()).filter(|n| !n.is_empty()),
            provenance: Provenance::Password,
        };
        self.state.lock().accounts.insert(
            email.trim().to_lowercase(),
            PasswordAccount {
                password: password.to_string(),
                identity: identity.clone(),
            },
        );
        identity
    }

    pub fn register_federated_account(
        &self,
        provider: &str,
        token: &str,
        email: &str,
        display_name: &str,
    ) -> Identity {
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.trim().to_lowercase()),
            display_name: Some(display_name.to_string()).filter(|n| !n.is_empty()),
            provenance: Provenance::Federated {
                provider: provider.to_string(),
            },
        };
        self.state
            .lock()
            .federated
            .insert((provider.to_string(), token.to_string()), identity.clone());
        identity
    }

    /// Re-deliver the current state, as a token refresh does.
    pub fn refresh_token(&self) {
        let current = self.state.lock().current.clone();
        self.listeners.emit(&current);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn authenticate(&self, credential: &Credential) -> CoreResult<Identity> {
        let mut state = self.state.lock();
        match credential {
            Credential::EmailPassword { email, password } => {
                let account = state
                    .accounts
                    .get(&email.trim().to_lowercase())
                    .ok_or_else(|| CoreError::auth("auth/invalid-credential"))?;
                if constant_time_compare(password, &account.password) {
                    Ok(account.identity.clone())
                } else {
                    Err(CoreError::auth("auth/invalid-credential"))
                }
            }
            Credential::CreateAccount { email, password } => {
                let key = email.trim().to_lowercase();
                if key.is_empty() || !key.contains('@') {
                    return Err(CoreError::auth("auth/invalid-email"));
                }
                if state.accounts.contains_key(&key) {
                    return Err(CoreError::auth("auth/email-already-in-use"));
                }
                if password.chars().count() < MIN_PASSWORD_LEN {
                    return Err(CoreError::auth("auth/weak-password"));
                }
                let identity = Identity {
                    id: uuid::Uuid::new_v4().to_string(),
                    email: Some(key.clone()),
                    display_name: None,
                    provenance: Provenance::Password,
                };
                state.accounts.insert(
                    key,
                    PasswordAccount {
                        password: password.clone(),
                        identity: identity.clone(),
                    },
                );
                Ok(identity)
            }
            Credential::Federated { provider, token } => state
                .federated
                .get(&(provider.clone(), token.clone()))
                .cloned()
                .ok_or_else(|| CoreError::auth("auth/invalid-credential")),
        }
    }
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn sign_in_with_credential(&self, credential: &Credential) -> CoreResult<Identity> {
        let identity = self.authenticate(credential)?;
        self.state.lock().current = Some(identity.clone());
        self.listeners.emit(&Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> CoreResult<()> {
        self.state.lock().current = None;
        self.listeners.emit(&None);
        Ok(())
    }

    fn on_state_change(&self, listener: Listener<Option<Identity>>) -> Unsubscribe {
        let handle = self.listeners.add(listener.clone());
        let current = self.state.lock().current.clone();
        listener(&current);
        handle
    }
}
