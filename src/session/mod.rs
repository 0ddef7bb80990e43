//! Session monitor.
//!
//! Tracks the current identity reported by the identity provider and the identity
//! epoch. Every epoch-bound consumer reads the epoch when it acquires a resource and
//! compares it again before acting on a delayed result.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::errors::{CoreError, CoreResult};
use crate::models::{Epoch, Identity};
use crate::observe::{listener, Listener, ListenerSet, Unsubscribe};
use crate::ports::IdentityProvider;

/// Delivered to listeners on every identity change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChange {
    pub previous: Option<Identity>,
    pub current: Option<Identity>,
    pub epoch: Epoch,
}

impl SessionChange {
    pub fn is_sign_out(&self) -> bool {
        self.current.is_none()
    }
}

/// Identity and epoch read together.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub epoch: Epoch,
    pub identity: Option<Identity>,
}

struct SessionState {
    epoch: Epoch,
    identity: Option<Identity>,
}

struct Shared {
    state: Mutex<SessionState>,
    listeners: ListenerSet<SessionChange>,
}

impl Shared {
    fn apply(&self, next: Option<Identity>) {
        let change = {
            let mut state = self.state.lock();
            let unchanged = match (&state.identity, &next) {
                (None, None) => true,
                (Some(current), Some(next)) => current.same_principal(next),
                _ => false,
            };
            if unchanged {
                return;
            }
            let previous = std::mem::replace(&mut state.identity, next.clone());
            state.epoch = state.epoch.next();
            SessionChange {
                previous,
                current: next,
                epoch: state.epoch,
            }
        };

        tracing::info!(
            epoch = %change.epoch,
            identity = change.current.as_ref().map(|i| i.id.as_str()).unwrap_or("<none>"),
            "Identity changed"
        );
        self.listeners.emit(&change);
    }
}

/// Current identity plus epoch counter.
pub struct SessionMonitor {
    shared: Arc<Shared>,
    registration: Mutex<Option<Unsubscribe>>,
}

impl SessionMonitor {
    /// Register with the provider. Exactly one provider listener is held per monitor.
    pub fn new(provider: &dyn IdentityProvider) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                epoch: Epoch::ZERO,
                identity: None,
            }),
            listeners: ListenerSet::new(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let registration = provider.on_state_change(listener(move |next: &Option<Identity>| {
            if let Some(shared) = weak.upgrade() {
                shared.apply(next.clone());
            }
        }));

        Self {
            shared,
            registration: Mutex::new(Some(registration)),
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.shared.state.lock().identity.clone()
    }

    pub fn epoch(&self) -> Epoch {
        self.shared.state.lock().epoch
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state.lock();
        SessionSnapshot {
            epoch: state.epoch,
            identity: state.identity.clone(),
        }
    }

    /// The signed-in identity together with its epoch.
    pub fn require_identity(&self) -> CoreResult<(Epoch, Identity)> {
        let state = self.shared.state.lock();
        match &state.identity {
            Some(identity) => Ok((state.epoch, identity.clone())),
            None => Err(CoreError::NotSignedIn),
        }
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch() == epoch
    }

    pub fn ensure_current(&self, origin: Epoch) -> CoreResult<()> {
        let current = self.epoch();
        if current == origin {
            Ok(())
        } else {
            Err(CoreError::StaleEpoch { origin, current })
        }
    }

    pub fn on_change(&self, listener: Listener<SessionChange>) -> Unsubscribe {
        self.shared.listeners.add(listener)
    }

    /// Stop listening to the provider. Called once at shutdown.
    pub fn detach(&self) {
        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.unsubscribe();
            tracing::info!("Session monitor detached from identity provider");
        }
    }
}
