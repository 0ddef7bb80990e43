//! Access gate.
//!
//! Decides whether the current identity may see a protected view. The decision is
//! bound to the epoch it was made in and reads as `Unresolved` once that epoch ends.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{CoreError, CoreResult};
use crate::models::{Epoch, Role};
use crate::observe::{listener, Listener, ListenerSet, Unsubscribe};
use crate::roles::{RoleResolution, RoleResolver};
use crate::session::{SessionChange, SessionMonitor};
use crate::subscriptions::SubscriptionManager;

/// What a protected view needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    SignedIn,
    Role(Role),
}

/// Proof that the gate granted access in a given epoch.
///
/// Only the gate constructs grants. Holders pass them to admin-only operations,
/// which re-check the epoch before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    epoch: Epoch,
    identity_id: String,
    role: Role,
}

impl AccessGrant {
    pub(crate) fn new(epoch: Epoch, identity_id: impl Into<String>, role: Role) -> Self {
        Self {
            epoch,
            identity_id: identity_id.into(),
            role,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn ensure_role(&self, required: Role) -> CoreResult<()> {
        if self.role.satisfies(required) {
            Ok(())
        } else {
            Err(CoreError::Permission(format!(
                "{} role required",
                required.as_str()
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    SignedOut,
    InsufficientRole { required: Role, actual: Role },
    /// The role could not be read; access is refused rather than assumed.
    RoleUnavailable(CoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateState {
    Unresolved,
    Denied(DenyReason),
    Granted(AccessGrant),
}

impl GateState {
    pub fn is_granted(&self) -> bool {
        matches!(self, GateState::Granted(_))
    }

    pub fn grant(&self) -> Option<&AccessGrant> {
        match self {
            GateState::Granted(grant) => Some(grant),
            _ => None,
        }
    }
}

struct Decision {
    epoch: Epoch,
    state: GateState,
}

#[derive(Default)]
struct GateInner {
    generation: u64,
    decision: Option<Decision>,
}

struct GateShared {
    inner: Mutex<GateInner>,
    listeners: ListenerSet<GateState>,
}

impl GateShared {
    /// Forget the current decision. Any evaluation in flight is abandoned.
    fn reset(&self) {
        let was_decided = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.decision.take().is_some()
        };
        if was_decided {
            self.listeners.emit(&GateState::Unresolved);
        }
    }

    /// Reset on a permission error, dropping the cached role so the next
    /// evaluation reads it again.
    fn deny(&self, session: &SessionMonitor, roles: &RoleResolver, error: &CoreError) -> bool {
        if !error.requires_gate_reevaluation() {
            return false;
        }
        if let Some(identity) = session.current() {
            roles.invalidate(&identity.id);
        }
        tracing::warn!(
            code = error.error_code(),
            "Permission error from gated operation; gate reset"
        );
        self.reset();
        true
    }
}

pub struct AccessGate {
    session: Arc<SessionMonitor>,
    roles: Arc<RoleResolver>,
    requirement: Requirement,
    shared: Arc<GateShared>,
    session_listener: Unsubscribe,
    error_sources: Vec<Unsubscribe>,
}

impl AccessGate {
    pub fn new(session: Arc<SessionMonitor>, roles: Arc<RoleResolver>, requirement: Requirement) -> Self {
        let shared = Arc::new(GateShared {
            inner: Mutex::new(GateInner::default()),
            listeners: ListenerSet::new(),
        });

        let weak = Arc::downgrade(&shared);
        let session_listener = session.on_change(listener(move |_: &SessionChange| {
            if let Some(shared) = weak.upgrade() {
                shared.reset();
            }
        }));

        Self {
            session,
            roles,
            requirement,
            shared,
            session_listener,
            error_sources: Vec::new(),
        }
    }

    /// Reset whenever a live channel of `subscriptions` reports a permission error.
    pub fn watching(mut self, subscriptions: &SubscriptionManager) -> Self {
        let weak = Arc::downgrade(&self.shared);
        let session = Arc::downgrade(&self.session);
        let roles = Arc::downgrade(&self.roles);
        let handle = subscriptions.on_permission_error(listener(move |err: &CoreError| {
            if let (Some(shared), Some(session), Some(roles)) =
                (weak.upgrade(), session.upgrade(), roles.upgrade())
            {
                shared.deny(&session, &roles, err);
            }
        }));
        self.error_sources.push(handle);
        self
    }

    pub fn requirement(&self) -> Requirement {
        self.requirement
    }

    /// Current decision, `Unresolved` if none was made in this epoch.
    pub fn state(&self) -> GateState {
        let epoch = self.session.epoch();
        match &self.shared.inner.lock().decision {
            Some(decision) if decision.epoch == epoch => decision.state.clone(),
            _ => GateState::Unresolved,
        }
    }

    /// Evaluate the requirement against the current identity.
    pub async fn evaluate(&self) -> GateState {
        let snapshot = self.session.snapshot();
        let epoch = snapshot.epoch;
        let (generation, was_decided) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            (inner.generation, inner.decision.take().is_some())
        };
        if was_decided {
            self.shared.listeners.emit(&GateState::Unresolved);
        }

        let Some(identity) = snapshot.identity else {
            return self.settle(generation, epoch, GateState::Denied(DenyReason::SignedOut));
        };

        let resolution = self.roles.resolve(&identity).await;
        let state = match (self.requirement, resolution) {
            (Requirement::SignedIn, resolution) => {
                GateState::Granted(AccessGrant::new(epoch, identity.id, resolution.role()))
            }
            (Requirement::Role(required), RoleResolution::Resolved(actual)) => {
                if actual.satisfies(required) {
                    GateState::Granted(AccessGrant::new(epoch, identity.id, actual))
                } else {
                    GateState::Denied(DenyReason::InsufficientRole { required, actual })
                }
            }
            (Requirement::Role(_), RoleResolution::Defaulted { error, .. }) => {
                GateState::Denied(DenyReason::RoleUnavailable(error))
            }
        };

        self.settle(generation, epoch, state)
    }

    /// React to an error from a gated operation. Returns whether the gate was reset.
    pub fn report_permission_error(&self, error: &CoreError) -> bool {
        self.shared.deny(&self.session, &self.roles, error)
    }

    pub fn on_change(&self, listener: Listener<GateState>) -> Unsubscribe {
        self.shared.listeners.add(listener)
    }

    pub fn detach(&self) {
        self.session_listener.unsubscribe();
        for source in &self.error_sources {
            source.unsubscribe();
        }
    }

    fn settle(&self, generation: u64, epoch: Epoch, state: GateState) -> GateState {
        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || !self.session.is_current(epoch) {
                tracing::debug!(%epoch, "Discarding gate decision from superseded evaluation");
                return match &inner.decision {
                    Some(decision) if self.session.is_current(decision.epoch) => {
                        decision.state.clone()
                    }
                    _ => GateState::Unresolved,
                };
            }
            inner.decision = Some(Decision {
                epoch,
                state: state.clone(),
            });
        }

        self.shared.listeners.emit(&state);
        state
    }
}

impl Drop for AccessGate {
    fn drop(&mut self) {
        self.detach();
    }
}
