//! Live-query subscriptions keyed by scope and epoch.
//!
//! Each `(scope, epoch)` pair owns at most one live channel to the document store.
//! Subscribers of the same pair share the channel. When the epoch ends every
//! channel it owns is closed before a channel for the next epoch is opened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::errors::{CoreError, CoreResult};
use crate::gate::AccessGrant;
use crate::models::{fields, snapshot_order, Epoch, Identity, Record, Role};
use crate::observe::{listener, Listener, ListenerSet, Unsubscribe};
use crate::ports::{Document, DocumentQuery, DocumentStore, Filter, OrderBy};
use crate::session::{SessionChange, SessionMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Records whose `ownerId` is the current identity.
    Owned,
    /// Every record in the collection. Admin only.
    Global,
}

/// Identifies one logical view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub collection: String,
    pub visibility: Visibility,
}

impl ScopeKey {
    pub fn owned(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            visibility: Visibility::Owned,
        }
    }

    pub fn global(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            visibility: Visibility::Global,
        }
    }
}

/// A subscribable scope. Global scopes carry the epoch of the admin grant they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    key: ScopeKey,
    grant_epoch: Option<Epoch>,
}

impl QueryScope {
    pub fn owned(collection: impl Into<String>) -> Self {
        Self {
            key: ScopeKey::owned(collection),
            grant_epoch: None,
        }
    }

    pub fn global(collection: impl Into<String>, grant: &AccessGrant) -> CoreResult<Self> {
        grant.ensure_role(Role::Admin)?;
        Ok(Self {
            key: ScopeKey::global(collection),
            grant_epoch: Some(grant.epoch()),
        })
    }

    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    fn to_query(&self, identity: &Identity) -> DocumentQuery {
        let filters = match self.key.visibility {
            Visibility::Owned => vec![Filter::eq(fields::OWNER_ID, identity.id.clone())],
            Visibility::Global => Vec::new(),
        };
        DocumentQuery {
            collection: self.key.collection.clone(),
            filters,
            order_by: Some(OrderBy {
                field: fields::CREATED_AT.to_string(),
                descending: true,
            }),
        }
    }
}

/// Full result set of one view at one point in time, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: ScopeKey,
    pub epoch: Epoch,
    pub records: Vec<Record>,
}

impl Snapshot {
    fn from_documents(key: ScopeKey, epoch: Epoch, docs: Vec<Document>) -> Self {
        let mut records: Vec<Record> = docs.into_iter().map(Record::from_document).collect();
        records.sort_by(snapshot_order);
        Self { key, epoch, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }
}

/// Delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Snapshot(Snapshot),
    Error(CoreError),
    /// The channel was closed by an identity change or shutdown.
    Ended,
}

struct Channel {
    id: u64,
    key: ScopeKey,
    epoch: Epoch,
    listeners: ListenerSet<LiveEvent>,
    latest: Mutex<Option<Snapshot>>,
    upstream: Mutex<Option<Unsubscribe>>,
    closed: AtomicBool,
    denials: Weak<ListenerSet<CoreError>>,
}

impl Channel {
    fn deliver(&self, result: CoreResult<Vec<Document>>) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(channel = self.id, "Dropping event for closed channel");
            return;
        }
        let event = match result {
            Ok(docs) => {
                let snapshot = Snapshot::from_documents(self.key.clone(), self.epoch, docs);
                *self.latest.lock() = Some(snapshot.clone());
                LiveEvent::Snapshot(snapshot)
            }
            Err(err) => {
                tracing::warn!(
                    channel = self.id,
                    collection = %self.key.collection,
                    code = err.error_code(),
                    "Live query error: {}",
                    err
                );
                LiveEvent::Error(err)
            }
        };
        self.listeners.emit(&event);
        if let LiveEvent::Error(err) = &event {
            if err.requires_gate_reevaluation() {
                if let Some(denials) = self.denials.upgrade() {
                    denials.emit(err);
                }
            }
        }
    }

    fn attach(&self, upstream: Unsubscribe) {
        if self.closed.load(Ordering::SeqCst) {
            upstream.unsubscribe();
            return;
        }
        *self.upstream.lock() = Some(upstream);
        // Closed between the check and the store.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(upstream) = self.upstream.lock().take() {
                upstream.unsubscribe();
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.unsubscribe();
        }
        tracing::debug!(
            channel = self.id,
            collection = %self.key.collection,
            epoch = %self.epoch,
            "Live channel closed"
        );
        self.listeners.emit(&LiveEvent::Ended);
        self.listeners.clear();
        self.latest.lock().take();
    }
}

type ChannelKey = (ScopeKey, Epoch);

#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelKey, Arc<Channel>>,
    next_id: u64,
}

impl Registry {
    fn take_where<F>(&mut self, pred: F) -> Vec<Arc<Channel>>
    where
        F: Fn(&ChannelKey) -> bool,
    {
        let keys: Vec<ChannelKey> = self.channels.keys().filter(|k| pred(k)).cloned().collect();
        keys.into_iter()
            .filter_map(|k| self.channels.remove(&k))
            .collect()
    }
}

fn close_all(channels: Vec<Arc<Channel>>) {
    for channel in channels {
        channel.close();
    }
}

/// Owns every live channel.
pub struct SubscriptionManager {
    documents: Arc<dyn DocumentStore>,
    session: Arc<SessionMonitor>,
    registry: Arc<Mutex<Registry>>,
    denials: Arc<ListenerSet<CoreError>>,
    session_listener: Unsubscribe,
}

impl SubscriptionManager {
    pub fn new(documents: Arc<dyn DocumentStore>, session: Arc<SessionMonitor>) -> Self {
        let registry: Arc<Mutex<Registry>> = Arc::new(Mutex::new(Registry::default()));

        let weak = Arc::downgrade(&registry);
        let session_listener = session.on_change(listener(move |change: &SessionChange| {
            if let Some(registry) = weak.upgrade() {
                let stale = registry.lock().take_where(|(_, epoch)| *epoch != change.epoch);
                if !stale.is_empty() {
                    tracing::debug!(
                        epoch = %change.epoch,
                        closed = stale.len(),
                        "Closing live channels of ended epoch"
                    );
                }
                close_all(stale);
            }
        }));

        Self {
            documents,
            session,
            registry,
            denials: Arc::new(ListenerSet::new()),
            session_listener,
        }
    }

    /// Called with every permission error a live channel reports, after the
    /// channel's own subscribers have seen it.
    pub fn on_permission_error(&self, listener: Listener<CoreError>) -> Unsubscribe {
        self.denials.add(listener)
    }

    /// Subscribe to `scope` in the current epoch.
    pub fn subscribe(&self, scope: QueryScope, on_update: Listener<LiveEvent>) -> CoreResult<Unsubscribe> {
        let (epoch, identity) = self.session.require_identity()?;
        if let Some(grant_epoch) = scope.grant_epoch {
            if grant_epoch != epoch {
                return Err(CoreError::StaleEpoch {
                    origin: grant_epoch,
                    current: epoch,
                });
            }
        }

        let stale = self.registry.lock().take_where(|(_, e)| *e != epoch);
        close_all(stale);

        let channel_key: ChannelKey = (scope.key.clone(), epoch);
        let (channel, handle, opened) = {
            let mut registry = self.registry.lock();
            let (channel, opened) = match registry.channels.get(&channel_key) {
                Some(channel) => (channel.clone(), false),
                None => {
                    let id = registry.next_id;
                    registry.next_id += 1;
                    let channel = Arc::new(Channel {
                        id,
                        key: scope.key.clone(),
                        epoch,
                        listeners: ListenerSet::new(),
                        latest: Mutex::new(None),
                        upstream: Mutex::new(None),
                        closed: AtomicBool::new(false),
                        denials: Arc::downgrade(&self.denials),
                    });
                    registry.channels.insert(channel_key.clone(), channel.clone());
                    (channel, true)
                }
            };
            let handle = channel.listeners.add(on_update.clone());
            (channel, handle, opened)
        };

        if opened {
            if let Err(err) = self.open(&channel, &scope, &identity) {
                self.release(&channel_key, &channel);
                channel.close();
                return Err(err);
            }
            tracing::debug!(
                channel = channel.id,
                collection = %scope.key.collection,
                %epoch,
                "Live channel opened"
            );
        } else {
            let latest = channel.latest.lock().clone();
            if let Some(snapshot) = latest {
                on_update(&LiveEvent::Snapshot(snapshot));
            }
        }

        let registry = Arc::downgrade(&self.registry);
        Ok(Unsubscribe::new(move || {
            handle.unsubscribe();
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let last = {
                let mut registry = registry.lock();
                let ours = registry
                    .channels
                    .get(&channel_key)
                    .is_some_and(|c| c.id == channel.id);
                if ours && channel.listeners.is_empty() {
                    registry.channels.remove(&channel_key);
                    true
                } else {
                    false
                }
            };
            if last {
                channel.close();
            }
        }))
    }

    fn open(&self, channel: &Arc<Channel>, scope: &QueryScope, identity: &Identity) -> CoreResult<()> {
        let live = self.documents.query(&scope.to_query(identity))?;
        let weak: Weak<Channel> = Arc::downgrade(channel);
        let upstream = live.on_snapshot(Box::new(move |result| {
            if let Some(channel) = weak.upgrade() {
                channel.deliver(result);
            }
        }));
        channel.attach(upstream);
        Ok(())
    }

    fn release(&self, channel_key: &ChannelKey, channel: &Channel) {
        let mut registry = self.registry.lock();
        if registry
            .channels
            .get(channel_key)
            .is_some_and(|c| c.id == channel.id)
        {
            registry.channels.remove(channel_key);
        }
    }

    /// Latest snapshot of `key` in the current epoch.
    pub fn latest(&self, key: &ScopeKey) -> Option<Snapshot> {
        let epoch = self.session.epoch();
        let channel = self
            .registry
            .lock()
            .channels
            .get(&(key.clone(), epoch))
            .cloned()?;
        let latest = channel.latest.lock().clone();
        latest
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().channels.len()
    }

    /// Close every channel. Subscribers receive [`LiveEvent::Ended`].
    pub fn teardown_all(&self) {
        let all = self.registry.lock().take_where(|_| true);
        if !all.is_empty() {
            tracing::info!(closed = all.len(), "Tearing down live channels");
        }
        close_all(all);
    }

    pub fn detach(&self) {
        self.session_listener.unsubscribe();
    }
}
