//! Counts and numeric rollups over live snapshots, plus dashboard totals.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::errors::CoreResult;
use crate::gate::AccessGrant;
use crate::models::{collections, fields, Record};
use crate::observe::{listener, Listener, Unsubscribe};
use crate::ports::{DocumentStore, Filter};
use crate::session::SessionMonitor;
use crate::subscriptions::{LiveEvent, QueryScope, ScopeKey, Snapshot, SubscriptionManager};

/// One numeric factor read from a record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMeasure {
    /// Field names tried in order; the first one present wins.
    pub aliases: Vec<String>,
    /// Used when no alias is present or the value is not a finite number.
    pub fallback: f64,
}

impl FieldMeasure {
    pub fn new(aliases: &[&str], fallback: f64) -> Self {
        Self {
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            fallback: if fallback.is_finite() { fallback } else { 0.0 },
        }
    }

    pub fn read(&self, record: &Record) -> f64 {
        self.aliases
            .iter()
            .find_map(|alias| record.attribute(alias).filter(|v| !v.is_null()))
            .and_then(coerce)
            .unwrap_or(self.fallback)
    }
}

fn coerce(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Sum over records of the product of `factors`.
#[derive(Debug, Clone, PartialEq)]
pub struct SumSpec {
    pub factors: Vec<FieldMeasure>,
}

impl SumSpec {
    pub fn product(factors: Vec<FieldMeasure>) -> Self {
        Self { factors }
    }

    /// Sum of a single field, missing values counting as zero.
    pub fn field(name: &str) -> Self {
        Self::product(vec![FieldMeasure::new(&[name], 0.0)])
    }

    /// Total yardage of a stash: quantity (default 1) times yards per skein (default 0).
    pub fn stash_yardage() -> Self {
        Self::product(vec![
            FieldMeasure::new(&["qty", "quantity"], 1.0),
            FieldMeasure::new(&["yardsPerSkein", "yards"], 0.0),
        ])
    }

    fn value_of(&self, record: &Record) -> f64 {
        self.factors.iter().map(|m| m.read(record)).product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub count: usize,
    pub sum: f64,
}

/// Count and sum of one snapshot. Never fails, never returns a non-finite sum.
pub fn aggregate(snapshot: &Snapshot, spec: &SumSpec) -> Aggregate {
    let sum = snapshot
        .records
        .iter()
        .map(|record| spec.value_of(record))
        .filter(|v| v.is_finite())
        .fold(0.0, |acc, v| {
            let next = acc + v;
            if next.is_finite() {
                next
            } else {
                acc
            }
        });
    Aggregate {
        count: snapshot.len(),
        sum,
    }
}

/// Aggregates derived from the subscription manager's live state.
pub struct AggregationEngine {
    subscriptions: Arc<SubscriptionManager>,
}

impl AggregationEngine {
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self { subscriptions }
    }

    /// Aggregate of the latest snapshot for `key`, if the view is live.
    pub fn derive(&self, key: &ScopeKey, spec: &SumSpec) -> Option<Aggregate> {
        self.subscriptions
            .latest(key)
            .map(|snapshot| aggregate(&snapshot, spec))
    }

    /// Subscribe to `scope` and push a fresh aggregate on every snapshot.
    pub fn track(
        &self,
        scope: QueryScope,
        spec: SumSpec,
        on_aggregate: Listener<Aggregate>,
    ) -> CoreResult<Unsubscribe> {
        self.subscriptions.subscribe(
            scope,
            listener(move |event: &LiveEvent| {
                if let LiveEvent::Snapshot(snapshot) = event {
                    on_aggregate(&aggregate(snapshot, &spec));
                }
            }),
        )
    }
}

/// Dashboard counts. `None` means that count could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub users: Option<u64>,
    pub projects: Option<u64>,
    pub stash: Option<u64>,
}

/// Server-side counts: global for admins, owner-scoped otherwise. Each count fails
/// independently.
pub async fn fetch_totals(
    documents: &dyn DocumentStore,
    session: &SessionMonitor,
    grant: &AccessGrant,
) -> CoreResult<Totals> {
    session.ensure_current(grant.epoch())?;

    let owner_filter = if grant.is_admin() {
        Vec::new()
    } else {
        vec![Filter::eq(fields::OWNER_ID, grant.identity_id())]
    };

    let (users, projects, stash) = tokio::join!(
        async {
            if grant.is_admin() {
                documents.count_of(collections::USERS, &[]).await
            } else {
                Ok(0)
            }
        },
        documents.count_of(collections::PROJECTS, &owner_filter),
        documents.count_of(collections::STASH, &owner_filter),
    );

    let settle = |name: &str, result: CoreResult<u64>| match result {
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!(collection = name, code = err.error_code(), "Count failed: {}", err);
            None
        }
    };

    Ok(Totals {
        users: settle(collections::USERS, users),
        projects: settle(collections::PROJECTS, projects),
        stash: settle(collections::STASH, stash),
    })
}
