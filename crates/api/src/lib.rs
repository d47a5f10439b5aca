//! Reap reconciliation cycle (in-process).
//!
//! One pass builds a fresh inventory from what the apply engine reports, diffs it
//! against the persisted baseline, prunes stale objects and only then commits the
//! new inventory as the baseline. A failed prune leaves the old baseline in place,
//! so the next pass recomputes the same deletions.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use reap_core::{Action, ApplyEngine, ChangeSet, Entry, InventoryError, ObjRef, Pruner};
use reap_persist::BaselineStore;
use reap_store::{diff, DiffInput, Inventory};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The managed resource an inventory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub namespace: String,
    pub name: String,
}

impl Owner {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// The owner's own namespace object, which finalization leaves alone.
    fn is_home_namespace(&self, r: &ObjRef) -> bool {
        r.group.is_empty() && r.kind == "Namespace" && r.name == self.namespace
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

impl FromStr for Owner {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Owner::new(ns, name)),
            _ => Err(anyhow::anyhow!("invalid owner {:?} (expect namespace/name)", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Delete objects that dropped out of the desired state.
    pub prune: bool,
    /// Compute everything, change nothing: no prune, no commit.
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self { Self { prune: true, dry_run: false } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub owner: Owner,
    pub applied: ChangeSet,
    /// In baseline order.
    pub stale: Vec<ObjRef>,
    pub pruned: ChangeSet,
    pub inventory: Inventory,
    /// Committed baseline revision; `None` for dry runs.
    pub revision: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("apply: {0}")]
    Apply(String),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("prune: {0}")]
    Prune(String),
    #[error("persist: {0}")]
    Persist(String),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

fn persist_err(e: anyhow::Error) -> ReconcileError { ReconcileError::Persist(format!("{:#}", e)) }

pub struct Reconciler {
    apply: Arc<dyn ApplyEngine>,
    pruner: Arc<dyn Pruner>,
    store: Arc<dyn BaselineStore>,
    opts: ReconcileOptions,
}

impl Reconciler {
    pub fn new(apply: Arc<dyn ApplyEngine>, pruner: Arc<dyn Pruner>, store: Arc<dyn BaselineStore>) -> Self {
        Self { apply, pruner, store, opts: ReconcileOptions::default() }
    }

    pub fn with_options(mut self, opts: ReconcileOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn options(&self) -> ReconcileOptions { self.opts }

    /// Apply `objects` for `owner`, prune what the previous baseline has and they lack, commit.
    pub async fn reconcile(&self, owner: &Owner, objects: Vec<serde_json::Value>) -> ReconcileResult<ReconcileReport> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.run(owner, objects).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_err_total", 1u64);
            warn!(owner = %owner, error = %e, "reconcile failed; baseline retained");
        }
        res
    }

    async fn run(&self, owner: &Owner, objects: Vec<serde_json::Value>) -> ReconcileResult<ReconcileReport> {
        let key = owner.to_string();
        let applied = self.apply.apply(objects).await.map_err(|e| ReconcileError::Apply(format!("{:#}", e)))?;

        let mut inventory = Inventory::new();
        inventory.add_change_set(applied.clone())?;

        let previous = self.store.load(&key).map_err(persist_err)?.map(|b| b.inventory).unwrap_or_default();
        let stale = diff(DiffInput { current: &inventory, previous: &previous })?;
        counter!("reconcile_stale_total", stale.len() as u64);

        if self.opts.dry_run {
            info!(owner = %owner, applied = applied.len(), stale = stale.len(), "dry run; nothing pruned or committed");
            return Ok(ReconcileReport { owner: owner.clone(), applied, stale, pruned: ChangeSet::new(), inventory, revision: None });
        }

        let pruned = if stale.is_empty() {
            ChangeSet::new()
        } else if self.opts.prune {
            self.pruner.delete(&stale).await.map_err(|e| ReconcileError::Prune(format!("{:#}", e)))?
        } else {
            warn!(owner = %owner, orphaned = stale.len(), "prune disabled; stale objects left in place");
            ChangeSet::new()
        };

        let revision = self.store.commit(&key, &inventory).map_err(persist_err)?;
        info!(
            owner = %owner,
            applied = applied.len(),
            stale = stale.len(),
            pruned = pruned.len(),
            revision,
            "reconciled"
        );
        Ok(ReconcileReport { owner: owner.clone(), applied, stale, pruned, inventory, revision: Some(revision) })
    }

    /// Delete everything in the owner's baseline, then forget the baseline.
    ///
    /// The owner's own namespace is kept. If any deletion fails the baseline stays.
    /// A dry run returns what would be deleted and touches nothing.
    pub async fn finalize(&self, owner: &Owner) -> ReconcileResult<ChangeSet> {
        let key = owner.to_string();
        let Some(baseline) = self.store.load(&key).map_err(persist_err)? else {
            info!(owner = %owner, "no baseline; nothing to finalize");
            return Ok(ChangeSet::new());
        };
        let empty = Inventory::new();
        let doomed: Vec<ObjRef> = diff(DiffInput { current: &empty, previous: &baseline.inventory })?
            .into_iter()
            .filter(|r| !owner.is_home_namespace(r))
            .collect();
        if self.opts.dry_run {
            info!(owner = %owner, selected = doomed.len(), "dry run; nothing deleted or forgotten");
            return Ok(doomed.iter().map(|r| Entry::new(r.id(), r.version.clone(), Action::Deleted)).collect());
        }
        let deleted = if doomed.is_empty() {
            ChangeSet::new()
        } else {
            self.pruner.delete(&doomed).await.map_err(|e| ReconcileError::Prune(format!("{:#}", e)))?
        };
        self.store.forget(&key).map_err(persist_err)?;
        info!(owner = %owner, selected = doomed.len(), deleted = deleted.len(), "finalized");
        Ok(deleted)
    }
}
