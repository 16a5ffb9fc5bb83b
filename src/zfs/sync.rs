//! Single-snapshot sends and multi-snapshot syncs.
//!
//! A sync is planning plus execution applied in a strict sequence: every
//! source snapshot newer than the target's latest is sent in creation order,
//! and the first failure halts the run. Nothing is rolled back; a partially
//! received stream is picked up by the next run as a resume.

use std::time::Instant;

use regex::Regex;

use super::command::Endpoint;
use super::error::ReplicationError;
use super::inventory::{Inventory, InventoryReader, SnapshotRecord};
use super::pipeline::{Executor, TransferOptions, TransferResult};
use super::plan::{Decision, Planner};
use super::runner::Runner;

/// Report from syncing one dataset pair.
#[derive(Debug)]
pub struct SyncReport {
    pub source: String,
    pub target: String,
    /// Snapshots selected for transfer, in order.
    pub selected: Vec<String>,
    /// Transfers that completed (or were rendered, for dry runs).
    pub transfers: Vec<TransferResult>,
    /// Selected snapshots that were already on the target.
    pub skipped: Vec<String>,
    /// The error that stopped the run, if any.
    pub halted: Option<ReplicationError>,
    pub total_duration_ms: u64,
}

impl SyncReport {
    fn new(source: &Endpoint, target: &Endpoint) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            selected: Vec::new(),
            transfers: Vec::new(),
            skipped: Vec::new(),
            halted: None,
            total_duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.halted.is_none()
    }

    /// Selected snapshots that were neither transferred nor skipped.
    pub fn not_attempted(&self) -> Vec<&str> {
        let done = self.transfers.len() + self.skipped.len() + usize::from(self.halted.is_some());
        self.selected.iter().skip(done).map(String::as_str).collect()
    }
}

/// Outcome of sending one named snapshot.
#[derive(Debug)]
pub enum SendOutcome {
    Transferred(TransferResult),
    AlreadyPresent { snapshot: String },
}

/// Source snapshots to send, oldest first.
///
/// The base is the target's latest snapshot whose name matches `filter`; it
/// must also exist on the source. With no matching target snapshot every
/// matching source snapshot is selected.
pub fn select_snapshots<'s>(
    source: &'s Inventory,
    target: &Inventory,
    filter: &Regex,
) -> Result<Vec<&'s SnapshotRecord>, ReplicationError> {
    let mut matching: Vec<&SnapshotRecord> = source
        .snapshots
        .iter()
        .filter(|s| filter.is_match(&s.name))
        .collect();
    matching.sort_by_key(|s| s.creation_order);

    let target_latest = target
        .snapshots
        .iter()
        .filter(|s| filter.is_match(&s.name))
        .max_by_key(|s| s.creation_order);

    let Some(target_latest) = target_latest else {
        return Ok(matching);
    };

    let Some(base) = source.snapshot(&target_latest.name) else {
        return Err(ReplicationError::NoCommonAncestor {
            source_dataset: source.dataset.clone(),
            target_dataset: target.dataset.clone(),
            snapshot: target_latest.name.clone(),
        });
    };

    Ok(matching
        .into_iter()
        .filter(|s| s.creation_order > base.creation_order)
        .collect())
}

/// Drives planning and pipelines against one [`Runner`].
pub struct Replicator<'a, R: Runner + ?Sized> {
    runner: &'a R,
    planner: Planner,
}

impl<'a, R: Runner + ?Sized> Replicator<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self {
            runner,
            planner: Planner::default(),
        }
    }

    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    /// Send one named snapshot of `source` to `target`.
    pub fn send(
        &self,
        source: &Endpoint,
        snapshot: &str,
        target: &Endpoint,
        options: &TransferOptions,
    ) -> Result<SendOutcome, ReplicationError> {
        let reader = InventoryReader::new(self.runner);
        let source_inventory = reader.list_snapshots(source)?;
        let record = source_inventory
            .snapshot(snapshot)
            .ok_or_else(|| ReplicationError::SnapshotNotFound {
                dataset: source.to_string(),
                snapshot: snapshot.to_string(),
            })?;
        let target_inventory = reader.read_target(target, source)?;

        match self.planner.plan(record, &source_inventory, &target_inventory)? {
            Decision::AlreadyPresent => {
                tracing::info!(snapshot, target = %target, "already present on target");
                Ok(SendOutcome::AlreadyPresent {
                    snapshot: snapshot.to_string(),
                })
            }
            Decision::Transfer(plan) => {
                tracing::info!(snapshot, plan = %plan, "planned transfer");
                Executor::new(self.runner)
                    .transfer(&plan, snapshot, source, target, options)
                    .map(SendOutcome::Transferred)
            }
        }
    }

    /// Bring `target` up to date with the snapshots of `source` matching `filter`.
    ///
    /// Inventory and selection failures return `Err`; a failure while
    /// transferring is recorded in [`SyncReport::halted`] next to the
    /// transfers that completed before it.
    pub fn sync(
        &self,
        source: &Endpoint,
        target: &Endpoint,
        filter: &Regex,
        options: &TransferOptions,
    ) -> Result<SyncReport, ReplicationError> {
        let started = Instant::now();
        let reader = InventoryReader::new(self.runner);
        let source_inventory = reader.list_snapshots(source)?;
        let mut target_view = reader.read_target(target, source)?;

        let selected: Vec<SnapshotRecord> =
            select_snapshots(&source_inventory, &target_view, filter)?
                .into_iter()
                .cloned()
                .collect();

        let mut report = SyncReport::new(source, target);
        report.selected = selected.iter().map(|s| s.name.clone()).collect();
        tracing::info!(
            source = %source,
            target = %target,
            count = selected.len(),
            dry_run = options.dry_run,
            "sync selected snapshots"
        );

        let executor = Executor::new(self.runner);
        for snapshot in &selected {
            let outcome = self
                .planner
                .plan(snapshot, &source_inventory, &target_view)
                .and_then(|decision| match decision {
                    Decision::AlreadyPresent => Ok(None),
                    Decision::Transfer(plan) => executor
                        .transfer(&plan, &snapshot.name, source, target, options)
                        .map(Some),
                });

            match outcome {
                Ok(Some(result)) => {
                    target_view.record_landed(snapshot);
                    report.transfers.push(result);
                }
                Ok(None) => {
                    tracing::info!(snapshot = %snapshot.name, "already present on target");
                    report.skipped.push(snapshot.name.clone());
                }
                Err(err) => {
                    tracing::warn!(snapshot = %snapshot.name, error = %err, "sync halted");
                    report.halted = Some(err);
                    break;
                }
            }
        }

        report.total_duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            source = %source,
            target = %target,
            transferred = report.transfers.len(),
            skipped = report.skipped.len(),
            duration_ms = report.total_duration_ms,
            "sync finished"
        );
        Ok(report)
    }
}
