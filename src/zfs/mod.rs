//! ZFS snapshot replication engine.
//!
//! Snapshots are created, shipped between hosts with `zfs send | zfs receive`
//! (optionally over SSH on either side), and pruned under a retention policy.
//! Every external effect goes through the [`Runner`] trait.
//!
//! # Architecture
//!
//! - **address**: `[user@host:]dataset[@snapshot]` parsing and transfer topology
//! - **command**: local and SSH-wrapped invocations
//! - **runner**: process execution and pipelines
//! - **inventory**: snapshot/bookmark listings and resume tokens
//! - **plan**: full, incremental, or resumed transfer decisions
//! - **pipeline**: send/shape/relay/receive pipelines and dry runs
//! - **sync**: ordered multi-snapshot replication
//! - **snapshot**: snapshot and bookmark creation
//! - **prune**: tag-keyed retention
//!
//! # Syncing
//!
//! ```rust,ignore
//! use zrelay::zfs::{Endpoint, Replicator, SystemRunner, TransferOptions};
//!
//! let source: zrelay::zfs::DatasetAddress = "tank/data".parse()?;
//! let target: zrelay::zfs::DatasetAddress = "backup@nas:pool/data".parse()?;
//! let report = Replicator::new(&SystemRunner::default()).sync(
//!     &Endpoint::new(source, vec![]),
//!     &Endpoint::new(target, vec!["BatchMode=yes".into()]),
//!     &regex::Regex::new("^zrelay_")?,
//!     &TransferOptions::default(),
//! )?;
//! println!("sent {} snapshots", report.transfers.len());
//! ```

pub mod address;
pub mod command;
pub mod error;
pub mod inventory;
pub mod pipeline;
pub mod plan;
pub mod prune;
pub mod runner;
pub mod snapshot;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{
    Address, AddressError, DatasetAddress, Locality, Remote, SnapshotAddress, Topology,
};
pub use command::{Endpoint, Invocation};
pub use error::ReplicationError;
pub use inventory::{BookmarkRecord, Inventory, InventoryReader, ResumeState, SnapshotRecord};
pub use pipeline::{Executor, PipelineSpec, StageRole, TransferOptions, TransferResult};
pub use plan::{BasePreference, Decision, Planner, TransferPlan};
pub use prune::{PruneReport, RetentionRule, Verdict, plan_retention, prune};
pub use runner::{
    Cancellation, CommandFailure, Runner, StageDiagnostic, StageFailure, SystemRunner,
};
pub use snapshot::{SnapshotOutcome, SnapshotRequest, create_snapshot};
pub use sync::{Replicator, SendOutcome, SyncReport, select_snapshots};
