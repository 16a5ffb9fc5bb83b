//! Transfer planning: full, incremental, or resumed.
//!
//! Planning is a pure function of the source snapshot and the two
//! inventories. Snapshot names are the join key between hosts; GUIDs are not
//! compared across hosts.

use std::fmt;

use serde::Serialize;

use super::error::ReplicationError;
use super::inventory::{Inventory, SnapshotRecord};

/// How a single snapshot reaches the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransferPlan {
    Full { snapshot: String },
    Incremental { from: String, to: String },
    IncrementalFromBookmark { from: String, to: String },
    Resume { token: String },
}

impl TransferPlan {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Incremental { .. } => "incremental",
            Self::IncrementalFromBookmark { .. } => "incremental-from-bookmark",
            Self::Resume { .. } => "resume",
        }
    }
}

impl fmt::Display for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { snapshot } => write!(f, "full @{snapshot}"),
            Self::Incremental { from, to } => write!(f, "incremental @{from} -> @{to}"),
            Self::IncrementalFromBookmark { from, to } => {
                write!(f, "incremental #{from} -> @{to}")
            }
            Self::Resume { .. } => write!(f, "resume"),
        }
    }
}

/// Outcome of planning one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Decision {
    Transfer(TransferPlan),
    /// The target already holds a snapshot of this name.
    AlreadyPresent,
}

/// Which source object to use as the incremental base when both a snapshot
/// and a bookmark carry the common name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BasePreference {
    #[default]
    Snapshot,
    Bookmark,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Planner {
    pub base_preference: BasePreference,
}

impl Planner {
    pub fn new(base_preference: BasePreference) -> Self {
        Self { base_preference }
    }

    /// Decide how `snapshot` (a member of `source`) reaches `target`.
    pub fn plan(
        &self,
        snapshot: &SnapshotRecord,
        source: &Inventory,
        target: &Inventory,
    ) -> Result<Decision, ReplicationError> {
        // A pending partial receive blocks every fresh stream.
        if let Some(resume) = &target.resume {
            let expected = format!("{}@{}", source.dataset, snapshot.name);
            return match &resume.to_name {
                Some(to_name) if *to_name == expected => Ok(Decision::Transfer(
                    TransferPlan::Resume {
                        token: resume.token.clone(),
                    },
                )),
                other => Err(ReplicationError::ResumeTokenMismatch {
                    target_dataset: target.dataset.clone(),
                    expected,
                    found: other.clone().unwrap_or_else(|| "an unknown stream".to_string()),
                }),
            };
        }

        if target.snapshot(&snapshot.name).is_some() {
            return Ok(Decision::AlreadyPresent);
        }

        if target.snapshots.is_empty() {
            return Ok(Decision::Transfer(TransferPlan::Full {
                snapshot: snapshot.name.clone(),
            }));
        }

        let mut target_newest_first: Vec<&SnapshotRecord> = target.snapshots.iter().collect();
        target_newest_first.sort_by(|a, b| b.creation_order.cmp(&a.creation_order));

        for candidate in target_newest_first {
            let as_snapshot = source
                .snapshot(&candidate.name)
                .filter(|s| s.creation_order < snapshot.creation_order);
            let as_bookmark = source
                .bookmark(&candidate.name)
                .filter(|b| b.creation_order < snapshot.creation_order);

            let from = candidate.name.clone();
            let to = snapshot.name.clone();
            let plan = match (self.base_preference, as_snapshot, as_bookmark) {
                (BasePreference::Snapshot, Some(_), _)
                | (BasePreference::Bookmark, Some(_), None) => {
                    TransferPlan::Incremental { from, to }
                }
                (_, _, Some(_)) => TransferPlan::IncrementalFromBookmark { from, to },
                (_, None, None) => continue,
            };
            return Ok(Decision::Transfer(plan));
        }

        Err(ReplicationError::NoCommonAncestor {
            source_dataset: source.dataset.clone(),
            target_dataset: target.dataset.clone(),
            snapshot: snapshot.name.clone(),
        })
    }
}
