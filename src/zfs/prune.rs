//! Tag-keyed retention.
//!
//! Each rule votes independently over the snapshots it matches: the newest
//! `keep` get a keep vote, older ones a destroy vote. A snapshot is destroyed
//! only when every rule that matched it voted destroy; snapshots matched by no
//! rule are left alone.

use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;

use super::command::Endpoint;
use super::error::ReplicationError;
use super::inventory::{InventoryReader, SnapshotRecord};
use super::runner::Runner;

#[derive(Debug, Clone)]
pub struct RetentionRule {
    pub pattern: Regex,
    pub keep: usize,
}

impl RetentionRule {
    pub fn new(pattern: &str, keep: usize) -> Result<Self, ReplicationError> {
        let pattern =
            Regex::new(pattern).map_err(|e| ReplicationError::invalid_pattern(pattern, &e))?;
        Ok(Self { pattern, keep })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Keep,
    Destroy,
    Unmatched,
}

/// Verdict for every snapshot, in the order given.
pub fn plan_retention<'s>(
    snapshots: &'s [SnapshotRecord],
    rules: &[RetentionRule],
) -> Vec<(&'s SnapshotRecord, Verdict)> {
    // (keep votes, destroy votes) per snapshot index
    let mut votes = vec![(0usize, 0usize); snapshots.len()];

    for rule in rules {
        let mut matched: Vec<usize> = (0..snapshots.len())
            .filter(|&i| rule.pattern.is_match(&snapshots[i].name))
            .collect();
        matched.sort_by(|&a, &b| {
            snapshots[b]
                .creation_order
                .cmp(&snapshots[a].creation_order)
        });
        for (rank, index) in matched.into_iter().enumerate() {
            if rank < rule.keep {
                votes[index].0 += 1;
            } else {
                votes[index].1 += 1;
            }
        }
    }

    snapshots
        .iter()
        .zip(votes)
        .map(|(snapshot, (keep, destroy))| {
            let verdict = match (keep, destroy) {
                (0, 0) => Verdict::Unmatched,
                (0, _) => Verdict::Destroy,
                _ => Verdict::Keep,
            };
            (snapshot, verdict)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyFailure {
    pub snapshot: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub dataset: String,
    pub dry_run: bool,
    pub retained: Vec<String>,
    pub untouched: Vec<String>,
    pub destroyed: Vec<String>,
    pub failed: Vec<DestroyFailure>,
    /// Rendered destroy commands, in creation order.
    pub commands: Vec<String>,
}

impl PruneReport {
    pub fn into_result(self) -> Result<Self, ReplicationError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(ReplicationError::PruneIncomplete {
                attempted: self.destroyed.len() + self.failed.len(),
                failed: self.failed.len(),
            })
        }
    }
}

/// Apply `rules` to the snapshots of `endpoint`.
///
/// Destroys run concurrently and every outcome is collected; failures are
/// reported in [`PruneReport::failed`] rather than stopping the others.
pub fn prune<R: Runner + ?Sized>(
    runner: &R,
    endpoint: &Endpoint,
    rules: &[RetentionRule],
    dry_run: bool,
) -> Result<PruneReport, ReplicationError> {
    let inventory = InventoryReader::new(runner).list_snapshots(endpoint)?;
    let verdicts = plan_retention(&inventory.snapshots, rules);

    let mut report = PruneReport {
        dataset: endpoint.to_string(),
        dry_run,
        ..PruneReport::default()
    };
    let mut doomed = Vec::new();
    for (snapshot, verdict) in verdicts {
        match verdict {
            Verdict::Keep => report.retained.push(snapshot.name.clone()),
            Verdict::Unmatched => report.untouched.push(snapshot.name.clone()),
            Verdict::Destroy => {
                let full = endpoint.snapshot_name(&snapshot.name);
                let invocation = endpoint.invocation(["zfs", "destroy", full.as_str()]);
                report.commands.push(invocation.render());
                doomed.push((snapshot.name.clone(), invocation));
            }
        }
    }

    tracing::info!(
        dataset = %endpoint,
        retained = report.retained.len(),
        doomed = doomed.len(),
        untouched = report.untouched.len(),
        dry_run,
        "retention planned"
    );

    if dry_run {
        for command in &report.commands {
            tracing::info!(command = %command, "dry run");
        }
        return Ok(report);
    }

    let outcomes: Vec<(String, Result<(), String>)> = doomed
        .par_iter()
        .map(|(name, invocation)| {
            let outcome = runner
                .capture(invocation)
                .map(|_| ())
                .map_err(|failure| failure.to_string());
            (name.clone(), outcome)
        })
        .collect();

    for (name, outcome) in outcomes {
        match outcome {
            Ok(()) => {
                tracing::debug!(dataset = %endpoint, snapshot = %name, "destroyed");
                report.destroyed.push(name);
            }
            Err(error) => {
                tracing::warn!(dataset = %endpoint, snapshot = %name, %error, "destroy failed");
                report.failed.push(DestroyFailure {
                    snapshot: name,
                    error,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zfs::testing::{ScriptedRunner, list_cmd};

    fn snapshots(names: &[&str]) -> Vec<SnapshotRecord> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| SnapshotRecord {
                name: name.to_string(),
                guid: i.to_string(),
                creation_order: i as u64 + 1,
                has_bookmark: false,
            })
            .collect()
    }

    fn verdicts(snapshots: &[SnapshotRecord], rules: &[RetentionRule]) -> Vec<(String, Verdict)> {
        plan_retention(snapshots, rules)
            .into_iter()
            .map(|(s, v)| (s.name.clone(), v))
            .collect()
    }

    // Newest first: h4 is the oldest, h1 the newest.
    fn hourly() -> Vec<SnapshotRecord> {
        snapshots(&[
            "h4_tag_hourly",
            "h3_tag_hourly",
            "tag_daily_1",
            "h2_tag_hourly",
            "h1_tag_hourly",
        ])
    }

    #[test]
    fn keeps_newest_per_rule() {
        let rules = [RetentionRule::new("tag_hourly", 2).unwrap()];
        let result = verdicts(&hourly(), &rules);
        assert_eq!(
            result,
            vec![
                ("h4_tag_hourly".to_string(), Verdict::Destroy),
                ("h3_tag_hourly".to_string(), Verdict::Destroy),
                ("tag_daily_1".to_string(), Verdict::Unmatched),
                ("h2_tag_hourly".to_string(), Verdict::Keep),
                ("h1_tag_hourly".to_string(), Verdict::Keep),
            ]
        );
    }

    #[test]
    fn overlapping_rules_destroy_only_when_all_agree() {
        let snaps = snapshots(&["a_x_y", "b_x", "c_x_y", "d_x"]);
        let rules = [
            RetentionRule::new("_x", 1).unwrap(),
            RetentionRule::new("_y", 2).unwrap(),
        ];
        let result = verdicts(&snaps, &rules);
        // _x keeps d_x only; _y keeps c_x_y and a_x_y.
        assert_eq!(
            result,
            vec![
                ("a_x_y".to_string(), Verdict::Keep),
                ("b_x".to_string(), Verdict::Destroy),
                ("c_x_y".to_string(), Verdict::Keep),
                ("d_x".to_string(), Verdict::Keep),
            ]
        );
    }

    #[test]
    fn keep_zero_destroys_every_match() {
        let rules = [RetentionRule::new("hourly", 0).unwrap()];
        let destroyed = verdicts(&hourly(), &rules)
            .into_iter()
            .filter(|(_, v)| *v == Verdict::Destroy)
            .count();
        assert_eq!(destroyed, 4);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = RetentionRule::new("(", 1).unwrap_err();
        assert_eq!(err.kind(), "invalid-pattern");
        assert_eq!(err.exit_code(), 64);
    }

    const LISTING: &str = "tank/a@h4_tag_hourly\t1\t1\n\
                           tank/a@h3_tag_hourly\t2\t2\n\
                           tank/a@tag_daily_1\t3\t3\n\
                           tank/a@h2_tag_hourly\t4\t4\n\
                           tank/a@h1_tag_hourly\t5\t5\n";

    #[test]
    fn dry_run_lists_commands_only() {
        let runner = ScriptedRunner::default().reply(&list_cmd("tank/a"), LISTING);
        let rules = [RetentionRule::new("tag_hourly", 2).unwrap()];
        let report = prune(&runner, &Endpoint::local("tank/a"), &rules, true).unwrap();
        assert_eq!(
            report.commands,
            vec![
                "zfs destroy tank/a@h4_tag_hourly",
                "zfs destroy tank/a@h3_tag_hourly"
            ]
        );
        assert!(report.destroyed.is_empty());
        assert_eq!(report.untouched, vec!["tag_daily_1"]);
        assert_eq!(runner.captured().len(), 1);
    }

    #[test]
    fn destroy_failures_are_collected() {
        let runner = ScriptedRunner::default()
            .reply(&list_cmd("tank/a"), LISTING)
            .fail("zfs destroy tank/a@h4_tag_hourly", "dataset is busy")
            .reply("zfs destroy tank/a@h3_tag_hourly", "");
        let rules = [RetentionRule::new("tag_hourly", 2).unwrap()];
        let report = prune(&runner, &Endpoint::local("tank/a"), &rules, false).unwrap();
        assert_eq!(report.destroyed, vec!["h3_tag_hourly"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].snapshot, "h4_tag_hourly");
        assert!(report.failed[0].error.contains("dataset is busy"));

        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), "prune-incomplete");
        assert_eq!(err.exit_code(), 7);
    }
}
