//! Human and JSON rendering of command results.

use std::io::Write;

use serde_json::{Value, json};

use crate::zfs::pipeline::human_size;
use crate::zfs::{
    Inventory, PruneReport, ReplicationError, SendOutcome, SnapshotOutcome, SyncReport,
    TransferResult,
};

fn error_json(err: &ReplicationError) -> Value {
    json!({ "kind": err.kind(), "message": err.to_string() })
}

fn write_json(out: &mut impl Write, value: &Value) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

fn write_transfer(out: &mut impl Write, result: &TransferResult) -> std::io::Result<()> {
    let verb = if result.dry_run { "would send" } else { "sent" };
    write!(out, "{verb} {} ({})", result.snapshot, result.plan)?;
    if let Some(size) = result.estimated_size {
        write!(out, ", ~{}", human_size(size))?;
    }
    if !result.dry_run {
        write!(out, " in {} ms", result.duration_ms)?;
    }
    writeln!(out)?;
    if result.dry_run {
        writeln!(out, "  {}", result.command)?;
    }
    Ok(())
}

pub fn print_send(
    out: &mut impl Write,
    outcome: &SendOutcome,
    as_json: bool,
) -> std::io::Result<()> {
    match (outcome, as_json) {
        (SendOutcome::Transferred(result), true) => {
            write_json(out, &json!({ "status": "transferred", "transfer": result }))
        }
        (SendOutcome::AlreadyPresent { snapshot }, true) => {
            write_json(out, &json!({ "status": "already_present", "snapshot": snapshot }))
        }
        (SendOutcome::Transferred(result), false) => write_transfer(out, result),
        (SendOutcome::AlreadyPresent { snapshot }, false) => {
            writeln!(out, "{snapshot} is already on the target")
        }
    }
}

pub fn print_sync(
    out: &mut impl Write,
    report: &SyncReport,
    as_json: bool,
) -> std::io::Result<()> {
    if as_json {
        return write_json(
            out,
            &json!({
                "source": report.source,
                "target": report.target,
                "selected": report.selected,
                "transfers": report.transfers,
                "skipped": report.skipped,
                "not_attempted": report.not_attempted(),
                "halted": report.halted.as_ref().map(error_json),
                "total_duration_ms": report.total_duration_ms,
            }),
        );
    }

    if report.selected.is_empty() {
        return writeln!(out, "{} is up to date with {}", report.target, report.source);
    }
    for result in &report.transfers {
        write_transfer(out, result)?;
    }
    for snapshot in &report.skipped {
        writeln!(out, "skipped {snapshot} (already on target)")?;
    }
    let pending = report.not_attempted();
    if !pending.is_empty() {
        writeln!(out, "not attempted: {}", pending.join(", "))?;
    }
    Ok(())
}

pub fn print_snapshot(
    out: &mut impl Write,
    outcome: &SnapshotOutcome,
    as_json: bool,
) -> std::io::Result<()> {
    if as_json {
        return write_json(out, &json!(outcome));
    }
    write!(out, "created {}@{}", outcome.dataset, outcome.snapshot)?;
    if outcome.bookmarked {
        write!(out, " (bookmarked)")?;
    }
    writeln!(out)
}

pub fn print_prune(
    out: &mut impl Write,
    report: &PruneReport,
    as_json: bool,
) -> std::io::Result<()> {
    if as_json {
        return write_json(out, &json!(report));
    }
    if report.dry_run {
        for command in &report.commands {
            writeln!(out, "{command}")?;
        }
        return writeln!(
            out,
            "would destroy {}, keep {}, leave {} untouched",
            report.commands.len(),
            report.retained.len(),
            report.untouched.len()
        );
    }
    for snapshot in &report.destroyed {
        writeln!(out, "destroyed {snapshot}")?;
    }
    for failure in &report.failed {
        writeln!(out, "failed {}: {}", failure.snapshot, failure.error)?;
    }
    writeln!(
        out,
        "destroyed {}, failed {}, kept {}, left {} untouched",
        report.destroyed.len(),
        report.failed.len(),
        report.retained.len(),
        report.untouched.len()
    )
}

/// Options for `list`.
#[derive(Debug, Clone, Copy)]
pub struct ListView {
    pub snapshots: bool,
    pub bookmarks: bool,
}

pub fn print_list(
    out: &mut impl Write,
    inventory: &Inventory,
    filter: Option<&regex::Regex>,
    view: ListView,
    as_json: bool,
) -> std::io::Result<()> {
    let keep = |name: &str| filter.is_none_or(|f| f.is_match(name));
    let snapshots: Vec<_> = inventory
        .snapshots
        .iter()
        .filter(|s| view.snapshots && keep(&s.name))
        .collect();
    let bookmarks: Vec<_> = inventory
        .bookmarks
        .iter()
        .filter(|b| view.bookmarks && keep(&b.name))
        .collect();

    if as_json {
        return write_json(
            out,
            &json!({
                "dataset": inventory.dataset,
                "snapshots": snapshots,
                "bookmarks": bookmarks,
            }),
        );
    }

    for snapshot in snapshots {
        let marker = if snapshot.has_bookmark { " *" } else { "" };
        writeln!(
            out,
            "{}@{}\t{}\t{}{marker}",
            inventory.dataset, snapshot.name, snapshot.guid, snapshot.creation_order
        )?;
    }
    for bookmark in bookmarks {
        writeln!(
            out,
            "{}#{}\t{}\t{}",
            inventory.dataset, bookmark.name, bookmark.guid, bookmark.creation_order
        )?;
    }
    Ok(())
}
