//! Snapshot creation.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use serde::Serialize;

use super::command::Endpoint;
use super::error::ReplicationError;
use super::runner::Runner;

pub const DATETIME_PLACEHOLDER: &str = "{datetime}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Name template; `{datetime}` is replaced by the formatted timestamp.
    pub name: String,
    pub tag: Option<String>,
    pub time_format: String,
    pub bookmark: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotOutcome {
    pub dataset: String,
    pub snapshot: String,
    pub bookmarked: bool,
}

fn validate_time_format(format: &str) -> Result<(), ReplicationError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ReplicationError::InvalidName(format!(
            "invalid time format '{format}'"
        )));
    }
    Ok(())
}

/// Check a snapshot name component.
pub fn validate_name(name: &str) -> Result<(), ReplicationError> {
    if name.is_empty() {
        return Err(ReplicationError::InvalidName("name is empty".to_string()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| matches!(c, '@' | '#' | '/') || c.is_whitespace())
    {
        return Err(ReplicationError::InvalidName(format!(
            "'{name}' contains {bad:?}"
        )));
    }
    Ok(())
}

/// Resolve a name template into a snapshot name.
pub fn render_name(
    template: &str,
    tag: Option<&str>,
    now: &DateTime<Local>,
    time_format: &str,
) -> Result<String, ReplicationError> {
    let mut name = if template.contains(DATETIME_PLACEHOLDER) {
        validate_time_format(time_format)?;
        template.replace(DATETIME_PLACEHOLDER, &now.format(time_format).to_string())
    } else {
        template.to_string()
    };
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        name.push('_');
        name.push_str(tag);
    }
    validate_name(&name)?;
    Ok(name)
}

/// Create a snapshot of `endpoint`, then bookmark it if requested.
///
/// The bookmark is only attempted once the snapshot exists.
pub fn create_snapshot<R: Runner + ?Sized>(
    runner: &R,
    endpoint: &Endpoint,
    request: &SnapshotRequest,
    now: &DateTime<Local>,
) -> Result<SnapshotOutcome, ReplicationError> {
    let name = render_name(
        &request.name,
        request.tag.as_deref(),
        now,
        &request.time_format,
    )?;
    let full = endpoint.snapshot_name(&name);

    runner.capture(&endpoint.invocation(["zfs", "snapshot", full.as_str()]))?;
    tracing::info!(dataset = %endpoint, snapshot = %name, "created snapshot");

    if request.bookmark {
        let bookmark = endpoint.bookmark_name(&name);
        runner.capture(&endpoint.invocation([
            "zfs",
            "bookmark",
            full.as_str(),
            bookmark.as_str(),
        ]))?;
        tracing::debug!(dataset = %endpoint, bookmark = %name, "created bookmark");
    }

    Ok(SnapshotOutcome {
        dataset: endpoint.to_string(),
        snapshot: name,
        bookmarked: request.bookmark,
    })
}
