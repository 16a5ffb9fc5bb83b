//! Snapshot and bookmark inventories read from `zfs list`.

use serde::Serialize;

use super::command::Endpoint;
use super::error::ReplicationError;
use super::runner::Runner;

/// A snapshot of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub guid: String,
    /// ZFS `createtxg`; the only ordering that matters.
    pub creation_order: u64,
    pub has_bookmark: bool,
}

/// A bookmark of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookmarkRecord {
    pub name: String,
    pub guid: String,
    pub creation_order: u64,
}

/// A partially received stream waiting on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeState {
    pub token: String,
    /// `dataset@snapshot` the interrupted stream was sending, if it could be decoded.
    pub to_name: Option<String>,
}

/// Everything the planners need to know about one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub dataset: String,
    pub exists: bool,
    pub snapshots: Vec<SnapshotRecord>,
    pub bookmarks: Vec<BookmarkRecord>,
    pub resume: Option<ResumeState>,
}

impl Inventory {
    pub fn empty(dataset: impl Into<String>, exists: bool) -> Self {
        Self {
            dataset: dataset.into(),
            exists,
            snapshots: Vec::new(),
            bookmarks: Vec::new(),
            resume: None,
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn bookmark(&self, name: &str) -> Option<&BookmarkRecord> {
        self.bookmarks.iter().find(|b| b.name == name)
    }

    pub fn latest(&self) -> Option<&SnapshotRecord> {
        self.snapshots.iter().max_by_key(|s| s.creation_order)
    }

    /// Account for a snapshot that just landed on this (target) dataset.
    ///
    /// The target assigns its own createtxg, so the record is placed after
    /// everything already present.
    pub fn record_landed(&mut self, snapshot: &SnapshotRecord) {
        let next = self.latest().map_or(1, |s| s.creation_order + 1);
        self.exists = true;
        self.resume = None;
        self.snapshots.push(SnapshotRecord {
            name: snapshot.name.clone(),
            guid: snapshot.guid.clone(),
            creation_order: next,
            has_bookmark: false,
        });
    }
}

/// Parse `zfs list -H -p -t snapshot,bookmark -o name,guid,createtxg` output.
///
/// Rows are `<dataset>@<name>` for snapshots and `<dataset>#<name>` for
/// bookmarks. Results are sorted by creation order.
pub fn parse_listing(
    output: &str,
) -> Result<(Vec<SnapshotRecord>, Vec<BookmarkRecord>), String> {
    let mut snapshots = Vec::new();
    let mut bookmarks = Vec::new();

    // Columns are tab separated; names may contain spaces.
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').map(|f| f.trim_end_matches('\r')).collect();
        let [full_name, guid, createtxg] = fields.as_slice() else {
            return Err(format!("expected 3 columns in '{line}'"));
        };
        let (guid, createtxg) = (guid.trim(), createtxg.trim());
        let creation_order: u64 = createtxg
            .parse()
            .map_err(|_| format!("bad createtxg '{createtxg}' in '{line}'"))?;

        if let Some((_, name)) = full_name.split_once('@') {
            snapshots.push(SnapshotRecord {
                name: name.to_string(),
                guid: guid.to_string(),
                creation_order,
                has_bookmark: false,
            });
        } else if let Some((_, name)) = full_name.split_once('#') {
            bookmarks.push(BookmarkRecord {
                name: name.to_string(),
                guid: guid.to_string(),
                creation_order,
            });
        } else {
            return Err(format!("'{full_name}' is neither a snapshot nor a bookmark"));
        }
    }

    snapshots.sort_by_key(|s| s.creation_order);
    bookmarks.sort_by_key(|b| b.creation_order);
    for snapshot in &mut snapshots {
        snapshot.has_bookmark = bookmarks.iter().any(|b| b.guid == snapshot.guid);
    }
    Ok((snapshots, bookmarks))
}

/// Extract `toname` from `zfs send -n -v -t <token>` output.
pub fn parse_token_target(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "toname").then(|| value.trim().to_string())
    })
}

/// Read-only queries against a dataset.
pub struct InventoryReader<'a, R: Runner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: Runner + ?Sized> InventoryReader<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// List snapshots and bookmarks of `endpoint`.
    pub fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Inventory, ReplicationError> {
        tracing::debug!(dataset = %endpoint, "listing snapshots");
        let invocation = endpoint.invocation([
            "zfs",
            "list",
            "-H",
            "-p",
            "-t",
            "snapshot,bookmark",
            "-o",
            "name,guid,createtxg",
            "-s",
            "createtxg",
            endpoint.dataset(),
        ]);
        let output = self.runner.capture(&invocation).map_err(|failure| {
            ReplicationError::InventoryUnavailable {
                dataset: endpoint.to_string(),
                stderr: failure.stderr,
            }
        })?;
        let (snapshots, bookmarks) =
            parse_listing(&output).map_err(|detail| ReplicationError::UnexpectedOutput {
                command: invocation.render(),
                detail,
            })?;
        Ok(Inventory {
            dataset: endpoint.dataset().to_string(),
            exists: true,
            snapshots,
            bookmarks,
            resume: None,
        })
    }

    /// Pending `receive_resume_token` of `endpoint`, if any.
    pub fn resume_token(&self, endpoint: &Endpoint) -> Result<Option<String>, ReplicationError> {
        let invocation = endpoint.invocation([
            "zfs",
            "get",
            "-H",
            "-o",
            "value",
            "receive_resume_token",
            endpoint.dataset(),
        ]);
        let output = self.runner.capture(&invocation).map_err(|failure| {
            ReplicationError::InventoryUnavailable {
                dataset: endpoint.to_string(),
                stderr: failure.stderr,
            }
        })?;
        let token = output.trim();
        Ok(match token {
            "" | "-" => None,
            token => Some(token.to_string()),
        })
    }

    /// Ask the source which snapshot a resume token continues.
    ///
    /// An undecodable token yields `None`, which the planner treats as a
    /// mismatch.
    pub fn describe_token(&self, source: &Endpoint, token: &str) -> Option<String> {
        let invocation = source.invocation(["zfs", "send", "-n", "-v", "-t", token]);
        match self.runner.capture(&invocation) {
            Ok(output) => parse_token_target(&output),
            Err(failure) => {
                tracing::warn!(dataset = %source, error = %failure, "cannot decode resume token");
                None
            }
        }
    }

    /// Inventory of a transfer target, including its resume state.
    ///
    /// A target that does not exist yet is an empty inventory rather than an
    /// error, so that the first transfer becomes a full send.
    pub fn read_target(
        &self,
        target: &Endpoint,
        source: &Endpoint,
    ) -> Result<Inventory, ReplicationError> {
        let mut inventory = match self.list_snapshots(target) {
            Ok(inventory) => inventory,
            Err(ReplicationError::InventoryUnavailable { stderr, .. })
                if stderr.contains("dataset does not exist") =>
            {
                tracing::info!(dataset = %target, "target does not exist yet");
                return Ok(Inventory::empty(target.dataset(), false));
            }
            Err(err) => return Err(err),
        };

        if let Some(token) = self.resume_token(target)? {
            let to_name = self.describe_token(source, &token);
            tracing::info!(dataset = %target, to_name = ?to_name, "found partial receive");
            inventory.resume = Some(ResumeState { token, to_name });
        }
        Ok(inventory)
    }
}
