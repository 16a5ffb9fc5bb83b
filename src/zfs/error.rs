//! Error taxonomy shared by every replication operation.

use thiserror::Error;

use super::address::AddressError;
use super::runner::{CommandFailure, StageDiagnostic, StageFailure, also_failed_suffix};

/// Errors surfaced by the replication engine.
///
/// Each variant maps to a stable [`kind`](ReplicationError::kind) label and a
/// process exit code so an external service manager can tell them apart.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error(transparent)]
    AddressSyntax(#[from] AddressError),

    #[error("cannot read inventory of '{dataset}': {stderr}")]
    InventoryUnavailable { dataset: String, stderr: String },

    #[error(
        "no common snapshot between '{source_dataset}' and '{target_dataset}' to send '{snapshot}' incrementally; the target has unrelated history"
    )]
    NoCommonAncestor {
        source_dataset: String,
        target_dataset: String,
        snapshot: String,
    },

    #[error(
        "pipeline stage {stage_index} failed{}: {stderr}\n  stage: {command}{}",
        exit_detail(.exit_code),
        also_failed_suffix(.also_failed)
    )]
    PipelineStageFailed {
        stage_index: usize,
        exit_code: Option<i32>,
        command: String,
        stderr: String,
        also_failed: Vec<StageDiagnostic>,
    },

    #[error(
        "'{target_dataset}' holds a partial receive of '{found}' but '{expected}' was requested; finish it or abandon it with `zfs receive -A {target_dataset}`"
    )]
    ResumeTokenMismatch {
        target_dataset: String,
        expected: String,
        found: String,
    },

    #[error("snapshot '{snapshot}' not found in '{dataset}'")]
    SnapshotNotFound { dataset: String, snapshot: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid pipe command '{command}': {message}")]
    InvalidPipe { command: String, message: String },

    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("{0}")]
    CommandFailed(#[from] CommandFailure),

    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },

    #[error("{failed} of {attempted} snapshot destroys failed")]
    PruneIncomplete { attempted: usize, failed: usize },

    #[error("interrupted by signal")]
    Interrupted,
}

fn exit_detail(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl From<StageFailure> for ReplicationError {
    fn from(failure: StageFailure) -> Self {
        Self::PipelineStageFailed {
            stage_index: failure.index,
            exit_code: failure.exit_code,
            command: failure.command,
            stderr: failure.stderr,
            also_failed: failure.also_failed,
        }
    }
}

impl ReplicationError {
    pub fn invalid_pattern(pattern: &str, err: &regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        }
    }

    /// Stable label printed as `error[<kind>]`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddressSyntax(_) => "address-syntax",
            Self::InventoryUnavailable { .. } => "inventory-unavailable",
            Self::NoCommonAncestor { .. } => "no-common-ancestor",
            Self::PipelineStageFailed { .. } => "pipeline-stage-failed",
            Self::ResumeTokenMismatch { .. } => "resume-token-mismatch",
            Self::SnapshotNotFound { .. } => "snapshot-not-found",
            Self::InvalidPattern { .. } => "invalid-pattern",
            Self::InvalidPipe { .. } => "invalid-pipe",
            Self::InvalidName(_) => "invalid-name",
            Self::CommandFailed(_) => "command-failed",
            Self::UnexpectedOutput { .. } => "unexpected-output",
            Self::PruneIncomplete { .. } => "prune-incomplete",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AddressSyntax(_) => 2,
            Self::InventoryUnavailable { .. } => 3,
            Self::NoCommonAncestor { .. } => 4,
            Self::PipelineStageFailed { .. } => 5,
            Self::ResumeTokenMismatch { .. } => 6,
            Self::PruneIncomplete { .. } => 7,
            Self::InvalidPattern { .. } | Self::InvalidPipe { .. } | Self::InvalidName(_) => 64,
            Self::Interrupted => 130,
            Self::SnapshotNotFound { .. }
            | Self::CommandFailed(_)
            | Self::UnexpectedOutput { .. } => 1,
        }
    }
}
