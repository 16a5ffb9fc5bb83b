//! Building and running `zfs send | ... | zfs receive` pipelines.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::address::Topology;
use super::command::{Endpoint, Invocation};
use super::error::ReplicationError;
use super::plan::TransferPlan;
use super::runner::Runner;

pub const SIZE_PLACEHOLDER: &str = "{size}";
pub const LIMIT_PLACEHOLDER: &str = "{limit}";
pub const DEFAULT_SHAPER: &str = "mbuffer -q -r {limit}";

static SIZE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^size\s+(\d+)$").expect("valid size regex"));

/// Knobs shared by `send` and `sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub send_options: Vec<String>,
    pub recv_options: Vec<String>,
    /// Relay commands inserted between send and receive, in shell syntax.
    pub pipes: Vec<String>,
    pub bandwidth_limit: Option<String>,
    /// Shaping command template; `{limit}` is replaced by the bandwidth limit.
    pub shaper: String,
    /// Pass `-s` to `zfs receive` so an interrupted stream can be resumed.
    pub resumable: bool,
    pub dry_run: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            send_options: Vec::new(),
            recv_options: Vec::new(),
            pipes: Vec::new(),
            bandwidth_limit: None,
            shaper: DEFAULT_SHAPER.to_string(),
            resumable: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Send,
    Shape,
    Relay,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub role: StageRole,
    pub invocation: Invocation,
}

/// A fully resolved pipeline, ready to run or to print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    pub topology: Topology,
    pub stages: Vec<Stage>,
    pub estimated_size: Option<u64>,
}

impl PipelineSpec {
    pub fn render(&self) -> String {
        self.stages
            .iter()
            .map(|stage| stage.invocation.render())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.stages.iter().map(|s| s.invocation.clone()).collect()
    }
}

/// Outcome of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub snapshot: String,
    pub plan: TransferPlan,
    pub command: String,
    pub estimated_size: Option<u64>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// `zfs send` argv for a plan, without the leading `zfs send`.
fn send_args(plan: &TransferPlan, source: &Endpoint) -> Vec<String> {
    match plan {
        TransferPlan::Full { snapshot } => vec![source.snapshot_name(snapshot)],
        TransferPlan::Incremental { from, to } => vec![
            "-i".to_string(),
            source.snapshot_name(from),
            source.snapshot_name(to),
        ],
        TransferPlan::IncrementalFromBookmark { from, to } => vec![
            "-i".to_string(),
            source.bookmark_name(from),
            source.snapshot_name(to),
        ],
        TransferPlan::Resume { token } => vec!["-t".to_string(), token.clone()],
    }
}

fn split_stage(text: &str) -> Result<Vec<String>, ReplicationError> {
    let argv = shell_words::split(text).map_err(|e| ReplicationError::InvalidPipe {
        command: text.to_string(),
        message: format!("cannot split into words: {e}"),
    })?;
    if argv.is_empty() {
        return Err(ReplicationError::InvalidPipe {
            command: text.to_string(),
            message: "empty command".to_string(),
        });
    }
    Ok(argv)
}

/// Parse the last line of `zfs send -n -P -v` output.
pub fn parse_size_estimate(output: &str) -> Option<u64> {
    let last = output.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    SIZE_LINE
        .captures(last)
        .and_then(|caps| caps[1].parse().ok())
}

/// Bytes in binary units, e.g. `1.5 GiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub struct Executor<'a, R: Runner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: Runner + ?Sized> Executor<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Build the pipeline for `plan`.
    ///
    /// Shaping and relay stages run on the engine host. The size estimate is
    /// a read-only query and is made even for dry runs when a stage needs it.
    pub fn prepare(
        &self,
        plan: &TransferPlan,
        source: &Endpoint,
        target: &Endpoint,
        options: &TransferOptions,
    ) -> Result<PipelineSpec, ReplicationError> {
        let topology = Topology::of(&source.address, &target.address);
        let send_tail = send_args(plan, source);

        let mut send_argv = vec!["zfs".to_string(), "send".to_string()];
        send_argv.extend(options.send_options.iter().cloned());
        send_argv.extend(send_tail.iter().cloned());

        let mut stages = vec![Stage {
            role: StageRole::Send,
            invocation: source.invocation(send_argv),
        }];

        if let Some(limit) = &options.bandwidth_limit {
            let mut shaper = Invocation::local(split_stage(&options.shaper)?);
            shaper.substitute(LIMIT_PLACEHOLDER, limit);
            stages.push(Stage {
                role: StageRole::Shape,
                invocation: shaper,
            });
        }

        for pipe in &options.pipes {
            stages.push(Stage {
                role: StageRole::Relay,
                invocation: Invocation::local(split_stage(pipe)?),
            });
        }

        let mut recv_argv = vec!["zfs".to_string(), "receive".to_string()];
        if options.resumable {
            recv_argv.push("-s".to_string());
        }
        recv_argv.extend(options.recv_options.iter().cloned());
        recv_argv.push(target.dataset().to_string());
        stages.push(Stage {
            role: StageRole::Receive,
            invocation: target.invocation(recv_argv),
        });

        let needs_size = stages
            .iter()
            .any(|s| s.invocation.contains_placeholder(SIZE_PLACEHOLDER));
        let mut estimated_size = None;
        if needs_size {
            let size = self.estimate_size(source, &options.send_options, &send_tail)?;
            for stage in &mut stages {
                stage.invocation.substitute(SIZE_PLACEHOLDER, &size.to_string());
            }
            estimated_size = Some(size);
        }

        Ok(PipelineSpec {
            topology,
            stages,
            estimated_size,
        })
    }

    fn estimate_size(
        &self,
        source: &Endpoint,
        send_options: &[String],
        send_tail: &[String],
    ) -> Result<u64, ReplicationError> {
        let mut argv: Vec<String> = ["zfs", "send", "-n", "-P", "-v"]
            .into_iter()
            .map(String::from)
            .collect();
        argv.extend(send_options.iter().cloned());
        argv.extend(send_tail.iter().cloned());
        let invocation = source.invocation(argv);

        let output = self.runner.capture(&invocation)?;
        let size = parse_size_estimate(&output).ok_or_else(|| {
            ReplicationError::UnexpectedOutput {
                command: invocation.render(),
                detail: "no trailing 'size <bytes>' line".to_string(),
            }
        })?;
        tracing::info!(
            dataset = %source,
            bytes = size,
            size = %human_size(size),
            "estimated stream size"
        );
        Ok(size)
    }

    /// Run a prepared pipeline, or just render it when `dry_run` is set.
    pub fn execute(
        &self,
        spec: &PipelineSpec,
        plan: &TransferPlan,
        snapshot: &str,
        dry_run: bool,
    ) -> Result<TransferResult, ReplicationError> {
        let command = spec.render();
        let started = Instant::now();

        if dry_run {
            tracing::info!(snapshot, mode = plan.mode(), pipeline = %command, "dry run");
        } else {
            tracing::info!(
                snapshot,
                mode = plan.mode(),
                topology = %spec.topology,
                "starting transfer"
            );
            tracing::debug!(pipeline = %command, "pipeline");
            self.runner.pipe(&spec.invocations())?;
            tracing::info!(
                snapshot,
                duration_ms = started.elapsed().as_millis() as u64,
                "transfer complete"
            );
        }

        Ok(TransferResult {
            snapshot: snapshot.to_string(),
            plan: plan.clone(),
            command,
            estimated_size: spec.estimated_size,
            dry_run,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// `prepare` followed by `execute`.
    pub fn transfer(
        &self,
        plan: &TransferPlan,
        snapshot: &str,
        source: &Endpoint,
        target: &Endpoint,
        options: &TransferOptions,
    ) -> Result<TransferResult, ReplicationError> {
        let spec = self.prepare(plan, source, target, options)?;
        self.execute(&spec, plan, snapshot, options.dry_run)
    }
}
