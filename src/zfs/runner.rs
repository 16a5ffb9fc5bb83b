//! Process execution.
//!
//! Everything the engine does to the outside world goes through [`Runner`]:
//! `capture` for single commands whose stdout is needed (listings, property
//! reads, snapshot/destroy), and `pipe` for a send/receive pipeline whose
//! stages are connected stdout to stdin.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use super::command::Invocation;

/// A single command exited non-zero or could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{command}` failed{}: {stderr}", exit_suffix(.exit_code))]
pub struct CommandFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl CommandFailure {
    pub fn dataset_missing(&self) -> bool {
        self.stderr.contains("dataset does not exist")
    }
}

/// One stage of a pipeline failed.
///
/// `index` names the stage blamed for the failure. Every other stage that
/// also exited unsuccessfully is kept in `also_failed` with its own stderr.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "stage {index} `{command}` failed{}: {stderr}{}",
    exit_suffix(.exit_code),
    also_failed_suffix(.also_failed)
)]
pub struct StageFailure {
    pub index: usize,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub also_failed: Vec<StageDiagnostic>,
}

/// Exit status and stderr of a stage that failed alongside the blamed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDiagnostic {
    pub index: usize,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

pub(crate) fn also_failed_suffix(others: &[StageDiagnostic]) -> String {
    others
        .iter()
        .map(|d| {
            format!(
                "\n  stage {} `{}` also failed{}: {}",
                d.index,
                d.command,
                exit_suffix(&d.exit_code),
                d.stderr
            )
        })
        .collect()
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " without an exit code".to_string(),
    }
}

/// Narrow interface to external processes; tests substitute a scripted fake.
pub trait Runner: Send + Sync {
    /// Run one command to completion and return its trimmed stdout.
    fn capture(&self, invocation: &Invocation) -> Result<String, CommandFailure>;

    /// Run `stages` as one connected pipeline and wait for every stage.
    fn pipe(&self, stages: &[Invocation]) -> Result<(), StageFailure>;
}

/// Shared flag that tells a [`SystemRunner`] to stop.
///
/// Once set, running stages are killed and reaped, and no new command is
/// started.
#[derive(Debug, Default, Clone)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

const CANCELLED: &str = "cancelled by signal";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`Runner`] backed by real child processes.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner {
    cancellation: Cancellation,
}

impl SystemRunner {
    pub fn new(cancellation: Cancellation) -> Self {
        Self { cancellation }
    }

    fn command(invocation: &Invocation) -> Result<Command, String> {
        let argv = invocation.program_argv();
        let Some((program, args)) = argv.split_first() else {
            return Err("empty command".to_string());
        };
        let resolved =
            which::which(program).map_err(|e| format!("`{program}` not found on PATH: {e}"))?;
        let mut cmd = Command::new(resolved);
        cmd.args(args);
        Ok(cmd)
    }

    /// Wait for every child, killing the ones still running on cancellation.
    ///
    /// Returns `None` when the wait was cancelled.
    fn wait_all(&self, children: &mut [Child]) -> Option<Vec<Option<ExitStatus>>> {
        let mut statuses: Vec<Option<Option<ExitStatus>>> = vec![None; children.len()];
        loop {
            for (child, status) in children.iter_mut().zip(statuses.iter_mut()) {
                if status.is_none() {
                    match child.try_wait() {
                        Ok(Some(exit)) => *status = Some(Some(exit)),
                        Ok(None) => {}
                        Err(_) => *status = Some(None),
                    }
                }
            }
            if statuses.iter().all(Option::is_some) {
                return Some(statuses.into_iter().flatten().collect());
            }
            if self.cancellation.is_cancelled() {
                for (child, status) in children.iter_mut().zip(&statuses) {
                    if status.is_none() {
                        tracing::debug!(pid = child.id(), "killing stage");
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                }
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Runner for SystemRunner {
    fn capture(&self, invocation: &Invocation) -> Result<String, CommandFailure> {
        let rendered = invocation.render();
        tracing::debug!(command = %rendered, "run");

        let failure = |exit_code, stderr: String| CommandFailure {
            command: rendered.clone(),
            exit_code,
            stderr,
        };
        if self.cancellation.is_cancelled() {
            return Err(failure(None, CANCELLED.to_string()));
        }

        let mut cmd = Self::command(invocation).map_err(|e| failure(None, e))?;
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failure(None, format!("failed to execute: {e}")))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(statuses) = self.wait_all(std::slice::from_mut(&mut child)) else {
            return Err(failure(None, CANCELLED.to_string()));
        };
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default().trim().to_string();

        match statuses.first().copied().flatten() {
            Some(status) if status.success() => Ok(stdout.trim().to_string()),
            status => {
                tracing::debug!(command = %rendered, ?status, %stderr, "command failed");
                Err(failure(status.and_then(|s| s.code()), stderr))
            }
        }
    }

    fn pipe(&self, stages: &[Invocation]) -> Result<(), StageFailure> {
        let rendered: Vec<String> = stages.iter().map(Invocation::render).collect();
        tracing::debug!(pipeline = %rendered.join(" | "), "run");

        let cancelled = || StageFailure {
            index: 0,
            command: rendered.first().cloned().unwrap_or_default(),
            exit_code: None,
            stderr: CANCELLED.to_string(),
            also_failed: Vec::new(),
        };
        if self.cancellation.is_cancelled() {
            return Err(cancelled());
        }

        let mut children: Vec<Child> = Vec::with_capacity(stages.len());
        let mut drains: Vec<JoinHandle<String>> = Vec::with_capacity(stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for (index, stage) in stages.iter().enumerate() {
            let last = index + 1 == stages.len();
            let spawned = Self::command(stage).and_then(|mut cmd| {
                cmd.stdin(match upstream.take() {
                    Some(stdout) => Stdio::from(stdout),
                    None => Stdio::null(),
                })
                .stdout(if last { Stdio::null() } else { Stdio::piped() })
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| format!("failed to execute: {e}"))
            });

            let mut child = match spawned {
                Ok(child) => child,
                Err(stderr) => {
                    // Started stages see EOF or SIGPIPE once we drop their pipes.
                    for mut started in children {
                        let _ = started.kill();
                        let _ = started.wait();
                    }
                    for drain in drains {
                        let _ = drain.join();
                    }
                    return Err(StageFailure {
                        index,
                        command: rendered[index].clone(),
                        exit_code: None,
                        stderr,
                        also_failed: Vec::new(),
                    });
                }
            };

            upstream = child.stdout.take();
            drains.push(drain(child.stderr.take()));
            children.push(child);
        }

        let Some(statuses) = self.wait_all(&mut children) else {
            tracing::warn!(pipeline = %rendered.join(" | "), "pipeline killed");
            return Err(cancelled());
        };
        let outcomes: Vec<(Option<ExitStatus>, String)> = statuses
            .into_iter()
            .zip(drains)
            .map(|(status, drain)| (status, drain.join().unwrap_or_default()))
            .collect();

        let Some(index) = first_failure(&outcomes) else {
            return Ok(());
        };
        let diagnostic = |i: usize| {
            let (status, stderr) = &outcomes[i];
            StageDiagnostic {
                index: i,
                command: rendered[i].clone(),
                exit_code: status.and_then(|s| s.code()),
                stderr: stderr.trim().to_string(),
            }
        };
        let also_failed = (0..outcomes.len())
            .filter(|&i| {
                let status = &outcomes[i].0;
                i != index && failed(status) && !killed_by_sigpipe(status)
            })
            .map(diagnostic)
            .collect();
        let blamed = diagnostic(index);
        Err(StageFailure {
            index,
            command: blamed.command,
            exit_code: blamed.exit_code,
            stderr: blamed.stderr,
            also_failed,
        })
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Pick the stage that caused a pipeline failure.
///
/// Upstream stages killed by SIGPIPE are a consequence of a downstream stage
/// exiting early, so they are only reported when nothing else failed.
fn first_failure(outcomes: &[(Option<ExitStatus>, String)]) -> Option<usize> {
    outcomes
        .iter()
        .position(|(status, _)| failed(status) && !killed_by_sigpipe(status))
        .or_else(|| outcomes.iter().position(|(status, _)| failed(status)))
}

fn failed(status: &Option<ExitStatus>) -> bool {
    !status.is_some_and(|s| s.success())
}

#[cfg(unix)]
fn killed_by_sigpipe(status: &Option<ExitStatus>) -> bool {
    use std::os::unix::process::ExitStatusExt;
    const SIGPIPE: i32 = 13;
    status.is_some_and(|s| s.signal() == Some(SIGPIPE))
}

#[cfg(not(unix))]
fn killed_by_sigpipe(_status: &Option<ExitStatus>) -> bool {
    false
}
