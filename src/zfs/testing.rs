//! Scripted [`Runner`] for unit tests.

use std::sync::Mutex;

use super::command::Invocation;
use super::runner::{CommandFailure, Runner, StageFailure};

pub fn list_cmd(dataset: &str) -> String {
    format!("zfs list -H -p -t snapshot,bookmark -o name,guid,createtxg -s createtxg {dataset}")
}

pub fn token_cmd(dataset: &str) -> String {
    format!("zfs get -H -o value receive_resume_token {dataset}")
}

/// Replies are keyed by the exact rendered command line; pipeline failures by
/// a substring of the rendered pipeline.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Vec<(String, Result<String, String>)>,
    pipe_failures: Vec<(String, usize, String)>,
    pub captured: Mutex<Vec<String>>,
    pub piped: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn reply(mut self, command: &str, stdout: &str) -> Self {
        self.replies.push((command.to_string(), Ok(stdout.to_string())));
        self
    }

    pub fn fail(mut self, command: &str, stderr: &str) -> Self {
        self.replies.push((command.to_string(), Err(stderr.to_string())));
        self
    }

    pub fn fail_pipe(mut self, contains: &str, stage: usize, stderr: &str) -> Self {
        self.pipe_failures
            .push((contains.to_string(), stage, stderr.to_string()));
        self
    }

    pub fn captured(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }

    pub fn piped(&self) -> Vec<String> {
        self.piped.lock().unwrap().clone()
    }
}

impl Runner for ScriptedRunner {
    fn capture(&self, invocation: &Invocation) -> Result<String, CommandFailure> {
        let rendered = invocation.render();
        self.captured.lock().unwrap().push(rendered.clone());
        match self.replies.iter().find(|(cmd, _)| *cmd == rendered) {
            Some((_, Ok(stdout))) => Ok(stdout.clone()),
            Some((_, Err(stderr))) => Err(CommandFailure {
                command: rendered,
                exit_code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Err(CommandFailure {
                command: rendered.clone(),
                exit_code: Some(127),
                stderr: format!("unscripted command: {rendered}"),
            }),
        }
    }

    fn pipe(&self, stages: &[Invocation]) -> Result<(), StageFailure> {
        let rendered: Vec<String> = stages.iter().map(Invocation::render).collect();
        let pipeline = rendered.join(" | ");
        self.piped.lock().unwrap().push(pipeline.clone());
        match self
            .pipe_failures
            .iter()
            .find(|(contains, _, _)| pipeline.contains(contains.as_str()))
        {
            Some((_, index, stderr)) => Err(StageFailure {
                index: *index,
                command: rendered[*index].clone(),
                exit_code: Some(1),
                stderr: stderr.clone(),
                also_failed: Vec::new(),
            }),
            None => Ok(()),
        }
    }
}
