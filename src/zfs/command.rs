//! Command lines, either run on the engine host or wrapped in `ssh`.

use std::fmt;

use serde::Serialize;

use super::address::{DatasetAddress, Remote};

/// A command together with the host it must run on.
///
/// Remote invocations are rendered as
/// `ssh [-o OPTION]... user@host -- '<quoted command>'` so the remote shell sees
/// exactly the argv built here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub remote: Option<Remote>,
    pub ssh_options: Vec<String>,
}

impl Invocation {
    pub fn local<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            remote: None,
            ssh_options: Vec::new(),
        }
    }

    /// The argv actually executed on the engine host.
    pub fn program_argv(&self) -> Vec<String> {
        let Some(remote) = &self.remote else {
            return self.argv.clone();
        };
        let mut argv = vec!["ssh".to_string()];
        for option in &self.ssh_options {
            argv.push("-o".to_string());
            argv.push(option.clone());
        }
        argv.push(remote.to_string());
        argv.push("--".to_string());
        argv.push(shell_words::join(&self.argv));
        argv
    }

    /// Shell rendering of [`Self::program_argv`], used for logs and dry runs.
    pub fn render(&self) -> String {
        shell_words::join(self.program_argv())
    }

    pub fn contains_placeholder(&self, placeholder: &str) -> bool {
        self.argv.iter().any(|arg| arg.contains(placeholder))
    }

    pub fn substitute(&mut self, placeholder: &str, value: &str) {
        for arg in &mut self.argv {
            if arg.contains(placeholder) {
                *arg = arg.replace(placeholder, value);
            }
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A dataset plus the SSH options used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: DatasetAddress,
    pub ssh_options: Vec<String>,
}

impl Endpoint {
    pub fn new(address: DatasetAddress, ssh_options: Vec<String>) -> Self {
        Self {
            address,
            ssh_options,
        }
    }

    pub fn local(dataset: impl Into<String>) -> Self {
        Self::new(DatasetAddress::local(dataset), Vec::new())
    }

    pub fn dataset(&self) -> &str {
        &self.address.dataset
    }

    /// `dataset@name`, without any remote prefix.
    pub fn snapshot_name(&self, snapshot: &str) -> String {
        format!("{}@{snapshot}", self.address.dataset)
    }

    /// `dataset#name`, without any remote prefix.
    pub fn bookmark_name(&self, bookmark: &str) -> String {
        format!("{}#{bookmark}", self.address.dataset)
    }

    /// Build an invocation that runs at this endpoint's locality.
    pub fn invocation<I, S>(&self, argv: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation {
            argv: argv.into_iter().map(Into::into).collect(),
            remote: self.address.remote.clone(),
            ssh_options: match self.address.remote {
                Some(_) => self.ssh_options.clone(),
                None => Vec::new(),
            },
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}
