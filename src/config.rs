//! Configuration file handling.
//!
//! Settings live in `config.toml` under the platform config directory
//! (`~/.config/zrelay/config.toml` on Linux). `--config`, or else
//! `ZRELAY_CONFIG`, overrides the location. A missing file means built-in
//! defaults.
//!
//! ```toml
//! [snapshot]
//! name = "zrelay_{datetime}"
//! time_format = "%Y-%m-%d_%H-%M-%S"
//! bookmark = true
//!
//! [transfer]
//! filter = "^zrelay_"
//! shaper = "mbuffer -q -r {limit}"
//!
//! [ssh]
//! options = ["BatchMode=yes"]
//!
//! [hosts."backup@nas"]
//! ssh_options = ["Port=2222"]
//!
//! [prune."tank/data"]
//! rules = [{ pattern = "_hourly$", keep = 24 }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::zfs::pipeline::DEFAULT_SHAPER;
use crate::zfs::{DatasetAddress, ReplicationError, Remote, RetentionRule};

pub const CONFIG_ENV: &str = "ZRELAY_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        "config"
    }

    pub fn exit_code(&self) -> i32 {
        64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    pub name: String,
    pub time_format: String,
    pub bookmark: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            name: "zrelay_{datetime}".to_string(),
            time_format: "%Y-%m-%d_%H-%M-%S".to_string(),
            bookmark: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Snapshots considered by `sync`.
    pub filter: String,
    pub shaper: String,
    pub resumable: bool,
    pub send_options: Vec<String>,
    pub recv_options: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            filter: "^zrelay_".to_string(),
            shaper: DEFAULT_SHAPER.to_string(),
            resumable: true,
            send_options: Vec::new(),
            recv_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            options: vec!["BatchMode=yes".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub pattern: String,
    pub keep: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PruneConfig {
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub snapshot: SnapshotConfig,
    pub transfer: TransferConfig,
    pub ssh: SshConfig,
    /// Keyed by `user@host`.
    pub hosts: BTreeMap<String, HostConfig>,
    /// Keyed by dataset address as written on the command line.
    pub prune: BTreeMap<String, PruneConfig>,
}

impl Config {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("", "", "zrelay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// `explicit` (`--config`), then `$ZRELAY_CONFIG`, then the platform default.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match dotenvy::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Self::default_path(),
        }
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::resolve_path(explicit)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Global options, then per-host options, then `extra`.
    pub fn ssh_options_for(&self, remote: Option<&Remote>, extra: &[String]) -> Vec<String> {
        let Some(remote) = remote else {
            return Vec::new();
        };
        let mut options = self.ssh.options.clone();
        if let Some(host) = self.hosts.get(&remote.to_string()) {
            options.extend(host.ssh_options.iter().cloned());
        }
        options.extend(extra.iter().cloned());
        options
    }

    /// The sync filter, with `override_pattern` taking precedence.
    pub fn filter(&self, override_pattern: Option<&str>) -> Result<Regex, ReplicationError> {
        let pattern = override_pattern.unwrap_or(&self.transfer.filter);
        Regex::new(pattern).map_err(|e| ReplicationError::invalid_pattern(pattern, &e))
    }

    /// Retention rules configured for `dataset`, empty when there are none.
    pub fn prune_rules(
        &self,
        dataset: &DatasetAddress,
    ) -> Result<Vec<RetentionRule>, ReplicationError> {
        let key = dataset.to_string();
        let Some(policy) = self.prune.get(&key) else {
            return Ok(Vec::new());
        };
        policy
            .rules
            .iter()
            .map(|rule| RetentionRule::new(&rule.pattern, rule.keep))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.snapshot.name, "zrelay_{datetime}");
        assert!(config.snapshot.bookmark);
        assert!(config.transfer.resumable);
    }

    #[test]
    fn parses_full_file() {
        let config = Config::parse(
            r#"
            [snapshot]
            name = "auto_{datetime}"
            bookmark = false

            [transfer]
            filter = "^auto_"
            send_options = ["-w"]

            [ssh]
            options = ["BatchMode=yes", "ConnectTimeout=10"]

            [hosts."backup@nas"]
            ssh_options = ["Port=2222"]

            [prune."tank/data"]
            rules = [{ pattern = "_hourly$", keep = 24 }, { pattern = "_daily$", keep = 7 }]
            "#,
        )
        .unwrap();
        assert_eq!(config.snapshot.name, "auto_{datetime}");
        assert_eq!(config.snapshot.time_format, "%Y-%m-%d_%H-%M-%S");
        assert!(!config.snapshot.bookmark);
        assert_eq!(config.transfer.send_options, vec!["-w"]);

        let rules = config
            .prune_rules(&DatasetAddress::local("tank/data"))
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].keep, 24);
        assert!(
            config
                .prune_rules(&DatasetAddress::local("tank/other"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[transfer]\nfliter = \"x\"\n").is_err());
    }

    #[test]
    fn ssh_options_are_layered() {
        let config = Config::parse(
            "[ssh]\noptions = [\"BatchMode=yes\"]\n[hosts.\"backup@nas\"]\nssh_options = [\"Port=2222\"]\n",
        )
        .unwrap();
        let remote = Remote::new("backup", "nas");
        assert_eq!(
            config.ssh_options_for(Some(&remote), &["Compression=yes".to_string()]),
            vec!["BatchMode=yes", "Port=2222", "Compression=yes"]
        );
        assert_eq!(
            config.ssh_options_for(Some(&Remote::new("other", "host")), &[]),
            vec!["BatchMode=yes"]
        );
        assert!(config.ssh_options_for(None, &[]).is_empty());
    }

    #[test]
    fn filter_override_and_validation() {
        let config = Config::default();
        assert!(config.filter(None).unwrap().is_match("zrelay_2024"));
        assert!(config.filter(Some("^manual")).unwrap().is_match("manual_1"));
        assert_eq!(config.filter(Some("[")).unwrap_err().kind(), "invalid-pattern");
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[snapshot\nname = 1").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.exit_code(), 64);
    }
}
