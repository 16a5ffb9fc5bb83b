//! Dataset and snapshot addresses.
//!
//! An address names a ZFS dataset (and optionally one of its snapshots) on
//! either the local host or a remote host reached over SSH:
//!
//! ```text
//! [user@host:]dataset[@snapshot]
//! ```
//!
//! The `user@host:` prefix is recognised when the text before the first `:`
//! contains an `@` and no `/`. Anything else is a local dataset path, which
//! means a pool-root snapshot whose name contains `:` must be written with an
//! explicit remote prefix to be unambiguous.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing an address string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty dataset in '{0}'")]
    EmptyDataset(String),

    #[error("empty snapshot name in '{0}'")]
    EmptySnapshot(String),

    #[error("more than one '@' in '{0}'")]
    MultipleAt(String),

    #[error("empty user in remote prefix of '{0}'")]
    EmptyUser(String),

    #[error("empty host in remote prefix of '{0}'")]
    EmptyHost(String),

    #[error("expected [user@host:]dataset without a snapshot, got '{0}'")]
    UnexpectedSnapshot(String),

    #[error("expected [user@host:]dataset@snapshot, got '{0}'")]
    MissingSnapshot(String),
}

/// SSH destination of a remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remote {
    pub user: String,
    pub host: String,
}

impl Remote {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Where an address lives relative to the engine host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    Remote,
}

/// A dataset on the local host or a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetAddress {
    pub remote: Option<Remote>,
    pub dataset: String,
}

impl DatasetAddress {
    pub fn local(dataset: impl Into<String>) -> Self {
        Self {
            remote: None,
            dataset: dataset.into(),
        }
    }

    pub fn remote(remote: Remote, dataset: impl Into<String>) -> Self {
        Self {
            remote: Some(remote),
            dataset: dataset.into(),
        }
    }

    pub fn locality(&self) -> Locality {
        match self.remote {
            Some(_) => Locality::Remote,
            None => Locality::Local,
        }
    }

    /// Address of a snapshot of this dataset.
    pub fn snapshot(&self, name: impl Into<String>) -> SnapshotAddress {
        SnapshotAddress {
            dataset: self.clone(),
            snapshot: name.into(),
        }
    }
}

impl FromStr for DatasetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Address::parse(s)? {
            Address::Dataset(dataset) => Ok(dataset),
            Address::Snapshot(_) => Err(AddressError::UnexpectedSnapshot(s.to_string())),
        }
    }
}

impl fmt::Display for DatasetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "{remote}:{}", self.dataset),
            None => f.write_str(&self.dataset),
        }
    }
}

/// A snapshot of a dataset, `dataset@snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotAddress {
    pub dataset: DatasetAddress,
    pub snapshot: String,
}

impl FromStr for SnapshotAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Address::parse(s)? {
            Address::Snapshot(snapshot) => Ok(snapshot),
            Address::Dataset(_) => Err(AddressError::MissingSnapshot(s.to_string())),
        }
    }
}

impl fmt::Display for SnapshotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.snapshot)
    }
}

/// Either kind of address, as produced by [`Address::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Dataset(DatasetAddress),
    Snapshot(SnapshotAddress),
}

impl Address {
    /// Parse `[user@host:]dataset[@snapshot]`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let (remote, rest) = split_remote(input)?;

        let mut parts = rest.split('@');
        let dataset = parts.next().unwrap_or_default();
        let snapshot = parts.next();
        if parts.next().is_some() {
            return Err(AddressError::MultipleAt(input.to_string()));
        }
        if dataset.is_empty() {
            return Err(AddressError::EmptyDataset(input.to_string()));
        }

        let dataset = DatasetAddress {
            remote,
            dataset: dataset.to_string(),
        };
        match snapshot {
            None => Ok(Self::Dataset(dataset)),
            Some("") => Err(AddressError::EmptySnapshot(input.to_string())),
            Some(name) => Ok(Self::Snapshot(dataset.snapshot(name))),
        }
    }

    pub fn dataset(&self) -> &DatasetAddress {
        match self {
            Self::Dataset(dataset) => dataset,
            Self::Snapshot(snapshot) => &snapshot.dataset,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset(dataset) => dataset.fmt(f),
            Self::Snapshot(snapshot) => snapshot.fmt(f),
        }
    }
}

fn split_remote(input: &str) -> Result<(Option<Remote>, &str), AddressError> {
    let Some((prefix, rest)) = input.split_once(':') else {
        return Ok((None, input));
    };
    if prefix.contains('/') {
        return Ok((None, input));
    }
    let Some((user, host)) = prefix.split_once('@') else {
        return Ok((None, input));
    };
    if host.contains('@') {
        return Err(AddressError::MultipleAt(input.to_string()));
    }
    if user.is_empty() {
        return Err(AddressError::EmptyUser(input.to_string()));
    }
    if host.is_empty() {
        return Err(AddressError::EmptyHost(input.to_string()));
    }
    Ok((Some(Remote::new(user, host)), rest))
}

/// Shape of a two-address operation, decided by where each side lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Both datasets on the engine host.
    Local,
    /// Local source, remote target.
    Push,
    /// Remote source, local target.
    Pull,
    /// Both remote; the stream is relayed through the engine host.
    Broker,
}

impl Topology {
    pub fn from_localities(source: Locality, target: Locality) -> Self {
        match (source, target) {
            (Locality::Local, Locality::Local) => Self::Local,
            (Locality::Local, Locality::Remote) => Self::Push,
            (Locality::Remote, Locality::Local) => Self::Pull,
            (Locality::Remote, Locality::Remote) => Self::Broker,
        }
    }

    pub fn of(source: &DatasetAddress, target: &DatasetAddress) -> Self {
        Self::from_localities(source.locality(), target.locality())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_dataset() {
        let addr: DatasetAddress = "tank/data".parse().unwrap();
        assert_eq!(addr, DatasetAddress::local("tank/data"));
        assert_eq!(addr.locality(), Locality::Local);
    }

    #[test]
    fn parses_remote_snapshot() {
        let addr: SnapshotAddress = "backup@nas:tank/data@daily_1".parse().unwrap();
        assert_eq!(addr.dataset.remote, Some(Remote::new("backup", "nas")));
        assert_eq!(addr.dataset.dataset, "tank/data");
        assert_eq!(addr.snapshot, "daily_1");
        assert_eq!(addr.to_string(), "backup@nas:tank/data@daily_1");
    }

    #[test]
    fn local_snapshot_with_at_is_not_a_remote() {
        let addr: SnapshotAddress = "tank/data@snap".parse().unwrap();
        assert!(addr.dataset.remote.is_none());
        assert_eq!(addr.snapshot, "snap");
    }

    #[test]
    fn colon_in_nested_snapshot_stays_local() {
        let addr: SnapshotAddress = "tank/data@zrelay_12:00".parse().unwrap();
        assert!(addr.dataset.remote.is_none());
        assert_eq!(addr.snapshot, "zrelay_12:00");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(
            Address::parse(""),
            Err(AddressError::EmptyDataset(String::new()))
        );
        assert!(matches!(
            Address::parse("user@host:"),
            Err(AddressError::EmptyDataset(_))
        ));
        assert!(matches!(
            Address::parse("tank@a@b"),
            Err(AddressError::MultipleAt(_))
        ));
        assert!(matches!(
            Address::parse("@host:tank"),
            Err(AddressError::EmptyUser(_))
        ));
        assert!(matches!(
            Address::parse("user@:tank"),
            Err(AddressError::EmptyHost(_))
        ));
        assert!(matches!(
            Address::parse("tank@"),
            Err(AddressError::EmptySnapshot(_))
        ));
    }

    #[test]
    fn dataset_and_snapshot_parsers_are_strict() {
        assert!(matches!(
            "tank/a@s".parse::<DatasetAddress>(),
            Err(AddressError::UnexpectedSnapshot(_))
        ));
        assert!(matches!(
            "tank/a".parse::<SnapshotAddress>(),
            Err(AddressError::MissingSnapshot(_))
        ));
    }

    #[test]
    fn topology_table_is_total() {
        use Locality::*;
        assert_eq!(Topology::from_localities(Local, Local), Topology::Local);
        assert_eq!(Topology::from_localities(Local, Remote), Topology::Push);
        assert_eq!(Topology::from_localities(Remote, Local), Topology::Pull);
        assert_eq!(Topology::from_localities(Remote, Remote), Topology::Broker);
    }

    #[test]
    fn topology_of_addresses() {
        let local = DatasetAddress::local("tank/a");
        let remote = DatasetAddress::remote(Remote::new("u", "h"), "tank/b");
        assert_eq!(Topology::of(&local, &remote), Topology::Push);
        assert_eq!(Topology::of(&remote, &remote), Topology::Broker);
        assert_eq!(Topology::Broker.to_string(), "broker");
    }
}
