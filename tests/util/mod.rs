//! Shared helpers for CLI tests: a fake `zfs` on `PATH`.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// A temp directory holding a fake `zfs` script, a fake `ssh`, per-dataset
/// listings, and a log of every invocation.
///
/// The script answers `list` from `listing-<dataset>` files (datasets with
/// `/` replaced by `_`), reports no resume token, succeeds for
/// snapshot/bookmark/destroy unless a `fail-<subcommand>` file exists, and
/// drains stdin for `receive`. A `slow-<subcommand>` file makes that
/// subcommand record its pid in `pids` and sleep.
///
/// The `ssh` shim logs its arguments to `ssh.log` and runs the remote command
/// locally, so remote endpoints reach the same fake `zfs`.
#[allow(dead_code)]
pub struct FakeZfs {
    dir: TempDir,
}

#[allow(dead_code)]
impl FakeZfs {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().display().to_string();
        let script = format!(
            r#"#!/bin/sh
root='{root}'
echo "$*" >> "$root/calls.log"
eval last=\${{$#}}
key=$(printf '%s' "$last" | tr '/' '_')
if [ -e "$root/fail-$1" ]; then
    echo "cannot $1 '$last': permission denied" >&2
    exit 1
fi
if [ -e "$root/slow-$1" ]; then
    echo $$ >> "$root/pids"
    exec sleep 60
fi
case "$1" in
    list)
        if [ -e "$root/listing-$key" ]; then
            cat "$root/listing-$key"
        else
            echo "cannot open '$last': dataset does not exist" >&2
            exit 1
        fi
        ;;
    get)
        echo "-"
        ;;
    send)
        case " $* " in
            *" -n "*) printf 'incremental\tx\t%s\t4096\nsize\t4096\n' "$last" ;;
            *) echo "stream of $last" ;;
        esac
        ;;
    receive)
        cat > /dev/null
        ;;
esac
exit 0
"#
        );
        let path = dir.path().join("zfs");
        fs::write(&path, script).expect("write fake zfs");
        make_executable(&path);

        let ssh = format!(
            r#"#!/bin/sh
echo "$*" >> '{root}/ssh.log'
while [ $# -gt 0 ] && [ "$1" != "--" ]; do shift; done
shift
exec sh -c "$1"
"#
        );
        let path = dir.path().join("ssh");
        fs::write(&path, ssh).expect("write fake ssh");
        make_executable(&path);
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Rows are `name guid createtxg`, written tab-separated.
    pub fn listing(&self, dataset: &str, rows: &[(&str, &str, u64)]) -> &Self {
        let body: String = rows
            .iter()
            .map(|(name, guid, txg)| format!("{name}\t{guid}\t{txg}\n"))
            .collect();
        let key = dataset.replace('/', "_");
        fs::write(self.dir.path().join(format!("listing-{key}")), body).expect("write listing");
        self
    }

    pub fn fail(&self, subcommand: &str) -> &Self {
        fs::write(self.dir.path().join(format!("fail-{subcommand}")), "").expect("write marker");
        self
    }

    pub fn slow(&self, subcommand: &str) -> &Self {
        fs::write(self.dir.path().join(format!("slow-{subcommand}")), "").expect("write marker");
        self
    }

    /// Every recorded `zfs` argument list, one per line.
    pub fn calls(&self) -> Vec<String> {
        self.log_lines("calls.log")
    }

    /// Every recorded `ssh` argument list, one per line.
    pub fn ssh_calls(&self) -> Vec<String> {
        self.log_lines("ssh.log")
    }

    /// Pids of the slow subcommands started so far.
    pub fn slow_pids(&self) -> Vec<String> {
        self.log_lines("pids")
    }

    fn log_lines(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.dir.path().join(name))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn search_path(&self) -> std::ffi::OsString {
        match std::env::var_os("PATH") {
            Some(existing) => {
                let mut dirs = vec![self.dir.path().to_path_buf()];
                dirs.extend(std::env::split_paths(&existing));
                std::env::join_paths(dirs).expect("join PATH")
            }
            None => self.dir.path().as_os_str().to_owned(),
        }
    }

    /// `zrelay` with the fakes first on `PATH` and no user config.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("zrelay");
        cmd.env("PATH", self.search_path())
            .env("ZRELAY_CONFIG", self.config_path())
            .env_remove("ZRELAY_LOG");
        cmd
    }

    /// Same environment as [`Self::command`], for tests that need to signal
    /// the running process.
    pub fn std_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_zrelay"));
        cmd.env("PATH", self.search_path())
            .env("ZRELAY_CONFIG", self.config_path())
            .env_remove("ZRELAY_LOG");
        cmd
    }

    /// Config file location used by [`Self::command`]; absent unless written.
    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    pub fn write_config(&self, toml: &str) -> &Self {
        fs::write(self.config_path(), toml).expect("write config");
        self
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("stat").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}
