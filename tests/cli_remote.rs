//! CLI tests for remote endpoints, with `ssh` faked to run commands locally.
#![cfg(unix)]

use predicates::prelude::*;

mod util;
use util::FakeZfs;

#[test]
fn list_reads_a_remote_inventory_over_ssh() {
    let fake = FakeZfs::new();
    fake.listing("tank/a", &[("tank/a@a", "101", 1), ("tank/a#a", "101", 1)]);

    fake.command()
        .args(["list", "root@nas:tank/a", "--bookmarks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("@a\t101\t1 *"))
        .stdout(predicate::str::contains("#a\t101\t1"));

    let ssh = fake.ssh_calls();
    assert_eq!(ssh.len(), 1, "{ssh:?}");
    assert!(ssh[0].starts_with("-o BatchMode=yes root@nas -- zfs list"), "{ssh:?}");
    assert!(fake.calls()[0].starts_with("list "));
}

#[test]
fn host_options_from_config_reach_ssh() {
    let fake = FakeZfs::new();
    fake.listing("tank/a", &[("tank/a@a", "101", 1)])
        .write_config("[hosts.\"root@nas\"]\nssh_options = [\"Port=2222\"]\n");

    fake.command()
        .args(["list", "root@nas:tank/a", "--ssh-opt", "ConnectTimeout=5"])
        .assert()
        .success();

    let ssh = fake.ssh_calls();
    assert!(
        ssh[0].starts_with(
            "-o BatchMode=yes -o Port=2222 -o ConnectTimeout=5 root@nas -- zfs list"
        ),
        "{ssh:?}"
    );
}

#[test]
fn broker_sync_relays_between_two_remotes() {
    let fake = FakeZfs::new();
    fake.listing("tank/a", &[("tank/a@a", "101", 1), ("tank/a@b", "102", 2)])
        .listing("backup/a", &[("backup/a@a", "101", 9)]);

    fake.command()
        .args(["sync", "root@src:tank/a", "root@dst:backup/a", "--filter", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("sent b (incremental @a -> @b)"));

    let calls = fake.calls();
    assert!(calls.contains(&"send -i tank/a@a tank/a@b".to_string()), "{calls:?}");
    assert!(calls.contains(&"receive -s backup/a".to_string()), "{calls:?}");

    let ssh = fake.ssh_calls();
    assert!(ssh.iter().any(|c| c.contains("root@src -- zfs send -i tank/a@a tank/a@b")));
    assert!(ssh.iter().any(|c| c.contains("root@dst -- zfs receive -s backup/a")));
}

#[test]
fn pull_failure_surfaces_the_receive_diagnostic() {
    let fake = FakeZfs::new();
    fake.listing("tank/a", &[("tank/a@a", "101", 1), ("tank/a@b", "102", 2)])
        .listing("backup/a", &[("backup/a@a", "101", 9)])
        .fail("receive");

    fake.command()
        .args(["sync", "root@src:tank/a", "backup/a", "--filter", "."])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("error[pipeline-stage-failed]"))
        .stderr(predicate::str::contains("cannot receive 'backup/a': permission denied"));
}
