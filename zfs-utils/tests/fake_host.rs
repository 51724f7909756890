// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the public API against a scripted host.

use slog::{o, Drain, Logger};
use std::io::Write;
use std::sync::{Arc, Mutex};
use zfs_utils::host::{FakeExecutor, Input, Output, OutputExt, StaticHandler};
use zfs_utils::zfs::{DestroyFlags, Properties, SendFlags};
use zfs_utils::{
    ChangeType, Config, DatasetType, DiffError, InodeType, Platform, Zfs,
    Zpool,
};

const PROPS: &str = "name,origin,used,available,mountpoint,compression,type,\
                     volsize,quota,referenced,written,logicalused,usedbydataset";

fn log() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

fn config() -> Config {
    toml::from_str(
        r#"
        zfs = "/sbin/zfs"
        zpool = "/sbin/zpool"
        pfexec = "/usr/bin/pfexec"
        platform = "open_zfs"
        "#,
    )
    .unwrap()
}

fn row(name: &str, ty: &str) -> String {
    format!(
        "{name}\t-\t24576\t9663676416\t/{name}\toff\t{ty}\t\
         -\t0\t24576\t24576\t12288\t24576\n"
    )
}

#[test]
fn pool_lifecycle() {
    let log = log();
    let executor = FakeExecutor::new(log.clone());
    let mut handler = StaticHandler::new();
    handler.expect_ok(
        "/usr/bin/pfexec /sbin/zpool create test /var/tmp/vdev0 /var/tmp/vdev1",
    );
    handler.expect_stdout(
        "/usr/bin/pfexec /sbin/zpool get -Hp name,health,allocated,size,free,\
         readonly,dedupratio,fragmentation,freeing,leaked test",
        "test\thealth\tONLINE\t-\ntest\tsize\t1056964608\t-\n\
         test\tfeature@async_destroy\tenabled\tlocal\n",
    );
    handler.expect_stdout(
        format!("/usr/bin/pfexec /sbin/zfs list -rHp -t all -o {PROPS} test"),
        row("test", "filesystem"),
    );
    handler.expect_ok("/usr/bin/pfexec /sbin/zpool destroy test");
    handler.register(&executor);

    let zpool = Zpool::new(&log, executor.clone().as_executor(), config());
    let zfs = Zfs::new(&log, executor.as_executor(), config());

    let pool = zpool
        .create(
            "test",
            &Properties::new(),
            &["/var/tmp/vdev0", "/var/tmp/vdev1"],
        )
        .unwrap();
    assert_eq!(pool.name, "test");
    assert_eq!(pool.size, 1056964608);

    let datasets = pool.datasets(&zfs).unwrap();
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].dataset_type, DatasetType::Filesystem);

    zpool.destroy("test").unwrap();
}

#[test]
fn snapshot_diff_and_destroy() {
    let log = log();
    let executor = FakeExecutor::new(log.clone());
    let mut handler = StaticHandler::new();
    handler.expect_stdout(
        format!("/usr/bin/pfexec /sbin/zfs list -Hp -o {PROPS} test/origin"),
        row("test/origin", "filesystem"),
    );
    handler.expect_ok(
        "/usr/bin/pfexec /sbin/zfs snapshot test/origin@snapshot",
    );
    handler.expect_stdout(
        format!(
            "/usr/bin/pfexec /sbin/zfs list -Hp -o {PROPS} test/origin@snapshot"
        ),
        row("test/origin@snapshot", "snapshot"),
    );
    handler.expect_stdout(
        "/usr/bin/pfexec /sbin/zfs diff -FHt test/origin@snapshot test/origin",
        "1700000000.1\tM\t/\t/test/origin/\n\
         1700000000.2\tR\tF\t/test/origin/file\t/test/origin/file-new\n\
         1700000000.3\t+\tF\t/test/origin/i\\0040\\0342\\0235\\0244\\0040unicode\n",
    );
    handler.expect(
        Input::shell(
            "/usr/bin/pfexec /sbin/zfs diff -FHt test/origin@snapshot test/origin",
        ),
        Output::success().set_stdout("1700000000.4\tX\tF\t/test/origin/odd\n"),
    );
    handler.expect_ok(
        "/usr/bin/pfexec /sbin/zfs destroy -r -d test/origin@snapshot",
    );
    handler.register(&executor);
    let zfs = Zfs::new(&log, executor.as_executor(), config());

    let origin = zfs.get_dataset("test/origin").unwrap();
    let snapshot = zfs.snapshot(&origin, "snapshot", false).unwrap();
    assert_eq!(snapshot.dataset_type, DatasetType::Snapshot);

    let changes = zfs.diff(&snapshot.name, &origin.name).unwrap();
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].path(), "/test/origin/");
    assert_eq!(changes[0].inode_type(), InodeType::Directory);
    assert_eq!(changes[0].change(), ChangeType::Modified);
    assert_eq!(changes[1].change(), ChangeType::Renamed);
    assert_eq!(changes[1].new_path(), Some("/test/origin/file-new"));
    assert_eq!(changes[2].path(), "/test/origin/i ❤ unicode");

    let err = zfs.diff(&snapshot.name, &origin.name).unwrap_err();
    assert!(
        matches!(err, DiffError::UnknownChangeKind { row: 0, .. }),
        "{err}"
    );

    zfs.destroy(
        &snapshot,
        DestroyFlags::RECURSIVE | DestroyFlags::DEFER_DELETION,
    )
    .unwrap();
}

#[test]
fn send_into_receive() {
    let log = log();
    let executor = FakeExecutor::new(log.clone());

    // Bytes produced by the fake `zfs send` are captured and handed to the
    // fake `zfs receive`.
    let stream: Arc<Mutex<Vec<u8>>> = Arc::default();
    executor.set_spawn_handler(Box::new(|child| {
        let argv = Input::from(child.command()).argv();
        if argv.iter().any(|arg| arg == "send") {
            child.stdout_queue().clone().write_all(b"\x00\x01replica").unwrap();
        }
    }));
    let received = stream.clone();
    executor.set_wait_handler(Box::new(move |child| {
        let argv = Input::from(child.command()).argv();
        match argv.get(2).map(String::as_str) {
            Some("send") => Output::success(),
            Some("receive") => {
                *received.lock().unwrap() = child.stdin_queue().take_all();
                Output::success()
            }
            Some("list") => Output::success()
                .set_stdout(row("backup/origin@snapshot", "snapshot")),
            other => panic!("unexpected command {other:?}"),
        }
    }));
    let zfs = Zfs::new(&log, executor.as_executor(), config());

    let snapshot = zfs_utils::Dataset {
        name: "test/origin@snapshot".to_string(),
        dataset_type: DatasetType::Snapshot,
        ..Default::default()
    };
    let mut buffer = Vec::new();
    zfs.send_snapshot(&snapshot, &mut buffer, SendFlags::REPLICATE).unwrap();
    assert_eq!(buffer, b"\x00\x01replica");

    let copy =
        zfs.receive_snapshot(&mut buffer.as_slice(), "backup/origin").unwrap();
    assert_eq!(copy.name, "backup/origin@snapshot");
    assert_eq!(*stream.lock().unwrap(), b"\x00\x01replica");
}

#[test]
fn platform_from_config() {
    let config: Config = toml::from_str("platform = \"solaris\"").unwrap();
    assert_eq!(config.platform, Platform::Solaris);
    assert!(config.pfexec.is_none());
}
