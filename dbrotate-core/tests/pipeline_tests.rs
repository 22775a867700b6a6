/*!
Pipeline tests: full runs against temporary local and "remote" roots.

The remote side is driven through the same shell commands the SSH transport
would send, executed locally.
*/

mod common;

use std::sync::Arc;

use common::*;
use dbrotate_core::{
    BackupError, FixedClock, MysqlDump, Orchestrator, RetentionPolicy, RunState, RunWarning, StoreKind,
};
use tempfile::TempDir;

async fn run_on(
    day_index: i64,
    local: &std::path::Path,
    remote: &std::path::Path,
    policy: RetentionPolicy,
    transport: Arc<LocalShellTransport>,
) -> dbrotate_core::RunReport {
    let orchestrator = Orchestrator::new(
        config(local, remote, policy),
        FakeDump::default(),
        Some(transport),
        FixedClock::new(day(day_index)),
    );
    orchestrator.run().await.unwrap()
}

#[tokio::test]
async fn test_full_run_fills_both_stores() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let transport = Arc::new(LocalShellTransport::default());

    let report = run_on(0, local.path(), remote.path(), RetentionPolicy::default(), transport.clone()).await;

    assert_eq!(report.state, RunState::Done);
    assert!(!report.has_warnings(), "{:?}", report.warnings);
    let name = report.artifact.file_name();
    assert_eq!(name, "all_20240101T030000000Z.sql");

    for tier in ["daily", "weekly", "monthly"] {
        assert_eq!(tier_files(local.path(), tier), vec![name.clone()]);
        assert_eq!(tier_files(remote.path(), tier), vec![name.clone()]);
        assert_eq!(std::fs::read(path_in(remote.path(), tier, &name)).unwrap(), DUMP_CONTENT);
    }

    // relayed copy and staging are cleaned up
    assert!(tier_files(remote.path(), ".incoming").is_empty());
    assert!(entries(local.path()).iter().all(|e| !e.starts_with(".staging-")));
    assert_eq!(transport.uploads.load(std::sync::atomic::Ordering::SeqCst), 1);

    let remote_outcome = report.remote.unwrap();
    assert_eq!(remote_outcome.report.joined.len(), 3);
    assert_eq!(report.artifact.content_hash, sha256_hex(DUMP_CONTENT));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_tiers_share_one_payload() {
    use std::os::unix::fs::MetadataExt;

    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let report = run_on(
        0,
        local.path(),
        remote.path(),
        RetentionPolicy::default(),
        Arc::new(LocalShellTransport::default()),
    )
    .await;

    let name = report.artifact.file_name();
    let daily = std::fs::metadata(path_in(local.path(), "daily", &name)).unwrap();
    let monthly = std::fs::metadata(path_in(local.path(), "monthly", &name)).unwrap();
    assert_eq!(daily.ino(), monthly.ino());
    assert_eq!(daily.nlink(), 3);
}

#[tokio::test]
async fn test_rotation_over_many_days() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let transport = Arc::new(LocalShellTransport::default());
    let policy = RetentionPolicy::new(2, 1, 3);

    // 2024-01-01 is a Monday; run daily for five weeks
    for d in 0..35 {
        run_on(d, local.path(), remote.path(), policy, transport.clone()).await;
    }

    for root in [local.path(), remote.path()] {
        let daily = tier_files(root, "daily");
        assert_eq!(daily, vec!["all_20240203T030000000Z.sql", "all_20240204T030000000Z.sql"]);

        // newest week: Monday 2024-01-29
        assert_eq!(tier_files(root, "weekly"), vec!["all_20240129T030000000Z.sql"]);

        // January and February
        assert_eq!(
            tier_files(root, "monthly"),
            vec!["all_20240101T030000000Z.sql", "all_20240201T030000000Z.sql"]
        );
    }
}

#[tokio::test]
async fn test_skip_local_stores_remotely_only() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();

    let mut config = config(local.path(), remote.path(), RetentionPolicy::default());
    config.skip_local = true;
    let orchestrator = Orchestrator::new(
        config,
        FakeDump::default(),
        Some(Arc::new(LocalShellTransport::default())),
        FixedClock::new(day(3)),
    );
    let report = orchestrator.run().await.unwrap();

    assert!(report.local.is_none());
    let name = report.artifact.file_name();
    assert_eq!(tier_files(remote.path(), "daily"), vec![name.clone()]);

    // nothing permanent locally: no tier directories, no staging, only the lock
    assert_eq!(entries(local.path()), vec![".dbrotate.lock".to_string()]);
}

#[tokio::test]
async fn test_dump_failure_touches_nothing() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let transport = Arc::new(LocalShellTransport::default());

    let orchestrator = Orchestrator::new(
        config(local.path(), remote.path(), RetentionPolicy::default()),
        FakeDump::failing(),
        Some(transport.clone()),
        FixedClock::new(day(0)),
    );
    let err = orchestrator.run().await.unwrap_err();

    assert!(matches!(err, BackupError::Dump(_)));
    assert_eq!(entries(local.path()), vec![".dbrotate.lock".to_string()]);
    assert!(entries(remote.path()).is_empty());
    assert_eq!(transport.uploads.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_remote_is_a_warning() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();

    let orchestrator = Orchestrator::new(
        config(local.path(), remote.path(), RetentionPolicy::default()),
        FakeDump::default(),
        Some(Arc::new(UnreachableTransport)),
        FixedClock::new(day(0)),
    );
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert!(matches!(report.warnings.as_slice(), [RunWarning::Transfer(_)]));
    assert!(report.has_warnings());
    assert_eq!(tier_files(local.path(), "daily"), vec![report.artifact.file_name()]);
}

#[tokio::test]
async fn test_remote_store_failure_is_a_warning() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    // a file where the daily directory should be makes every remote install fail
    std::fs::write(remote.path().join("daily"), b"not a directory").unwrap();

    let report = run_on(
        0,
        local.path(),
        remote.path(),
        RetentionPolicy::default(),
        Arc::new(LocalShellTransport::default()),
    )
    .await;

    assert_eq!(report.state, RunState::Done);
    assert!(report.remote.is_none());
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, RunWarning::RemoteStore(_))));

    // local outcome kept, relayed copy removed anyway
    assert_eq!(tier_files(local.path(), "daily"), vec![report.artifact.file_name()]);
    assert!(tier_files(remote.path(), ".incoming").is_empty());
}

#[tokio::test]
async fn test_other_backup_sets_are_left_alone() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    std::fs::create_dir_all(local.path().join("daily")).unwrap();
    let foreign = "billing-users_20231201T030000000Z.sql";
    std::fs::write(path_in(local.path(), "daily", foreign), b"-- other set").unwrap();
    std::fs::write(path_in(local.path(), "daily", "README"), b"hands off").unwrap();

    let policy = RetentionPolicy::new(1, 1, 1);
    for d in 0..3 {
        run_on(d, local.path(), remote.path(), policy, Arc::new(LocalShellTransport::default())).await;
    }

    let daily = tier_files(local.path(), "daily");
    assert!(daily.contains(&foreign.to_string()));
    assert!(daily.contains(&"README".to_string()));
    assert!(daily.contains(&"all_20240103T030000000Z.sql".to_string()));
    assert_eq!(daily.len(), 3);
}

#[tokio::test]
async fn test_interrupted_remote_install_is_swept() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    std::fs::create_dir_all(remote.path().join("weekly")).unwrap();
    std::fs::write(
        path_in(remote.path(), "weekly", ".all_20231225T030000000Z.sql.partial"),
        b"-- cut short",
    )
    .unwrap();

    run_on(
        0,
        local.path(),
        remote.path(),
        RetentionPolicy::default(),
        Arc::new(LocalShellTransport::default()),
    )
    .await;

    assert_eq!(tier_files(remote.path(), "weekly"), vec!["all_20240101T030000000Z.sql"]);
}

#[tokio::test]
async fn test_compressed_artifacts() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let mut config = config(local.path(), remote.path(), RetentionPolicy::default());
    config.compress = true;

    let orchestrator = Orchestrator::new(
        config,
        FakeDump::default(),
        Some(Arc::new(LocalShellTransport::default())),
        FixedClock::new(day(0)),
    );
    let report = orchestrator.run().await.unwrap();

    let name = report.artifact.file_name();
    assert!(name.ends_with(".sql.gz"));
    assert_eq!(gunzip(&path_in(remote.path(), "daily", &name)), DUMP_CONTENT);
}

#[tokio::test]
async fn test_dump_utility_output_is_stored() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let config = config(local.path(), remote.path(), RetentionPolicy::default());

    // `echo` prints its arguments, standing in for mysqldump's stdout
    let dumper = MysqlDump::new(&config.database).with_binary("echo");
    let orchestrator = Orchestrator::new(
        config,
        dumper,
        Some(Arc::new(LocalShellTransport::default())),
        FixedClock::new(day(0)),
    );
    let report = orchestrator.run().await.unwrap();

    let expected = b"-u root --all-databases\n";
    let name = report.artifact.file_name();
    assert_eq!(report.artifact.size_bytes, expected.len() as u64);
    assert_eq!(report.artifact.content_hash, sha256_hex(expected));
    for root in [local.path(), remote.path()] {
        assert_eq!(std::fs::read(path_in(root, "daily", &name)).unwrap(), expected);
    }
}

#[tokio::test]
async fn test_local_store_failure_is_fatal() {
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    // a file where the weekly directory should be breaks the local store
    std::fs::write(local.path().join("weekly"), b"not a directory").unwrap();
    let transport = Arc::new(LocalShellTransport::default());

    let orchestrator = Orchestrator::new(
        config(local.path(), remote.path(), RetentionPolicy::default()),
        FakeDump::default(),
        Some(transport.clone()),
        FixedClock::new(day(0)),
    );
    let err = orchestrator.run().await.unwrap_err();

    assert!(matches!(err, BackupError::StoreIo { store: StoreKind::Local, .. }), "{err:?}");
    assert_eq!(transport.uploads.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(entries(remote.path()).is_empty());
    assert!(entries(local.path()).iter().all(|e| !e.starts_with(".staging-")));
}
