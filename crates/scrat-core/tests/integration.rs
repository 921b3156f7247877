//! End-to-end scenarios against a local destination: full/incremental
//! chains, point-in-time restore, splitting, tampering, rotation,
//! cancellation, and crash cleanup.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use scrat_core::catalog::{BackupKind, BackupStatus, Catalog};
use scrat_core::config::{
    BackupPolicy, CompressionSetting, DestinationConfig, DestinationKind, ScratConfig,
    SourceConfig,
};
use scrat_core::engine::{self, BackupOutcome, BackupRequest, CancelToken, RequestedKind};
use scrat_core::error::ScratError;
use scrat_core::events::EventSender;
use scrat_core::ops::Ops;
use scrat_core::restore::RestoreRequest;

const PASSPHRASE: &str = "correct-horse-battery-staple";

struct TestEnv {
    tmp: tempfile::TempDir,
    ops: Ops,
    source_dir: PathBuf,
    dest_root: PathBuf,
}

fn setup_with_policy(policy: BackupPolicy) -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let source_dir = tmp.path().join("source");
    fs::create_dir_all(&source_dir).unwrap();
    let dest_root = tmp.path().join("dest");

    let config = ScratConfig {
        catalog_path: tmp.path().join("catalog.db").display().to_string(),
        policy,
        spool_dir: None,
    };
    let (ops, _events) = Ops::open(config).unwrap();

    ops.add_source(&SourceConfig {
        name: "docs".into(),
        root_path: source_dir.display().to_string(),
        enabled: true,
        exclude_patterns: vec![],
    })
    .unwrap();
    ops.add_destination(&DestinationConfig {
        id: "dest1".into(),
        kind: DestinationKind::Local {
            root_path: dest_root.display().to_string(),
        },
        enabled: true,
    })
    .unwrap();

    TestEnv {
        tmp,
        ops,
        source_dir,
        dest_root,
    }
}

fn setup() -> TestEnv {
    setup_with_policy(BackupPolicy::default())
}

/// Write a file with an explicit mtime so change detection is
/// deterministic regardless of test speed.
fn write_file(root: &Path, rel: &str, contents: &[u8], mtime_secs_ago: i64) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    let mtime = Utc::now().timestamp() - mtime_secs_ago;
    filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

/// Relative forward-slash path -> contents for every file under `dir`.
fn read_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    if dir.is_dir() {
        walk(dir, dir, &mut out);
    }
    out
}

fn backup(env: &TestEnv, kind: RequestedKind) -> BackupOutcome {
    env.ops
        .start_backup("dest1", kind, PASSPHRASE, None)
        .unwrap()
}

fn restore_at(env: &TestEnv, at: chrono::DateTime<Utc>, target: &Path) -> scrat_core::restore::RestoreOutcome {
    env.ops
        .restore(&RestoreRequest {
            destination_id: "dest1".into(),
            at,
            passphrase: PASSPHRASE.into(),
            selection: None,
            target_dir: target.to_path_buf(),
        })
        .unwrap()
}

fn point_of<'a>(
    points: &'a [scrat_core::restore::RestorePoint],
    backup_id: &str,
) -> &'a scrat_core::restore::RestorePoint {
    points
        .iter()
        .find(|p| p.backup_id == backup_id)
        .unwrap_or_else(|| panic!("no restore point for {backup_id}"))
}

/// Deterministic byte stream for payloads; avoids compressible content.
fn prng_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn s1_full_incremental_point_in_time_restore() {
    let env = setup();

    write_file(&env.source_dir, "a.txt", b"hello", 30);
    write_file(&env.source_dir, "b/c.bin", &vec![0xAB; 1024 * 1024], 30);

    let full = backup(&env, RequestedKind::Full);
    assert_eq!(full.kind, BackupKind::Full);
    assert_eq!(full.stats.files_total, 2);
    let original = read_tree(&env.source_dir);

    // Mutate: rewrite a.txt (same size, fresh mtime), add, delete.
    write_file(&env.source_dir, "a.txt", b"HELLO", 0);
    write_file(&env.source_dir, "b/d.txt", b"new", 0);
    fs::remove_file(env.source_dir.join("b/c.bin")).unwrap();

    let incr = backup(&env, RequestedKind::Incremental);
    assert_eq!(incr.kind, BackupKind::Incremental);
    assert_eq!(incr.stats.files_total, 2); // a.txt + b/d.txt

    let points = env.ops.list_restorable_points("dest1").unwrap();
    assert_eq!(points.len(), 2);
    let t0 = point_of(&points, &full.backup_id).timestamp;
    let t1 = point_of(&points, &incr.backup_id).timestamp;

    // T0 reproduces the original tree byte for byte.
    let r0 = env.tmp.path().join("restore0");
    let outcome = restore_at(&env, t0, &r0);
    assert_eq!(outcome.files_restored, 2);
    assert!(outcome.failed.is_empty());
    assert_eq!(read_tree(&r0), original);

    // T1 shows the rewrite, the addition, and the deletion.
    let r1 = env.tmp.path().join("restore1");
    restore_at(&env, t1, &r1);
    let restored = read_tree(&r1);
    assert_eq!(restored.get("a.txt").map(Vec::as_slice), Some(&b"HELLO"[..]));
    assert_eq!(restored.get("b/d.txt").map(Vec::as_slice), Some(&b"new"[..]));
    assert!(!restored.contains_key("b/c.bin"));
}

#[test]
fn restore_preserves_mtime_and_mode() {
    let env = setup();
    write_file(&env.source_dir, "kept.txt", b"payload", 500);
    let source_path = env.source_dir.join("kept.txt");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&source_path, fs::Permissions::from_mode(0o640)).unwrap();
    }
    let source_mtime = fs::metadata(&source_path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();

    backup(&env, RequestedKind::Full);
    let target = env.tmp.path().join("restore");
    restore_at(&env, Utc::now(), &target);

    let restored = fs::metadata(target.join("kept.txt")).unwrap();
    let restored_mtime = restored
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(restored_mtime, source_mtime);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(restored.permissions().mode() & 0o7777, 0o640);
    }
}

#[test]
fn split_lands_between_files_and_restores_identically() {
    let split = 64 * 1024u64;
    let mut policy = BackupPolicy {
        split_size_bytes: split,
        compression: CompressionSetting::None,
        ..Default::default()
    };
    policy.upload_catalog_copy = false;
    let env = setup_with_policy(policy);

    // Two files of exactly split_size each: the first fills segment one
    // past the threshold, the second lands in segment two.
    write_file(&env.source_dir, "one.bin", &prng_bytes(0x5EED, split as usize), 30);
    write_file(&env.source_dir, "two.bin", &prng_bytes(0xBEEF, split as usize), 30);

    let outcome = backup(&env, RequestedKind::Full);

    let backup_dir = env
        .dest_root
        .join("scrat-backup/backups")
        .join(&outcome.backup_id);
    let mut names: Vec<String> = fs::read_dir(&backup_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["data.001.scrat", "data.002.scrat", "manifest.json.enc"]
    );

    // Segment one stored roughly the split threshold (payload + framing).
    let seg1 = fs::metadata(backup_dir.join("data.001.scrat")).unwrap().len();
    let seg2 = fs::metadata(backup_dir.join("data.002.scrat")).unwrap().len();
    assert!(seg1 >= split && seg1 < split + 16 * 1024, "seg1 = {seg1}");
    assert!(seg2 > 0);

    let target = env.tmp.path().join("restore");
    restore_at(&env, Utc::now(), &target);
    assert_eq!(read_tree(&target), read_tree(&env.source_dir));
}

#[test]
fn single_file_larger_than_split_stays_in_one_segment() {
    // Splits only ever land between files: one oversized file makes one
    // oversized segment.
    let split = 64 * 1024u64;
    let policy = BackupPolicy {
        split_size_bytes: split,
        compression: CompressionSetting::None,
        upload_catalog_copy: false,
        ..Default::default()
    };
    let env = setup_with_policy(policy);
    write_file(
        &env.source_dir,
        "big.bin",
        &prng_bytes(0x5EED, 2 * split as usize),
        30,
    );

    let outcome = backup(&env, RequestedKind::Full);
    let backup_dir = env
        .dest_root
        .join("scrat-backup/backups")
        .join(&outcome.backup_id);
    let segments: Vec<_> = fs::read_dir(&backup_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".scrat"))
        .collect();
    assert_eq!(segments, vec!["data.001.scrat"]);

    let target = env.tmp.path().join("restore");
    restore_at(&env, Utc::now(), &target);
    assert_eq!(read_tree(&target), read_tree(&env.source_dir));
}

#[test]
fn s3_rotation_keeps_newest_chains() {
    let policy = BackupPolicy {
        max_versions: 2,
        upload_catalog_copy: false,
        ..Default::default()
    };
    let env = setup_with_policy(policy);

    write_file(&env.source_dir, "a.txt", b"v1", 60);
    let f1 = backup(&env, RequestedKind::Full);
    write_file(&env.source_dir, "a.txt", b"v2", 50);
    let i1a = backup(&env, RequestedKind::Incremental);
    write_file(&env.source_dir, "a.txt", b"v3", 40);
    let f2 = backup(&env, RequestedKind::Full);
    write_file(&env.source_dir, "a.txt", b"v4", 30);
    let i2a = backup(&env, RequestedKind::Incremental);
    write_file(&env.source_dir, "a.txt", b"v5", 20);
    let f3 = backup(&env, RequestedKind::Full);

    // F1 and its incremental are gone from catalog and destination.
    let points = env.ops.list_restorable_points("dest1").unwrap();
    let ids: HashSet<String> = points.into_iter().map(|p| p.backup_id).collect();
    assert!(!ids.contains(&f1.backup_id));
    assert!(!ids.contains(&i1a.backup_id));
    assert!(ids.contains(&f2.backup_id));
    assert!(ids.contains(&i2a.backup_id));
    assert!(ids.contains(&f3.backup_id));

    let mut remote: Vec<String> = fs::read_dir(env.dest_root.join("scrat-backup/backups"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    remote.sort();
    let mut expected = vec![f2.backup_id.clone(), i2a.backup_id.clone(), f3.backup_id.clone()];
    expected.sort();
    assert_eq!(remote, expected);

    // Every surviving backup still restores (its ancestors survived too).
    let points = env.ops.list_restorable_points("dest1").unwrap();
    let t = point_of(&points, &i2a.backup_id).timestamp;
    let target = env.tmp.path().join("restore");
    restore_at(&env, t, &target);
    assert_eq!(
        read_tree(&target).get("a.txt").map(Vec::as_slice),
        Some(&b"v4"[..])
    );
}

#[test]
fn s4_tampered_segment_fails_others_restore() {
    let policy = BackupPolicy {
        split_size_bytes: 32 * 1024,
        compression: CompressionSetting::None,
        upload_catalog_copy: false,
        ..Default::default()
    };
    let env = setup_with_policy(policy);

    write_file(&env.source_dir, "first.bin", &prng_bytes(1, 40 * 1024), 30);
    write_file(&env.source_dir, "second.bin", &prng_bytes(2, 10 * 1024), 30);

    let outcome = backup(&env, RequestedKind::Full);
    let backup_dir = env
        .dest_root
        .join("scrat-backup/backups")
        .join(&outcome.backup_id);
    assert!(backup_dir.join("data.002.scrat").exists(), "needs two segments");

    // Flip one bit inside the first ciphertext chunk of segment one.
    let seg1_path = backup_dir.join("data.001.scrat");
    let mut bytes = fs::read(&seg1_path).unwrap();
    bytes[100] ^= 0x01;
    fs::write(&seg1_path, &bytes).unwrap();

    let target = env.tmp.path().join("restore");
    let result = env
        .ops
        .restore(&RestoreRequest {
            destination_id: "dest1".into(),
            at: Utc::now(),
            passphrase: PASSPHRASE.into(),
            selection: None,
            target_dir: target.clone(),
        })
        .unwrap();

    // Segment one's file is reported, segment two's file is intact.
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].relative_path, "first.bin");
    assert_eq!(result.failed[0].archive_name, "data.001.scrat");
    assert_eq!(result.files_restored, 1);

    let restored = read_tree(&target);
    assert!(!restored.contains_key("first.bin"));
    assert_eq!(
        restored.get("second.bin").map(Vec::len),
        Some(10 * 1024)
    );
}

#[test]
fn wrong_passphrase_fails_fast_and_writes_nothing() {
    let env = setup();
    write_file(&env.source_dir, "secret.txt", b"contents", 30);
    backup(&env, RequestedKind::Full);

    let target = env.tmp.path().join("restore");
    let err = env
        .ops
        .restore(&RestoreRequest {
            destination_id: "dest1".into(),
            at: Utc::now(),
            passphrase: "wrong-horse-battery-staple".into(),
            selection: None,
            target_dir: target.clone(),
        })
        .unwrap_err();

    assert!(matches!(err, ScratError::Passphrase));
    assert!(read_tree(&target).is_empty());
}

#[test]
fn incremental_with_wrong_passphrase_is_rejected() {
    let env = setup();
    write_file(&env.source_dir, "a.txt", b"v1", 30);
    backup(&env, RequestedKind::Full);

    write_file(&env.source_dir, "a.txt", b"v2", 0);
    let err = env
        .ops
        .start_backup(
            "dest1",
            RequestedKind::Incremental,
            "different-wrong-passphrase",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ScratError::Passphrase));
}

#[test]
fn selection_restores_a_subtree_only() {
    let env = setup();
    write_file(&env.source_dir, "a.txt", b"a", 30);
    write_file(&env.source_dir, "b/c.txt", b"c", 30);
    write_file(&env.source_dir, "b/d/e.txt", b"e", 30);
    backup(&env, RequestedKind::Full);

    let target = env.tmp.path().join("restore");
    let selection: HashSet<String> = ["b".to_string()].into_iter().collect();
    let outcome = env
        .ops
        .restore(&RestoreRequest {
            destination_id: "dest1".into(),
            at: Utc::now(),
            passphrase: PASSPHRASE.into(),
            selection: Some(selection),
            target_dir: target.clone(),
        })
        .unwrap();

    assert_eq!(outcome.files_restored, 2);
    let restored = read_tree(&target);
    assert!(restored.contains_key("b/c.txt"));
    assert!(restored.contains_key("b/d/e.txt"));
    assert!(!restored.contains_key("a.txt"));
}

#[test]
fn empty_source_set_produces_completed_empty_backup() {
    let env = setup();
    let outcome = backup(&env, RequestedKind::Full);
    assert_eq!(outcome.stats.files_total, 0);

    let points = env.ops.list_restorable_points("dest1").unwrap();
    assert_eq!(points.len(), 1);

    let target = env.tmp.path().join("restore");
    let restored = restore_at(&env, Utc::now(), &target);
    assert_eq!(restored.files_restored, 0);
}

#[test]
fn zero_byte_and_unicode_files_roundtrip() {
    let env = setup();
    write_file(&env.source_dir, "empty.dat", b"", 30);
    write_file(&env.source_dir, "unter/größe müßig.txt", "ößü".as_bytes(), 30);

    let outcome = backup(&env, RequestedKind::Full);
    assert_eq!(outcome.stats.files_total, 2);

    let target = env.tmp.path().join("restore");
    restore_at(&env, Utc::now(), &target);
    assert_eq!(read_tree(&target), read_tree(&env.source_dir));
}

#[test]
fn future_and_pre_epoch_mtimes_survive() {
    let env = setup();
    let path = env.source_dir.join("clock.txt");
    fs::write(&path, b"skewed").unwrap();
    let future = Utc::now().timestamp() + 7 * 24 * 3600;
    filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(future, 0)).unwrap();

    backup(&env, RequestedKind::Full);
    let target = env.tmp.path().join("restore");
    restore_at(&env, Utc::now(), &target);

    let restored = filetime::FileTime::from_last_modification_time(
        &fs::metadata(target.join("clock.txt")).unwrap(),
    );
    assert_eq!(restored.unix_seconds(), future);
}

#[test]
fn p4_every_intermediate_state_is_restorable() {
    let env = setup();

    // S0
    write_file(&env.source_dir, "a.txt", b"state0", 60);
    let b0 = backup(&env, RequestedKind::Full);
    let s0 = read_tree(&env.source_dir);

    // S1: modify + add
    write_file(&env.source_dir, "a.txt", b"state1!", 40);
    write_file(&env.source_dir, "b.txt", b"fresh", 40);
    let b1 = backup(&env, RequestedKind::Incremental);
    let s1 = read_tree(&env.source_dir);

    // S2: delete + add
    fs::remove_file(env.source_dir.join("b.txt")).unwrap();
    write_file(&env.source_dir, "c.txt", b"newest", 20);
    let b2 = backup(&env, RequestedKind::Incremental);
    let s2 = read_tree(&env.source_dir);

    let points = env.ops.list_restorable_points("dest1").unwrap();
    for (backup_id, expected) in [(&b0.backup_id, &s0), (&b1.backup_id, &s1), (&b2.backup_id, &s2)]
    {
        let at = point_of(&points, backup_id).timestamp;
        let target = env.tmp.path().join(format!("restore-{backup_id}"));
        restore_at(&env, at, &target);
        assert_eq!(&read_tree(&target), expected, "state at {backup_id}");
    }
}

#[test]
fn multi_source_restore_keeps_sources_apart() {
    let env = setup();
    let second_root = env.tmp.path().join("source2");
    fs::create_dir_all(&second_root).unwrap();
    env.ops
        .add_source(&SourceConfig {
            name: "pictures".into(),
            root_path: second_root.display().to_string(),
            enabled: true,
            exclude_patterns: vec![],
        })
        .unwrap();

    write_file(&env.source_dir, "shared.txt", b"from docs", 30);
    write_file(&second_root, "shared.txt", b"from pictures", 30);

    backup(&env, RequestedKind::Full);
    let target = env.tmp.path().join("restore");
    let outcome = restore_at(&env, Utc::now(), &target);
    assert_eq!(outcome.files_restored, 2);

    let restored = read_tree(&target);
    assert_eq!(
        restored.get("docs/shared.txt").map(Vec::as_slice),
        Some(&b"from docs"[..])
    );
    assert_eq!(
        restored.get("pictures/shared.txt").map(Vec::as_slice),
        Some(&b"from pictures"[..])
    );
}

// ---------------------------------------------------------------------
// Engine-level scenarios that need direct catalog access
// ---------------------------------------------------------------------

struct EngineEnv {
    _tmp: tempfile::TempDir,
    catalog: Catalog,
    policy: BackupPolicy,
    source_dir: PathBuf,
    dest_root: PathBuf,
}

fn engine_setup() -> EngineEnv {
    let tmp = tempfile::tempdir().unwrap();
    let source_dir = tmp.path().join("source");
    fs::create_dir_all(&source_dir).unwrap();
    let dest_root = tmp.path().join("dest");

    let catalog = Catalog::open(&tmp.path().join("catalog.db")).unwrap();
    catalog
        .upsert_source(&SourceConfig {
            name: "docs".into(),
            root_path: source_dir.display().to_string(),
            enabled: true,
            exclude_patterns: vec![],
        })
        .unwrap();
    catalog
        .upsert_destination(&DestinationConfig {
            id: "dest1".into(),
            kind: DestinationKind::Local {
                root_path: dest_root.display().to_string(),
            },
            enabled: true,
        })
        .unwrap();

    let policy = BackupPolicy {
        upload_catalog_copy: false,
        ..Default::default()
    };

    EngineEnv {
        _tmp: tmp,
        catalog,
        policy,
        source_dir,
        dest_root,
    }
}

fn engine_request(kind: RequestedKind) -> BackupRequest {
    BackupRequest {
        destination_id: "dest1".into(),
        kind,
        passphrase: PASSPHRASE.into(),
        sources: None,
    }
}

#[test]
fn s6_cancelled_run_leaves_no_stray_state() {
    let mut env = engine_setup();
    for i in 0..50 {
        write_file(&env.source_dir, &format!("file{i:02}.txt"), b"payload", 30);
    }

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = engine::run(
        &mut env.catalog,
        &env.policy,
        None,
        &engine_request(RequestedKind::Full),
        &EventSender::disconnected(),
        &cancel,
    )
    .unwrap_err();
    assert!(matches!(err, ScratError::Cancelled));

    // The row survives as failed(cancelled)...
    let backups = env.catalog.unfinished_backups("dest1").unwrap();
    assert!(backups.is_empty(), "no running/partial rows remain");
    let all_points =
        scrat_core::restore::list_restorable_points(&env.catalog, "dest1").unwrap();
    assert!(all_points.is_empty());

    // ...with no archive rows and nothing on the destination.
    let backups_dir = env.dest_root.join("scrat-backup/backups");
    let remote_dirs = fs::read_dir(&backups_dir)
        .map(|rd| rd.count())
        .unwrap_or(0);
    assert_eq!(remote_dirs, 0);
}

#[test]
fn crashed_run_is_resolved_by_the_next_backup() {
    let mut env = engine_setup();
    write_file(&env.source_dir, "a.txt", b"v1", 30);

    // Simulate a crash: a running row plus an orphan segment on disk.
    let started = Utc::now() - chrono::Duration::minutes(10);
    let (stale_id, stale_started) = env
        .catalog
        .allocate_backup_id(BackupKind::Full, "dest1", started)
        .unwrap();
    env.catalog
        .create_backup(&scrat_core::catalog::BackupRow {
            backup_id: stale_id.clone(),
            kind: BackupKind::Full,
            base_backup_id: None,
            destination_ref: "dest1".into(),
            status: BackupStatus::Running,
            started_at: stale_started,
            finished_at: None,
            files_total: 0,
            size_original: 0,
            size_stored: 0,
            salt: vec![0u8; 32],
            verifier: "dead".into(),
            error_message: None,
        })
        .unwrap();
    let orphan_dir = env
        .dest_root
        .join("scrat-backup/backups")
        .join(&stale_id);
    fs::create_dir_all(&orphan_dir).unwrap();
    fs::write(orphan_dir.join("data.001.scrat"), b"torn bytes").unwrap();

    let outcome = engine::run(
        &mut env.catalog,
        &env.policy,
        None,
        &engine_request(RequestedKind::Full),
        &EventSender::disconnected(),
        &CancelToken::new(),
    )
    .unwrap();

    // The stale run is failed and its objects are gone; the new backup
    // stands alone on the destination.
    let stale = env.catalog.backup(&stale_id).unwrap().unwrap();
    assert_eq!(stale.status, BackupStatus::Failed);
    assert!(!orphan_dir.exists());
    let remote: Vec<String> = fs::read_dir(env.dest_root.join("scrat-backup/backups"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remote, vec![outcome.backup_id.clone()]);
}

#[test]
fn recovery_info_is_written_once() {
    let env = setup();
    write_file(&env.source_dir, "a.txt", b"v1", 30);
    backup(&env, RequestedKind::Full);

    let info_path = env.dest_root.join("scrat-backup/recovery_info.txt");
    let first = fs::read_to_string(&info_path).unwrap();
    assert!(first.contains("format version 1"));

    write_file(&env.source_dir, "a.txt", b"v2", 0);
    backup(&env, RequestedKind::Incremental);
    assert_eq!(fs::read_to_string(&info_path).unwrap(), first);
}

#[test]
fn catalog_copy_is_uploaded_and_decryptable() {
    let env = setup(); // default policy keeps upload_catalog_copy = true
    write_file(&env.source_dir, "a.txt", b"v1", 30);
    backup(&env, RequestedKind::Full);

    let sealed = fs::read(env.dest_root.join("scrat-backup/metadata.db.enc")).unwrap();
    let plain = scrat_core::crypto::stream::open_bytes(PASSPHRASE, &sealed).unwrap();
    // SQLite database header.
    assert!(plain.starts_with(b"SQLite format 3\0"));
}

#[test]
fn manifest_mirrors_the_run() {
    let env = setup();
    write_file(&env.source_dir, "a.txt", b"hello", 30);
    let outcome = backup(&env, RequestedKind::Full);

    let sealed = fs::read(
        env.dest_root
            .join("scrat-backup/backups")
            .join(&outcome.backup_id)
            .join("manifest.json.enc"),
    )
    .unwrap();
    let manifest = scrat_core::manifest::open(PASSPHRASE, &sealed).unwrap();

    assert_eq!(manifest.backup_id, outcome.backup_id);
    assert_eq!(manifest.kind, "full");
    assert_eq!(manifest.format_version, 1);
    assert_eq!(manifest.stats.files_total, 1);
    assert_eq!(manifest.archives.len(), 1);
    assert_eq!(manifest.archives[0].name, "data.001.scrat");
    assert_eq!(manifest.sources.len(), 1);
    assert_eq!(manifest.sources[0].name, "docs");
}

#[test]
fn verify_after_backup_passes_on_clean_data() {
    let policy = BackupPolicy {
        verify_after_backup: true,
        upload_catalog_copy: false,
        ..Default::default()
    };
    let env = setup_with_policy(policy);
    write_file(&env.source_dir, "a.txt", b"verified", 30);
    // Completes only if every sealed segment authenticates.
    backup(&env, RequestedKind::Full);
}
