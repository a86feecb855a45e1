use super::*;

use std::{env, fs, os::unix::fs::PermissionsExt, path::PathBuf};

use crate::{
    config::{Config, Selection},
    session::Repo,
    util, DATA_DIR,
};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("revbak-{}-{}", name, rand::random::<u32>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn put_file(root: &std::path::Path, rel: &str, content: &[u8], mtime: i64) {
    let loc = root.join(rel);
    if let Some(parent) = loc.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&loc, content).unwrap();
    fs::set_permissions(&loc, fs::Permissions::from_mode(0o644)).unwrap();
    filetime::set_file_mtime(&loc, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

const T1: SessionTime = SessionTime(1_700_000_001);
const T2: SessionTime = SessionTime(1_700_000_100);
const T3: SessionTime = SessionTime(1_700_000_200);

// three sessions: hello/world, then a modified, then d/b deleted.
fn three_sessions(dir: &std::path::Path) -> Repo {
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    put_file(&source, "d/b", b"world", 1_700_000_000);

    let repo = Repo::open(&dir.join("mirror"), Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();

    put_file(&source, "a", b"hello!", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();

    fs::remove_file(source.join("d/b")).unwrap();
    repo.backup_at(&source, Selection::all(), T3).unwrap();
    repo
}

#[test]
fn test_resolve_rest_time() {
    let times = vec![T1, T2, T3];
    assert_eq!(resolve_rest_time(T1, &times), T1);
    assert_eq!(resolve_rest_time(T3, &times), T3);
    // between two sessions the older one was on disk
    assert_eq!(resolve_rest_time(SessionTime(1_700_000_150), &times), T2);
    // after the newest session
    assert_eq!(resolve_rest_time(SessionTime(2_000_000_000), &times), T3);
    // before the oldest falls back to the oldest
    assert_eq!(resolve_rest_time(SessionTime(5), &times), T1);
}

#[test]
fn test_round_trip_every_session() {
    let dir = scratch_dir("restore-roundtrip");
    let repo = three_sessions(&dir);

    // state at T1
    let out = dir.join("out1");
    repo.restore(&Index::root(), &out, T1).unwrap();
    assert_eq!(fs::read(out.join("a")).unwrap(), b"hello");
    assert_eq!(fs::read(out.join("d/b")).unwrap(), b"world");
    assert_eq!(
        fs::metadata(out.join("a")).unwrap().permissions().mode() & 0o7777,
        0o644
    );
    let mtime = fs::metadata(out.join("a")).unwrap().modified().unwrap();
    let want = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
    assert_eq!(mtime, want);

    // state at T2
    let out = dir.join("out2");
    repo.restore(&Index::root(), &out, T2).unwrap();
    assert_eq!(fs::read(out.join("a")).unwrap(), b"hello!");
    assert_eq!(fs::read(out.join("d/b")).unwrap(), b"world");

    // state at T3, the current mirror
    let out = dir.join("out3");
    repo.restore(&Index::root(), &out, T3).unwrap();
    assert_eq!(fs::read(out.join("a")).unwrap(), b"hello!");
    assert!(!out.join("d/b").exists());
    assert!(out.join("d").is_dir());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_restore_intermediate_time() {
    let dir = scratch_dir("restore-intermediate");
    let repo = three_sessions(&dir);

    // 150 seconds falls between sessions 2 and 3: session 2 wins
    let out = dir.join("out");
    repo.restore(&Index::root(), &out, SessionTime(1_700_000_150)).unwrap();
    assert_eq!(fs::read(out.join("a")).unwrap(), b"hello!");
    assert_eq!(fs::read(out.join("d/b")).unwrap(), b"world");

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_restore_subtree() {
    let dir = scratch_dir("restore-subtree");
    let repo = three_sessions(&dir);

    let out = dir.join("out");
    repo.restore(&Index::from_path(b"d"), &out, T1).unwrap();
    assert_eq!(fs::read(out.join("b")).unwrap(), b"world");
    assert!(!out.join("a").exists());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_restore_many_versions_of_one_file() {
    let dir = scratch_dir("restore-versions");
    let source = dir.join("source");
    let repo = Repo::open(&dir.join("mirror"), Config::new()).unwrap();

    let mut times = vec![];
    for i in 0..6_i64 {
        let content = format!("version {} of this file\n", i).repeat(50);
        put_file(&source, "f", content.as_bytes(), 1_700_000_000 + i * 10);
        let t = SessionTime(1_700_000_001 + i * 100);
        repo.backup_at(&source, Selection::all(), t).unwrap();
        times.push(t);
    }

    for (i, t) in times.iter().enumerate() {
        let out = dir.join(format!("out{}", i));
        repo.restore(&Index::root(), &out, *t).unwrap();
        let want = format!("version {} of this file\n", i).repeat(50);
        assert_eq!(fs::read(out.join("f")).unwrap(), want.as_bytes());
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_cached_rf_fallback_attrs() {
    let dir = scratch_dir("restore-fallback");
    let repo = three_sessions(&dir);
    drop(repo);

    let mirror = dir.join("mirror");
    let mirror_root = RPath::new(&mirror, Index::root(), None).unwrap();
    let inc_root = RPath::new(
        &mirror.join(DATA_DIR).join(crate::INCREMENTS_DIR),
        Index::root(),
        None,
    )
    .unwrap();
    let long_root = RPath::new(
        &mirror.join(DATA_DIR).join(crate::longname::LONG_NAME_DIR),
        Index::root(),
        None,
    )
    .unwrap();

    // at rest time T2 the snapshot increment for d/b is relevant and
    // supplies attributes even without the metadata chain.
    let mut rf = CachedRF::new(mirror_root, inc_root, long_root, T2, T3);
    let attrs = rf.fallback_attrs(&Index::from_path(b"d/b")).unwrap().unwrap();
    assert!(attrs.is_reg());
    assert_eq!(attrs.mtime, 1_700_000_000);

    // and the data chain agrees
    let probe = Rorp::new(
        Index::from_path(b"d/b"),
        crate::rorp::Attrs::new(crate::rorp::FileType::Reg),
    );
    let bytes = rf.restore_bytes(&probe).unwrap().unwrap();
    assert_eq!(bytes, b"world");

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_restore_sha1_recorded() {
    let dir = scratch_dir("restore-sha1");
    let repo = three_sessions(&dir);

    // metadata carries hashes usable for verification after restore
    let manager = crate::meta::Manager::new(
        &dir.join("mirror").join(DATA_DIR),
        true,
        false,
    );
    let records: Vec<_> = manager.attrs_at(T1).unwrap().map(|r| r.unwrap()).collect();
    let a = records.iter().find(|r| r.index == Index::from_path(b"a")).unwrap();
    assert_eq!(a.attrs.sha1.as_deref(), Some(util::sha1_hex(b"hello")).as_deref());
    drop(repo);

    fs::remove_dir_all(&dir).unwrap();
}
