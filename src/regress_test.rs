use super::*;

use std::{env, os::unix::fs::PermissionsExt, path::Path};

use crate::{
    config::{Config, Selection},
    session::{DestState, Repo},
    DATA_DIR,
};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("revbak-{}-{}", name, rand::random::<u32>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn put_file(root: &Path, rel: &str, content: &[u8], mtime: i64) {
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
const T4: SessionTime = SessionTime(1_700_000_300);

fn marker_path(mirror: &Path, time: SessionTime) -> PathBuf {
    mirror
        .join(DATA_DIR)
        .join(format!("current_mirror.{}.data", time.to_string_with(false)))
}

// full recursive listing of path -> content, for equivalence checks.
// session markers are left out; their lifecycle is asserted through
// check_dest instead.
fn snapshot_tree(root: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
    let mut out = std::collections::BTreeMap::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .to_string();
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("current_mirror.")
            {
                continue;
            }
            let ft = entry.file_type().unwrap();
            if ft.is_dir() {
                dirs.push(entry.path());
                out.insert(rel, b"<dir>".to_vec());
            } else if ft.is_file() {
                out.insert(rel, fs::read(entry.path()).unwrap());
            } else {
                out.insert(rel, b"<other>".to_vec());
            }
        }
    }
    out
}

#[test]
fn test_parse_marker_pid() {
    assert_eq!(parse_marker_pid(b"PID 1234\n"), Some(1234));
    assert_eq!(parse_marker_pid(b"PID 1234"), Some(1234));
    assert_eq!(parse_marker_pid(b"no pid here"), None);
    assert_eq!(parse_marker_pid(b""), None);
}

#[test]
fn test_pid_alive() {
    assert!(pid_alive(std::process::id()));
    assert!(!pid_alive(4_000_000_000));
}

#[test]
fn test_regress_dead_marker_only() {
    // scenario: a marker from a crashed session that never wrote
    // anything; regress removes it and leaves everything else intact.
    let dir = scratch_dir("regress-marker");
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    put_file(&source, "d/b", b"world", 1_700_000_000);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    put_file(&source, "a", b"hello!", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();
    fs::remove_file(source.join("d/b")).unwrap();
    repo.backup_at(&source, Selection::all(), T3).unwrap();

    let before = snapshot_tree(&mirror);

    fs::write(marker_path(&mirror, T4), b"PID 4000000000\n").unwrap();
    assert_eq!(repo.check_dest().unwrap(), DestState::NeedsRegress(T3, T4));

    repo.regress().unwrap();

    assert_eq!(repo.check_dest().unwrap(), DestState::Clean(T3));
    let after = snapshot_tree(&mirror);
    assert_eq!(before, after);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_regress_reverts_partial_session() {
    let dir = scratch_dir("regress-revert");
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    put_file(&source, "d/b", b"world", 1_700_000_000);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    put_file(&source, "a", b"hello!", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();

    let before = snapshot_tree(&mirror);

    // a fourth session that "aborted": it ran to completion, then we
    // resurrect the old marker to put the repository in the two-marker
    // state regress expects.
    put_file(&source, "a", b"corrupted by crash", 1_700_000_250);
    put_file(&source, "evil", b"should vanish", 1_700_000_250);
    fs::remove_file(source.join("d/b")).unwrap();
    repo.backup_at(&source, Selection::all(), T3).unwrap();
    fs::write(marker_path(&mirror, T2), b"PID 4000000000\n").unwrap();

    assert_eq!(repo.check_dest().unwrap(), DestState::NeedsRegress(T2, T3));
    repo.regress().unwrap();

    // byte-identical to the post-session-2 state
    assert_eq!(repo.check_dest().unwrap(), DestState::Clean(T2));
    let after = snapshot_tree(&mirror);
    assert_eq!(before, after);

    // and a further backup works on top of the regressed state
    put_file(&source, "a", b"hello again", 1_700_000_350);
    put_file(&source, "d/b", b"world", 1_700_000_000);
    repo.backup_at(&source, Selection::all(), T4).unwrap();
    assert_eq!(fs::read(mirror.join("a")).unwrap(), b"hello again");

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_regress_refuses_live_pid() {
    let dir = scratch_dir("regress-live");
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    let contents = format!("PID {}\n", std::process::id());
    fs::write(marker_path(&mirror, T2), contents.as_bytes()).unwrap();

    match repo.regress() {
        Err(Error::Fatal(..)) => (),
        other => panic!("expected Fatal, got {:?}", other),
    }

    // force overrides the liveness check
    let mut config = Config::new();
    config.set_force(true);
    let repo = Repo::open(&mirror, config).unwrap();
    repo.regress().unwrap();
    assert_eq!(repo.check_dest().unwrap(), DestState::Clean(T1));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_regress_nothing_to_do() {
    let dir = scratch_dir("regress-clean");
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    assert!(repo.regress().is_err());

    fs::remove_dir_all(&dir).unwrap();
}
