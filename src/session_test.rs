use super::*;

use std::{env, os::unix::fs::PermissionsExt};

use crate::{
    inc::{parse_inc_name, IncKind},
    meta::Manager,
    rorp::FileType,
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

fn freeze_dir_mtimes(root: &Path, mtime: i64) {
    // children first, the parents last, so the updates stick.
    let mut dirs = vec![root.to_path_buf()];
    let mut i = 0;
    while i < dirs.len() {
        let dir = dirs[i].clone();
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                dirs.push(entry.path());
            }
        }
        i += 1;
    }
    for dir in dirs.iter().rev() {
        filetime::set_file_mtime(dir, filetime::FileTime::from_unix_time(mtime, 0))
            .unwrap();
    }
}

// the tree of the end-to-end scenarios: {a: "hello", d/: {b: "world"}}
fn setup_source(dir: &Path) -> PathBuf {
    let source = dir.join("source");
    put_file(&source, "a", b"hello", 1_700_000_000);
    put_file(&source, "d/b", b"world", 1_700_000_000);
    fs::set_permissions(&source.join("d"), fs::Permissions::from_mode(0o755)).unwrap();
    freeze_dir_mtimes(&source, 1_700_000_000);
    source
}

fn list_increment_files(data_dir: &Path) -> Vec<PathBuf> {
    let mut found = vec![];
    let mut dirs = vec![data_dir.join(INCREMENTS_DIR)];
    while let Some(dir) = dirs.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                dirs.push(entry.path());
            } else {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    found
}

const T1: SessionTime = SessionTime(1_700_000_001);
const T2: SessionTime = SessionTime(1_700_000_100);
const T3: SessionTime = SessionTime(1_700_000_200);

#[test]
fn test_fresh_backup() {
    let dir = scratch_dir("fresh-backup");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    let stats = repo.backup_at(&source, Selection::all(), T1).unwrap();

    // mirror matches the source byte for byte
    assert_eq!(fs::read(mirror.join("a")).unwrap(), b"hello");
    assert_eq!(fs::read(mirror.join("d/b")).unwrap(), b"world");
    assert_eq!(
        fs::metadata(mirror.join("a")).unwrap().permissions().mode() & 0o7777,
        0o644
    );

    // the session marker carries our pid
    let marker = mirror
        .join(DATA_DIR)
        .join(format!("current_mirror.{}.data", T1.to_string_with(false)));
    let contents = fs::read(&marker).unwrap();
    assert!(contents.starts_with(b"PID "), "{:?}", contents);

    // a metadata snapshot, no increments
    let manager = Manager::new(&mirror.join(DATA_DIR), true, false);
    let files = manager.list_files().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].is_snapshot);
    assert_eq!(files[0].time, T1);

    let records: Vec<_> = manager.attrs_at(T1).unwrap().map(|r| r.unwrap()).collect();
    let a = records.iter().find(|r| r.index == Index::from_path(b"a")).unwrap();
    assert_eq!(a.attrs.size, 5);
    assert_eq!(a.attrs.sha1.as_deref(), Some(crate::util::sha1_hex(b"hello")).as_deref());
    assert!(records.iter().any(|r| r.index == Index::from_path(b"d/b")));

    assert!(list_increment_files(&mirror.join(DATA_DIR)).is_empty());
    assert_eq!(stats.errors, 0);
    assert!(stats.source_files >= 4); // root, a, d, d/b

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_modify_one_file() {
    let dir = scratch_dir("modify-one");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();

    put_file(&source, "a", b"hello!", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();

    assert_eq!(fs::read(mirror.join("a")).unwrap(), b"hello!");

    // the reverse diff reconstructs the old bytes from the new mirror
    let incs = list_increment_files(&mirror.join(DATA_DIR));
    let a_inc = incs
        .iter()
        .find(|p| {
            p.file_name().unwrap().to_str().unwrap().starts_with("a.")
        })
        .expect("increment for a");
    let name = a_inc.file_name().unwrap().to_str().unwrap().as_bytes();
    let (base, time, kind, compressed) = parse_inc_name(name).unwrap();
    assert_eq!(base, b"a".to_vec());
    assert_eq!(time, T1);
    assert_eq!(kind, IncKind::Diff);
    assert!(compressed);

    let inc_rp = crate::inc::get_inclist(
        &crate::rorp::RPath::new(
            &mirror.join(DATA_DIR).join(INCREMENTS_DIR),
            Index::from_path(b"a"),
            None,
        )
        .unwrap(),
    )
    .unwrap();
    let delta = inc_rp[0].read_payload().unwrap();
    let old = crate::rsync::patch(b"hello!", &delta).unwrap();
    assert_eq!(old, b"hello");

    // metadata for session 1 became a diff
    let manager = Manager::new(&mirror.join(DATA_DIR), true, false);
    let files = manager.list_files().unwrap();
    let t1_files: Vec<_> = files.iter().filter(|f| f.time == T1).collect();
    assert_eq!(t1_files.len(), 1);
    assert!(!t1_files[0].is_snapshot);
    let at1: Vec<_> = manager.attrs_at(T1).unwrap().map(|r| r.unwrap()).collect();
    let a1 = at1.iter().find(|r| r.index == Index::from_path(b"a")).unwrap();
    assert_eq!(a1.attrs.size, 5);

    // only the newest marker remains
    assert_eq!(repo.mirror_time().unwrap(), Some(T2));
    assert_eq!(repo.list_markers().unwrap().len(), 1);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_delete_file() {
    let dir = scratch_dir("delete-file");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    put_file(&source, "a", b"hello!", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();

    fs::remove_file(source.join("d/b")).unwrap();
    repo.backup_at(&source, Selection::all(), T3).unwrap();

    assert!(!mirror.join("d/b").exists());
    assert!(mirror.join("d").is_dir());

    // the pre-image survived as a snapshot increment
    let incs = list_increment_files(&mirror.join(DATA_DIR));
    let b_inc = incs
        .iter()
        .find(|p| {
            p.parent().unwrap().file_name() == Some(std::ffi::OsStr::new("d"))
                && p.file_name().unwrap().to_str().unwrap().starts_with("b.")
        })
        .expect("increment for d/b");
    let name = b_inc.file_name().unwrap().to_str().unwrap().as_bytes();
    let (_, time, kind, _) = parse_inc_name(name).unwrap();
    assert_eq!(time, T2);
    assert_eq!(kind, IncKind::Snapshot);

    // the d/b record is gone from the head state but reappears when
    // walking back to session 2
    let manager = Manager::new(&mirror.join(DATA_DIR), true, false);
    let at3: Vec<_> = manager.attrs_at(T3).unwrap().map(|r| r.unwrap()).collect();
    assert!(!at3.iter().any(|r| r.index == Index::from_path(b"d/b")));
    let at2: Vec<_> = manager.attrs_at(T2).unwrap().map(|r| r.unwrap()).collect();
    let b2 = at2.iter().find(|r| r.index == Index::from_path(b"d/b")).unwrap();
    assert_eq!(b2.attrs.ftype, FileType::Reg);
    assert_eq!(b2.attrs.size, 5);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_idempotent_backup() {
    let dir = scratch_dir("idempotent");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    let stats = repo.backup_at(&source, Selection::all(), T2).unwrap();

    // nothing changed: no increments, no new file content
    assert!(list_increment_files(&mirror.join(DATA_DIR)).is_empty());
    assert_eq!(stats.new_files + stats.changed_files + stats.deleted_files, 0);

    // the records at both times agree entry for entry
    let manager = Manager::new(&mirror.join(DATA_DIR), true, false);
    let at1: Vec<_> = manager
        .attrs_at(T1)
        .unwrap()
        .map(|r| crate::meta::rorp_to_record(&r.unwrap()))
        .collect();
    let at2: Vec<_> = manager
        .attrs_at(T2)
        .unwrap()
        .map(|r| crate::meta::rorp_to_record(&r.unwrap()))
        .collect();
    assert_eq!(at1, at2);

    assert_eq!(repo.mirror_time().unwrap(), Some(T2));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_quoting_activation() {
    let dir = scratch_dir("quoting");
    let source = dir.join("source");
    put_file(&source, "a:b", b"colonized", 1_700_000_000);
    freeze_dir_mtimes(&source, 1_700_000_000);
    let mirror = dir.join("mirror");

    let mut config = Config::new();
    config.set_chars_to_quote(b":");
    config.use_compatible_timestamps = true;
    let repo = Repo::open(&mirror, config.clone()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();

    // on disk the name is quoted
    assert_eq!(fs::read(mirror.join("a;058b")).unwrap(), b"colonized");
    assert!(!mirror.join("a:b").exists());

    // the quoting layer lists it under its original name
    let quoter = crate::quote::Quoter::from_config(&config).unwrap().unwrap();
    let root = crate::rorp::RPath::new(
        &mirror,
        Index::root(),
        Some(std::rc::Rc::new(quoter)),
    )
    .unwrap();
    let names = root.listdir().unwrap();
    assert!(names.contains(&b"a:b".to_vec()), "{:?}", names);

    // the persisted quoting class guards later sessions
    assert_eq!(
        fs::read(mirror.join(DATA_DIR).join("chars_to_quote")).unwrap(),
        b":".to_vec()
    );
    let mut other = Config::new();
    other.set_chars_to_quote(b"A-Z");
    assert!(Repo::open(&mirror, other).is_err());

    // metadata speaks the unquoted name
    let manager = Manager::new(&mirror.join(DATA_DIR), true, true);
    let records: Vec<_> = manager.attrs_at(T1).unwrap().map(|r| r.unwrap()).collect();
    assert!(records.iter().any(|r| r.index == Index::from_path(b"a:b")));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_check_dest_states() {
    let dir = scratch_dir("check-dest");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    assert_eq!(repo.check_dest().unwrap(), DestState::Empty);

    repo.backup_at(&source, Selection::all(), T1).unwrap();
    assert_eq!(repo.check_dest().unwrap(), DestState::Clean(T1));

    // a second marker flips the state to needs-regress
    let marker = mirror
        .join(DATA_DIR)
        .join(format!("current_mirror.{}.data", T2.to_string_with(false)));
    fs::write(&marker, b"PID 4000000000\n").unwrap();
    assert_eq!(repo.check_dest().unwrap(), DestState::NeedsRegress(T1, T2));

    // write operations refuse in that state
    assert!(repo.backup_at(&source, Selection::all(), T3).is_err());
    assert!(repo.restore(&Index::root(), &dir.join("out"), T1).is_err());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_backup_refuses_time_going_backwards() {
    let dir = scratch_dir("time-backwards");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T2).unwrap();
    match repo.backup_at(&source, Selection::all(), T1) {
        Err(Error::Fatal(..)) => (),
        other => panic!("expected Fatal, got {:?}", other),
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_new_file_between_sessions_gets_missing_increment() {
    let dir = scratch_dir("missing-inc");
    let source = setup_source(&dir);
    let mirror = dir.join("mirror");

    let repo = Repo::open(&mirror, Config::new()).unwrap();
    repo.backup_at(&source, Selection::all(), T1).unwrap();
    put_file(&source, "fresh", b"new file", 1_700_000_050);
    repo.backup_at(&source, Selection::all(), T2).unwrap();

    let incs = list_increment_files(&mirror.join(DATA_DIR));
    let fresh = incs
        .iter()
        .find(|p| p.file_name().unwrap().to_str().unwrap().starts_with("fresh."))
        .expect("increment for fresh");
    let name = fresh.file_name().unwrap().to_str().unwrap().as_bytes();
    let (_, time, kind, _) = parse_inc_name(name).unwrap();
    assert_eq!(time, T1);
    assert_eq!(kind, IncKind::Missing);

    fs::remove_dir_all(&dir).unwrap();
}
