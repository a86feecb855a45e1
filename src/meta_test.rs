use super::*;

use std::{env, path::PathBuf};

use crate::rorp::{Attrs, FileType};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("revbak-{}-{}", name, rand::random::<u32>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn reg_rorp(path: &[u8], size: u64, mtime: i64) -> Rorp {
    let mut attrs = Attrs::new(FileType::Reg);
    attrs.size = size;
    attrs.mtime = mtime;
    attrs.perms = 0o644;
    attrs.uid = 1000;
    attrs.gid = 1000;
    Rorp::new(Index::from_path(path), attrs)
}

#[test]
fn test_quote_path_roundtrip() {
    let cases: Vec<&[u8]> = vec![
        b"plain",
        b"with\nnewline",
        b"with\\backslash",
        b"\\n\\\\\n\n",
        b"",
    ];
    for case in cases {
        let quoted = quote_path(case);
        assert!(!quoted.contains(&b'\n'));
        assert_eq!(unquote_path(&quoted).unwrap(), case.to_vec());
    }
    assert!(unquote_path(b"bad\\x").is_err());
    assert!(unquote_path(b"trailing\\").is_err());
}

#[test]
fn test_record_roundtrip_reg() {
    let mut rorp = reg_rorp(b"d/notes.txt", 1234, 1_700_000_000);
    rorp.attrs.sha1 = Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".to_string());
    rorp.attrs.nlink = Some(2);
    rorp.attrs.inode = Some(99);
    rorp.attrs.devloc = Some(7);

    let rec = rorp_to_record(&rorp);
    let back = record_to_rorp(&rec).unwrap();
    assert_eq!(back.index, rorp.index);
    assert_eq!(back.attrs.ftype, FileType::Reg);
    assert_eq!(back.attrs.size, 1234);
    assert_eq!(back.attrs.mtime, 1_700_000_000);
    assert_eq!(back.attrs.perms, 0o644);
    assert_eq!(back.attrs.sha1, rorp.attrs.sha1);
    assert_eq!(back.attrs.nlink, Some(2));
    assert_eq!(back.attrs.inode, Some(99));
    assert_eq!(back.attrs.devloc, Some(7));
}

#[test]
fn test_record_roundtrip_types() {
    // symlink with an awkward target
    let mut sym = Rorp::new(Index::from_path(b"s"), Attrs::new(FileType::Sym));
    sym.attrs.linkname = Some(b"target\nwith\\escapes".to_vec());
    let back = record_to_rorp(&rorp_to_record(&sym)).unwrap();
    assert_eq!(back.attrs.ftype, FileType::Sym);
    assert_eq!(back.attrs.linkname, sym.attrs.linkname);

    // device node
    let mut dev = Rorp::new(Index::from_path(b"dev/null"), Attrs::new(FileType::Dev));
    dev.attrs.devnums = Some(('c', 1, 3));
    let back = record_to_rorp(&rorp_to_record(&dev)).unwrap();
    assert_eq!(back.attrs.devnums, Some(('c', 1, 3)));

    // missing marker keeps only the type
    let gone = Rorp::missing(Index::from_path(b"gone"));
    let back = record_to_rorp(&rorp_to_record(&gone)).unwrap();
    assert_eq!(back.attrs.ftype, FileType::Missing);

    // root spells itself "."
    let root = Rorp::new(Index::root(), Attrs::new(FileType::Dir));
    let rec = rorp_to_record(&root);
    assert!(rec.starts_with(b"File .\n"));
    assert_eq!(record_to_rorp(&rec).unwrap().index, Index::root());

    // long name redirects survive the roundtrip
    let mut redirected = reg_rorp(b"x", 1, 1);
    redirected.mirrorname = Some(b"17".to_vec());
    redirected.incname = Some(b"17".to_vec());
    let back = record_to_rorp(&rorp_to_record(&redirected)).unwrap();
    assert_eq!(back.mirrorname, Some(b"17".to_vec()));
    assert_eq!(back.incname, Some(b"17".to_vec()));
}

#[test]
fn test_record_binary_path() {
    let mut rorp = reg_rorp(b"x", 1, 1);
    rorp.index = Index::new(vec![b"\xff\x00dir".to_vec(), b"name\nled".to_vec()]);
    let back = record_to_rorp(&rorp_to_record(&rorp)).unwrap();
    assert_eq!(back.index, rorp.index);
}

fn write_snapshot(manager: &Manager, time: SessionTime, rorps: &[Rorp]) {
    let mut writer = manager.new_writer(time).unwrap();
    for rorp in rorps {
        writer.write(rorp).unwrap();
    }
    writer.close().unwrap();
}

#[test]
fn test_chain_reconstruction() {
    let dir = scratch_dir("meta-chain");
    let manager = Manager::new(&dir, true, false);

    let t1 = SessionTime(1_700_000_001);
    let t2 = SessionTime(1_700_000_100);
    let t3 = SessionTime(1_700_000_200);

    // session 1: a@v1, b
    write_snapshot(
        &manager,
        t1,
        &[reg_rorp(b"a", 5, 10), reg_rorp(b"b", 1, 10)],
    );
    // session 2: a changed, b gone, c new
    write_snapshot(
        &manager,
        t2,
        &[reg_rorp(b"a", 6, 20), reg_rorp(b"c", 2, 20)],
    );
    manager.convert_to_diff(t1, t2).unwrap();
    // session 3: c changed
    write_snapshot(
        &manager,
        t3,
        &[reg_rorp(b"a", 6, 20), reg_rorp(b"c", 3, 30)],
    );
    manager.convert_to_diff(t2, t3).unwrap();

    // exactly one snapshot remains, the newest
    let files = manager.list_files().unwrap();
    let snapshots: Vec<_> = files.iter().filter(|f| f.is_snapshot).collect();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].time, t3);
    assert_eq!(manager.session_times().unwrap(), vec![t1, t2, t3]);

    // newest state comes straight off the snapshot
    let at3: Vec<Rorp> =
        manager.attrs_at(t3).unwrap().map(|r| r.unwrap()).collect();
    let names: Vec<Index> = at3.iter().map(|r| r.index.clone()).collect();
    assert_eq!(names, vec![Index::from_path(b"a"), Index::from_path(b"c")]);
    assert_eq!(at3[1].attrs.size, 3);

    // middle state: c at its old size
    let at2: Vec<Rorp> =
        manager.attrs_at(t2).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(at2.len(), 2);
    assert_eq!(at2[1].index, Index::from_path(b"c"));
    assert_eq!(at2[1].attrs.size, 2);

    // oldest state: b exists again, c does not
    let at1: Vec<Rorp> =
        manager.attrs_at(t1).unwrap().map(|r| r.unwrap()).collect();
    let names: Vec<Index> = at1.iter().map(|r| r.index.clone()).collect();
    assert_eq!(names, vec![Index::from_path(b"a"), Index::from_path(b"b")]);
    assert_eq!(at1[0].attrs.size, 5);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_unchanged_sessions_make_empty_diffs() {
    let dir = scratch_dir("meta-idempotent");
    let manager = Manager::new(&dir, false, false);

    let t1 = SessionTime(1_700_000_001);
    let t2 = SessionTime(1_700_000_100);
    let rorps = vec![reg_rorp(b"a", 5, 10)];

    write_snapshot(&manager, t1, &rorps);
    write_snapshot(&manager, t2, &rorps);
    manager.convert_to_diff(t1, t2).unwrap();

    let files = manager.list_files().unwrap();
    let diff = files.iter().find(|f| f.time == t1 && !f.is_snapshot).unwrap();
    assert_eq!(fs::metadata(&diff.path).unwrap().len(), 0);

    // reconstruction at t1 still equals the snapshot
    let at1: Vec<Rorp> =
        manager.attrs_at(t1).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(at1.len(), 1);
    assert_eq!(at1[0].attrs.size, 5);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_recreate_snapshot() {
    let dir = scratch_dir("meta-recreate");
    let manager = Manager::new(&dir, true, false);

    let t1 = SessionTime(1_700_000_001);
    let t2 = SessionTime(1_700_000_100);

    write_snapshot(&manager, t1, &[reg_rorp(b"a", 5, 10)]);
    write_snapshot(&manager, t2, &[reg_rorp(b"a", 6, 20)]);
    manager.convert_to_diff(t1, t2).unwrap();

    // as if the t2 session aborted after converting: rebuild t1
    manager.recreate_snapshot(t1, t2).unwrap();
    let files = manager.list_files().unwrap();
    assert!(files.iter().any(|f| f.time == t1 && f.is_snapshot));

    manager.delete_after(t1).unwrap();
    let files = manager.list_files().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].is_snapshot && files[0].time == t1);

    let at1: Vec<Rorp> =
        manager.attrs_at(t1).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(at1[0].attrs.size, 5);

    fs::remove_dir_all(&dir).unwrap();
}
