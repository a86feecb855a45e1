use super::*;

use std::{env, fs, path::PathBuf};

use crate::rorp::{Attrs, FileType, Index, Rorp};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("revbak-{}-{}", name, rand::random::<u32>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn reg(path: &[u8], size: u64) -> Rorp {
    let mut attrs = Attrs::new(FileType::Reg);
    attrs.size = size;
    Rorp::new(Index::from_path(path), attrs)
}

#[test]
fn test_counters() {
    let mut stats = SessionStats::new(1_700_000_000);

    stats.add_pair(Some(&reg(b"same", 5)), Some(&reg(b"same", 5)), false);
    stats.add_pair(Some(&reg(b"new", 10)), None, true);
    stats.add_pair(None, Some(&reg(b"gone", 7)), true);
    stats.add_pair(Some(&reg(b"mod", 20)), Some(&reg(b"mod", 15)), true);
    stats.add_increment(3);
    stats.add_error();

    assert_eq!(stats.source_files, 3);
    assert_eq!(stats.source_file_size, 35);
    assert_eq!(stats.mirror_files, 3);
    assert_eq!(stats.mirror_file_size, 27);
    assert_eq!(stats.new_files, 1);
    assert_eq!(stats.new_file_size, 10);
    assert_eq!(stats.deleted_files, 1);
    assert_eq!(stats.deleted_file_size, 7);
    assert_eq!(stats.changed_files, 1);
    assert_eq!(stats.changed_source_size, 20);
    assert_eq!(stats.changed_mirror_size, 15);
    assert_eq!(stats.increment_files, 1);
    assert_eq!(stats.increment_file_size, 3);
    assert_eq!(stats.errors, 1);
}

#[test]
fn test_write_file() {
    let dir = scratch_dir("stats-write");
    let mut stats = SessionStats::new(1_700_000_000);
    stats.end_time = 1_700_000_009;
    stats.add_pair(Some(&reg(b"a", 5)), None, true);

    let time = crate::stamp::SessionTime(1_700_000_001);
    stats.write_file(&dir, time, false).unwrap();

    let name = format!("session_statistics.{}.data", time.to_string_with(false));
    let text = String::from_utf8(fs::read(dir.join(name)).unwrap()).unwrap();
    assert!(text.contains("StartTime 1700000000\n"), "{}", text);
    assert!(text.contains("ElapsedTime 9\n"), "{}", text);
    assert!(text.contains("NewFiles 1\n"), "{}", text);
    assert!(text.contains("Errors 0\n"), "{}", text);

    fs::remove_dir_all(&dir).unwrap();
}
