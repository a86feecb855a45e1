use super::*;

use std::{env, fs, path::PathBuf};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("revbak-{}-{}", name, rand::random::<u32>()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn record(name: &str, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut rec = format!("File {}\n", name).into_bytes();
    for (key, value) in fields {
        rec.extend_from_slice(format!("  {} {}\n", key, value).as_bytes());
    }
    rec.push(b'\n');
    rec
}

#[test]
fn test_write_read_plain() {
    let dir = scratch_dir("flat-plain");
    let loc = dir.join("records.data");

    let recs = vec![
        record("a", &[("Type", "reg"), ("Size", "5")]),
        record("b", &[("Type", "dir")]),
        record("c/d", &[("Type", "sym"), ("SymData", "target")]),
    ];
    let mut writer = FlatWriter::new(&loc, false).unwrap();
    for rec in recs.iter() {
        writer.write_record(rec.clone()).unwrap();
    }
    writer.close().unwrap();

    let got: Vec<Vec<u8>> =
        RecordReader::open(&loc, b"File ").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(got.len(), 3);
    for (want, got) in recs.iter().zip(got.iter()) {
        assert_eq!(want, got);
    }

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_write_read_gz() {
    let dir = scratch_dir("flat-gz");
    let loc = dir.join("records.data.gz");

    let mut writer = FlatWriter::new(&loc, true).unwrap();
    // enough records to exercise the flush-batching path.
    for i in 0..500 {
        writer
            .write_record(record(&format!("file{:04}", i), &[("Type", "reg")]))
            .unwrap();
    }
    writer.close().unwrap();

    // really gzipped
    let raw = fs::read(&loc).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let got: Vec<Vec<u8>> =
        RecordReader::open(&loc, b"File ").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(got.len(), 500);
    assert!(got[499].starts_with(b"File file0499\n"));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_read_empty_file() {
    let dir = scratch_dir("flat-empty");
    let loc = dir.join("records.data");
    fs::write(&loc, b"").unwrap();

    let got: Vec<Vec<u8>> =
        RecordReader::open(&loc, b"File ").unwrap().map(|r| r.unwrap()).collect();
    assert!(got.is_empty());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_binary_safe_paths() {
    let dir = scratch_dir("flat-binary");
    let loc = dir.join("records.data");

    // a path with high bytes; newlines are the caller's business.
    let mut rec = b"File \xff\xfe\x80name\n".to_vec();
    rec.extend_from_slice(b"  Type reg\n\n");

    let mut writer = FlatWriter::new(&loc, false).unwrap();
    writer.write_record(rec.clone()).unwrap();
    writer.close().unwrap();

    let got: Vec<Vec<u8>> =
        RecordReader::open(&loc, b"File ").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(got, vec![rec]);

    fs::remove_dir_all(&dir).unwrap();
}
