//! Module implement the metadata manager.
//!
//! Every session writes the complete attribute set of the mirror into
//! `mirror_metadata.<T>.snapshot[.gz]`. Once the next session commits,
//! the older snapshot is rewritten as a diff against the newer one,
//! mirroring the reverse-increment strategy used for file content. A
//! diff holds only records that changed; a record of Type `None`
//! deletes the index when walking back in time.
//!
//! Records are binary-safe text:
//!
//! ```text
//! File <quoted-path>
//!   Type reg
//!   Size 6
//!   ModTime 1700000000
//!   ...
//! ```
//!
//! where newlines and backslashes in paths are escaped.

use lazy_static::lazy_static;
use regex::bytes::Regex;

use std::{
    convert::TryFrom,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    collate::Collate2,
    flat::{FlatWriter, RecordReader},
    rorp::{Attrs, FileType, Index, Rorp},
    stamp::SessionTime,
    util, Error, Result,
};

pub const META_PREFIX: &str = "mirror_metadata";

lazy_static! {
    static ref LINE_REGEXP: Regex =
        Regex::new(r"(?s-u)^ *([A-Za-z0-9]+) (.+)$").unwrap();
    static ref META_FILE_REGEXP: Regex = Regex::new(
        r"(?s-u)^mirror_metadata\.(\d{4}-\d{2}-\d{2}T\d{2}[-:]\d{2}[-:]\d{2}[-+]\d{2}[-:]\d{2})\.(snapshot|diff)(\.gz)?$"
    )
    .unwrap();
}

/// Escape a path for embedding in a record: `\n` and `\` get
/// backslash-escaped, everything else passes through.
pub fn quote_path(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len());
    for &b in path {
        match b {
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
    out
}

pub fn unquote_path(quoted: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(quoted.len());
    let mut iter = quoted.iter().cloned();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'\\') => out.push(b'\\'),
            _ => err_at!(
                ParsingError,
                msg: "bad path escape in {:?}", String::from_utf8_lossy(quoted)
            )?,
        }
    }
    Ok(out)
}

/// Serialize one rorp into its text record.
pub fn rorp_to_record(rorp: &Rorp) -> Vec<u8> {
    let attrs = &rorp.attrs;
    let mut rec = vec![];

    let indexpath: Vec<u8> = if rorp.index.is_root() {
        b".".to_vec()
    } else {
        rorp.index.components().join(&b'/')
    };
    rec.extend_from_slice(b"File ");
    rec.extend_from_slice(&quote_path(&indexpath));
    rec.push(b'\n');

    push_field(&mut rec, "Type", attrs.ftype.as_str().as_bytes());
    if attrs.ftype == FileType::Missing {
        rec.push(b'\n');
        return rec;
    }

    match attrs.ftype {
        FileType::Reg => {
            push_field(&mut rec, "Size", attrs.size.to_string().as_bytes());
            if let (Some(nlink), Some(inode), Some(devloc)) =
                (attrs.nlink, attrs.inode, attrs.devloc)
            {
                if nlink > 1 {
                    push_field(&mut rec, "NumHardLinks", nlink.to_string().as_bytes());
                    push_field(&mut rec, "Inode", inode.to_string().as_bytes());
                    push_field(&mut rec, "DeviceLoc", devloc.to_string().as_bytes());
                }
            }
            if let Some(sha1) = &attrs.sha1 {
                push_field(&mut rec, "SHA1Digest", sha1.as_bytes());
            }
        }
        FileType::Sym => {
            let target = attrs.linkname.clone().unwrap_or_default();
            push_field(&mut rec, "SymData", &quote_path(&target));
        }
        FileType::Dev => {
            if let Some((kind, major, minor)) = attrs.devnums {
                let val = format!("{} {} {}", kind, major, minor);
                push_field(&mut rec, "DeviceNum", val.as_bytes());
            }
        }
        _ => (),
    }

    if let Some(name) = &rorp.mirrorname {
        push_field(&mut rec, "AlternateMirrorName", &quote_path(name));
    }
    if let Some(name) = &rorp.incname {
        push_field(&mut rec, "AlternateIncrementName", &quote_path(name));
    }

    if attrs.ftype != FileType::Sym && attrs.ftype != FileType::Dev {
        push_field(&mut rec, "ModTime", attrs.mtime.to_string().as_bytes());
    }
    push_field(&mut rec, "Uid", attrs.uid.to_string().as_bytes());
    let uname = attrs.uname.clone().unwrap_or_else(|| ":".to_string());
    push_field(&mut rec, "Uname", uname.as_bytes());
    push_field(&mut rec, "Gid", attrs.gid.to_string().as_bytes());
    let gname = attrs.gname.clone().unwrap_or_else(|| ":".to_string());
    push_field(&mut rec, "Gname", gname.as_bytes());
    push_field(&mut rec, "Permissions", attrs.perms.to_string().as_bytes());
    rec.push(b'\n');
    rec
}

fn push_field(rec: &mut Vec<u8>, key: &str, value: &[u8]) {
    rec.extend_from_slice(b"  ");
    rec.extend_from_slice(key.as_bytes());
    rec.push(b' ');
    rec.extend_from_slice(value);
    rec.push(b'\n');
}

/// Parse one text record back into a rorp.
pub fn record_to_rorp(record: &[u8]) -> Result<Rorp> {
    let mut lines = record.split(|b| *b == b'\n');

    let first = match lines.next() {
        Some(line) if line.starts_with(b"File ") => &line[b"File ".len()..],
        _ => err_at!(ParsingError, msg: "record without File header")?,
    };
    let indexpath = unquote_path(first)?;
    let index = if indexpath == b"." {
        Index::root()
    } else {
        Index::from_path(&indexpath)
    };

    let mut rorp = Rorp::new(index, Attrs::missing());
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let caps = match LINE_REGEXP.captures(line) {
            Some(caps) => caps,
            None => err_at!(
                ParsingError,
                msg: "bad record line {:?}", String::from_utf8_lossy(line)
            )?,
        };
        let key = caps.get(1).unwrap().as_bytes();
        let value = caps.get(2).unwrap().as_bytes();
        apply_field(&mut rorp, key, value)?;
    }
    Ok(rorp)
}

fn apply_field(rorp: &mut Rorp, key: &[u8], value: &[u8]) -> Result<()> {
    let attrs = &mut rorp.attrs;
    match key {
        b"Type" => {
            let s = err_at!(ParsingError, std::str::from_utf8(value))?;
            attrs.ftype = match FileType::from_str(s) {
                Some(ftype) => ftype,
                None => err_at!(ParsingError, msg: "bad Type {:?}", s)?,
            };
        }
        b"Size" => attrs.size = parse_num(value)?,
        b"SHA1Digest" => {
            attrs.sha1 =
                Some(err_at!(ParsingError, std::str::from_utf8(value))?.to_string())
        }
        b"NumHardLinks" => attrs.nlink = Some(parse_num(value)? as u32),
        b"Inode" => attrs.inode = Some(parse_num(value)?),
        b"DeviceLoc" => attrs.devloc = Some(parse_num(value)?),
        b"SymData" => attrs.linkname = Some(unquote_path(value)?),
        b"DeviceNum" => {
            let s = err_at!(ParsingError, std::str::from_utf8(value))?;
            let parts: Vec<&str> = s.split(' ').collect();
            if parts.len() != 3 {
                err_at!(ParsingError, msg: "bad DeviceNum {:?}", s)?
            }
            let kind = if parts[0] == "b" { 'b' } else { 'c' };
            let major = err_at!(ParsingError, parts[1].parse::<u32>())?;
            let minor = err_at!(ParsingError, parts[2].parse::<u32>())?;
            attrs.devnums = Some((kind, major, minor));
        }
        b"AlternateMirrorName" => rorp.mirrorname = Some(unquote_path(value)?),
        b"AlternateIncrementName" => rorp.incname = Some(unquote_path(value)?),
        b"ModTime" => {
            let s = err_at!(ParsingError, std::str::from_utf8(value))?;
            attrs.mtime = err_at!(ParsingError, s.parse::<i64>())?;
        }
        b"Uid" => attrs.uid = parse_num(value)? as u32,
        b"Gid" => attrs.gid = parse_num(value)? as u32,
        b"Uname" => {
            if value != b":" {
                attrs.uname =
                    Some(err_at!(ParsingError, std::str::from_utf8(value))?.to_string());
            }
        }
        b"Gname" => {
            if value != b":" {
                attrs.gname =
                    Some(err_at!(ParsingError, std::str::from_utf8(value))?.to_string());
            }
        }
        b"Permissions" => attrs.perms = parse_num(value)? as u32,
        _ => (), // unknown fields pass through for compatibility
    }
    Ok(())
}

fn parse_num(value: &[u8]) -> Result<u64> {
    let s = err_at!(ParsingError, std::str::from_utf8(value))?;
    err_at!(ParsingError, s.parse::<u64>())
}

/// One metadata file in the chain.
#[derive(Clone, Debug)]
pub struct MetaFile {
    pub path: PathBuf,
    pub time: SessionTime,
    pub is_snapshot: bool,
    pub compressed: bool,
}

/// Writer of one session's metadata snapshot.
pub struct MetaWriter {
    writer: FlatWriter,
}

impl MetaWriter {
    pub fn write(&mut self, rorp: &Rorp) -> Result<()> {
        self.writer.write_record(rorp_to_record(rorp))
    }

    pub fn close(self) -> Result<()> {
        self.writer.close()
    }
}

/// Iterator over the rorps of one metadata file.
pub struct MetaReader {
    records: RecordReader,
}

impl MetaReader {
    pub fn open(path: &Path) -> Result<MetaReader> {
        Ok(MetaReader { records: RecordReader::open(path, b"File ")? })
    }
}

impl Iterator for MetaReader {
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.records.next()? {
            Ok(record) => Some(record_to_rorp(&record)),
            Err(err) => Some(Err(err)),
        }
    }
}

// Walk one step back in time: `base` is the state at the newer time,
// `diff` rewrites it into the older state. Missing-type diff records
// drop the index.
struct PatchMetaIter {
    collated: Collate2<MetaReader, Box<dyn Iterator<Item = Result<Rorp>>>>,
}

impl Iterator for PatchMetaIter {
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.collated.next()? {
                Ok((Some(diff), _)) => {
                    if diff.attrs.ftype == FileType::Missing {
                        continue;
                    }
                    break Some(Ok(diff));
                }
                Ok((None, Some(base))) => break Some(Ok(base)),
                Ok((None, None)) => continue,
                Err(err) => break Some(Err(err)),
            }
        }
    }
}

/// Manager of the metadata chain inside the data directory. Owns the
/// file handles it opens; nothing else in the package touches
/// `mirror_metadata.*`.
pub struct Manager {
    data_dir: PathBuf,
    compress: bool,
    compatible_ts: bool,
}

impl Manager {
    pub fn new(data_dir: &Path, compress: bool, compatible_ts: bool) -> Manager {
        Manager {
            data_dir: data_dir.to_path_buf(),
            compress,
            compatible_ts,
        }
    }

    fn meta_path(&self, time: SessionTime, is_snapshot: bool, compress: bool) -> PathBuf {
        let kind = if is_snapshot { "snapshot" } else { "diff" };
        let mut name = format!(
            "{}.{}.{}",
            META_PREFIX,
            time.to_string_with(self.compatible_ts),
            kind
        );
        if compress {
            name.push_str(".gz");
        }
        self.data_dir.join(name)
    }

    /// All metadata files in the chain, sorted ascending by time.
    pub fn list_files(&self) -> Result<Vec<MetaFile>> {
        use std::os::unix::ffi::OsStrExt;

        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return err_at!(IOError, Err(err), "{:?}", self.data_dir),
        };

        let mut files = vec![];
        for entry in entries {
            let entry = err_at!(IOError, entry)?;
            let name = entry.file_name();
            let caps = match META_FILE_REGEXP.captures(name.as_bytes()) {
                Some(caps) => caps,
                None => continue,
            };
            let time = SessionTime::try_from(caps.get(1).unwrap().as_bytes())?;
            let is_snapshot = caps.get(2).unwrap().as_bytes() == b"snapshot";
            let compressed = caps.get(3).is_some();
            files.push(MetaFile {
                path: self.data_dir.join(&name),
                time,
                is_snapshot,
                compressed,
            });
        }
        files.sort_by_key(|f| f.time);
        Ok(files)
    }

    /// Session times recorded in the chain, ascending.
    pub fn session_times(&self) -> Result<Vec<SessionTime>> {
        Ok(self.list_files()?.into_iter().map(|f| f.time).collect())
    }

    /// Open the snapshot writer for session `time`.
    pub fn new_writer(&self, time: SessionTime) -> Result<MetaWriter> {
        let loc = self.meta_path(time, true, self.compress);
        Ok(MetaWriter { writer: FlatWriter::new(&loc, self.compress)? })
    }

    /// Iterator over the complete attribute set at session `time`,
    /// reconstructed by walking the newest snapshot at or after `time`
    /// back through the diffs.
    pub fn attrs_at(&self, time: SessionTime) -> Result<Box<dyn Iterator<Item = Result<Rorp>>>> {
        let files = self.list_files()?;
        let mut chain: Vec<MetaFile> = vec![];
        for f in files.into_iter().filter(|f| f.time >= time) {
            let is_snapshot = f.is_snapshot;
            chain.push(f);
            if is_snapshot {
                break;
            }
        }
        match chain.last() {
            Some(last) if last.is_snapshot => (),
            _ => err_at!(
                InvalidFile,
                msg: "no metadata snapshot at or after {}", time
            )?,
        }

        let snapshot = chain.pop().unwrap();
        let mut iter: Box<dyn Iterator<Item = Result<Rorp>>> =
            Box::new(MetaReader::open(&snapshot.path)?);
        // remaining entries are diffs, newest first.
        for diff_file in chain.into_iter().rev() {
            let diff = MetaReader::open(&diff_file.path)?;
            iter = Box::new(PatchMetaIter { collated: Collate2::new(diff, iter) });
        }
        Ok(iter)
    }

    /// After session `new_time` committed, rewrite the `prev_time`
    /// snapshot as a diff against the new snapshot.
    pub fn convert_to_diff(
        &self,
        prev_time: SessionTime,
        new_time: SessionTime,
    ) -> Result<()> {
        let files = self.list_files()?;
        let prev = files.iter().find(|f| f.time == prev_time && f.is_snapshot);
        let new = files.iter().find(|f| f.time == new_time && f.is_snapshot);
        let (prev, new) = match (prev, new) {
            (Some(prev), Some(new)) => (prev, new),
            _ => return Ok(()), // nothing to convert
        };

        let diff_loc = self.meta_path(prev_time, false, self.compress);
        let tf = util::TempGuard::new_in_dir(&diff_loc)?;
        let mut writer = FlatWriter::new(tf.as_path(), self.compress)?;

        let collated =
            Collate2::new(MetaReader::open(&prev.path)?, MetaReader::open(&new.path)?);
        for pair in collated {
            match pair? {
                (Some(old), Some(new)) => {
                    let old_rec = rorp_to_record(&old);
                    if old_rec != rorp_to_record(&new) {
                        writer.write_record(old_rec)?;
                    }
                }
                (Some(old), None) => writer.write_record(rorp_to_record(&old))?,
                (None, Some(new)) => {
                    let marker = Rorp::missing(new.index.clone());
                    writer.write_record(rorp_to_record(&marker))?;
                }
                (None, None) => (),
            }
        }
        writer.close()?;
        tf.commit(&diff_loc)?;

        err_at!(IOError, fs::remove_file(&prev.path), "{:?}", prev.path)?;
        util::sync_dir(&self.data_dir)
    }

    /// Regress step one: if the `regress_time` snapshot is gone
    /// because the aborted session already converted it to a diff,
    /// rebuild it from the `unsuccessful_time` snapshot plus the diff.
    pub fn recreate_snapshot(
        &self,
        regress_time: SessionTime,
        unsuccessful_time: SessionTime,
    ) -> Result<()> {
        let files = self.list_files()?;
        if files.iter().any(|f| f.time == regress_time && f.is_snapshot) {
            // previous session crashed before converting; drop the
            // half-made diff if any.
            for f in files.iter().filter(|f| f.time == regress_time && !f.is_snapshot) {
                err_at!(IOError, fs::remove_file(&f.path), "{:?}", f.path)?;
            }
            return Ok(());
        }

        let have_chain = files
            .iter()
            .any(|f| f.time == unsuccessful_time && f.is_snapshot)
            && files.iter().any(|f| f.time == regress_time && !f.is_snapshot);
        if !have_chain {
            err_at!(
                Fatal,
                msg: "cannot reconstruct metadata for {}", regress_time
            )?
        }

        let snap_loc = self.meta_path(regress_time, true, self.compress);
        let tf = util::TempGuard::new_in_dir(&snap_loc)?;
        let mut writer = FlatWriter::new(tf.as_path(), self.compress)?;
        for rorp in self.attrs_at(regress_time)? {
            writer.write_record(rorp_to_record(&rorp?))?;
        }
        writer.close()?;
        tf.commit(&snap_loc)?;
        util::sync_dir(&self.data_dir)
    }

    /// Delete every metadata file with `time > cutoff`, plus diffs at
    /// exactly `cutoff` (the snapshot is the authoritative copy there).
    pub fn delete_after(&self, cutoff: SessionTime) -> Result<()> {
        for f in self.list_files()? {
            if f.time > cutoff || (f.time == cutoff && !f.is_snapshot) {
                err_at!(IOError, fs::remove_file(&f.path), "{:?}", f.path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "meta_test.rs"]
mod meta_test;
