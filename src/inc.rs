//! Module implement the increment codec.
//!
//! An increment records the pre-image of one file at one session time,
//! next to the mirror under the `increments/` area. The filename is
//! the mirror basename with a timestamp and kind suffix,
//! `<base>.<timestr>.<kind>[.gz]`. Kinds:
//!
//! * `snapshot` complete previous bytes (symlinks are materialized as
//!   symlinks),
//! * `diff` rsync delta that rebuilds the previous bytes from the
//!   current mirror,
//! * `dir` zero-byte marker, the entry used to be a directory,
//! * `missing` zero-byte marker, the entry did not exist,
//! * `special` zero-byte marker for device/fifo/socket entries.
//!
//! The timestamp suffix is written after quoting, so it survives a
//! round trip through [crate::quote] untouched.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use lazy_static::lazy_static;
use regex::bytes::Regex;

use std::{
    convert::TryFrom,
    fs,
    io::{Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::{
    config::Config,
    rorp::{lstat_attrs, Attrs, RPath},
    rsync,
    stamp::SessionTime,
    util, Error, Result,
};

lazy_static! {
    static ref INC_FILE_REGEXP: Regex = Regex::new(
        r"(?s-u)^(.+)\.(\d{4}-\d{2}-\d{2}T\d{2}[-:]\d{2}[-:]\d{2}[-+]\d{2}[-:]\d{2})\.(snapshot|diff|dir|missing|special)(\.gz)?$"
    )
    .unwrap();
}

/// The five increment kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncKind {
    Snapshot,
    Diff,
    Dir,
    Missing,
    Special,
}

impl IncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncKind::Snapshot => "snapshot",
            IncKind::Diff => "diff",
            IncKind::Dir => "dir",
            IncKind::Missing => "missing",
            IncKind::Special => "special",
        }
    }

    pub fn from_bytes(b: &[u8]) -> Option<IncKind> {
        match b {
            b"snapshot" => Some(IncKind::Snapshot),
            b"diff" => Some(IncKind::Diff),
            b"dir" => Some(IncKind::Dir),
            b"missing" => Some(IncKind::Missing),
            b"special" => Some(IncKind::Special),
            _ => None,
        }
    }
}

/// One increment file on disk.
#[derive(Clone, Debug)]
pub struct IncRp {
    /// On-disk location, quoted form.
    pub path: PathBuf,
    /// Unquoted logical basename the increment belongs to.
    pub basename: Vec<u8>,
    pub time: SessionTime,
    pub kind: IncKind,
    pub compressed: bool,
    /// Attributes of the increment file itself; perms and mtime were
    /// copied from the mirror entry it preserves.
    pub attrs: Attrs,
}

impl IncRp {
    /// Payload bytes, gunzipped when compressed. Marker kinds return
    /// empty. Our own unreadable payloads get a one-shot chmod.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        match self.kind {
            IncKind::Dir | IncKind::Missing | IncKind::Special => return Ok(vec![]),
            IncKind::Snapshot if self.attrs.is_sym() => {
                let target = err_at!(IOError, fs::read_link(&self.path))?;
                return Ok(target.as_os_str().as_bytes().to_vec());
            }
            _ => (),
        }
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                use std::os::unix::fs::PermissionsExt;
                let mode = self.attrs.perms | 0o400;
                err_at!(
                    IOError,
                    fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))
                )?;
                err_at!(IOError, fs::read(&self.path), "{:?}", self.path)?
            }
            Err(err) => err_at!(IOError, Err(err), "{:?}", self.path)?,
        };
        if self.compressed {
            let mut out = vec![];
            let mut dec = GzDecoder::new(&raw[..]);
            err_at!(IOError, dec.read_to_end(&mut out), "{:?}", self.path)?;
            Ok(out)
        } else {
            Ok(raw)
        }
    }
}

/// Parse `name` as `(basename, time, kind, compressed)`. None when the
/// name does not look like an increment.
pub fn parse_inc_name(name: &[u8]) -> Option<(Vec<u8>, SessionTime, IncKind, bool)> {
    let caps = INC_FILE_REGEXP.captures(name)?;
    let basename = caps.get(1)?.as_bytes().to_vec();
    let time = SessionTime::try_from(caps.get(2)?.as_bytes()).ok()?;
    let kind = IncKind::from_bytes(caps.get(3)?.as_bytes())?;
    let compressed = caps.get(4).is_some();
    Some((basename, time, kind, compressed))
}

/// Compose the on-disk increment path for `inc_base`.
pub fn compose_inc_path(
    inc_base: &RPath,
    time: SessionTime,
    kind: IncKind,
    compressed: bool,
    compatible_ts: bool,
) -> PathBuf {
    let mut name = inc_base
        .path()
        .file_name()
        .map(|n| n.as_bytes().to_vec())
        .unwrap_or_default();
    name.push(b'.');
    name.extend_from_slice(time.to_string_with(compatible_ts).as_bytes());
    name.push(b'.');
    name.extend_from_slice(kind.as_str().as_bytes());
    if compressed {
        name.extend_from_slice(b".gz");
    }
    let mut pb = inc_base.path();
    pb.set_file_name(std::ffi::OsStr::from_bytes(&name));
    pb
}

/// All increments recorded for `inc_base`, sorted ascending by time.
///
/// Lists the parent directory once; names are unquoted before the
/// suffix parse so the logical basename can be compared against the
/// index basename.
pub fn get_inclist(inc_base: &RPath) -> Result<Vec<IncRp>> {
    let base_path = inc_base.path();
    let parent = match base_path.parent() {
        Some(parent) => parent.to_path_buf(),
        None => return Ok(vec![]),
    };
    let logical_base = match inc_base.path().file_name() {
        Some(name) => {
            let raw = name.as_bytes().to_vec();
            match inc_base.quoter() {
                Some(quoter) => quoter.unquote(&raw)?,
                None => raw,
            }
        }
        None => return Ok(vec![]),
    };

    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return err_at!(IOError, Err(err), "{:?}", parent),
    };

    let mut incs = vec![];
    for entry in entries {
        let entry = err_at!(IOError, entry)?;
        let raw_name = entry.file_name().as_bytes().to_vec();
        let unquoted = match inc_base.quoter() {
            Some(quoter) => match quoter.unquote(&raw_name) {
                Ok(unquoted) => unquoted,
                Err(_) => continue,
            },
            None => raw_name.clone(),
        };
        let (basename, time, kind, compressed) = match parse_inc_name(&unquoted) {
            Some(parts) => parts,
            None => continue,
        };
        if basename != logical_base {
            continue;
        }
        let path = parent.join(std::ffi::OsStr::from_bytes(&raw_name));
        let attrs = lstat_attrs(&path)?;
        incs.push(IncRp { path, basename, time, kind, compressed, attrs });
    }
    incs.sort_by_key(|inc| inc.time);
    Ok(incs)
}

/// Parse every increment in the directory at `dir_rp`, grouped by
/// logical basename, each group sorted ascending by time. One listing
/// serves random access for all entries of the directory.
pub fn list_inc_dir(
    dir_rp: &RPath,
) -> Result<std::collections::HashMap<Vec<u8>, Vec<IncRp>>> {
    let mut groups: std::collections::HashMap<Vec<u8>, Vec<IncRp>> =
        std::collections::HashMap::new();
    let dir = dir_rp.path();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
        Err(err) => return err_at!(IOError, Err(err), "{:?}", dir),
    };
    for entry in entries {
        let entry = err_at!(IOError, entry)?;
        let raw_name = entry.file_name().as_bytes().to_vec();
        let unquoted = match dir_rp.quoter() {
            Some(quoter) => match quoter.unquote(&raw_name) {
                Ok(unquoted) => unquoted,
                Err(_) => continue,
            },
            None => raw_name.clone(),
        };
        let (basename, time, kind, compressed) = match parse_inc_name(&unquoted) {
            Some(parts) => parts,
            None => continue,
        };
        let path = dir.join(std::ffi::OsStr::from_bytes(&raw_name));
        let attrs = lstat_attrs(&path)?;
        groups.entry(basename.clone()).or_default().push(IncRp {
            path,
            basename,
            time,
            kind,
            compressed,
            attrs,
        });
    }
    for incs in groups.values_mut() {
        incs.sort_by_key(|inc| inc.time);
    }
    Ok(groups)
}

/// Write the increment that preserves the current `mirror` state of
/// one entry, before the mirror is replaced by `new_attrs`/`new_bytes`.
/// Returns the increment written.
pub fn increment(
    new_attrs: &Attrs,
    new_bytes: Option<&[u8]>,
    mirror: &RPath,
    inc_base: &RPath,
    time: SessionTime,
    config: &Config,
) -> Result<IncRp> {
    let mattrs = mirror.attrs();
    if mattrs.is_missing() {
        make_marker(mirror, inc_base, time, IncKind::Missing, config)
    } else if mattrs.is_dir() {
        make_marker(mirror, inc_base, time, IncKind::Dir, config)
    } else if mattrs.is_special() {
        make_marker(mirror, inc_base, time, IncKind::Special, config)
    } else if mattrs.is_reg() && new_attrs.is_reg() {
        match new_bytes {
            Some(new_bytes) => make_diff(new_bytes, mirror, inc_base, time, config),
            None => make_snapshot(mirror, inc_base, time, config),
        }
    } else {
        make_snapshot(mirror, inc_base, time, config)
    }
}

fn make_marker(
    mirror: &RPath,
    inc_base: &RPath,
    time: SessionTime,
    kind: IncKind,
    config: &Config,
) -> Result<IncRp> {
    let path = compose_inc_path(inc_base, time, kind, false, config.use_compatible_timestamps);
    err_at!(IOError, fs::File::create(&path), "{:?}", path)?;
    if kind != IncKind::Missing {
        copy_attrs_to_inc(mirror.attrs(), &path)?;
    }
    finish_inc(inc_base, path, time, kind, false)
}

fn make_snapshot(
    mirror: &RPath,
    inc_base: &RPath,
    time: SessionTime,
    config: &Config,
) -> Result<IncRp> {
    let mattrs = mirror.attrs();
    if mattrs.is_sym() {
        let path = compose_inc_path(
            inc_base,
            time,
            IncKind::Snapshot,
            false,
            config.use_compatible_timestamps,
        );
        let target = mattrs.linkname.clone().unwrap_or_default();
        err_at!(
            IOError,
            std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(&target), &path),
            "{:?}",
            path
        )?;
        return finish_inc(inc_base, path, time, IncKind::Snapshot, false);
    }

    let basename = inc_base
        .index()
        .basename()
        .map(|b| b.to_vec())
        .unwrap_or_else(|| b"increments".to_vec());
    let compress = config.compress_increment(&basename);
    let path = compose_inc_path(
        inc_base,
        time,
        IncKind::Snapshot,
        compress,
        config.use_compatible_timestamps,
    );
    let data = mirror.read_bytes()?;
    write_payload(&path, &data, compress)?;
    copy_attrs_to_inc(mattrs, &path)?;
    finish_inc(inc_base, path, time, IncKind::Snapshot, compress)
}

fn make_diff(
    new_bytes: &[u8],
    mirror: &RPath,
    inc_base: &RPath,
    time: SessionTime,
    config: &Config,
) -> Result<IncRp> {
    let basename = inc_base
        .index()
        .basename()
        .map(|b| b.to_vec())
        .unwrap_or_else(|| b"increments".to_vec());
    let compress = config.compress_increment(&basename);
    let path = compose_inc_path(
        inc_base,
        time,
        IncKind::Diff,
        compress,
        config.use_compatible_timestamps,
    );
    let old = mirror.read_bytes()?;
    let delta = rsync::reverse_delta(new_bytes, &old)?;
    write_payload(&path, &delta, compress)?;
    copy_attrs_to_inc(mirror.attrs(), &path)?;
    finish_inc(inc_base, path, time, IncKind::Diff, compress)
}

fn write_payload(path: &Path, data: &[u8], compress: bool) -> Result<()> {
    let tf = util::TempGuard::new_in_dir(path)?;
    {
        let fd = tf.create()?;
        if compress {
            let mut enc = GzEncoder::new(fd, Compression::default());
            err_at!(IOError, enc.write_all(data), "{:?}", path)?;
            let fd = err_at!(IOError, enc.finish(), "{:?}", path)?;
            err_at!(IOError, fd.sync_all())?;
        } else {
            let mut fd = fd;
            err_at!(IOError, fd.write_all(data), "{:?}", path)?;
            err_at!(IOError, fd.sync_all())?;
        }
    }
    tf.commit(path)
}

// increments carry the perms and mtime of the entry they preserve,
// the fallback source of attributes when the metadata chain is lost.
fn copy_attrs_to_inc(attrs: &Attrs, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    err_at!(
        IOError,
        fs::set_permissions(path, fs::Permissions::from_mode(attrs.perms)),
        "{:?}",
        path
    )?;
    let ft = filetime::FileTime::from_unix_time(attrs.mtime, 0);
    err_at!(IOError, filetime::set_file_mtime(path, ft), "{:?}", path)
}

fn finish_inc(
    inc_base: &RPath,
    path: PathBuf,
    time: SessionTime,
    kind: IncKind,
    compressed: bool,
) -> Result<IncRp> {
    let basename = inc_base
        .index()
        .basename()
        .map(|b| b.to_vec())
        .unwrap_or_else(|| b"increments".to_vec());
    let attrs = lstat_attrs(&path)?;
    Ok(IncRp { path, basename, time, kind, compressed, attrs })
}

#[cfg(test)]
#[path = "inc_test.rs"]
mod inc_test;
