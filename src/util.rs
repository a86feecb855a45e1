//! Module implement common utility functions for file handling.

use std::{
    ffi, fs,
    io::{Read, Write},
    path,
};

use crate::{Error, Result};

/// Create file in read-write mode, truncating existing file.
pub fn create_file_rw(loc: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(loc);
    match os_file.parent() {
        Some(parent) => err_at!(IOError, fs::create_dir_all(parent))?,
        None => err_at!(InvalidFile, msg: "{:?}", loc)?,
    };

    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(
        IOError,
        opts.create(true).truncate(true).read(true).write(true).open(os_file),
        "{:?}",
        loc
    )?)
}

/// Open file in read-only mode.
pub fn open_file_r(loc: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(loc);
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(IOError, opts.read(true).open(os_file), "{:?}", loc)?)
}

/// Open file in append mode.
pub fn open_file_a(loc: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(loc);
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(
        IOError,
        opts.create(true).append(true).open(os_file),
        "{:?}",
        loc
    )?)
}

/// Read the whole of `loc` into a byte buffer.
pub fn read_whole_file(loc: &ffi::OsStr) -> Result<Vec<u8>> {
    let mut fd = open_file_r(loc)?;
    let mut data = vec![];
    err_at!(IOError, fd.read_to_end(&mut data), "{:?}", loc)?;
    Ok(data)
}

/// Fsync the directory at `loc`, making renames within it durable.
pub fn sync_dir(loc: &path::Path) -> Result<()> {
    let fd = err_at!(IOError, fs::File::open(loc), "{:?}", loc)?;
    err_at!(IOError, fd.sync_all(), "{:?}", loc)
}

/// A temporary file owned by a single operation.
///
/// The file is created in the same directory as its final location, so
/// the closing rename is atomic. If the guard is dropped before
/// [TempGuard::commit] the temp file is unlinked.
pub struct TempGuard {
    tmp: path::PathBuf,
    committed: bool,
}

impl TempGuard {
    /// New temp file next to `target`. The file itself is not created,
    /// only the name is reserved with a random suffix.
    pub fn new_in_dir(target: &path::Path) -> Result<TempGuard> {
        let dir = match target.parent() {
            Some(dir) => dir,
            None => err_at!(InvalidInput, msg: "no parent for {:?}", target)?,
        };
        let name = format!("rdiff-backup.tmp.{}", rand::random::<u32>());
        Ok(TempGuard { tmp: dir.join(name), committed: false })
    }

    /// Location of the temp file.
    pub fn as_path(&self) -> &path::Path {
        &self.tmp
    }

    /// Write `data` into the temp file, creating it.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut fd = err_at!(IOError, fs::File::create(&self.tmp), "{:?}", self.tmp)?;
        err_at!(IOError, fd.write_all(data), "{:?}", self.tmp)?;
        err_at!(IOError, fd.sync_all(), "{:?}", self.tmp)
    }

    /// Create the temp file and hand the descriptor to the caller.
    pub fn create(&self) -> Result<fs::File> {
        Ok(err_at!(IOError, fs::File::create(&self.tmp), "{:?}", self.tmp)?)
    }

    /// Rename the temp file over `target`. Consumes the guard.
    pub fn commit(mut self, target: &path::Path) -> Result<()> {
        err_at!(
            IOError,
            fs::rename(&self.tmp, target),
            "{:?} -> {:?}",
            self.tmp,
            target
        )?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.committed {
            fs::remove_file(&self.tmp).ok();
        }
    }
}

/// Compute the hex encoded SHA1 digest of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut s = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

#[cfg(test)]
#[path = "util_test.rs"]
mod util_test;
