//! Module implement the long filename overflow area.
//!
//! Quoting can push a destination name over the filesystem limit, and
//! increment suffixes make names longer still. Entries whose quoted
//! mirror or increment name does not fit are written under
//! `long_filename_data/` with a short numeric basename instead, and
//! the substitution is recorded in the metadata via the
//! `AlternateMirrorName`/`AlternateIncrementName` fields.

use std::{fs, path::PathBuf};

use crate::{rorp::RPath, util, Error, Result};

pub const LONG_NAME_DIR: &str = "long_filename_data";

// holds the next free numeric basename.
const COUNTER_FILE: &str = "next_free";

/// Allocator of short names inside `long_filename_data/`.
pub struct LongNames {
    dir: PathBuf,
    free: Option<u64>,
    max_component_len: usize,
}

impl LongNames {
    pub fn new(data_dir: &std::path::Path, max_component_len: usize) -> LongNames {
        LongNames {
            dir: data_dir.join(LONG_NAME_DIR),
            free: None,
            max_component_len,
        }
    }

    /// True if a mirror component of this length needs redirecting.
    pub fn is_too_long(&self, quoted_len: usize) -> bool {
        quoted_len > self.max_component_len
    }

    /// Increment names add a timestamp and kind to the base; keep
    /// enough headroom for the longest suffix.
    pub fn is_too_long_for_inc(&self, quoted_len: usize) -> bool {
        quoted_len + 50 > self.max_component_len
    }

    fn read_counter(&self) -> u64 {
        match fs::read(self.dir.join(COUNTER_FILE)) {
            Ok(data) => String::from_utf8_lossy(&data).trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Allocate the next free short name, persisting the counter.
    pub fn next_free(&mut self) -> Result<Vec<u8>> {
        err_at!(IOError, fs::create_dir_all(&self.dir), "{:?}", self.dir)?;
        let n = match self.free {
            Some(n) => n,
            None => self.read_counter(),
        };
        self.free = Some(n + 1);
        let loc = self.dir.join(COUNTER_FILE);
        let tf = util::TempGuard::new_in_dir(&loc)?;
        tf.write_all(format!("{}\n", n + 1).as_bytes())?;
        tf.commit(&loc)?;
        Ok(n.to_string().into_bytes())
    }

    /// RPath of a short-named entry inside the overflow area.
    pub fn long_rp(&self, name: &[u8]) -> Result<RPath> {
        use crate::rorp::Index;

        RPath::new(&self.dir, Index::new(vec![name.to_vec()]), None)
    }
}

#[cfg(test)]
#[path = "longname_test.rs"]
mod longname_test;
