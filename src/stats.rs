//! Module implement per-session statistics.
//!
//! Counters are accumulated as entries leave the post-processing cache
//! and written to `session_statistics.<T>.data` at session close, one
//! `Key value` pair per line.

use std::path::Path;

use crate::{flat::FlatWriter, rorp::Rorp, stamp::SessionTime, Result};

/// Counters for one backup session.
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub start_time: i64,
    pub end_time: i64,
    pub source_files: u64,
    pub source_file_size: u64,
    pub mirror_files: u64,
    pub mirror_file_size: u64,
    pub new_files: u64,
    pub new_file_size: u64,
    pub deleted_files: u64,
    pub deleted_file_size: u64,
    pub changed_files: u64,
    pub changed_source_size: u64,
    pub changed_mirror_size: u64,
    pub increment_files: u64,
    pub increment_file_size: u64,
    pub errors: u64,
}

impl SessionStats {
    pub fn new(start_time: i64) -> SessionStats {
        SessionStats { start_time, ..SessionStats::default() }
    }

    /// Account one collated pair as it is finalized. `changed` and
    /// `success` carry the post-processing verdict.
    pub fn add_pair(&mut self, source: Option<&Rorp>, mirror: Option<&Rorp>, changed: bool) {
        if let Some(source) = source {
            self.source_files += 1;
            if source.is_reg() {
                self.source_file_size += source.attrs.size;
            }
        }
        if let Some(mirror) = mirror {
            self.mirror_files += 1;
            if mirror.is_reg() {
                self.mirror_file_size += mirror.attrs.size;
            }
        }
        if !changed {
            return;
        }
        match (source, mirror) {
            (Some(source), None) => {
                self.new_files += 1;
                self.new_file_size += source.attrs.size;
            }
            (None, Some(mirror)) => {
                self.deleted_files += 1;
                self.deleted_file_size += mirror.attrs.size;
            }
            (Some(source), Some(mirror)) => {
                self.changed_files += 1;
                if source.is_reg() {
                    self.changed_source_size += source.attrs.size;
                }
                if mirror.is_reg() {
                    self.changed_mirror_size += mirror.attrs.size;
                }
            }
            (None, None) => (),
        }
    }

    pub fn add_increment(&mut self, size: u64) {
        self.increment_files += 1;
        self.increment_file_size += size;
    }

    pub fn add_error(&mut self) {
        self.errors += 1;
    }

    /// Write the counters to `session_statistics.<T>.data` in the
    /// data directory.
    pub fn write_file(
        &self,
        data_dir: &Path,
        time: SessionTime,
        compatible_ts: bool,
    ) -> Result<()> {
        let name = format!(
            "session_statistics.{}.data",
            time.to_string_with(compatible_ts)
        );
        let loc = data_dir.join(name);
        let mut writer = FlatWriter::new(&loc, false)?;

        let elapsed = self.end_time - self.start_time;
        let fields: Vec<(&str, String)> = vec![
            ("StartTime", self.start_time.to_string()),
            ("EndTime", self.end_time.to_string()),
            ("ElapsedTime", elapsed.to_string()),
            ("SourceFiles", self.source_files.to_string()),
            ("SourceFileSize", self.source_file_size.to_string()),
            ("MirrorFiles", self.mirror_files.to_string()),
            ("MirrorFileSize", self.mirror_file_size.to_string()),
            ("NewFiles", self.new_files.to_string()),
            ("NewFileSize", self.new_file_size.to_string()),
            ("DeletedFiles", self.deleted_files.to_string()),
            ("DeletedFileSize", self.deleted_file_size.to_string()),
            ("ChangedFiles", self.changed_files.to_string()),
            ("ChangedSourceSize", self.changed_source_size.to_string()),
            ("ChangedMirrorSize", self.changed_mirror_size.to_string()),
            ("IncrementFiles", self.increment_files.to_string()),
            ("IncrementFileSize", self.increment_file_size.to_string()),
            ("Errors", self.errors.to_string()),
        ];
        for (key, value) in fields {
            writer.write_record(format!("{} {}\n", key, value).into_bytes())?;
        }
        writer.close()
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;
