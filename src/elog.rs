//! Module implement the per-session error log.
//!
//! Routine per-file errors do not stop a session; they are recorded in
//! `error_log.<T>.data[.gz]`, one line per error, and the entry keeps
//! its old mirror state. Newlines inside messages or paths are escaped
//! the same way metadata paths are.

use std::path::Path;

use crate::{
    flat::FlatWriter, meta::quote_path, rorp::Index, stamp::SessionTime, Result,
};

/// Sink for routine errors of one session.
pub struct ErrorLog {
    writer: Option<FlatWriter>,
}

impl ErrorLog {
    /// Open the log for session `time`. Pass `compress` consistent
    /// with the repository's compression setting.
    pub fn open(
        data_dir: &Path,
        time: SessionTime,
        compress: bool,
        compatible_ts: bool,
    ) -> Result<ErrorLog> {
        let mut name =
            format!("error_log.{}.data", time.to_string_with(compatible_ts));
        if compress {
            name.push_str(".gz");
        }
        let writer = FlatWriter::new(&data_dir.join(name), compress)?;
        Ok(ErrorLog { writer: Some(writer) })
    }

    pub fn log(&mut self, kind: &str, index: &Index, message: &str) -> Result<()> {
        tracing::warn!("{} {}: {}", kind, index, message);
        if let Some(writer) = self.writer.as_mut() {
            let mut line = vec![];
            line.extend_from_slice(kind.as_bytes());
            line.push(b' ');
            let path: Vec<u8> = index.components().join(&b'/');
            line.extend_from_slice(&quote_path(&path));
            line.push(b' ');
            line.extend_from_slice(&quote_path(message.as_bytes()));
            line.push(b'\n');
            writer.write_record(line)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }
}
