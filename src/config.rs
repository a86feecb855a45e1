//! Module implement session configuration.
//!
//! All knobs that the original tool kept as process-wide globals are
//! collected here and threaded explicitly through the components. One
//! [Config] value describes one repository; per-session state lives in
//! [crate::session].

use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::rorp::Index;

/// Default bound on requests in flight between pipeline stages. The
/// post-processing cache is sized at four times this value.
pub const PIPELINE_MAX_LENGTH: usize = 500;

lazy_static! {
    // increment payloads for files that are already compressed gain
    // nothing from another gzip pass.
    static ref NO_COMPRESSION_REGEXP: Regex = Regex::new(
        r"(?i)\.(gz|z|bz|bz2|tgz|zip|zst|rpm|deb|jpg|jpeg|gif|png|mp3|ogg|avi|mp4)$"
    )
    .unwrap();
}

/// Configuration for a backup repository.
#[derive(Clone, Debug)]
pub struct Config {
    /// Byte class quoted on the destination filesystem, e.g. b"A-Z:".
    /// None disables quoting.
    ///
    /// Default: None
    pub chars_to_quote: Option<Vec<u8>>,
    /// Single ASCII byte introducing an escape group.
    ///
    /// Default: b';'
    pub quoting_char: u8,
    /// Escape the first byte of DOS device names (aux, prn, con, nul,
    /// com0-9, lpt1-9).
    ///
    /// Default: false
    pub escape_dos_devices: bool,
    /// Escape a trailing space or period.
    ///
    /// Default: false
    pub escape_trailing_spaces: bool,
    /// Gzip increment payloads and flat files.
    ///
    /// Default: true
    pub compression: bool,
    /// Bound on entries in flight between pipeline stages.
    ///
    /// Default: [PIPELINE_MAX_LENGTH]
    pub pipeline_max_length: usize,
    /// Track hard links via (devloc, inode) and record link counts in
    /// the metadata.
    ///
    /// Default: true
    pub preserve_hardlinks: bool,
    /// Emit the `-`-for-`:` timestamp form in file names.
    ///
    /// Default: false
    pub use_compatible_timestamps: bool,
    /// Proceed where the engine would otherwise refuse, e.g. regressing
    /// past a live pid or changing the quoting class.
    ///
    /// Default: false
    pub force: bool,
    /// Quoted file name components longer than this many bytes are
    /// routed through the long-filename overflow area.
    ///
    /// Default: 255
    pub max_component_len: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            chars_to_quote: None,
            quoting_char: b';',
            escape_dos_devices: false,
            escape_trailing_spaces: false,
            compression: true,
            pipeline_max_length: PIPELINE_MAX_LENGTH,
            preserve_hardlinks: true,
            use_compatible_timestamps: false,
            force: false,
            max_component_len: 255,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Enable destination filename quoting for the byte class `ctq`.
    pub fn set_chars_to_quote(&mut self, ctq: &[u8]) -> &mut Self {
        self.chars_to_quote = Some(ctq.to_vec());
        self
    }

    pub fn set_quoting_char(&mut self, qc: u8) -> &mut Self {
        self.quoting_char = qc;
        self
    }

    pub fn set_compression(&mut self, compression: bool) -> &mut Self {
        self.compression = compression;
        self
    }

    pub fn set_force(&mut self, force: bool) -> &mut Self {
        self.force = force;
        self
    }

    /// True if the increment payload for `name` should be gzipped.
    pub fn compress_increment(&self, name: &[u8]) -> bool {
        self.compression && !NO_COMPRESSION_REGEXP.is_match(name)
    }
}

/// Literal selection of source entries. The expression parser
/// (globs, file lists) lives outside this package; here a selection is
/// an ordered list of include/exclude index prefixes, first match wins.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    rules: Vec<(bool, Index)>,
}

impl Selection {
    /// Select everything.
    pub fn all() -> Selection {
        Selection { rules: vec![] }
    }

    pub fn include(&mut self, prefix: Index) -> &mut Self {
        self.rules.push((true, prefix));
        self
    }

    pub fn exclude(&mut self, prefix: Index) -> &mut Self {
        self.rules.push((false, prefix));
        self
    }

    /// Whether `index` is selected. Rules apply to the entry and its
    /// descendants; the first matching rule decides. Ancestors of an
    /// included prefix stay selected so the scan can reach it.
    pub fn is_selected(&self, index: &Index) -> bool {
        for (include, prefix) in self.rules.iter() {
            if prefix.is_prefix_of(index) {
                return *include;
            }
            if *include && index.is_prefix_of(prefix) {
                return true;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
