//! Package implement an incremental, reverse-delta backup engine for
//! file trees.
//!
//! The engine maintains a *mirror*, the latest materialized copy of a
//! source tree, and a set of *increments*, per-file reverse diffs that
//! reconstruct any earlier state. Every backup run is a *session*
//! identified by its timestamp `T`. A session,
//!
//! * scans the source in index order and collates it with the mirror,
//! * computes rsync-style signatures on the mirror and deltas on the
//!   source for files that changed,
//! * writes a reverse increment for every changed file before patching
//!   the mirror in place,
//! * records the new attribute set in a metadata flat-file chain,
//! * brackets all of the above between `current_mirror` session markers
//!   so that an aborted run can be detected and regressed.
//!
//! Use [session::Repo] to create or open a repository and drive backup,
//! restore, regress and archive management. The lower level modules are
//! exported for callers that need to compose their own pipelines:
//!
//! * [rorp] path-and-attribute objects, the currency of every iterator.
//! * [collate] and [reducer], the sorted-iterator merge and the
//!   tree-order visitor over it.
//! * [inc], [meta] and [flat], the on-disk encodings.
//! * [quote], the destination filename quoting layer.
//! * [rsync], thin wrappers over the signature/delta/patch engine.
//!
//! All iterators in this package deliver entries in strictly increasing
//! index order, where an index is the tuple of path components below
//! the tree root. Directories sort before their contents, which is what
//! makes the single-pass collation and the tree reducer possible.

#[macro_use]
mod error;

pub mod backup;
pub mod collate;
pub mod config;
pub mod elog;
pub mod flat;
pub mod hlink;
pub mod inc;
pub mod longname;
pub mod manage;
pub mod meta;
pub mod quote;
pub mod reducer;
pub mod regress;
pub mod restore;
pub mod rorp;
pub mod rsync;
pub mod scan;
pub mod session;
pub mod stamp;
pub mod stats;
pub mod util;

pub use error::Error;

/// Type alias for Result returned by functions and methods defined in
/// this package.
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the per-repository data directory, located directly under
/// the mirror root.
pub const DATA_DIR: &str = "rdiff-backup-data";

/// Name of the increments area inside [DATA_DIR].
pub const INCREMENTS_DIR: &str = "increments";
