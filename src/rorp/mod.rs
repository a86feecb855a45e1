//! Module `rorp` implement the path-and-attribute objects that every
//! iterator in this package trades in.
//!
//! An [Index] identifies an entry relative to a tree root as the tuple
//! of its path components, kept as raw bytes. A [Rorp] is a read-only
//! descriptor `{index, attrs}` optionally carrying an attached payload
//! while it travels through the pipeline. [RPath] binds an index to a
//! base directory on the local filesystem and adds the system calls.

use std::{cmp, fmt, result};

mod rpath;

pub use rpath::{apply_attrs_at, lstat_attrs, mknod_at, symlink_at, RPath};

/// Ordered tuple of byte-string path components. The empty tuple is
/// the tree root.
///
/// Indices order lexicographically component-wise, which makes a
/// directory sort immediately before its children. Note that this is
/// not the byte order of the joined path: `(a!,)` sorts after
/// `(a, b)` even though `a! < a/b` as joined bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Index(Vec<Vec<u8>>);

impl Index {
    pub fn root() -> Index {
        Index(vec![])
    }

    pub fn new(comps: Vec<Vec<u8>>) -> Index {
        Index(comps)
    }

    /// Build an index from a `/` separated literal, handy in tests and
    /// selection rules.
    pub fn from_path(path: &[u8]) -> Index {
        let comps = path
            .split(|b| *b == b'/')
            .filter(|c| !c.is_empty())
            .map(|c| c.to_vec())
            .collect();
        Index(comps)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn components(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Last component, aka the base name.
    pub fn basename(&self) -> Option<&[u8]> {
        self.0.last().map(|c| c.as_slice())
    }

    pub fn append(&self, comp: &[u8]) -> Index {
        let mut comps = self.0.clone();
        comps.push(comp.to_vec());
        Index(comps)
    }

    pub fn parent(&self) -> Option<Index> {
        match self.0.len() {
            0 => None,
            n => Some(Index(self.0[..n - 1].to_vec())),
        }
    }

    /// The first `n` components.
    pub fn truncate(&self, n: usize) -> Index {
        Index(self.0[..cmp::min(n, self.0.len())].to_vec())
    }

    /// True if `self` is a prefix of `other`, equality included.
    pub fn is_prefix_of(&self, other: &Index) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let parts: Vec<String> =
            self.0.iter().map(|c| String::from_utf8_lossy(c).to_string()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

/// File type of an entry; `Missing` marks an entry that does not exist
/// on the filesystem side being described.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Reg,
    Dir,
    Sym,
    Dev,
    Fifo,
    Sock,
    Missing,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Reg => "reg",
            FileType::Dir => "dir",
            FileType::Sym => "sym",
            FileType::Dev => "dev",
            FileType::Fifo => "fifo",
            FileType::Sock => "sock",
            FileType::Missing => "None",
        }
    }

    pub fn from_str(s: &str) -> Option<FileType> {
        match s {
            "reg" => Some(FileType::Reg),
            "dir" => Some(FileType::Dir),
            "sym" => Some(FileType::Sym),
            "dev" => Some(FileType::Dev),
            "fifo" => Some(FileType::Fifo),
            "sock" => Some(FileType::Sock),
            "None" => Some(FileType::Missing),
            _ => None,
        }
    }
}

/// Typed attribute record for one entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Attrs {
    pub ftype: FileType,
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub mtime: i64,
    /// Meaningful only for regular files.
    pub size: u64,
    /// Hex digest, set lazily while the file content passes through.
    pub sha1: Option<String>,
    pub inode: Option<u64>,
    pub devloc: Option<u64>,
    pub nlink: Option<u32>,
    /// Symlink target.
    pub linkname: Option<Vec<u8>>,
    /// ('c'|'b', major, minor) for device nodes.
    pub devnums: Option<(char, u32, u32)>,
}

impl Attrs {
    /// Attributes of a non-existent entry.
    pub fn missing() -> Attrs {
        Attrs {
            ftype: FileType::Missing,
            perms: 0,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mtime: 0,
            size: 0,
            sha1: None,
            inode: None,
            devloc: None,
            nlink: None,
            linkname: None,
            devnums: None,
        }
    }

    pub fn new(ftype: FileType) -> Attrs {
        Attrs { ftype, ..Attrs::missing() }
    }

    pub fn is_missing(&self) -> bool {
        self.ftype == FileType::Missing
    }

    pub fn is_reg(&self) -> bool {
        self.ftype == FileType::Reg
    }

    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Dir
    }

    pub fn is_sym(&self) -> bool {
        self.ftype == FileType::Sym
    }

    /// Device, fifo or socket: entries whose content cannot be read or
    /// compared, only recreated from attributes.
    pub fn is_special(&self) -> bool {
        matches!(self.ftype, FileType::Dev | FileType::Fifo | FileType::Sock)
    }

    /// Metadata equivalence, the test that decides whether a file
    /// needs to be transferred. Symlinks compare by target only, size
    /// matters only for regular files, inode/nlink never participate.
    pub fn metadata_equal(&self, other: &Attrs) -> bool {
        if self.ftype != other.ftype {
            return false;
        }
        match self.ftype {
            FileType::Missing => true,
            FileType::Sym => self.linkname == other.linkname,
            FileType::Reg => {
                self.size == other.size
                    && self.mtime == other.mtime
                    && self.perms == other.perms
                    && self.uid == other.uid
                    && self.gid == other.gid
            }
            FileType::Dev => {
                self.devnums == other.devnums
                    && self.perms == other.perms
                    && self.uid == other.uid
                    && self.gid == other.gid
            }
            _ => {
                self.perms == other.perms
                    && self.mtime == other.mtime
                    && self.uid == other.uid
                    && self.gid == other.gid
            }
        }
    }

    /// Loose equivalence used by regress: ownership is ignored because
    /// it may not have been settable, sha1 participates when both
    /// sides carry one.
    pub fn equal_loose(&self, other: &Attrs) -> bool {
        if self.ftype != other.ftype {
            return false;
        }
        match self.ftype {
            FileType::Missing => true,
            FileType::Sym => self.linkname == other.linkname,
            FileType::Reg => {
                let sha1_ok = match (&self.sha1, &other.sha1) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                };
                self.size == other.size && self.mtime == other.mtime && sha1_ok
            }
            FileType::Dev => self.devnums == other.devnums,
            FileType::Dir => true,
            _ => true,
        }
    }
}

/// What an attached payload is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachKind {
    /// Complete file bytes.
    Snapshot,
    /// rsync delta against some basis.
    Diff,
    /// rsync signature of a basis, flows only mirror-to-source.
    Signature,
}

/// In-flight payload riding on a [Rorp]. Never written to disk in this
/// form.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub kind: AttachKind,
    pub data: Vec<u8>,
}

/// A routine per-file error, converted from an exception into a value
/// so the pipeline keeps running.
#[derive(Clone, Debug)]
pub struct Report {
    pub message: String,
}

/// Read-only descriptor of one tree entry: index plus typed attributes
/// plus transport-only extras.
#[derive(Clone, Debug)]
pub struct Rorp {
    pub index: Index,
    pub attrs: Attrs,
    pub attached: Option<Attachment>,
    /// Overriding on-disk mirror location, for over-long names.
    pub mirrorname: Option<Vec<u8>>,
    /// Overriding increment base, for over-long names.
    pub incname: Option<Vec<u8>>,
    /// Set when this entry's content lives at an earlier index of the
    /// same hardlink group.
    pub linked_to: Option<Index>,
    /// A routine error hit while producing this entry.
    pub report: Option<Report>,
}

impl Rorp {
    pub fn new(index: Index, attrs: Attrs) -> Rorp {
        Rorp {
            index,
            attrs,
            attached: None,
            mirrorname: None,
            incname: None,
            linked_to: None,
            report: None,
        }
    }

    /// A marker for an entry that does not exist.
    pub fn missing(index: Index) -> Rorp {
        Rorp::new(index, Attrs::missing())
    }

    pub fn is_missing(&self) -> bool {
        self.attrs.is_missing()
    }

    pub fn is_reg(&self) -> bool {
        self.attrs.is_reg()
    }

    pub fn is_dir(&self) -> bool {
        self.attrs.is_dir()
    }

    pub fn attach(&mut self, kind: AttachKind, data: Vec<u8>) {
        self.attached = Some(Attachment { kind, data });
    }

    pub fn attached_kind(&self) -> Option<AttachKind> {
        self.attached.as_ref().map(|a| a.kind)
    }

    /// Take the attached payload out, leaving the rorp bare.
    pub fn take_attached(&mut self) -> Option<Attachment> {
        self.attached.take()
    }

    pub fn set_report(&mut self, message: String) {
        self.report = Some(Report { message });
    }
}
