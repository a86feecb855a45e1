//! RPath binds an [Index] to a base directory on the local filesystem.

use std::{
    convert::TryFrom,
    ffi::CString,
    fs,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt},
    },
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{
    quote::Quoter,
    rorp::{Attrs, FileType, Index},
    util, Error, Result,
};

/// A path on the local filesystem, split as `base` plus `index`, with
/// a cached attribute record. When a [Quoter] is present, the on-disk
/// path is derived by quoting every index component; the index itself
/// always holds the unquoted names.
#[derive(Clone)]
pub struct RPath {
    base: PathBuf,
    index: Index,
    quoter: Option<Rc<Quoter>>,
    attrs: Attrs,
}

impl std::fmt::Debug for RPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RPath({:?})", self.path())
    }
}

impl RPath {
    /// New rpath for `base` + `index`, stat'ed.
    pub fn new(base: &Path, index: Index, quoter: Option<Rc<Quoter>>) -> Result<RPath> {
        let mut rp = RPath {
            base: base.to_path_buf(),
            index,
            quoter,
            attrs: Attrs::missing(),
        };
        rp.setdata()?;
        Ok(rp)
    }

    /// Same base and quoter, different index.
    pub fn new_index(&self, index: Index) -> Result<RPath> {
        RPath::new(&self.base, index, self.quoter.clone())
    }

    pub fn append(&self, comp: &[u8]) -> Result<RPath> {
        self.new_index(self.index.append(comp))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn quoter(&self) -> Option<Rc<Quoter>> {
        self.quoter.clone()
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.attrs
    }

    /// The on-disk path, quoting components if quoting is active.
    pub fn path(&self) -> PathBuf {
        let mut pb = self.base.clone();
        for comp in self.index.components() {
            let comp = match &self.quoter {
                Some(quoter) => quoter.quote(comp),
                None => comp.clone(),
            };
            pb.push(std::ffi::OsStr::from_bytes(&comp));
        }
        pb
    }

    /// Re-read attributes from the filesystem.
    pub fn setdata(&mut self) -> Result<()> {
        self.attrs = lstat_attrs(&self.path())?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        !self.attrs.is_missing()
    }

    pub fn is_dir(&self) -> bool {
        self.attrs.is_dir()
    }

    pub fn is_reg(&self) -> bool {
        self.attrs.is_reg()
    }

    /// Sorted list of entry names in this directory, unquoted when
    /// quoting is active.
    pub fn listdir(&self) -> Result<Vec<Vec<u8>>> {
        let mut names = vec![];
        let entries = err_at!(IOError, fs::read_dir(self.path()), "{:?}", self.path())?;
        for entry in entries {
            let entry = err_at!(IOError, entry)?;
            let name = entry.file_name().as_bytes().to_vec();
            let name = match &self.quoter {
                Some(quoter) => quoter.unquote(&name)?,
                None => name,
            };
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        err_at!(IOError, fs::read(self.path()), "{:?}", self.path())
    }

    /// Write `data` to a temp file in the target directory and rename
    /// it into place.
    pub fn write_bytes_via_temp(&mut self, data: &[u8]) -> Result<()> {
        let target = self.path();
        let tf = util::TempGuard::new_in_dir(&target)?;
        tf.write_all(data)?;
        tf.commit(&target)?;
        self.setdata()
    }

    /// Create this entry as an empty regular file.
    pub fn touch(&mut self) -> Result<()> {
        err_at!(IOError, fs::File::create(self.path()), "{:?}", self.path())?;
        self.setdata()
    }

    pub fn mkdir(&mut self) -> Result<()> {
        err_at!(IOError, fs::create_dir(self.path()), "{:?}", self.path())?;
        self.setdata()
    }

    pub fn makedirs(&mut self) -> Result<()> {
        err_at!(IOError, fs::create_dir_all(self.path()), "{:?}", self.path())?;
        self.setdata()
    }

    /// Remove a file, symlink or empty directory.
    pub fn delete(&mut self) -> Result<()> {
        let loc = self.path();
        let res = if self.attrs.is_dir() {
            fs::remove_dir(&loc)
        } else {
            fs::remove_file(&loc)
        };
        err_at!(IOError, res, "{:?}", loc)?;
        self.attrs = Attrs::missing();
        Ok(())
    }

    /// Remove this entry and, for directories, everything below it.
    pub fn delete_recursive(&mut self) -> Result<()> {
        let loc = self.path();
        let res = if self.attrs.is_dir() {
            fs::remove_dir_all(&loc)
        } else {
            fs::remove_file(&loc)
        };
        err_at!(IOError, res, "{:?}", loc)?;
        self.attrs = Attrs::missing();
        Ok(())
    }

    pub fn chmod(&mut self, perms: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let loc = self.path();
        err_at!(
            IOError,
            fs::set_permissions(&loc, fs::Permissions::from_mode(perms)),
            "{:?}",
            loc
        )?;
        self.attrs.perms = perms;
        Ok(())
    }

    pub fn set_mtime(&mut self, mtime: i64) -> Result<()> {
        let loc = self.path();
        let ft = filetime::FileTime::from_unix_time(mtime, 0);
        err_at!(IOError, filetime::set_file_mtime(&loc, ft), "{:?}", loc)?;
        self.attrs.mtime = mtime;
        Ok(())
    }

    /// Best effort ownership change; quietly a no-op without the
    /// privilege for it.
    pub fn chown(&mut self, uid: u32, gid: u32) {
        let loc = self.path();
        if self.attrs.is_sym() {
            std::os::unix::fs::lchown(&loc, Some(uid), Some(gid)).ok();
        } else {
            std::os::unix::fs::chown(&loc, Some(uid), Some(gid)).ok();
        }
    }

    /// Create this entry as a symlink pointing at `target`.
    pub fn symlink(&mut self, target: &[u8]) -> Result<()> {
        symlink_at(&self.path(), target)?;
        self.setdata()
    }

    /// Create this entry as a fifo, socket or device node.
    pub fn mknod(&mut self, attrs: &Attrs) -> Result<()> {
        mknod_at(&self.path(), attrs)?;
        self.setdata()
    }

    /// Copy the chmoddable bits, ownership and timestamp from `attrs`
    /// onto this entry. Symlinks only get ownership.
    pub fn copy_attrs_from(&mut self, attrs: &Attrs) -> Result<()> {
        self.chown(attrs.uid, attrs.gid);
        if !self.attrs.is_sym() {
            self.chmod(attrs.perms)?;
            self.set_mtime(attrs.mtime)?;
        }
        Ok(())
    }

}

/// Create a symlink at `loc` pointing at `target`.
pub fn symlink_at(loc: &Path, target: &[u8]) -> Result<()> {
    err_at!(
        IOError,
        std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(target), loc),
        "{:?}",
        loc
    )
}

/// Create a fifo, socket or device node at `loc`.
pub fn mknod_at(loc: &Path, attrs: &Attrs) -> Result<()> {
    let cpath = err_at!(FailConvert, CString::new(loc.as_os_str().as_bytes()))?;
    let (mode, dev) = match attrs.ftype {
        FileType::Fifo => (libc::S_IFIFO, 0),
        FileType::Sock => (libc::S_IFSOCK, 0),
        FileType::Dev => match attrs.devnums {
            Some(('b', major, minor)) => {
                (libc::S_IFBLK, unsafe { libc::makedev(major, minor) })
            }
            Some((_, major, minor)) => {
                (libc::S_IFCHR, unsafe { libc::makedev(major, minor) })
            }
            None => err_at!(InvalidInput, msg: "device without numbers")?,
        },
        _ => err_at!(InvalidInput, msg: "mknod on {:?}", attrs.ftype)?,
    };
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode | attrs.perms, dev) };
    if rc != 0 {
        err_at!(IOError, Err(std::io::Error::last_os_error()), "{:?}", loc)?
    }
    Ok(())
}

/// Apply the chmoddable bits, ownership and timestamp from `attrs`
/// onto the entry at `loc`. Symlinks get ownership only.
pub fn apply_attrs_at(loc: &Path, attrs: &Attrs) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if attrs.is_sym() {
        std::os::unix::fs::lchown(loc, Some(attrs.uid), Some(attrs.gid)).ok();
        return Ok(());
    }
    std::os::unix::fs::chown(loc, Some(attrs.uid), Some(attrs.gid)).ok();
    err_at!(
        IOError,
        fs::set_permissions(loc, fs::Permissions::from_mode(attrs.perms)),
        "{:?}",
        loc
    )?;
    let ft = filetime::FileTime::from_unix_time(attrs.mtime, 0);
    err_at!(IOError, filetime::set_file_mtime(loc, ft), "{:?}", loc)
}

/// lstat `loc` into an [Attrs], mapping absence to `Missing`.
pub fn lstat_attrs(loc: &Path) -> Result<Attrs> {
    let md = match fs::symlink_metadata(loc) {
        Ok(md) => md,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Attrs::missing());
        }
        Err(err) => return err_at!(IOError, Err(err), "{:?}", loc),
    };

    let ft = md.file_type();
    let ftype = if ft.is_symlink() {
        FileType::Sym
    } else if ft.is_dir() {
        FileType::Dir
    } else if ft.is_file() {
        FileType::Reg
    } else if ft.is_fifo() {
        FileType::Fifo
    } else if ft.is_socket() {
        FileType::Sock
    } else if ft.is_block_device() || ft.is_char_device() {
        FileType::Dev
    } else {
        FileType::Missing
    };

    let mut attrs = Attrs::new(ftype);
    attrs.perms = md.mode() & 0o7777;
    attrs.uid = md.uid();
    attrs.gid = md.gid();
    attrs.mtime = md.mtime();
    attrs.size = md.size();
    attrs.inode = Some(md.ino());
    attrs.devloc = Some(md.dev());
    attrs.nlink = err_at!(FailConvert, u32::try_from(md.nlink())).ok();

    if ftype == FileType::Sym {
        let target = err_at!(IOError, fs::read_link(loc), "{:?}", loc)?;
        attrs.linkname = Some(target.as_os_str().as_bytes().to_vec());
    }
    if ftype == FileType::Dev {
        let rdev = md.rdev();
        let kind = if ft.is_block_device() { 'b' } else { 'c' };
        let (major, minor) = unsafe { (libc::major(rdev), libc::minor(rdev)) };
        attrs.devnums = Some((kind, major, minor));
    }

    Ok(attrs)
}
