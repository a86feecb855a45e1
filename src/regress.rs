//! Module implement the regress engine.
//!
//! An aborted session leaves two `current_mirror` markers behind. The
//! mirror is then somewhere between two states, and the metadata
//! snapshot of the older marker is the ground truth for bringing it
//! back: entries that match it loosely only need their stray
//! increments removed, entries that do not are reverted through the
//! increments the aborted session wrote, entries it does not mention
//! are deleted. The newer marker is removed only after everything
//! else, so a crash during regress re-enters regress.

use std::{fs, path::PathBuf};

use crate::{
    collate::Collate2,
    meta,
    reducer::{Branch, TreeReducer},
    restore::CachedRF,
    rorp::{FileType, Index, RPath, Rorp},
    stamp::SessionTime,
    util, Error, Result,
};

/// Parse the `PID <n>` contents of a session marker.
pub fn parse_marker_pid(contents: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(contents).ok()?;
    let rest = text.strip_prefix("PID ")?;
    rest.trim().parse().ok()
}

/// Whether a process with this pid is still running.
pub fn pid_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{}", pid)).exists()
}

// Union walk over the mirror tree and the increments tree, in index
// order. Entries that exist only as increments still show up, with
// missing mirror attributes, so their stray increments get cleaned.
struct RegressScan {
    mirror_root: RPath,
    inc_root: RPath,
    to_visit: Vec<Index>,
}

impl RegressScan {
    fn new(mirror_root: RPath, inc_root: RPath) -> RegressScan {
        RegressScan {
            mirror_root,
            inc_root,
            to_visit: vec![Index::root()],
        }
    }

    fn child_names(&self, index: &Index) -> Result<Vec<Vec<u8>>> {
        use std::collections::BTreeSet;

        let mut names: BTreeSet<Vec<u8>> = BTreeSet::new();

        let mirror_rp = self.mirror_root.new_index(index.clone())?;
        if mirror_rp.is_dir() {
            for name in mirror_rp.listdir()? {
                if index.is_root() && name == crate::DATA_DIR.as_bytes() {
                    continue;
                }
                names.insert(name);
            }
        }

        let inc_rp = self.inc_root.new_index(index.clone())?;
        if inc_rp.is_dir() {
            for name in inc_rp.listdir()? {
                match crate::inc::parse_inc_name(&name) {
                    Some((basename, _, _, _)) => names.insert(basename),
                    None => names.insert(name),
                };
            }
        }

        Ok(names.into_iter().collect())
    }
}

impl Iterator for RegressScan {
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.to_visit.pop()?;
        let rp = match self.mirror_root.new_index(index.clone()) {
            Ok(rp) => rp,
            Err(err) => return Some(Err(err)),
        };
        let rorp = Rorp::new(index.clone(), rp.attrs().clone());

        let descend = rp.is_dir() || {
            match self.inc_root.new_index(index.clone()) {
                Ok(inc_rp) => inc_rp.is_dir(),
                Err(_) => false,
            }
        };
        if descend {
            match self.child_names(&index) {
                Ok(names) => {
                    for name in names.into_iter().rev() {
                        self.to_visit.push(index.append(&name));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
        Some(Ok(rorp))
    }
}

/// One entry of the regress walk: what is on disk against what the
/// metadata says should be there.
pub struct RegressItem {
    pub index: Index,
    pub metadata: Option<Rorp>,
}

enum RegressPlan {
    /// Directory confirmed; set these attributes at the end.
    Update(Rorp),
    /// Mirror directory must become this staged non-dir content.
    Replace(Option<Vec<u8>>, Rorp),
    /// Nothing left to do at the end.
    Done,
}

struct RegressCtx {
    mirror_root: RPath,
    regress_time: SessionTime,
    cached_rf: std::cell::RefCell<CachedRF>,
}

impl RegressCtx {
    // drop every increment the aborted session left for this entry,
    // the long-filename area included.
    fn delete_later_incs(&self, index: &Index, metadata: Option<&Rorp>) -> Result<()> {
        let mut incs = self.cached_rf.borrow_mut().incs_for(index)?;
        if let Some(meta_rorp) = metadata.filter(|m| m.incname.is_some()) {
            incs.extend(self.cached_rf.borrow_mut().incs_for_rorp(meta_rorp)?);
        }
        for inc in incs {
            if inc.time >= self.regress_time {
                err_at!(IOError, fs::remove_file(&inc.path), "{:?}", inc.path)?;
            }
        }
        Ok(())
    }

    // redirect-aware location of the mirror copy.
    fn mirror_rp_for(&self, index: &Index, metadata: Option<&Rorp>) -> Result<RPath> {
        match metadata.filter(|m| m.mirrorname.is_some()) {
            Some(meta_rorp) => self.cached_rf.borrow().mirror_rp_for(meta_rorp),
            None => self.mirror_root.new_index(index.clone()),
        }
    }

    // loose equality plus a content check when the metadata carries a
    // hash; regress is the one place a silent mismatch would linger.
    fn matches_metadata(&self, mirror_rp: &RPath, meta_rorp: &Rorp) -> Result<bool> {
        let mattrs = mirror_rp.attrs();
        if !mattrs.equal_loose(&meta_rorp.attrs) {
            return Ok(false);
        }
        if mattrs.is_reg() {
            if let Some(want) = &meta_rorp.attrs.sha1 {
                let got = util::sha1_hex(&mirror_rp.read_bytes()?);
                return Ok(&got == want);
            }
        }
        Ok(true)
    }

    fn revert_entry(&self, index: &Index, meta_rorp: &Rorp) -> Result<()> {
        let mut mirror_rp = self.mirror_rp_for(index, Some(meta_rorp))?;
        match meta_rorp.attrs.ftype {
            FileType::Reg => {
                let bytes =
                    match self.cached_rf.borrow_mut().restore_bytes(meta_rorp)? {
                        Some(bytes) => bytes,
                        None => err_at!(
                            Fatal,
                            msg: "regress cannot recover data for {}", index
                        )?,
                    };
                if mirror_rp.exists() && !mirror_rp.is_reg() {
                    mirror_rp.delete_recursive()?;
                }
                mirror_rp.write_bytes_via_temp(&bytes)?;
            }
            FileType::Sym => {
                if mirror_rp.exists() {
                    mirror_rp.delete_recursive()?;
                }
                let target = meta_rorp.attrs.linkname.clone().unwrap_or_default();
                mirror_rp.symlink(&target)?;
            }
            FileType::Fifo | FileType::Sock | FileType::Dev => {
                if mirror_rp.exists() {
                    mirror_rp.delete_recursive()?;
                }
                if let Err(err) = mirror_rp.mknod(&meta_rorp.attrs) {
                    tracing::warn!("cannot recreate special file {}: {}", index, err);
                    mirror_rp.touch()?;
                }
            }
            _ => (),
        }
        mirror_rp.copy_attrs_from(&meta_rorp.attrs)?;
        Ok(())
    }
}

struct RegressBranch {
    ctx: std::rc::Rc<RegressCtx>,
    base_rp: Option<RPath>,
    plan: Option<RegressPlan>,
}

impl RegressBranch {
    fn handle_fast(&self, index: &Index, item: &RegressItem) -> Result<()> {
        let mut mirror_rp = self.ctx.mirror_rp_for(index, item.metadata.as_ref())?;
        match &item.metadata {
            None => {
                if mirror_rp.exists() {
                    mirror_rp.delete_recursive()?;
                }
            }
            Some(meta_rorp) => {
                if !self.ctx.matches_metadata(&mirror_rp, meta_rorp)? {
                    self.ctx.revert_entry(index, meta_rorp)?;
                }
            }
        }
        self.ctx.delete_later_incs(index, item.metadata.as_ref())
    }
}

impl Branch for RegressBranch {
    type Item = RegressItem;

    fn can_fast_process(&mut self, index: &Index, item: &RegressItem) -> bool {
        let meta_is_dir = item
            .metadata
            .as_ref()
            .map(|rorp| rorp.is_dir())
            .unwrap_or(false);
        if meta_is_dir {
            return false;
        }
        self.ctx
            .mirror_root
            .new_index(index.clone())
            .map(|rp| !rp.is_dir())
            .unwrap_or(true)
    }

    fn fast_process(&mut self, index: &Index, item: RegressItem) -> Result<()> {
        self.handle_fast(index, &item)
    }

    fn start_process(&mut self, index: &Index, item: RegressItem) -> Result<()> {
        let mut rp = self.ctx.mirror_root.new_index(index.clone())?;
        self.base_rp = Some(rp.clone());

        match item.metadata {
            Some(meta_rorp) if meta_rorp.is_dir() => {
                if !rp.is_dir() {
                    if rp.exists() {
                        rp.delete()?;
                    }
                    rp.mkdir()?;
                }
                if rp.attrs().perms & 0o700 < 0o700 {
                    rp.chmod(rp.attrs().perms | 0o700)?;
                }
                self.ctx.delete_later_incs(index, Some(&meta_rorp))?;
                self.plan = Some(RegressPlan::Update(meta_rorp));
            }
            Some(meta_rorp) => {
                // a directory stands where the metadata wants a
                // non-dir; recover the content now, swap at the end.
                let staged = if meta_rorp.is_reg() {
                    self.ctx.cached_rf.borrow_mut().restore_bytes(&meta_rorp)?
                } else {
                    None
                };
                self.ctx.delete_later_incs(index, Some(&meta_rorp))?;
                self.plan = Some(RegressPlan::Replace(staged, meta_rorp));
            }
            None => {
                if rp.exists() {
                    rp.delete_recursive()?;
                }
                self.ctx.delete_later_incs(index, None)?;
                self.plan = Some(RegressPlan::Done);
            }
        }
        Ok(())
    }

    fn end_process(&mut self) -> Result<()> {
        let mut base_rp = match self.base_rp.take() {
            Some(base_rp) => base_rp,
            None => return Ok(()),
        };
        match self.plan.take() {
            Some(RegressPlan::Update(meta_rorp)) => {
                base_rp.setdata()?;
                if base_rp.is_dir() {
                    base_rp.copy_attrs_from(&meta_rorp.attrs)?;
                }
            }
            Some(RegressPlan::Replace(staged, meta_rorp)) => {
                base_rp.setdata()?;
                if base_rp.is_dir() {
                    base_rp.delete_recursive()?;
                }
                match (staged, meta_rorp.is_reg()) {
                    (Some(bytes), true) => {
                        base_rp.write_bytes_via_temp(&bytes)?;
                        base_rp.copy_attrs_from(&meta_rorp.attrs)?;
                    }
                    _ => self.ctx.revert_entry(base_rp.index(), &meta_rorp)?,
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn branch_process(&mut self, _child: Self) -> Result<()> {
        Ok(())
    }
}

/// Regress driver: reverts mirror and data dir to `regress_time`. The
/// caller owns marker handling and deletes the newer marker after this
/// returns.
pub struct Regresser {
    pub mirror_root: RPath,
    pub inc_root: RPath,
    pub long_root: RPath,
    pub data_dir: PathBuf,
    pub manager: meta::Manager,
    pub regress_time: SessionTime,
    pub unsuccessful_time: SessionTime,
}

impl Regresser {
    pub fn run(self) -> Result<()> {
        // ground truth first: a metadata snapshot at regress time.
        self.manager.recreate_snapshot(self.regress_time, self.unsuccessful_time)?;
        self.manager.delete_after(self.regress_time)?;

        let cached_rf = CachedRF::new(
            self.mirror_root.clone(),
            self.inc_root.clone(),
            self.long_root.clone(),
            self.regress_time,
            self.unsuccessful_time,
        );
        let ctx = std::rc::Rc::new(RegressCtx {
            mirror_root: self.mirror_root.clone(),
            regress_time: self.regress_time,
            cached_rf: std::cell::RefCell::new(cached_rf),
        });

        let scan = RegressScan::new(self.mirror_root.clone(), self.inc_root.clone());
        let meta_iter = self.manager.attrs_at(self.regress_time)?;
        let collated = Collate2::new(scan, meta_iter);

        let mut reducer = {
            let ctx = std::rc::Rc::clone(&ctx);
            TreeReducer::new(move || RegressBranch {
                ctx: std::rc::Rc::clone(&ctx),
                base_rp: None,
                plan: None,
            })
        };
        for pair in collated {
            let (scanned, metadata) = pair?;
            let index = match (&scanned, &metadata) {
                (Some(s), _) => s.index.clone(),
                (_, Some(m)) => m.index.clone(),
                _ => continue,
            };
            reducer.feed(index.clone(), RegressItem { index, metadata })?;
        }
        reducer.finish()?;

        // increment directories the aborted session opened may now be
        // empty; prune them bottom-up so the tree matches the state
        // before the session started.
        prune_empty_dirs(&self.inc_root.path())?;

        util::sync_dir(&self.mirror_root.path())?;
        util::sync_dir(&self.data_dir)
    }
}

// remove empty directories below `root`, deepest first; `root` itself
// stays.
fn prune_empty_dirs(root: &std::path::Path) -> Result<()> {
    let mut dirs = vec![];
    let mut to_visit = vec![root.to_path_buf()];
    while let Some(dir) = to_visit.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = err_at!(IOError, entry)?;
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                to_visit.push(entry.path());
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    for dir in dirs.into_iter().rev() {
        fs::remove_dir(&dir).ok(); // only succeeds when empty
    }
    Ok(())
}

#[cfg(test)]
#[path = "regress_test.rs"]
mod regress_test;
