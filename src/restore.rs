//! Module implement the restore engine.
//!
//! Restoring to time `T` walks the attribute set recorded at `T` and,
//! for every regular file, rebuilds the bytes by starting from the
//! current mirror and applying the chain of reverse diffs newest
//! first. A `snapshot` increment in the chain resets the basis, a
//! `missing` increment means the file did not exist. When the
//! requested time falls between two sessions the older one wins; that
//! is what was on disk at `T`.
//!
//! The patch half repeats the backup-side branch instead of sharing
//! it; the error handling is different enough that one shared branch
//! would serve neither well.

use std::collections::HashMap;

use crate::{
    collate::FillInIter,
    inc::{self, IncKind, IncRp},
    meta,
    reducer::{Branch, TreeReducer},
    rorp::{self, AttachKind, Attrs, FileType, Index, RPath, Rorp},
    rsync,
    stamp::SessionTime,
    Error, Result,
};

/// The session time whose on-disk state corresponds to `restore_to`:
/// the newest session at or before it, else the oldest session.
pub fn resolve_rest_time(
    restore_to: SessionTime,
    session_times: &[SessionTime],
) -> SessionTime {
    let mut pick = None;
    for t in session_times {
        if *t <= restore_to {
            pick = Some(*t);
        }
    }
    match pick {
        Some(t) => t,
        None => session_times.first().copied().unwrap_or(restore_to),
    }
}

/// Random access to the increments of one directory at a time.
///
/// Restore files are requested in index order, so listing the
/// increment directory once per directory and indexing by basename
/// gives amortized constant cost; the cache is replaced when a later
/// directory is requested.
pub struct CachedRF {
    mirror_root: RPath,
    inc_root: RPath,
    long_root: RPath,
    rest_time: SessionTime,
    mirror_time: SessionTime,
    cur_dir: Option<Index>,
    dir_incs: HashMap<Vec<u8>, Vec<IncRp>>,
}

impl CachedRF {
    pub fn new(
        mirror_root: RPath,
        inc_root: RPath,
        long_root: RPath,
        rest_time: SessionTime,
        mirror_time: SessionTime,
    ) -> CachedRF {
        CachedRF {
            mirror_root,
            inc_root,
            long_root,
            rest_time,
            mirror_time,
            cur_dir: None,
            dir_incs: HashMap::new(),
        }
    }

    /// All increments recorded for `index`, ascending by time.
    pub fn incs_for(&mut self, index: &Index) -> Result<Vec<IncRp>> {
        if index.is_root() {
            let inc_base = self.inc_root.new_index(Index::root())?;
            return inc::get_inclist(&inc_base);
        }
        let parent = index.parent().unwrap();
        if self.cur_dir.as_ref() != Some(&parent) {
            let dir_rp = self.inc_root.new_index(parent.clone())?;
            self.dir_incs = inc::list_inc_dir(&dir_rp)?;
            self.cur_dir = Some(parent);
        }
        let basename = index.basename().unwrap_or_default().to_vec();
        Ok(self.dir_incs.get(&basename).cloned().unwrap_or_default())
    }

    /// Increments for `rorp`, honoring a long-name redirect.
    pub fn incs_for_rorp(&mut self, rorp: &Rorp) -> Result<Vec<IncRp>> {
        match &rorp.incname {
            Some(name) => {
                let inc_base = self.long_root.new_index(Index::new(vec![name.clone()]))?;
                inc::get_inclist(&inc_base)
            }
            None => self.incs_for(&rorp.index),
        }
    }

    // The increments that matter for this entry: ascending from
    // rest_time, diffs up to and including the first non-diff.
    fn relevant_incs(&mut self, rorp: &Rorp) -> Result<Vec<IncRp>> {
        if self.rest_time >= self.mirror_time {
            return Ok(vec![]);
        }
        let incs = self.incs_for_rorp(rorp)?;
        let mut relevant = vec![];
        for inc in incs.into_iter().filter(|inc| inc.time >= self.rest_time) {
            let is_diff = inc.kind == IncKind::Diff;
            relevant.push(inc);
            if !is_diff {
                break;
            }
        }
        Ok(relevant)
    }

    /// The mirror location for `rorp`: its index below the mirror
    /// root, unless an alternate mirror name redirects it into the
    /// long-filename area.
    pub fn mirror_rp_for(&self, rorp: &Rorp) -> Result<RPath> {
        match &rorp.mirrorname {
            Some(name) => self.long_root.new_index(Index::new(vec![name.clone()])),
            None => self.mirror_root.new_index(rorp.index.clone()),
        }
    }

    /// Bytes of the regular file described by the metadata entry
    /// `rorp`, as they were at rest time, or None when the chain says
    /// the file did not exist.
    pub fn restore_bytes(&mut self, rorp: &Rorp) -> Result<Option<Vec<u8>>> {
        let index = &rorp.index;
        let relevant = self.relevant_incs(rorp)?;

        // newest first; the mirror is the basis unless a snapshot or
        // marker interrupts the diff chain.
        let from_mirror =
            relevant.is_empty() || relevant.last().unwrap().kind == IncKind::Diff;
        let mut chain: Vec<&IncRp> = relevant.iter().rev().collect();

        let mut current = if from_mirror {
            let rp = self.mirror_rp_for(rorp)?;
            if !rp.is_reg() {
                return Ok(None);
            }
            rp.read_bytes()?
        } else {
            let first = chain.remove(0);
            match first.kind {
                IncKind::Snapshot => first.read_payload()?,
                IncKind::Missing | IncKind::Dir | IncKind::Special => return Ok(None),
                IncKind::Diff => err_at!(
                    Fatal,
                    msg: "diff cannot head a detached chain at {}", index
                )?,
            }
        };

        for inc in chain {
            if inc.kind != IncKind::Diff {
                err_at!(
                    InvalidFile,
                    msg: "unexpected {} increment at {}", inc.kind.as_str(), index
                )?
            }
            current = rsync::patch(&current, &inc.read_payload()?)?;
        }
        Ok(Some(current))
    }

    /// Fallback attributes for `index`, from the oldest relevant
    /// increment, when the metadata chain has no record.
    pub fn fallback_attrs(&mut self, index: &Index) -> Result<Option<Attrs>> {
        let probe = Rorp::missing(index.clone());
        let relevant = self.relevant_incs(&probe)?;
        let last = match relevant.last() {
            Some(last) => last,
            None => return Ok(None),
        };
        let mut attrs = last.attrs.clone();
        match last.kind {
            IncKind::Missing => return Ok(Some(Attrs::missing())),
            IncKind::Dir => attrs.ftype = FileType::Dir,
            _ => (),
        }
        Ok(Some(attrs))
    }
}

/// Restore driver for one repository.
pub struct Restorer {
    pub mirror_root: RPath,
    pub inc_root: RPath,
    pub long_root: RPath,
    pub manager: meta::Manager,
    pub mirror_time: SessionTime,
    pub rest_time: SessionTime,
}

impl Restorer {
    /// Write the tree under `sub_index` as of rest time into
    /// `target`. The target directory is created if needed.
    pub fn restore(&self, sub_index: &Index, target: &std::path::Path) -> Result<()> {
        let mut cached_rf = CachedRF::new(
            self.mirror_root.clone(),
            self.inc_root.clone(),
            self.long_root.clone(),
            self.rest_time,
            self.mirror_time,
        );

        let target_root = RPath::new(target, Index::root(), None)?;
        let meta_iter = self.manager.attrs_at(self.rest_time)?;
        let sub = sub_index.clone();
        let depth = sub.depth();

        let out_iter = meta_iter.filter_map(move |item| match item {
            Ok(rorp) => {
                if !sub.is_prefix_of(&rorp.index) {
                    return None;
                }
                Some(Ok(rorp))
            }
            Err(err) => Some(Err(err)),
        });

        let mut reducer = TreeReducer::new(RestoreBranch::factory(target_root.clone()));
        let filler_root = target_root.clone();
        let filled = FillInIter::new(
            OutIter { iter: Box::new(out_iter), cached_rf: &mut cached_rf, depth },
            move |index| {
                let rp = filler_root.new_index(index.clone())?;
                if rp.exists() {
                    Ok(Rorp::new(index.clone(), rp.attrs().clone()))
                } else {
                    let mut attrs = Attrs::new(FileType::Dir);
                    attrs.perms = 0o755;
                    Ok(Rorp::new(index.clone(), attrs))
                }
            },
        );

        for item in filled {
            let rorp = item?;
            reducer.feed(rorp.index.clone(), rorp)?;
        }
        reducer.finish()
    }
}

// Map metadata entries to output rorps with content attached, indices
// rebased below the restored subtree.
struct OutIter<'a> {
    iter: Box<dyn Iterator<Item = Result<Rorp>> + 'a>,
    cached_rf: &'a mut CachedRF,
    depth: usize,
}

impl<'a> Iterator for OutIter<'a> {
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut rorp = match self.iter.next()? {
            Ok(rorp) => rorp,
            Err(err) => return Some(Err(err)),
        };
        if rorp.is_reg() {
            match self.cached_rf.restore_bytes(&rorp) {
                Ok(Some(bytes)) => rorp.attach(AttachKind::Snapshot, bytes),
                Ok(None) => {
                    tracing::warn!(
                        "no data recoverable for {}, restoring empty", rorp.index
                    );
                    rorp.attach(AttachKind::Snapshot, vec![]);
                }
                Err(err) => return Some(Err(err)),
            }
        }
        // rebase under the restore target.
        let comps = rorp.index.components()[self.depth..].to_vec();
        rorp.index = Index::new(comps);
        Some(Ok(rorp))
    }
}

/// Target-side writer branch. Same shape as the backup patch branch,
/// minus increments and the post-processing cache.
pub struct RestoreBranch {
    target_root: RPath,
    base_rp: Option<RPath>,
    dir_update: Option<Rorp>,
}

impl RestoreBranch {
    pub fn factory(target_root: RPath) -> impl FnMut() -> RestoreBranch {
        move || RestoreBranch {
            target_root: target_root.clone(),
            base_rp: None,
            dir_update: None,
        }
    }

    fn write_entry(&self, index: &Index, rorp: &Rorp) -> Result<()> {
        let mut rp = self.target_root.new_index(index.clone())?;
        if rp.exists() {
            rp.delete_recursive()?;
        }
        match rorp.attrs.ftype {
            FileType::Reg => {
                let data = match &rorp.attached {
                    Some(att) => att.data.clone(),
                    None => vec![],
                };
                rp.write_bytes_via_temp(&data)?;
                rp.copy_attrs_from(&rorp.attrs)?;
            }
            FileType::Sym => {
                let target = rorp.attrs.linkname.clone().unwrap_or_default();
                rp.symlink(&target)?;
                rp.chown(rorp.attrs.uid, rorp.attrs.gid);
            }
            FileType::Fifo | FileType::Sock | FileType::Dev => {
                if let Err(err) = rp.mknod(&rorp.attrs) {
                    tracing::warn!("cannot recreate special file {}: {}", index, err);
                    rp.touch()?;
                }
                rorp::apply_attrs_at(&rp.path(), &rorp.attrs)?;
            }
            _ => (),
        }
        Ok(())
    }
}

impl Branch for RestoreBranch {
    type Item = Rorp;

    fn can_fast_process(&mut self, _index: &Index, rorp: &Rorp) -> bool {
        !rorp.is_dir()
    }

    fn fast_process(&mut self, index: &Index, rorp: Rorp) -> Result<()> {
        if rorp.is_missing() {
            return Ok(());
        }
        self.write_entry(index, &rorp)
    }

    fn start_process(&mut self, index: &Index, rorp: Rorp) -> Result<()> {
        let mut rp = self.target_root.new_index(index.clone())?;
        if !rp.is_dir() {
            if rp.exists() {
                rp.delete()?;
            }
            if index.is_root() {
                rp.makedirs()?;
            } else {
                rp.mkdir()?;
            }
        }
        if rorp.attrs.perms & 0o700 < 0o700 {
            rp.chmod(rorp.attrs.perms | 0o700)?;
        }
        self.base_rp = Some(rp);
        self.dir_update = Some(rorp);
        Ok(())
    }

    fn end_process(&mut self) -> Result<()> {
        if let (Some(mut rp), Some(rorp)) = (self.base_rp.take(), self.dir_update.take())
        {
            rp.setdata()?;
            if rp.is_dir() {
                rp.copy_attrs_from(&rorp.attrs)?;
            }
        }
        Ok(())
    }

    fn branch_process(&mut self, _child: Self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "restore_test.rs"]
mod restore_test;
