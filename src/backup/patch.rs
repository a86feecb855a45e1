//! Patch and increment branches for the tree reducer.
//!
//! [PatchBranch] applies the diff stream to the mirror: regular files
//! are written to a temp file in the target directory and renamed into
//! place, special entries are recreated from attributes, deletions are
//! carried out, directory attributes are set after their contents.
//! With an increment context attached it becomes the
//! mirror-plus-increment branch: before every mirror mutation the
//! pre-image is preserved under the increments area, stamped with the
//! previous session's time.

use std::rc::Rc;

use crate::{
    backup::ccpp::{Ccpp, SUCCESS_OK, SUCCESS_SPECIAL},
    config::Config,
    inc,
    reducer::Branch,
    rorp::{self, FileType, Index, RPath, Rorp},
    rsync,
    stamp::SessionTime,
    util, Error, Result,
};

/// Shared context for every branch of one pipeline run.
pub struct PatchCtx {
    pub dest_root: RPath,
    pub ccpp: Ccpp,
    pub config: Config,
    /// Present when increments are wanted: the increments area root
    /// and the previous session's time.
    pub inc: Option<(RPath, SessionTime)>,
    /// Long-filename overflow allocator and its area root.
    pub longnames: std::cell::RefCell<crate::longname::LongNames>,
    pub long_root: RPath,
}

enum DirPlan {
    /// Directory stays a directory; set these attributes at the end.
    Update(Rorp),
    /// Directory becomes this non-dir entry; content already staged.
    Replace(Option<util::TempGuard>),
    /// Directory is deleted outright.
    Delete,
}

pub struct PatchBranch {
    ctx: Rc<PatchCtx>,
    base_rp: Option<RPath>,
    plan: Option<DirPlan>,
}

impl PatchBranch {
    pub fn new(ctx: Rc<PatchCtx>) -> PatchBranch {
        PatchBranch { ctx, base_rp: None, plan: None }
    }

    // quoted on-disk length of the entry's base name.
    fn quoted_len(&self, index: &Index) -> usize {
        let basename = index.basename().unwrap_or_default();
        match self.ctx.dest_root.quoter() {
            Some(quoter) => quoter.quote(basename).len(),
            None => basename.len(),
        }
    }

    // Mirror location for a non-directory entry. A name that does not
    // fit the destination is redirected into the long-filename area
    // and the substitution recorded for the metadata.
    fn mirror_rp_for(&self, index: &Index) -> Result<RPath> {
        if let Some(mirror) = self.ctx.ccpp.get_mirror(index) {
            if let Some(name) = mirror.mirrorname {
                self.ctx.ccpp.set_mirrorname(index, name.clone());
                if let Some(incname) = mirror.incname {
                    self.ctx.ccpp.set_incname(index, incname);
                }
                return self.ctx.long_root.new_index(Index::new(vec![name]));
            }
        }
        if let Some(source) = self.ctx.ccpp.get_source(index) {
            if let Some(name) = source.mirrorname {
                return self.ctx.long_root.new_index(Index::new(vec![name]));
            }
        }
        let mut longnames = self.ctx.longnames.borrow_mut();
        if longnames.is_too_long(self.quoted_len(index)) {
            let name = longnames.next_free()?;
            self.ctx.ccpp.set_mirrorname(index, name.clone());
            self.ctx.ccpp.set_incname(index, name.clone());
            return self.ctx.long_root.new_index(Index::new(vec![name]));
        }
        self.ctx.dest_root.new_index(index.clone())
    }

    // Increment base for an entry; follows the mirror redirect, and
    // redirects on its own when the suffixed name would not fit.
    fn inc_base_for(&self, index: &Index, inc_root: &RPath) -> Result<RPath> {
        for rorp in [self.ctx.ccpp.get_source(index), self.ctx.ccpp.get_mirror(index)]
            .iter()
            .flatten()
        {
            if let Some(name) = &rorp.incname {
                self.ctx.ccpp.set_incname(index, name.clone());
                return self.ctx.long_root.new_index(Index::new(vec![name.clone()]));
            }
        }
        let mut longnames = self.ctx.longnames.borrow_mut();
        if longnames.is_too_long_for_inc(self.quoted_len(index)) {
            let name = longnames.next_free()?;
            self.ctx.ccpp.set_incname(index, name.clone());
            return self.ctx.long_root.new_index(Index::new(vec![name]));
        }
        inc_root.new_index(index.clone())
    }

    // Write the increment preserving the current state of `mirror_rp`
    // before it is replaced by `new`. Returns false if the increment
    // could not be written, which aborts the entry.
    fn write_increment(
        &self,
        index: &Index,
        new: &Rorp,
        new_bytes: Option<&[u8]>,
        mirror_rp: &RPath,
    ) -> Result<bool> {
        let (inc_root, prev_time) = match &self.ctx.inc {
            Some((inc_root, prev_time)) => (inc_root, *prev_time),
            None => return Ok(true),
        };
        if new.attrs.is_missing() && !mirror_rp.exists() {
            return Ok(true); // gone on both sides, nothing to keep
        }
        let inc_base = match self.inc_base_for(index, inc_root) {
            Ok(inc_base) => inc_base,
            Err(err) => {
                self.ctx.ccpp.error(index, &format!("increment base: {}", err));
                return Ok(false);
            }
        };
        match inc::increment(
            &new.attrs,
            new_bytes,
            mirror_rp,
            &inc_base,
            prev_time,
            &self.ctx.config,
        ) {
            Ok(inc_rp) => {
                self.ctx.ccpp.set_inc_size(index, inc_rp.attrs.size);
                Ok(true)
            }
            Err(err) => {
                self.ctx.ccpp.error(index, &format!("writing increment: {}", err));
                Ok(false)
            }
        }
    }

    // Stage the new content of a non-directory entry into `tf`.
    // Returns the bytes written for regular files. Errors here are
    // routine and reported by the caller.
    fn write_to_temp(
        &self,
        diff: &Rorp,
        mirror_rp: &RPath,
        tf: &util::TempGuard,
    ) -> Result<Option<Vec<u8>>> {
        use crate::rorp::AttachKind;

        match diff.attrs.ftype {
            FileType::Reg => {
                let bytes = match (diff.attached.as_ref(), diff.linked_to.as_ref()) {
                    (Some(att), _) if att.kind == AttachKind::Snapshot => {
                        att.data.clone()
                    }
                    (Some(att), _) if att.kind == AttachKind::Diff => {
                        let basis = mirror_rp.read_bytes()?;
                        rsync::patch(&basis, &att.data)?
                    }
                    (_, Some(first)) => {
                        // content lives at an earlier member of the
                        // hardlink group, already written this session.
                        self.mirror_rp_for(first)?.read_bytes()?
                    }
                    _ => err_at!(InvalidInput, msg: "no data for {}", diff.index)?,
                };
                if bytes.len() as u64 != diff.attrs.size {
                    err_at!(
                        InvalidInput,
                        msg: "updated file does not match source: {} vs {} bytes",
                        bytes.len(),
                        diff.attrs.size
                    )?
                }
                tf.write_all(&bytes)?;
                rorp::apply_attrs_at(tf.as_path(), &diff.attrs)?;
                Ok(Some(bytes))
            }
            FileType::Sym => {
                let target = diff.attrs.linkname.clone().unwrap_or_default();
                rorp::symlink_at(tf.as_path(), &target)?;
                rorp::apply_attrs_at(tf.as_path(), &diff.attrs)?;
                Ok(None)
            }
            FileType::Fifo | FileType::Sock | FileType::Dev => {
                if let Err(err) = rorp::mknod_at(tf.as_path(), &diff.attrs) {
                    // devices need privilege; leave a placeholder so
                    // the tree shape survives.
                    tracing::warn!("cannot create special file {}: {}", diff.index, err);
                    tf.write_all(b"")?;
                }
                rorp::apply_attrs_at(tf.as_path(), &diff.attrs)?;
                Ok(None)
            }
            _ => err_at!(InvalidInput, msg: "cannot stage {:?}", diff.attrs.ftype),
        }
    }

    // Patch one non-directory entry, increments first, rename last.
    fn patch_entry(&self, index: &Index, diff: Rorp, mirror_rp: &mut RPath) -> Result<()> {
        let target = mirror_rp.path();
        let tf = match util::TempGuard::new_in_dir(&target) {
            Ok(tf) => tf,
            Err(err) => {
                self.ctx.ccpp.error(index, &format!("temp file: {}", err));
                return Ok(());
            }
        };

        let new_bytes = match self.write_to_temp(&diff, mirror_rp, &tf) {
            Ok(new_bytes) => new_bytes,
            Err(err) => {
                self.ctx.ccpp.error(index, &format!("{}", err));
                return Ok(());
            }
        };

        if !self.write_increment(index, &diff, new_bytes.as_deref(), mirror_rp)? {
            return Ok(());
        }

        if mirror_rp.is_dir() {
            // non-dir over dir outside start_process cannot happen;
            // the reducer routes that through a branch.
            err_at!(Fatal, msg: "unexpected directory at {}", index)?
        }
        if let Err(err) = tf.commit(&target) {
            self.ctx.ccpp.error(index, &format!("rename: {}", err));
            return Ok(());
        }
        mirror_rp.setdata()?;

        let success = if diff.attrs.is_special() { SUCCESS_SPECIAL } else { SUCCESS_OK };
        self.ctx.ccpp.set_success(index, success);
        Ok(())
    }

    // Delete one entry from the mirror, preserving it first.
    fn delete_entry(&self, index: &Index, diff: &Rorp, mirror_rp: &mut RPath) -> Result<()> {
        if mirror_rp.exists() {
            if !self.write_increment(index, diff, None, mirror_rp)? {
                return Ok(());
            }
            let res = if mirror_rp.is_dir() {
                mirror_rp.delete_recursive()
            } else {
                mirror_rp.delete()
            };
            if let Err(err) = res {
                self.ctx.ccpp.error(index, &format!("delete: {}", err));
                return Ok(());
            }
        }
        self.ctx.ccpp.set_success(index, SUCCESS_SPECIAL);
        Ok(())
    }

    fn prepare_dir(&mut self, index: &Index, diff: Rorp) -> Result<()> {
        let rp = self.base_rp.as_mut().unwrap();
        if !rp.is_dir() {
            if rp.exists() {
                rp.delete()?;
            }
            rp.mkdir()?;
            self.ctx.ccpp.set_success(index, SUCCESS_OK);
        } else {
            self.ctx.ccpp.set_success(index, SUCCESS_OK);
        }
        // a too-restrictive dir must stay enterable while its
        // contents are written; real perms return at end_process.
        if diff.attrs.perms & 0o700 < 0o700 {
            rp.chmod(diff.attrs.perms | 0o700)?;
        }
        self.plan = Some(DirPlan::Update(diff));
        Ok(())
    }
}

impl Branch for PatchBranch {
    type Item = Rorp;

    fn can_fast_process(&mut self, index: &Index, diff: &Rorp) -> bool {
        if diff.is_dir() {
            return false;
        }
        let is_dir_on_mirror = self
            .ctx
            .dest_root
            .new_index(index.clone())
            .map(|rp| rp.is_dir())
            .unwrap_or(false);
        !is_dir_on_mirror
    }

    fn fast_process(&mut self, index: &Index, diff: Rorp) -> Result<()> {
        if let Some(report) = &diff.report {
            self.ctx.ccpp.error(index, &report.message.clone());
            return Ok(());
        }
        let mut mirror_rp = self.mirror_rp_for(index)?;
        if diff.is_missing() {
            self.delete_entry(index, &diff, &mut mirror_rp)
        } else {
            self.patch_entry(index, diff, &mut mirror_rp)
        }
    }

    fn start_process(&mut self, index: &Index, diff: Rorp) -> Result<()> {
        self.base_rp = Some(self.ctx.dest_root.new_index(index.clone())?);

        if diff.is_dir() {
            let base_rp = self.base_rp.as_ref().unwrap().clone();
            if !self.write_increment(index, &diff, None, &base_rp)? {
                self.plan = Some(DirPlan::Update(Rorp::missing(index.clone())));
                return Ok(());
            }
            return self.prepare_dir(index, diff);
        }

        // the mirror has a directory where the source now has a
        // non-dir (or nothing); stage the replacement and do the swap
        // after the directory's contents have been deleted.
        if diff.is_missing() {
            if !self.write_increment(index, &diff, None, self.base_rp.as_ref().unwrap())? {
                self.plan = Some(DirPlan::Update(diff));
                return Ok(());
            }
            self.ctx.ccpp.set_success(index, SUCCESS_SPECIAL);
            self.plan = Some(DirPlan::Delete);
            return Ok(());
        }

        let base_rp = self.base_rp.as_ref().unwrap().clone();
        let tf = util::TempGuard::new_in_dir(&base_rp.path())?;
        match self.write_to_temp(&diff, &base_rp, &tf) {
            Ok(new_bytes) => {
                if !self.write_increment(index, &diff, new_bytes.as_deref(), &base_rp)? {
                    self.plan = Some(DirPlan::Update(Rorp::missing(index.clone())));
                    return Ok(());
                }
                self.ctx.ccpp.set_success(
                    index,
                    if diff.attrs.is_special() { SUCCESS_SPECIAL } else { SUCCESS_OK },
                );
                self.plan = Some(DirPlan::Replace(Some(tf)));
            }
            Err(err) => {
                self.ctx.ccpp.error(index, &format!("{}", err));
                self.plan = Some(DirPlan::Update(Rorp::missing(index.clone())));
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
            Some(DirPlan::Update(diff)) => {
                if diff.is_missing() {
                    return Ok(()); // failed entry, leave as is
                }
                base_rp.setdata()?;
                if base_rp.is_dir() {
                    base_rp.copy_attrs_from(&diff.attrs)?;
                    if diff.attrs.perms & 0o700 < 0o700 {
                        base_rp.chmod(diff.attrs.perms | 0o700)?;
                        self.ctx
                            .ccpp
                            .remember_dir_perms(base_rp.clone(), diff.attrs.perms);
                    }
                }
            }
            Some(DirPlan::Replace(tf)) => {
                base_rp.setdata()?;
                if base_rp.is_dir() {
                    base_rp.delete_recursive()?;
                }
                if let Some(tf) = tf {
                    tf.commit(&base_rp.path())?;
                }
            }
            Some(DirPlan::Delete) => {
                base_rp.setdata()?;
                if base_rp.exists() {
                    base_rp.delete_recursive()?;
                }
            }
            None => (),
        }
        Ok(())
    }

    fn branch_process(&mut self, _child: Self) -> Result<()> {
        Ok(())
    }
}
