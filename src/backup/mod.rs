//! Module implement the backup pipeline.
//!
//! One session flows through five stages, each an iterator pulling
//! from the previous one:
//!
//! ```text
//! source scan ─┐
//!              ├─ collate ── CCPP ── signatures ── diffs ── reducer
//! mirror iter ─┘                                            (patch +
//!                                                            increment)
//! ```
//!
//! The mirror side is iterated from the previous session's metadata
//! when available, else by scanning the mirror directly. Unchanged
//! entries are dropped at the signature stage; everything downstream
//! only sees work. The reducer drives [patch::PatchBranch], which
//! patches the mirror in place and, for every mutation, first writes
//! the reverse increment stamped with the previous session time.

pub mod ccpp;
pub mod patch;

use std::rc::Rc;

use crate::{
    collate::{Collate2, FillInIter},
    config::{Config, Selection},
    elog::ErrorLog,
    meta::MetaWriter,
    reducer::TreeReducer,
    rorp::{AttachKind, Attrs, FileType, Index, RPath, Rorp},
    rsync,
    stamp::SessionTime,
    stats::SessionStats,
    util, Error, Result,
};

pub use ccpp::Ccpp;
pub use patch::{PatchBranch, PatchCtx};

/// Inputs of one pipeline run. The caller (the session coordinator)
/// owns marker ordering; this only moves bytes.
pub struct Pipeline {
    pub source_root: RPath,
    pub dest_root: RPath,
    pub selection: Selection,
    pub config: Config,
    /// The repository data directory, for the long-filename area.
    pub data_dir: std::path::PathBuf,
    /// Increment area and previous session time; None on the first
    /// backup (mirror only).
    pub inc: Option<(RPath, SessionTime)>,
}

impl Pipeline {
    /// Run the pipeline to completion. `dest_iter` is the sorted
    /// iteration of the current mirror state; `meta_writer` receives
    /// this session's snapshot.
    pub fn run(
        self,
        dest_iter: Box<dyn Iterator<Item = Result<Rorp>>>,
        meta_writer: MetaWriter,
        elog: ErrorLog,
        stats: SessionStats,
    ) -> Result<SessionStats> {
        let source_iter =
            crate::scan::TreeScan::new(self.source_root.clone(), self.selection.clone());

        let collated = Collate2::new(source_iter, dest_iter);
        let ccpp = Ccpp::new(
            self.config.pipeline_max_length * 4,
            self.dest_root.clone(),
            meta_writer,
            elog,
            stats,
            self.config.preserve_hardlinks,
        );

        let pairs = ccpp.wrap(collated);
        let sigs = SigIter {
            iter: pairs,
            ccpp: ccpp.clone(),
            dest_root: self.dest_root.clone(),
        };
        let diffs = DiffIter {
            iter: sigs,
            ccpp: ccpp.clone(),
            source_root: self.source_root.clone(),
        };

        let filler_ccpp = ccpp.clone();
        let filler_dest = self.dest_root.clone();
        let filled = FillInIter::new(diffs, move |index| {
            make_filler(&filler_ccpp, &filler_dest, index)
        });

        let long_root = RPath::new(
            &self.data_dir.join(crate::longname::LONG_NAME_DIR),
            Index::root(),
            None,
        )?;
        let longnames = crate::longname::LongNames::new(
            &self.data_dir,
            self.config.max_component_len,
        );
        let ctx = Rc::new(PatchCtx {
            dest_root: self.dest_root.clone(),
            ccpp: ccpp.clone(),
            config: self.config.clone(),
            inc: self.inc.clone(),
            longnames: std::cell::RefCell::new(longnames),
            long_root,
        });
        let mut reducer = {
            let ctx = Rc::clone(&ctx);
            TreeReducer::new(move || PatchBranch::new(Rc::clone(&ctx)))
        };

        for item in filled {
            let rorp = item?;
            reducer.feed(rorp.index.clone(), rorp)?;
        }
        reducer.finish()?;

        ccpp.flush()
    }
}

// Ancestors missing from the diff stream are unchanged directories;
// rebuild them from the cached source entry, or from the mirror.
fn make_filler(ccpp: &Ccpp, dest_root: &RPath, index: &Index) -> Result<Rorp> {
    if let Some(source) = ccpp.get_source(index) {
        return Ok(source);
    }
    if let Some(parent) = ccpp.get_parent(index) {
        return Ok(parent);
    }
    let rp = dest_root.new_index(index.clone())?;
    if rp.exists() {
        Ok(Rorp::new(index.clone(), rp.attrs().clone()))
    } else {
        let mut attrs = Attrs::new(FileType::Dir);
        attrs.perms = 0o755;
        Ok(Rorp::new(index.clone(), attrs))
    }
}

// Stage two: decide which entries changed, and hand the source side a
// signature of the mirror file where a delta is worth computing.
struct SigIter<I>
where
    I: Iterator<Item = Result<(Option<Rorp>, Option<Rorp>)>>,
{
    iter: I,
    ccpp: Ccpp,
    dest_root: RPath,
}

impl<I> SigIter<I>
where
    I: Iterator<Item = Result<(Option<Rorp>, Option<Rorp>)>>,
{
    fn one_sig(&self, source: &Option<Rorp>, mirror: &Option<Rorp>) -> Result<Rorp> {
        let index = match (source, mirror) {
            (Some(s), _) => s.index.clone(),
            (_, Some(m)) => m.index.clone(),
            _ => err_at!(Fatal, msg: "empty collated pair")?,
        };

        let mut sig_rorp = match mirror {
            Some(mirror) => Rorp::new(index.clone(), mirror.attrs.clone()),
            None => Rorp::missing(index.clone()),
        };

        let src_is_reg = source.as_ref().map(|s| s.is_reg()).unwrap_or(false);
        let src_is_linked =
            source.as_ref().map(|s| s.linked_to.is_some()).unwrap_or(false);
        if sig_rorp.is_reg() && src_is_reg && !src_is_linked {
            let rp = self.dest_root.new_index(index.clone())?;
            match rp.read_bytes() {
                Ok(basis) => {
                    sig_rorp.attach(AttachKind::Signature, rsync::signature(&basis))
                }
                Err(err) => {
                    // unreadable mirror file; the source will send a
                    // full snapshot instead.
                    tracing::warn!("cannot read mirror {}: {}", index, err);
                }
            }
        }
        Ok(sig_rorp)
    }
}

impl<I> Iterator for SigIter<I>
where
    I: Iterator<Item = Result<(Option<Rorp>, Option<Rorp>)>>,
{
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (source, mirror) = match self.iter.next()? {
                Ok(pair) => pair,
                Err(err) => return Some(Err(err)),
            };
            if let (Some(source), Some(mirror)) = (&source, &mirror) {
                if source.attrs.metadata_equal(&mirror.attrs) {
                    continue; // unchanged, nothing flows downstream
                }
            }
            let index = match (&source, &mirror) {
                (Some(s), _) => s.index.clone(),
                (_, Some(m)) => m.index.clone(),
                _ => continue,
            };
            self.ccpp.set_changed(&index);
            return Some(self.one_sig(&source, &mirror));
        }
    }
}

// Stage three, nominally on the source endpoint: answer each signature
// with a delta, a full snapshot, or bare attributes.
struct DiffIter<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    iter: I,
    ccpp: Ccpp,
    source_root: RPath,
}

impl<I> DiffIter<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    fn one_diff(&self, sig_rorp: Rorp) -> Result<Rorp> {
        let index = sig_rorp.index.clone();
        let mut diff_rorp = match self.ccpp.get_source(&index) {
            Some(source) => source,
            // gone from the source: a deletion marker.
            None => return Ok(Rorp::missing(index)),
        };

        if diff_rorp.report.is_some() {
            return Ok(diff_rorp);
        }

        if diff_rorp.linked_to.is_some() {
            // content already transferred with the first link member.
            diff_rorp.attrs.sha1 = self.ccpp.hardlink_sha1(&diff_rorp);
            return Ok(diff_rorp);
        }

        if !diff_rorp.is_reg() {
            return Ok(diff_rorp);
        }

        // read the source file; a routine failure turns into a report
        // so the mirror keeps the old state.
        let rp = match self.source_root.new_index(index.clone()) {
            Ok(rp) => rp,
            Err(err) => {
                diff_rorp.set_report(format!("{}", err));
                return Ok(diff_rorp);
            }
        };
        if !rp.is_reg() {
            diff_rorp.set_report(format!("{} changed type mid-session", index));
            return Ok(diff_rorp);
        }
        let data = match rp.read_bytes() {
            Ok(data) => data,
            Err(err) => {
                diff_rorp.set_report(format!("{}", err));
                return Ok(diff_rorp);
            }
        };
        if data.len() as u64 != diff_rorp.attrs.size {
            // drifted under us; fail the entry rather than record a
            // state that never existed.
            diff_rorp.set_report(format!("{} changed while reading", index));
            return Ok(diff_rorp);
        }
        let sha1 = util::sha1_hex(&data);
        diff_rorp.attrs.sha1 = Some(sha1.clone());
        self.ccpp.update_hash(&index, sha1);

        match sig_rorp.attached {
            Some(att) if att.kind == AttachKind::Signature => {
                let delta = rsync::delta(&att.data, &data)?;
                diff_rorp.attach(AttachKind::Diff, delta);
            }
            _ => diff_rorp.attach(AttachKind::Snapshot, data),
        }
        Ok(diff_rorp)
    }
}

impl<I> Iterator for DiffIter<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next()? {
            Ok(sig_rorp) => Some(self.one_diff(sig_rorp)),
            Err(err) => Some(Err(err)),
        }
    }
}
