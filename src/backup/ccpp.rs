//! The cache-collated post-processor.
//!
//! Sits between collation and the rest of the pipeline and solves an
//! ordering problem: metadata for an entry may only be written once
//! the entry's patch outcome is known, which happens several pipeline
//! stages later. Every pair passing through is parked in an
//! insertion-ordered cache; by the time an entry is evicted its fate
//! is settled and the right metadata record can be written.
//!
//! Also handled here, because they need the same lifetime:
//! hardlink bookkeeping, relaxing unreadable mirror directories (and
//! restoring them once the iteration has left the subtree), per-file
//! statistics and the routine error log.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use crate::{
    collate::Collate2,
    elog::ErrorLog,
    hlink::HardlinkMap,
    meta::MetaWriter,
    rorp::{Index, RPath, Rorp},
    stats::SessionStats,
    Result,
};

/// Patch not attempted or failed; keep the old state in the metadata.
pub const SUCCESS_NONE: u8 = 0;
/// Mirror entry updated normally.
pub const SUCCESS_OK: u8 = 1;
/// Special file written or entry deleted; nothing left to compare.
pub const SUCCESS_SPECIAL: u8 = 2;

struct Entry {
    source: Option<Rorp>,
    mirror: Option<Rorp>,
    changed: bool,
    success: u8,
    inc_size: Option<u64>,
}

struct State {
    cache: HashMap<Index, Entry>,
    order: VecDeque<Index>,
    cache_size: usize,
    meta_writer: Option<MetaWriter>,
    stats: SessionStats,
    elog: ErrorLog,
    hardlinks: HardlinkMap,
    // unreadable mirror dirs we chmod'ed, restored when the iteration
    // leaves them.
    dir_perms: Vec<(RPath, u32)>,
    // finished directory entries whose descendants are still in
    // flight.
    parent_stack: Vec<(Index, Option<Rorp>)>,
    dest_root: RPath,
    preserve_hardlinks: bool,
    process_uid: u32,
}

/// Shared handle on the post-processing state. Clones are cheap; the
/// pipeline stages and the patch branches all hold one.
#[derive(Clone)]
pub struct Ccpp {
    state: Rc<RefCell<State>>,
}

impl Ccpp {
    pub fn new(
        cache_size: usize,
        dest_root: RPath,
        meta_writer: MetaWriter,
        elog: ErrorLog,
        stats: SessionStats,
        preserve_hardlinks: bool,
    ) -> Ccpp {
        let process_uid = unsafe { libc::geteuid() };
        let state = State {
            cache: HashMap::new(),
            order: VecDeque::new(),
            cache_size,
            meta_writer: Some(meta_writer),
            stats,
            elog,
            hardlinks: HardlinkMap::new(),
            dir_perms: vec![],
            parent_stack: vec![],
            dest_root,
            preserve_hardlinks,
            process_uid,
        };
        Ccpp { state: Rc::new(RefCell::new(state)) }
    }

    /// Wrap the collated pair iterator; pairs flow through unchanged
    /// while being registered in the cache.
    pub fn wrap<A, B>(&self, iter: Collate2<A, B>) -> CcppIter<A, B>
    where
        A: Iterator<Item = Result<Rorp>>,
        B: Iterator<Item = Result<Rorp>>,
    {
        CcppIter { ccpp: self.clone(), iter }
    }

    // Register a pair, running the synchronous pre-processing; the
    // returned pair carries any hardlink flag added on the way in.
    fn admit(
        &self,
        mut source: Option<Rorp>,
        mirror: Option<Rorp>,
    ) -> Result<(Option<Rorp>, Option<Rorp>)> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.preserve_hardlinks {
            if let Some(source) = source.as_mut() {
                if let Some(first) = state.hardlinks.add(source) {
                    source.linked_to = Some(first);
                }
            }
        }
        state.pre_process(&mirror)?;
        let index = match (&source, &mirror) {
            (Some(s), _) => s.index.clone(),
            (_, Some(m)) => m.index.clone(),
            _ => return Ok((source, mirror)),
        };
        state.cache.insert(
            index.clone(),
            Entry {
                source: source.clone(),
                mirror: mirror.clone(),
                changed: false,
                success: SUCCESS_NONE,
                inc_size: None,
            },
        );
        state.order.push_back(index);
        while state.order.len() > state.cache_size {
            state.evict_front()?;
        }
        Ok((source, mirror))
    }

    pub fn set_changed(&self, index: &Index) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.cache.get_mut(index) {
            entry.changed = true;
        }
    }

    pub fn set_success(&self, index: &Index, success: u8) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.cache.get_mut(index) {
            entry.success = success;
        }
    }

    pub fn set_inc_size(&self, index: &Index, size: u64) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.cache.get_mut(index) {
            entry.inc_size = Some(size);
        }
    }

    /// Record a long-name redirect for the mirror copy; lands in the
    /// metadata as `AlternateMirrorName`.
    pub fn set_mirrorname(&self, index: &Index, name: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.cache.get_mut(index) {
            if let Some(source) = entry.source.as_mut() {
                source.mirrorname = Some(name);
            }
        }
    }

    /// Record a long-name redirect for the increments; lands in the
    /// metadata as `AlternateIncrementName`.
    pub fn set_incname(&self, index: &Index, name: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.cache.get_mut(index) {
            if let Some(source) = entry.source.as_mut() {
                source.incname = Some(name);
            }
        }
    }

    /// Remember the content hash computed while the entry's bytes
    /// passed through, for the metadata record and the link group.
    pub fn update_hash(&self, index: &Index, sha1: String) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if let Some(entry) = state.cache.get_mut(index) {
            if let Some(source) = entry.source.as_mut() {
                source.attrs.sha1 = Some(sha1.clone());
                state.hardlinks.set_sha1(source, sha1);
            }
        }
    }

    pub fn get_source(&self, index: &Index) -> Option<Rorp> {
        self.state.borrow().cache.get(index).and_then(|e| e.source.clone())
    }

    pub fn get_mirror(&self, index: &Index) -> Option<Rorp> {
        self.state.borrow().cache.get(index).and_then(|e| e.mirror.clone())
    }

    /// Directory entries above the current position, outermost first.
    pub fn get_parent(&self, index: &Index) -> Option<Rorp> {
        let state = self.state.borrow();
        for (pindex, rorp) in state.parent_stack.iter().rev() {
            if pindex == index {
                return rorp.clone();
            }
        }
        None
    }

    /// Remember a directory whose on-disk permissions are relaxed
    /// right now; they are put back once the iteration has left the
    /// subtree, or at flush.
    pub fn remember_dir_perms(&self, rp: RPath, perms: u32) {
        self.state.borrow_mut().dir_perms.push((rp, perms));
    }

    /// Record a routine error against `index`; the entry keeps its old
    /// metadata.
    pub fn error(&self, index: &Index, message: &str) {
        let mut state = self.state.borrow_mut();
        state.stats.add_error();
        state.elog.log("UpdateError", index, message).ok();
    }

    pub fn hardlink_sha1(&self, rorp: &Rorp) -> Option<String> {
        self.state.borrow().hardlinks.get_sha1(rorp)
    }

    /// Drain the cache in order, restore every relaxed directory and
    /// close the metadata writer. Returns the accumulated statistics.
    pub fn flush(&self) -> Result<SessionStats> {
        let mut state = self.state.borrow_mut();
        while !state.order.is_empty() {
            state.evict_front()?;
        }
        while let Some((mut rp, perms)) = state.dir_perms.pop() {
            rp.chmod(perms)?;
        }
        state.parent_stack.clear();
        if let Some(writer) = state.meta_writer.take() {
            writer.close()?;
        }
        state.elog.close()?;
        Ok(state.stats.clone())
    }
}

impl State {
    // runs synchronously as each pair is consumed, before anything
    // downstream can fail.
    fn pre_process(&mut self, mirror: &Option<Rorp>) -> Result<()> {
        if let Some(mirror) = mirror {
            let perms = mirror.attrs.perms;
            if mirror.is_dir() && self.process_uid != 0 && perms & 0o700 < 0o700 {
                let mut rp = self.dest_root.new_index(mirror.index.clone())?;
                if rp.is_dir() {
                    rp.chmod(perms | 0o700)?;
                    self.dir_perms.push((rp, perms));
                }
            }
        }
        Ok(())
    }

    fn evict_front(&mut self) -> Result<()> {
        let index = match self.order.pop_front() {
            Some(index) => index,
            None => return Ok(()),
        };
        let entry = match self.cache.remove(&index) {
            Some(entry) => entry,
            None => {
                tracing::warn!("index {} missing from cache", index);
                return Ok(());
            }
        };
        self.finalize(index, entry)
    }

    fn finalize(&mut self, index: Index, entry: Entry) -> Result<()> {
        // restore relaxed permissions for directories we have passed.
        while let Some((rp, _)) = self.dir_perms.last() {
            if rp.index().is_prefix_of(&index) {
                break;
            }
            let (mut rp, perms) = self.dir_perms.pop().unwrap();
            rp.chmod(perms)?;
        }

        self.stats.add_pair(entry.source.as_ref(), entry.mirror.as_ref(), entry.changed);
        if let Some(size) = entry.inc_size {
            self.stats.add_increment(size);
        }

        // success != 0 records the new state; a failed or skipped
        // change keeps the old record, and absent old state writes
        // nothing at all.
        let meta_rorp = if entry.success != SUCCESS_NONE {
            entry.source.as_ref().filter(|r| !r.is_missing())
        } else {
            entry.mirror.as_ref().filter(|r| !r.is_missing())
        };
        if let (Some(rorp), Some(writer)) = (meta_rorp, self.meta_writer.as_mut()) {
            writer.write(rorp)?;
        }

        let is_dir = entry.source.as_ref().map(|r| r.is_dir()).unwrap_or(false)
            || entry.mirror.as_ref().map(|r| r.is_dir()).unwrap_or(false);
        if is_dir {
            while let Some((pindex, _)) = self.parent_stack.last() {
                if pindex.is_prefix_of(&index) {
                    break;
                }
                self.parent_stack.pop();
            }
            self.parent_stack.push((index, entry.source.clone()));
        }
        Ok(())
    }
}

/// The iterator side of [Ccpp].
pub struct CcppIter<A, B>
where
    A: Iterator<Item = Result<Rorp>>,
    B: Iterator<Item = Result<Rorp>>,
{
    ccpp: Ccpp,
    iter: Collate2<A, B>,
}

impl<A, B> Iterator for CcppIter<A, B>
where
    A: Iterator<Item = Result<Rorp>>,
    B: Iterator<Item = Result<Rorp>>,
{
    type Item = Result<(Option<Rorp>, Option<Rorp>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next()? {
            Ok((source, mirror)) => match self.ccpp.admit(source, mirror) {
                Ok(pair) => Some(Ok(pair)),
                Err(err) => Some(Err(err)),
            },
            Err(err) => Some(Err(err)),
        }
    }
}
