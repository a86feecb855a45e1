//! Module implement the tree reducer, the visitor that turns a sorted
//! iteration back into tree-shaped processing.
//!
//! Indices of an iteration form a tree. Feeding them one by one into
//! [TreeReducer] drives a stack of per-directory [Branch] values:
//! `start_process` fires when the iteration enters a subtree,
//! `end_process` when it leaves, and the finished branch is handed to
//! its parent through `branch_process`. Entries that need no subtree
//! of their own take the `fast_process` path. The reducer is an
//! explicit stack machine, so arbitrarily deep trees cannot overflow
//! the call stack.

use crate::{rorp::Index, Error, Result};

/// Per-directory processing hooks. One branch value is created for
/// every subtree the iteration enters.
pub trait Branch: Sized {
    type Item;

    /// True if the entry can be handled without opening a subtree.
    fn can_fast_process(&mut self, index: &Index, item: &Self::Item) -> bool;

    /// Handle an entry in place.
    fn fast_process(&mut self, index: &Index, item: Self::Item) -> Result<()>;

    /// Enter the subtree rooted at `index`.
    fn start_process(&mut self, index: &Index, item: Self::Item) -> Result<()>;

    /// Leave the subtree. All descendants have been processed.
    fn end_process(&mut self) -> Result<()>;

    /// A finished child branch, handed over in finish order.
    fn branch_process(&mut self, child: Self) -> Result<()>;
}

/// Stack machine driving [Branch] values over an index-sorted feed.
///
/// Guarantees, for a branch `B` over subtree `S`: `B.start_process`
/// precedes every event in `S`, `B.end_process` follows all of them,
/// and `B.branch_process(child)` runs once per immediate child in the
/// order the children finished. A repeated index is logged and
/// dropped; a decreasing index is fatal.
pub struct TreeReducer<B, F>
where
    B: Branch,
    F: FnMut() -> B,
{
    factory: F,
    index: Option<Index>,
    // (base_index, branch); the root branch's base is fixed by the
    // first entry fed.
    branches: Vec<(Index, B)>,
    root_fast_processed: bool,
}

impl<B, F> TreeReducer<B, F>
where
    B: Branch,
    F: FnMut() -> B,
{
    pub fn new(mut factory: F) -> TreeReducer<B, F> {
        let root = factory();
        TreeReducer {
            factory,
            index: None,
            branches: vec![(Index::root(), root)],
            root_fast_processed: false,
        }
    }

    /// Feed the next entry. Returns false if `index` fell outside the
    /// tree rooted at the first entry, in which case the entry was not
    /// processed.
    pub fn feed(&mut self, index: Index, item: B::Item) -> Result<bool> {
        let cur = match &self.index {
            None => {
                let (base, root) = &mut self.branches[0];
                *base = index.clone();
                if root.can_fast_process(&index, &item) {
                    root.fast_process(&index, item)?;
                    self.root_fast_processed = true;
                } else {
                    root.start_process(&index, item)?;
                }
                self.index = Some(index);
                return Ok(true);
            }
            Some(cur) => cur.clone(),
        };

        if index == cur {
            tracing::warn!("repeated index {}, bad filesystem?", index);
        } else if index < cur {
            err_at!(Fatal, msg: "bad index order: {} after {}", index, cur)?
        } else {
            if !self.finish_branches(&index)? {
                return Ok(false);
            }
            let (_, last) = self.branches.last_mut().unwrap();
            if last.can_fast_process(&index, &item) {
                last.fast_process(&index, item)?;
            } else {
                let mut branch = (self.factory)();
                branch.start_process(&index, item)?;
                self.branches.push((index.clone(), branch));
            }
        }

        self.index = Some(index);
        Ok(true)
    }

    // Close branches the new index has moved past. False means the
    // index is not under the root's base and the caller is done.
    fn finish_branches(&mut self, index: &Index) -> Result<bool> {
        loop {
            let base = self.branches.last().unwrap().0.clone();
            if base.is_prefix_of(index) {
                break Ok(true);
            }
            if self.branches.len() == 1 {
                break Ok(false);
            }
            let (_, mut done) = self.branches.pop().unwrap();
            done.end_process()?;
            let (_, parent) = self.branches.last_mut().unwrap();
            parent.branch_process(done)?;
        }
    }

    /// Close every open branch, innermost first.
    pub fn finish(mut self) -> Result<()> {
        if self.root_fast_processed {
            return Ok(());
        }
        while let Some((_, mut done)) = self.branches.pop() {
            if self.index.is_some() {
                done.end_process()?;
            }
            match self.branches.last_mut() {
                Some((_, parent)) => parent.branch_process(done)?,
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "reducer_test.rs"]
mod reducer_test;
