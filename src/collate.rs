//! Module implement collation of index-sorted iterators.
//!
//! [Collate2] merges two sorted iterations of a tree into pairs, the
//! basic move behind change detection (source against mirror), metadata
//! diffing (snapshot against diff) and regress (files against metadata).
//! [FillInIter] synthesizes absent ancestor entries so a tree reducer
//! always sees a parent before its children. [CacheIndexable] keeps the
//! last few entries of an iteration addressable by index.

use std::collections::{HashMap, VecDeque};

use crate::{
    rorp::{Index, Rorp},
    Result,
};

/// Merge two index-sorted fallible iterators into pairs. When the
/// heads carry the same index both sides of the pair are present; when
/// they diverge, only the smaller side is. Errors pass through in
/// place of their entry.
pub struct Collate2<A, B>
where
    A: Iterator<Item = Result<Rorp>>,
    B: Iterator<Item = Result<Rorp>>,
{
    a: A,
    b: B,
    a_entry: Option<Result<Rorp>>,
    b_entry: Option<Result<Rorp>>,
}

impl<A, B> Collate2<A, B>
where
    A: Iterator<Item = Result<Rorp>>,
    B: Iterator<Item = Result<Rorp>>,
{
    pub fn new(mut a: A, mut b: B) -> Collate2<A, B> {
        let a_entry = a.next();
        let b_entry = b.next();
        Collate2 { a, b, a_entry, b_entry }
    }
}

impl<A, B> Iterator for Collate2<A, B>
where
    A: Iterator<Item = Result<Rorp>>,
    B: Iterator<Item = Result<Rorp>>,
{
    type Item = Result<(Option<Rorp>, Option<Rorp>)>;

    fn next(&mut self) -> Option<Self::Item> {
        use std::cmp::Ordering;

        match (self.a_entry.take(), self.b_entry.take()) {
            (Some(Ok(x)), Some(Ok(y))) => match x.index.cmp(&y.index) {
                Ordering::Less => {
                    self.a_entry = self.a.next();
                    self.b_entry = Some(Ok(y));
                    Some(Ok((Some(x), None)))
                }
                Ordering::Greater => {
                    self.b_entry = self.b.next();
                    self.a_entry = Some(Ok(x));
                    Some(Ok((None, Some(y))))
                }
                Ordering::Equal => {
                    self.a_entry = self.a.next();
                    self.b_entry = self.b.next();
                    Some(Ok((Some(x), Some(y))))
                }
            },
            (Some(Ok(x)), None) => {
                self.a_entry = self.a.next();
                Some(Ok((Some(x), None)))
            }
            (None, Some(Ok(y))) => {
                self.b_entry = self.b.next();
                Some(Ok((None, Some(y))))
            }
            (Some(Err(err)), other) => {
                self.b_entry = other;
                Some(Err(err))
            }
            (other, Some(Err(err))) => {
                self.a_entry = other;
                Some(Err(err))
            }
            (None, None) => None,
        }
    }
}

/// Insert synthetic entries for ancestors the underlying iterator
/// skipped, so that every entry is preceded by its parents. The filler
/// callback materializes the entry for an absent ancestor index.
pub struct FillInIter<I, F>
where
    I: Iterator<Item = Result<Rorp>>,
    F: FnMut(&Index) -> Result<Rorp>,
{
    iter: I,
    filler: F,
    old_index: Option<Index>,
    queue: VecDeque<Rorp>,
}

impl<I, F> FillInIter<I, F>
where
    I: Iterator<Item = Result<Rorp>>,
    F: FnMut(&Index) -> Result<Rorp>,
{
    pub fn new(iter: I, filler: F) -> FillInIter<I, F> {
        FillInIter { iter, filler, old_index: None, queue: VecDeque::new() }
    }

    fn fill_for(&mut self, entry: Rorp) -> Result<()> {
        let cur = entry.index.clone();
        match &self.old_index {
            None => {
                for i in 0..cur.depth() {
                    let anc = cur.truncate(i);
                    let filler = (self.filler)(&anc)?;
                    self.queue.push_back(filler);
                }
            }
            Some(old) => {
                for i in 1..cur.depth() {
                    let anc = cur.truncate(i);
                    if !anc.is_prefix_of(old) {
                        let filler = (self.filler)(&anc)?;
                        self.queue.push_back(filler);
                    }
                }
            }
        }
        self.old_index = Some(cur);
        self.queue.push_back(entry);
        Ok(())
    }
}

impl<I, F> Iterator for FillInIter<I, F>
where
    I: Iterator<Item = Result<Rorp>>,
    F: FnMut(&Index) -> Result<Rorp>,
{
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.queue.pop_front() {
            return Some(Ok(entry));
        }
        match self.iter.next()? {
            Ok(entry) => match self.fill_for(entry) {
                Ok(()) => self.queue.pop_front().map(Ok),
                Err(err) => Some(Err(err)),
            },
            Err(err) => Some(Err(err)),
        }
    }
}

/// Pass-through iterator that remembers the last `cache_size` entries,
/// retrievable by index while they are still warm.
pub struct CacheIndexable<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    iter: I,
    cache_size: usize,
    cache: HashMap<Index, Rorp>,
    order: VecDeque<Index>,
}

impl<I> CacheIndexable<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    pub fn new(iter: I, cache_size: usize) -> CacheIndexable<I> {
        CacheIndexable {
            iter,
            cache_size,
            cache: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Entry for `index`, provided it has not been evicted yet.
    pub fn get(&self, index: &Index) -> Option<&Rorp> {
        self.cache.get(index)
    }
}

impl<I> Iterator for CacheIndexable<I>
where
    I: Iterator<Item = Result<Rorp>>,
{
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.iter.next()? {
            Ok(entry) => entry,
            Err(err) => return Some(Err(err)),
        };
        self.cache.insert(entry.index.clone(), entry.clone());
        self.order.push_back(entry.index.clone());
        while self.order.len() > self.cache_size {
            if let Some(old) = self.order.pop_front() {
                self.cache.remove(&old);
            }
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
#[path = "collate_test.rs"]
mod collate_test;
