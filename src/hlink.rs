//! Module implement session-local hardlink bookkeeping.
//!
//! Linked files are backed up like any other file, but their inode and
//! device location go into the metadata so a restore can re-link them.
//! During a session the first member of a link group seen carries the
//! content; later members are flagged as linked to the first index and
//! need no transfer. Entries are purged as their remaining link count
//! reaches zero.

use std::collections::HashMap;

use crate::rorp::{Index, Rorp};

#[derive(Clone, Debug)]
struct LinkGroup {
    first_index: Index,
    remaining_links: u32,
    sha1: Option<String>,
}

/// Map of in-flight hardlink groups keyed by `(devloc, inode)`.
#[derive(Default)]
pub struct HardlinkMap {
    groups: HashMap<(u64, u64), LinkGroup>,
}

impl HardlinkMap {
    pub fn new() -> HardlinkMap {
        HardlinkMap { groups: HashMap::new() }
    }

    fn key_of(rorp: &Rorp) -> Option<(u64, u64)> {
        let nlink = rorp.attrs.nlink?;
        if !rorp.is_reg() || nlink < 2 {
            return None;
        }
        Some((rorp.attrs.devloc?, rorp.attrs.inode?))
    }

    /// Record `rorp`; returns the first index of its group when the
    /// content is already accounted for.
    pub fn add(&mut self, rorp: &Rorp) -> Option<Index> {
        let key = HardlinkMap::key_of(rorp)?;
        match self.groups.get_mut(&key) {
            Some(group) => {
                let first = group.first_index.clone();
                group.remaining_links = group.remaining_links.saturating_sub(1);
                if group.remaining_links == 0 {
                    self.groups.remove(&key);
                }
                Some(first)
            }
            None => {
                let nlink = rorp.attrs.nlink.unwrap_or(1);
                self.groups.insert(
                    key,
                    LinkGroup {
                        first_index: rorp.index.clone(),
                        remaining_links: nlink - 1,
                        sha1: rorp.attrs.sha1.clone(),
                    },
                );
                None
            }
        }
    }

    /// Hash of the group's content, once known.
    pub fn get_sha1(&self, rorp: &Rorp) -> Option<String> {
        let key = HardlinkMap::key_of(rorp)?;
        self.groups.get(&key)?.sha1.clone()
    }

    /// Remember the hash computed while the first member was written.
    pub fn set_sha1(&mut self, rorp: &Rorp, sha1: String) {
        if let Some(key) = HardlinkMap::key_of(rorp) {
            if let Some(group) = self.groups.get_mut(&key) {
                group.sha1 = Some(sha1);
            }
        }
    }
}

#[cfg(test)]
#[path = "hlink_test.rs"]
mod hlink_test;
