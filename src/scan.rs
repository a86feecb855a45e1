//! Module implement the ordered source scanner.
//!
//! Yields one [Rorp] per selected entry, depth first, in strictly
//! increasing index order: a directory is emitted before its contents,
//! siblings in byte order of their names. The traversal keeps an
//! explicit stack, so tree depth is not bounded by the call stack.
//!
//! A directory that cannot be listed is still emitted, carrying a
//! report; its contents are skipped. That is a routine error, not a
//! failure of the scan.

use crate::{
    config::Selection,
    rorp::{RPath, Rorp},
    Result,
};

/// Iterator over a tree rooted at an [RPath].
pub struct TreeScan {
    root: RPath,
    selection: Selection,
    // LIFO; children are pushed in reverse name order.
    to_visit: Vec<crate::rorp::Index>,
}

impl TreeScan {
    pub fn new(root: RPath, selection: Selection) -> TreeScan {
        TreeScan {
            root,
            selection,
            to_visit: vec![crate::rorp::Index::root()],
        }
    }
}

impl Iterator for TreeScan {
    type Item = Result<Rorp>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let index = self.to_visit.pop()?;
            if !self.selection.is_selected(&index) {
                continue;
            }
            let rp = match self.root.new_index(index.clone()) {
                Ok(rp) => rp,
                Err(err) => return Some(Err(err)),
            };
            if !rp.exists() {
                // raced away between listing and stat, or absent root.
                continue;
            }

            let mut rorp = Rorp::new(index.clone(), rp.attrs().clone());
            if rp.is_dir() {
                match rp.listdir() {
                    Ok(names) => {
                        for name in names.into_iter().rev() {
                            self.to_visit.push(index.append(&name));
                        }
                    }
                    Err(err) => {
                        rorp.set_report(format!("listing {}: {}", index, err))
                    }
                }
            }
            return Some(Ok(rorp));
        }
    }
}

#[cfg(test)]
#[path = "scan_test.rs"]
mod scan_test;
