//! Module implement archive management: listing the increments held
//! by a repository and pruning sessions older than a cutoff.

use std::fs;

use crate::{
    inc::{self, IncKind, IncRp},
    rorp::{Index, RPath},
    session::Repo,
    stamp::SessionTime,
    Error, Result,
};

/// One increment file, with the index it belongs to.
#[derive(Clone, Debug)]
pub struct IncInfo {
    pub index: Index,
    pub time: SessionTime,
    pub kind: IncKind,
    pub size: u64,
}

/// Summary of one past session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub time: SessionTime,
    pub increment_files: u64,
    pub increment_size: u64,
}

// walk the whole increments tree, visiting every parsed increment
// exactly once.
fn walk_increments<F>(inc_root: &RPath, visit: &mut F) -> Result<()>
where
    F: FnMut(&Index, &IncRp) -> Result<()>,
{
    // the root's own increments live beside the increments directory.
    for inc in inc::get_inclist(&inc_root.new_index(Index::root())?)? {
        visit(&Index::root(), &inc)?;
    }

    let mut to_visit = vec![Index::root()];
    while let Some(dir_index) = to_visit.pop() {
        let dir_rp = inc_root.new_index(dir_index.clone())?;
        if !dir_rp.is_dir() {
            continue;
        }
        // increments of this directory's children are files here.
        let mut groups: Vec<_> = inc::list_inc_dir(&dir_rp)?.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        for (basename, incs) in groups {
            let child = dir_index.append(&basename);
            for inc in incs {
                visit(&child, &inc)?;
            }
        }
        for name in dir_rp.listdir()? {
            if dir_rp.append(&name)?.is_dir() {
                to_visit.push(dir_index.append(&name));
            }
        }
    }
    Ok(())
}

/// Every increment in the repository, sorted by index then time.
pub fn list_increments(repo: &Repo) -> Result<Vec<IncInfo>> {
    let inc_root = repo_inc_root(repo)?;
    let mut out = vec![];
    walk_increments(&inc_root, &mut |index, inc| {
        out.push(IncInfo {
            index: index.clone(),
            time: inc.time,
            kind: inc.kind,
            size: inc.attrs.size,
        });
        Ok(())
    })?;
    out.sort_by(|a, b| (&a.index, a.time).cmp(&(&b.index, b.time)));
    Ok(out)
}

/// Per-session rollup of the increments, oldest first.
pub fn list_sessions(repo: &Repo) -> Result<Vec<SessionInfo>> {
    use std::collections::BTreeMap;

    let mut sessions: BTreeMap<SessionTime, SessionInfo> = BTreeMap::new();
    for time in repo.session_times()? {
        sessions.entry(time).or_insert(SessionInfo {
            time,
            increment_files: 0,
            increment_size: 0,
        });
    }
    for info in list_increments(repo)? {
        let entry = sessions.entry(info.time).or_insert(SessionInfo {
            time: info.time,
            increment_files: 0,
            increment_size: 0,
        });
        entry.increment_files += 1;
        entry.increment_size += info.size;
    }
    Ok(sessions.into_iter().map(|(_, info)| info).collect())
}

/// Delete every increment and metadata file strictly older than
/// `cutoff`. The mirror and the current session are never touched.
/// Returns the number of increment files removed.
pub fn remove_older_than(repo: &Repo, cutoff: SessionTime) -> Result<usize> {
    match repo.mirror_time()? {
        Some(mirror_time) if cutoff > mirror_time => err_at!(
            InvalidInput,
            msg: "cutoff {} would remove the current mirror", cutoff
        )?,
        None => err_at!(InvalidInput, msg: "no mirror to prune")?,
        _ => (),
    }

    let inc_root = repo_inc_root(repo)?;
    let mut removed = 0;
    walk_increments(&inc_root, &mut |_index, inc| {
        if inc.time < cutoff {
            err_at!(IOError, fs::remove_file(&inc.path), "{:?}", inc.path)?;
            removed += 1;
        }
        Ok(())
    })?;

    // metadata, error logs and statistics of the pruned sessions.
    let manager = crate::meta::Manager::new(
        repo.as_data_dir(),
        repo.to_config().compression,
        repo.to_config().use_compatible_timestamps,
    );
    for f in manager.list_files()? {
        if f.time < cutoff && !f.is_snapshot {
            err_at!(IOError, fs::remove_file(&f.path), "{:?}", f.path)?;
        }
    }
    Ok(removed)
}

fn repo_inc_root(repo: &Repo) -> Result<RPath> {
    let base = repo.as_data_dir().join(crate::INCREMENTS_DIR);
    let config = repo.to_config();
    let quoter = crate::quote::Quoter::from_config(&config)?.map(std::rc::Rc::new);
    RPath::new(&base, Index::root(), quoter)
}

#[cfg(test)]
#[path = "manage_test.rs"]
mod manage_test;
