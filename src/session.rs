//! Module implement the repository and the session coordinator.
//!
//! A repository is a mirror root with a `rdiff-backup-data/` directory
//! beside the mirrored entries. [Repo] is the single entry point for
//! the write operations, and enforces their ordering:
//!
//! 1. the `current_mirror.<T>.data` marker is written and synced
//!    before any mutation,
//! 2. the pipeline runs,
//! 3. on success the post-processing cache is flushed (writing the
//!    metadata snapshot), the previous snapshot becomes a diff, the
//!    data dir is synced, and only then is the older marker deleted.
//!
//! Two markers at startup mean an aborted session; write operations
//! refuse to run until [Repo::regress] has recovered it. Read
//! operations never touch the repository and need no coordination.

use fs2::FileExt;
use lazy_static::lazy_static;
use regex::bytes::Regex;

use std::{
    convert::TryFrom,
    fs,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{
    backup::Pipeline,
    config::{Config, Selection},
    elog::ErrorLog,
    meta, quote,
    regress::{parse_marker_pid, pid_alive, Regresser},
    restore::{resolve_rest_time, Restorer},
    rorp::{Index, RPath},
    scan::TreeScan,
    stamp::SessionTime,
    stats::SessionStats,
    util, Error, Result, DATA_DIR, INCREMENTS_DIR,
};

lazy_static! {
    static ref MARKER_REGEXP: Regex = Regex::new(
        r"(?s-u)^current_mirror\.(\d{4}-\d{2}-\d{2}T\d{2}[-:]\d{2}[-:]\d{2}[-+]\d{2}[-:]\d{2})\.data$"
    )
    .unwrap();
}

// persisted quoting configuration.
const CHARS_TO_QUOTE_FILE: &str = "chars_to_quote";
const SPECIAL_ESCAPES_FILE: &str = "special_escapes";

/// What the session markers say about the repository.
#[derive(Clone, Debug, PartialEq)]
pub enum DestState {
    /// No data directory yet.
    Empty,
    /// One marker; the time of the last good session.
    Clean(SessionTime),
    /// Two markers; `(regress_time, unsuccessful_time)`.
    NeedsRegress(SessionTime, SessionTime),
}

/// A backup repository on the local filesystem.
pub struct Repo {
    mirror_root: PathBuf,
    data_dir: PathBuf,
    config: Config,
    quoter: Option<Rc<quote::Quoter>>,
}

impl Repo {
    /// Open (or later create) the repository rooted at `mirror_root`.
    /// If a quoting configuration was persisted by an earlier session
    /// it must match `config`, unless `config.force` is set.
    pub fn open(mirror_root: &Path, config: Config) -> Result<Repo> {
        let quoter = quote::Quoter::from_config(&config)?.map(Rc::new);
        let repo = Repo {
            mirror_root: mirror_root.to_path_buf(),
            data_dir: mirror_root.join(DATA_DIR),
            config,
            quoter,
        };
        repo.check_quoting_config()?;
        Ok(repo)
    }

    pub fn as_data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn to_config(&self) -> Config {
        self.config.clone()
    }

    fn mirror_rpath(&self) -> Result<RPath> {
        RPath::new(&self.mirror_root, Index::root(), self.quoter.clone())
    }

    fn inc_rpath(&self) -> Result<RPath> {
        let base = self.data_dir.join(INCREMENTS_DIR);
        RPath::new(&base, Index::root(), self.quoter.clone())
    }

    fn long_rpath(&self) -> Result<RPath> {
        let base = self.data_dir.join(crate::longname::LONG_NAME_DIR);
        RPath::new(&base, Index::root(), None)
    }

    fn manager(&self) -> meta::Manager {
        meta::Manager::new(
            &self.data_dir,
            self.config.compression,
            self.config.use_compatible_timestamps,
        )
    }

    fn check_quoting_config(&self) -> Result<()> {
        let loc = self.data_dir.join(CHARS_TO_QUOTE_FILE);
        let persisted = match fs::read(&loc) {
            Ok(data) => Some(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => err_at!(IOError, Err(err), "{:?}", loc)?,
        };
        let configured = self
            .quoter
            .as_ref()
            .map(|q| q.as_chars_to_quote().to_vec())
            .unwrap_or_default();
        match persisted {
            Some(persisted) if persisted != configured && !self.config.force => {
                err_at!(
                    Fatal,
                    msg: "chars_to_quote mismatch: repository has {:?}, configured {:?}; \
                          rerun with force to override",
                    String::from_utf8_lossy(&persisted),
                    String::from_utf8_lossy(&configured)
                )
            }
            _ => Ok(()),
        }
    }

    fn persist_quoting_config(&self) -> Result<()> {
        let ctq = self
            .quoter
            .as_ref()
            .map(|q| q.as_chars_to_quote().to_vec())
            .unwrap_or_default();
        let loc = self.data_dir.join(CHARS_TO_QUOTE_FILE);
        let tf = util::TempGuard::new_in_dir(&loc)?;
        tf.write_all(&ctq)?;
        tf.commit(&loc)?;

        let (dos, trailing) = self
            .quoter
            .as_ref()
            .map(|q| q.to_escape_flags())
            .unwrap_or((false, false));
        let mut text = String::new();
        if dos {
            text.push_str("escape_dos_devices\n");
        }
        if trailing {
            text.push_str("escape_trailing_spaces\n");
        }
        let loc = self.data_dir.join(SPECIAL_ESCAPES_FILE);
        let tf = util::TempGuard::new_in_dir(&loc)?;
        tf.write_all(text.as_bytes())?;
        tf.commit(&loc)
    }

    /// The session markers present, sorted ascending by time.
    pub fn list_markers(&self) -> Result<Vec<(SessionTime, PathBuf)>> {
        use std::os::unix::ffi::OsStrExt;

        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return err_at!(IOError, Err(err), "{:?}", self.data_dir),
        };
        let mut markers = vec![];
        for entry in entries {
            let entry = err_at!(IOError, entry)?;
            let name = entry.file_name();
            if let Some(caps) = MARKER_REGEXP.captures(name.as_bytes()) {
                let time = SessionTime::try_from(caps.get(1).unwrap().as_bytes())?;
                markers.push((time, self.data_dir.join(&name)));
            }
        }
        markers.sort_by_key(|(time, _)| *time);
        Ok(markers)
    }

    /// Classify the repository by its markers; more than two is fatal.
    pub fn check_dest(&self) -> Result<DestState> {
        let markers = self.list_markers()?;
        match markers.len() {
            0 if !self.data_dir.exists() => Ok(DestState::Empty),
            0 => {
                let empty = err_at!(IOError, fs::read_dir(&self.data_dir))?
                    .next()
                    .is_none();
                if empty {
                    Ok(DestState::Empty)
                } else {
                    err_at!(
                        Fatal,
                        msg: "data dir {:?} exists but has no current_mirror marker",
                        self.data_dir
                    )
                }
            }
            1 => Ok(DestState::Clean(markers[0].0)),
            2 => Ok(DestState::NeedsRegress(markers[0].0, markers[1].0)),
            n => err_at!(Fatal, msg: "found {} current_mirror markers, expected <= 2", n),
        }
    }

    /// Time of the current mirror, if any.
    pub fn mirror_time(&self) -> Result<Option<SessionTime>> {
        match self.check_dest()? {
            DestState::Clean(time) => Ok(Some(time)),
            DestState::NeedsRegress(_, time) => Ok(Some(time)),
            DestState::Empty => Ok(None),
        }
    }

    /// All session times recorded in the metadata chain.
    pub fn session_times(&self) -> Result<Vec<SessionTime>> {
        self.manager().session_times()
    }

    fn marker_path(&self, time: SessionTime) -> PathBuf {
        let name = format!(
            "current_mirror.{}.data",
            time.to_string_with(self.config.use_compatible_timestamps)
        );
        self.data_dir.join(name)
    }

    fn write_marker(&self, time: SessionTime) -> Result<()> {
        let loc = self.marker_path(time);
        let mut fd = util::create_file_rw(loc.as_os_str())?;
        err_at!(IOError, write!(fd, "PID {}\n", std::process::id()), "{:?}", loc)?;
        err_at!(IOError, fd.sync_all(), "{:?}", loc)?;
        util::sync_dir(&self.data_dir)
    }

    // the data-dir handle doubles as the single-writer lock.
    fn lock_data_dir(&self) -> Result<fs::File> {
        let fd = err_at!(IOError, fs::File::open(&self.data_dir), "{:?}", self.data_dir)?;
        err_at!(IOError, fd.try_lock_exclusive(), "repository is locked")?;
        Ok(fd)
    }

    /// Back up `source` into the mirror, stamping the session with the
    /// current time.
    pub fn backup(&self, source: &Path, selection: Selection) -> Result<SessionStats> {
        self.backup_at(source, selection, SessionTime::now())
    }

    /// Back up `source`, stamping the session `time`. Exposed so tests
    /// and schedulers can pin the clock.
    pub fn backup_at(
        &self,
        source: &Path,
        selection: Selection,
        time: SessionTime,
    ) -> Result<SessionStats> {
        let source_root = RPath::new(source, Index::root(), None)?;
        if !source_root.exists() {
            err_at!(InvalidInput, msg: "source {:?} does not exist", source)?
        }

        let prev_time = match self.check_dest()? {
            DestState::Empty => {
                err_at!(IOError, fs::create_dir_all(self.data_dir.join(INCREMENTS_DIR)))?;
                self.persist_quoting_config()?;
                None
            }
            DestState::Clean(prev) => {
                if prev >= time {
                    err_at!(
                        Fatal,
                        msg: "mirror time {} is not before session time {}", prev, time
                    )?
                }
                Some(prev)
            }
            DestState::NeedsRegress(..) => err_at!(
                Fatal,
                msg: "previous backup seems to have failed, regress the repository first"
            )?,
        };

        let lock = self.lock_data_dir()?;
        self.write_marker(time)?;

        let manager = self.manager();
        let dest_root = self.mirror_rpath()?;

        // iterate the mirror from the previous metadata when intact,
        // else scan the mirror directly.
        let dest_iter: Box<dyn Iterator<Item = Result<crate::rorp::Rorp>>> =
            match prev_time {
                Some(prev) if manager.attrs_at(prev).is_ok() => manager.attrs_at(prev)?,
                _ => {
                    let mut selection = Selection::all();
                    selection.exclude(Index::from_path(DATA_DIR.as_bytes()));
                    Box::new(TreeScan::new(dest_root.clone(), selection))
                }
            };

        let meta_writer = manager.new_writer(time)?;
        let elog = ErrorLog::open(
            &self.data_dir,
            time,
            self.config.compression,
            self.config.use_compatible_timestamps,
        )?;
        let stats = SessionStats::new(time.as_secs());

        let pipeline = Pipeline {
            source_root,
            dest_root,
            selection,
            config: self.config.clone(),
            data_dir: self.data_dir.clone(),
            inc: match prev_time {
                Some(prev) => Some((self.inc_rpath()?, prev)),
                None => None,
            },
        };
        let mut stats = pipeline.run(dest_iter, meta_writer, elog, stats)?;
        stats.end_time = SessionTime::now().as_secs();

        if let Some(prev) = prev_time {
            manager.convert_to_diff(prev, time)?;
        }
        stats.write_file(&self.data_dir, time, self.config.use_compatible_timestamps)?;

        util::sync_dir(&self.data_dir)?;
        if let Some(prev) = prev_time {
            let loc = self
                .list_markers()?
                .into_iter()
                .find(|(time, _)| *time == prev)
                .map(|(_, path)| path)
                .unwrap_or_else(|| self.marker_path(prev));
            err_at!(IOError, fs::remove_file(&loc), "{:?}", loc)?;
            util::sync_dir(&self.data_dir)?;
        }
        drop(lock);
        Ok(stats)
    }

    /// Restore the tree under `sub_index` as of `restore_to` into
    /// `target`.
    pub fn restore(
        &self,
        sub_index: &Index,
        target: &Path,
        restore_to: SessionTime,
    ) -> Result<()> {
        let mirror_time = match self.check_dest()? {
            DestState::Clean(time) => time,
            DestState::Empty => err_at!(Fatal, msg: "nothing to restore from")?,
            DestState::NeedsRegress(..) => err_at!(
                Fatal,
                msg: "previous backup seems to have failed, regress the repository first"
            )?,
        };

        let times = self.session_times()?;
        let rest_time = resolve_rest_time(restore_to, &times);

        let restorer = Restorer {
            mirror_root: self.mirror_rpath()?,
            inc_root: self.inc_rpath()?,
            long_root: self.long_rpath()?,
            manager: self.manager(),
            mirror_time,
            rest_time,
        };
        restorer.restore(sub_index, target)
    }

    /// Recover from an aborted session. Refuses while the recorded pid
    /// is still alive, unless `config.force` is set.
    pub fn regress(&self) -> Result<()> {
        let (regress_time, unsuccessful_time) = match self.check_dest()? {
            DestState::NeedsRegress(rt, ut) => (rt, ut),
            _ => err_at!(InvalidInput, msg: "repository does not need regressing")?,
        };

        // resolve the marker through the listing, so either timestamp
        // form on disk is honored.
        let newer = self
            .list_markers()?
            .into_iter()
            .find(|(time, _)| *time == unsuccessful_time)
            .map(|(_, path)| path)
            .unwrap_or_else(|| self.marker_path(unsuccessful_time));
        if let Ok(contents) = fs::read(&newer) {
            if let Some(pid) = parse_marker_pid(&contents) {
                if pid_alive(pid) && !self.config.force {
                    err_at!(
                        Fatal,
                        msg: "backup process {} appears to still be running; \
                              rerun with force to regress anyway",
                        pid
                    )?
                }
            }
        }

        let lock = self.lock_data_dir()?;
        let regresser = Regresser {
            mirror_root: self.mirror_rpath()?,
            inc_root: self.inc_rpath()?,
            long_root: self.long_rpath()?,
            data_dir: self.data_dir.clone(),
            manager: self.manager(),
            regress_time,
            unsuccessful_time,
        };
        regresser.run()?;
        self.delete_session_files(unsuccessful_time)?;

        // the newer marker goes last; a crash before this point simply
        // regresses again.
        err_at!(IOError, fs::remove_file(&newer), "{:?}", newer)?;
        util::sync_dir(&self.data_dir)?;
        drop(lock);
        Ok(())
    }

    // error log and statistics the aborted session may have left.
    fn delete_session_files(&self, time: SessionTime) -> Result<()> {
        let ts = time.to_string_with(self.config.use_compatible_timestamps);
        for name in [
            format!("error_log.{}.data", ts),
            format!("error_log.{}.data.gz", ts),
            format!("session_statistics.{}.data", ts),
        ]
        .iter()
        {
            fs::remove_file(self.data_dir.join(name)).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
