use structopt::StructOpt;

use std::{convert::TryFrom, path::PathBuf, process::exit};

use revbak::{config::Config, config::Selection, manage, rorp::Index, session::Repo};

#[derive(StructOpt)]
#[structopt(name = "revbak", about = "reverse-delta file-tree backups")]
enum Opt {
    /// Back up SOURCE into MIRROR, keeping increments.
    Backup {
        source: PathBuf,
        mirror: PathBuf,
        #[structopt(long)]
        no_compression: bool,
        #[structopt(long)]
        chars_to_quote: Option<String>,
        #[structopt(long)]
        force: bool,
    },
    /// Restore MIRROR (or a subpath of it) into TARGET.
    Restore {
        mirror: PathBuf,
        target: PathBuf,
        /// w3 datetime to restore to, default latest.
        #[structopt(long)]
        at: Option<String>,
        /// subpath below the mirror root, default whole tree.
        #[structopt(long)]
        path: Option<String>,
    },
    /// List past sessions and their increment sizes.
    ListIncrements { mirror: PathBuf },
    /// Recover from an aborted session.
    Regress {
        mirror: PathBuf,
        #[structopt(long)]
        force: bool,
    },
    /// Delete increments older than the given w3 datetime.
    RemoveOlderThan { mirror: PathBuf, time: String },
}

fn main() {
    match run(Opt::from_args()) {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("revbak: {}", err);
            exit(1);
        }
    }
}

fn run(opt: Opt) -> revbak::Result<()> {
    match opt {
        Opt::Backup { source, mirror, no_compression, chars_to_quote, force } => {
            let mut config = Config::new();
            config.set_compression(!no_compression).set_force(force);
            if let Some(ctq) = chars_to_quote {
                config.set_chars_to_quote(ctq.as_bytes());
            }
            let repo = Repo::open(&mirror, config)?;
            let stats = repo.backup(&source, Selection::all())?;
            println!(
                "{} files, {} new, {} changed, {} deleted, {} errors",
                stats.source_files,
                stats.new_files,
                stats.changed_files,
                stats.deleted_files,
                stats.errors
            );
            Ok(())
        }
        Opt::Restore { mirror, target, at, path } => {
            let repo = Repo::open(&mirror, Config::new())?;
            let time = match at {
                Some(at) => revbak::stamp::SessionTime::try_from(at.as_str())?,
                None => revbak::stamp::SessionTime::now(),
            };
            let sub_index = match path {
                Some(path) => Index::from_path(path.as_bytes()),
                None => Index::root(),
            };
            repo.restore(&sub_index, &target, time)
        }
        Opt::ListIncrements { mirror } => {
            let repo = Repo::open(&mirror, Config::new())?;
            for session in manage::list_sessions(&repo)? {
                println!(
                    "{}  {} increments, {} bytes",
                    session.time, session.increment_files, session.increment_size
                );
            }
            Ok(())
        }
        Opt::Regress { mirror, force } => {
            let mut config = Config::new();
            config.set_force(force);
            let repo = Repo::open(&mirror, config)?;
            repo.regress()
        }
        Opt::RemoveOlderThan { mirror, time } => {
            let repo = Repo::open(&mirror, Config::new())?;
            let cutoff = revbak::stamp::SessionTime::try_from(time.as_str())?;
            let removed = manage::remove_older_than(&repo, cutoff)?;
            println!("removed {} increment files", removed);
            Ok(())
        }
    }
}
