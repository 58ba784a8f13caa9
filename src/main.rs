use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use zeitdb::{
    Backend, Clock, Config, Database, EmbeddedStore, FixedClock, GitStore, SnapshotStore,
    SystemClock, Timestamp,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store location, defaults to `store.path` from the config
    #[arg(short, long, global = true)]
    repo: Option<PathBuf>,

    /// Pretend the current time is this (RFC 3339 or RFC 2822)
    #[arg(long, env = "ZEITDB_TIME", global = true)]
    time: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty store
    Init { path: Option<PathBuf> },
    /// Store the contents of a file at the current time
    Put { file: PathBuf },
    /// Print the value current at a time, or the n-th most recent value
    Get { key: Option<String> },
    /// Delete values in `[start]..[end]`; bounds are times or indexes
    Delete { range: String },
    /// List stored timestamps, newest first
    List { limit: Option<usize> },
    /// Reclaim space held by deleted values
    Compact,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load config: {:#}, using defaults", e);
        Config::default()
    });

    match config.store.backend {
        Backend::Git => run::<GitStore>(args, &config),
        Backend::Embedded => run::<EmbeddedStore>(args, &config),
    }
}

fn run<S: SnapshotStore>(args: Args, config: &Config) -> Result<()> {
    let clock: Box<dyn Clock> = match &args.time {
        Some(t) => Box::new(FixedClock(parse_time(t)?)),
        None => Box::new(SystemClock),
    };
    let location = args.repo.unwrap_or_else(|| config.store.path.clone());

    let command = match args.command {
        Command::Init { path } => {
            let location = path.unwrap_or(location);
            let mut db = Database::<S>::create_with_config(&location, config)
                .with_context(|| format!("failed to create store at {}", location.display()))?;
            db.close()?;
            println!("Initialized empty zeitdb store in {}", location.display());
            return Ok(());
        }
        command => command,
    };

    let mut db = Database::<S>::open_with_config(&location, config)
        .with_context(|| format!("failed to open store at {}", location.display()))?;

    match command {
        Command::Init { .. } => {}
        Command::Put { file } => {
            let payload = fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let at = db.put_now(clock.as_ref(), &payload)?;
            println!("{}", format_time(&at));
        }
        Command::Get { key } => {
            let at = match key.as_deref() {
                Some(arg) if !arg.is_empty() => resolve(&db, arg)?,
                _ => latest(&db)?,
            };
            let payload = db.get(at)?;
            io::stdout()
                .write_all(&payload)
                .context("failed to write value")?;
        }
        Command::Delete { range } => {
            let (start, end) = range
                .split_once("..")
                .ok_or_else(|| anyhow!("invalid range {:?}, expected [start]..[end]", range))?;
            let start = bound(&db, start)?;
            let end = bound(&db, end)?;
            let removed = db.delete(start, end)?;
            println!("Deleted {} value(s)", removed);
        }
        Command::List { limit } => {
            let Some(keys) = db.list(limit.unwrap_or(0))? else {
                bail!("db is empty");
            };
            for key in keys {
                println!("{}", format_time(&key));
            }
        }
        Command::Compact => {
            let report = db.compact()?;
            println!(
                "Compacted: {} snapshot(s) retained, {} object(s) reclaimed",
                report.retained, report.reclaimed
            );
        }
    }

    db.close()?;
    Ok(())
}

fn parse_time(s: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid time {:?}", s))
}

fn format_time(t: &Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn latest<S: SnapshotStore>(db: &Database<S>) -> Result<Timestamp> {
    db.list(1)?
        .and_then(|keys| keys.first().copied())
        .ok_or_else(|| anyhow!("db is empty"))
}

/// A time, or a 1-based position counted from the most recent value.
fn resolve<S: SnapshotStore>(db: &Database<S>, arg: &str) -> Result<Timestamp> {
    let Ok(n) = arg.parse::<usize>() else {
        return parse_time(arg);
    };
    if n == 0 {
        bail!("invalid index 0, indexes start at 1");
    }
    let keys = db.list(n)?.ok_or_else(|| anyhow!("db is empty"))?;
    keys.get(n - 1)
        .copied()
        .ok_or_else(|| anyhow!("invalid index {}, only {} value(s) stored", n, keys.len()))
}

fn bound<S: SnapshotStore>(db: &Database<S>, arg: &str) -> Result<Option<Timestamp>> {
    if arg.is_empty() {
        Ok(None)
    } else {
        resolve(db, arg).map(Some)
    }
}
