//! The snapshot chain the time index is built on.
//!
//! A store persists immutable snapshots linked to their parent, from the
//! genesis marker written at creation up to the current head. Two backends
//! ship with the crate: a bare git repository ([`GitStore`]) and an embedded
//! sled database ([`EmbeddedStore`]).

pub mod embedded;
pub mod git;

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

pub use embedded::{EmbeddedStore, SnapshotId};
pub use git::GitStore;

pub type Timestamp = DateTime<Utc>;

/// Inclusive time range; a missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Result<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(Error::InvalidArgument(format!(
                    "range start {} is after end {}",
                    s.to_rfc3339(),
                    e.to_rfc3339()
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: &Timestamp) -> bool {
        self.start.map_or(true, |s| s <= *t) && self.end.map_or(true, |e| *t <= e)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<Timestamp>| b.map(|t| t.to_rfc3339()).unwrap_or_default();
        write!(f, "[{}..{}]", bound(self.start), bound(self.end))
    }
}

/// What a snapshot in the chain stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// Chain root written once at store creation. Carries no data.
    Genesis,
    /// A value written at `at`.
    Put { at: Timestamp },
    /// Hides every older `Put` whose timestamp falls in `range`.
    Tombstone { range: TimeRange },
}

impl Record {
    /// Timestamp the signature of the snapshot is recorded with. Derived
    /// from the record alone: a put's key, a tombstone's last bounded edge,
    /// and the Unix epoch for genesis or a fully unbounded range.
    pub fn time(&self) -> Timestamp {
        match self {
            Record::Put { at } => *at,
            Record::Tombstone { range } => range.end.or(range.start).unwrap_or_default(),
            Record::Genesis => Timestamp::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<H> {
    pub handle: H,
    pub record: Record,
}

/// Outcome of [`SnapshotStore::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction<H> {
    /// Handles of the retained snapshots, in the order they were passed in.
    pub handles: Vec<H>,
    /// Number of store objects removed.
    pub reclaimed: usize,
}

pub type Walk<'a, H> = Box<dyn Iterator<Item = Result<Snapshot<H>>> + 'a>;

/// Minimal surface the time index needs from an append-only snapshot chain.
///
/// Calls are synchronous; a store may block on I/O internally.
pub trait SnapshotStore {
    type Handle: Clone + Eq + fmt::Debug;

    /// Initializes an empty store at `location` and writes the genesis
    /// snapshot. Fails with [`Error::AlreadyExists`] if a store is there.
    fn init(location: &Path, config: &Config) -> Result<Self>
    where
        Self: Sized;

    /// Opens an existing store. Fails with [`Error::NotFound`] if there is none.
    fn open(location: &Path, config: &Config) -> Result<Self>
    where
        Self: Sized;

    /// Appends a snapshot whose parent is `parent` and makes it the head.
    fn create_snapshot(
        &mut self,
        parent: &Self::Handle,
        record: &Record,
        payload: &[u8],
    ) -> Result<Self::Handle>;

    fn fetch_payload(&self, handle: &Self::Handle) -> Result<Vec<u8>>;

    fn head(&self) -> Result<Self::Handle>;

    /// Lazily visits snapshots from the head back to genesis. Dropping the
    /// iterator stops the walk.
    fn walk_from_head(&self) -> Result<Walk<'_, Self::Handle>>;

    /// Gives back a handle the index no longer references.
    fn release(&mut self, _handle: Self::Handle) {}

    /// Rewrites the chain to genesis followed by `live`, reclaiming the
    /// space of everything else. Payloads and records of `live` snapshots
    /// are preserved.
    fn compact(&mut self, live: &[Self::Handle]) -> Result<Compaction<Self::Handle>>;

    /// Flushes and releases the store.
    fn close(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_range_contains_inclusive() {
        let r = TimeRange::new(Some(ts(4)), Some(ts(6))).unwrap();
        assert!(r.contains(&ts(4)));
        assert!(r.contains(&ts(5)));
        assert!(r.contains(&ts(6)));
        assert!(!r.contains(&ts(3)));
        assert!(!r.contains(&ts(7)));
    }

    #[test]
    fn test_range_unbounded() {
        let r = TimeRange::new(None, Some(ts(0))).unwrap();
        assert!(r.contains(&ts(-1000)));
        assert!(!r.contains(&ts(1)));
        assert!(TimeRange::default().contains(&ts(42)));
    }

    #[test]
    fn test_range_rejects_inverted() {
        let err = TimeRange::new(Some(ts(6)), Some(ts(4))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_record_time_needs_no_clock() {
        assert_eq!(Record::Genesis.time(), Timestamp::default());
        assert_eq!(Record::Put { at: ts(3) }.time(), ts(3));
        let bounded = TimeRange::new(Some(ts(4)), Some(ts(6))).unwrap();
        assert_eq!(Record::Tombstone { range: bounded }.time(), ts(6));
        let open_end = TimeRange::new(Some(ts(4)), None).unwrap();
        assert_eq!(Record::Tombstone { range: open_end }.time(), ts(4));
        let everything = TimeRange::default();
        assert_eq!(
            Record::Tombstone { range: everything }.time(),
            Timestamp::default()
        );
    }

    #[test]
    fn test_record_json() {
        let rec = Record::Put { at: ts(1) };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"kind\":\"put\""));
        assert_eq!(serde_json::from_str::<Record>(&json).unwrap(), rec);
    }
}
