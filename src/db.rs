//! The database handle: a [`TimeIndex`] over a [`SnapshotStore`] chain.

use std::path::Path;

use log::{debug, info, warn};

use crate::chronos::{Clock, Replay, TimeIndex};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{EmbeddedStore, GitStore, Record, SnapshotStore, TimeRange, Timestamp};

pub type GitDatabase = Database<GitStore>;
pub type EmbeddedDatabase = Database<EmbeddedStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactReport {
    /// Snapshots still referenced by the index.
    pub retained: usize,
    /// Store objects removed.
    pub reclaimed: usize,
}

/// An open time-indexed store.
///
/// Single writer: the handle is not synchronized, and two handles on the
/// same location are not coordinated. Wrap it in a mutex to share it
/// between threads.
pub struct Database<S: SnapshotStore> {
    store: Option<S>,
    index: TimeIndex<S::Handle>,
}

impl<S: SnapshotStore> Database<S> {
    pub fn create(location: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_config(location, &Config::default())
    }

    pub fn create_with_config(location: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let store = S::init(location.as_ref(), config)?;
        Self::from_store(store)
    }

    pub fn open(location: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(location, &Config::default())
    }

    pub fn open_with_config(location: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let location = location.as_ref();
        let store = S::open(location, config)?;
        let db = Self::from_store(store)?;
        info!(
            "opened {} with {} entries",
            location.display(),
            db.index.len()
        );
        Ok(db)
    }

    /// Builds the index by replaying the store's chain. The store is closed
    /// again if the replay fails.
    pub fn from_store(mut store: S) -> Result<Self> {
        match rebuild(&mut store) {
            Ok(index) => Ok(Self {
                store: Some(store),
                index,
            }),
            Err(e) => {
                if let Err(close_err) = store.close() {
                    warn!("failed to close store after aborted rebuild: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Writes `payload` at `at`. A value already stored at exactly `at` is
    /// superseded.
    pub fn put(&mut self, at: Timestamp, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument("value is empty".to_string()));
        }
        let store = self.store.as_mut().ok_or(Error::Closed)?;
        let context = || format!("put {}", at.to_rfc3339());

        let parent = store.head().map_err(|e| e.context(context()))?;
        let handle = store
            .create_snapshot(&parent, &Record::Put { at }, payload)
            .map_err(|e| e.context(context()))?;
        if let Some(old) = self.index.insert(at, handle) {
            debug!("superseded value at {}", at.to_rfc3339());
            store.release(old);
        }
        Ok(())
    }

    /// Writes `payload` at the clock's current time and returns that time.
    pub fn put_now<C: Clock + ?Sized>(&mut self, clock: &C, payload: &[u8]) -> Result<Timestamp> {
        let at = clock.now();
        self.put(at, payload)?;
        Ok(at)
    }

    /// Value current at `at`: the most recent one written at or before it.
    pub fn get(&self, at: Timestamp) -> Result<Vec<u8>> {
        let store = self.store.as_ref().ok_or(Error::Closed)?;
        let entry = self.index.lookup(&at).ok_or_else(|| {
            Error::NotFound(format!("no value at or before {}", at.to_rfc3339()))
        })?;
        store
            .fetch_payload(&entry.handle)
            .map_err(|e| e.context(format!("get {}", at.to_rfc3339())))
    }

    /// Deletes every value in `[start, end]`; `None` leaves that side
    /// unbounded. Returns how many values were removed.
    pub fn delete(&mut self, start: Option<Timestamp>, end: Option<Timestamp>) -> Result<usize> {
        let range = TimeRange::new(start, end)?;
        let store = self.store.as_mut().ok_or(Error::Closed)?;
        let context = || format!("delete {}", range);

        let parent = store.head().map_err(|e| e.context(context()))?;
        let removed = self.index.remove_range(&range);
        let tombstone = match store.create_snapshot(&parent, &Record::Tombstone { range }, &[]) {
            Ok(handle) => handle,
            Err(e) => {
                for entry in removed {
                    self.index.insert(entry.at, entry.handle);
                }
                return Err(e.context(context()));
            }
        };
        self.index.punch(range, tombstone);

        let count = removed.len();
        for entry in removed {
            store.release(entry.handle);
        }
        debug!("deleted {} values in {}", count, range);
        Ok(count)
    }

    /// The `limit` most recent timestamps, newest first (all of them when
    /// `limit` is 0). `None` means the database holds no values at all.
    pub fn list(&self, limit: usize) -> Result<Option<Vec<Timestamp>>> {
        if self.store.is_none() {
            return Err(Error::Closed);
        }
        Ok(self.index.list(limit))
    }

    /// Rewrites the chain down to what the index still references and lets
    /// the store reclaim the rest.
    pub fn compact(&mut self) -> Result<CompactReport> {
        let store = self.store.as_mut().ok_or(Error::Closed)?;
        let live = self.index.live_handles();
        let compaction = store.compact(&live).map_err(|e| e.context("compact"))?;

        let retained = compaction.handles.len();
        let retired = self.index.rehandle(compaction.handles).ok_or_else(|| {
            Error::store(
                "compact",
                format!("store returned {} handles for {} snapshots", retained, live.len()),
            )
        })?;
        for handle in retired {
            store.release(handle);
        }

        info!(
            "compacted: {} snapshots retained, {} objects reclaimed",
            retained, compaction.reclaimed
        );
        Ok(CompactReport {
            retained,
            reclaimed: compaction.reclaimed,
        })
    }

    /// Releases every handle held by the index, then the store. Closing an
    /// already closed database does nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut store) = self.store.take() else {
            return Ok(());
        };
        for handle in self.index.drain() {
            store.release(handle);
        }
        store.close()
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// Number of values in the index.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl<S: SnapshotStore> Drop for Database<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close database: {}", e);
        }
    }
}

fn rebuild<S: SnapshotStore>(store: &mut S) -> Result<TimeIndex<S::Handle>> {
    let mut replay = Replay::new();
    let walked = store.walk_from_head().and_then(|walk| {
        for snapshot in walk {
            if !replay.visit(snapshot?) {
                return Err(Error::store(
                    "walk chain",
                    "snapshot found past the genesis marker",
                ));
            }
        }
        Ok(())
    });
    let walked = walked.and_then(|()| {
        if replay.reached_genesis() {
            Ok(())
        } else {
            Err(Error::store(
                "walk chain",
                "chain does not end in a genesis snapshot",
            ))
        }
    });

    if let Err(e) = walked {
        for handle in replay.into_handles() {
            store.release(handle);
        }
        return Err(e.context("rebuild index"));
    }

    let (index, discarded) = replay.finish();
    for handle in discarded {
        store.release(handle);
    }
    Ok(index)
}
