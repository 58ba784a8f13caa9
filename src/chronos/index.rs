//! In-memory time index: timestamps mapped to snapshot handles, kept sorted
//! most recent first with at most one entry per instant.

use std::collections::HashSet;

use super::order;
use crate::store::{Record, Snapshot, TimeRange, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<H> {
    pub at: Timestamp,
    pub handle: H,
}

/// A deleted range, backed by the tombstone snapshot that recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hole<H> {
    pub range: TimeRange,
    pub handle: H,
}

#[derive(Debug, Clone)]
pub struct TimeIndex<H> {
    entries: Vec<Entry<H>>,
    // oldest first
    holes: Vec<Hole<H>>,
}

impl<H> Default for TimeIndex<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            holes: Vec::new(),
        }
    }
}

impl<H> TimeIndex<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, most recent first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Entry<H>> {
        self.entries.iter()
    }

    /// Inserts `handle` at `at`. An entry with the exact same timestamp is
    /// replaced and its handle returned.
    pub fn insert(&mut self, at: Timestamp, handle: H) -> Option<H> {
        match order::exact_search_by_key(&self.entries, &at, |e| &e.at) {
            Some(n) => Some(std::mem::replace(&mut self.entries[n].handle, handle)),
            None => {
                let n = self.entries.partition_point(|e| e.at > at);
                self.entries.insert(n, Entry { at, handle });
                None
            }
        }
    }

    /// Most recent entry at or before `at`.
    pub fn floor(&self, at: &Timestamp) -> Option<&Entry<H>> {
        order::floor_search_by_key(&self.entries, at, |e| &e.at).map(|n| &self.entries[n])
    }

    /// Floor lookup that respects deleted ranges: a query inside a hole only
    /// finds entries written into the hole after it was punched.
    pub fn lookup(&self, at: &Timestamp) -> Option<&Entry<H>> {
        let entry = self.floor(at)?;
        let shadowed = self.holes.iter().any(|hole| {
            hole.range.contains(at) && hole.range.start.map_or(false, |s| entry.at < s)
        });
        (!shadowed).then_some(entry)
    }

    pub fn exact(&self, at: &Timestamp) -> Option<&Entry<H>> {
        order::exact_search_by_key(&self.entries, at, |e| &e.at).map(|n| &self.entries[n])
    }

    /// The `limit` most recent timestamps, all of them when `limit` is 0.
    /// Returns `None` when the index holds nothing at all.
    pub fn list(&self, limit: usize) -> Option<Vec<Timestamp>> {
        if self.entries.is_empty() {
            return None;
        }
        let n = if limit == 0 {
            self.entries.len()
        } else {
            limit.min(self.entries.len())
        };
        Some(self.entries[..n].iter().map(|e| e.at).collect())
    }

    /// Removes every entry inside `range`, returning them most recent first.
    pub fn remove_range(&mut self, range: &TimeRange) -> Vec<Entry<H>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| range.contains(&e.at));
        self.entries = kept;
        removed
    }

    /// Records `range` as deleted.
    pub fn punch(&mut self, range: TimeRange, handle: H) {
        self.holes.push(Hole { range, handle });
    }

    pub fn holes(&self) -> &[Hole<H>] {
        &self.holes
    }

    /// Whether dropping hole `i` leaves every lookup unchanged. An open-start
    /// hole never shadows anything, and a hole is covered by another with the
    /// same start and a wider range (or the same range, written later).
    fn hole_is_redundant(&self, i: usize) -> bool {
        let hole = &self.holes[i];
        let Some(start) = hole.range.start else {
            return true;
        };
        self.holes.iter().enumerate().any(|(j, other)| {
            j != i
                && other.range.start == Some(start)
                && match (other.range.end, hole.range.end) {
                    (None, Some(_)) => true,
                    (Some(a), Some(b)) => a > b || (a == b && j > i),
                    (None, None) => j > i,
                    (Some(_), None) => false,
                }
        })
    }

    /// Handles a rewritten chain has to keep, in rewrite order: holes that
    /// still shadow something (oldest first), then entries oldest first.
    pub fn live_handles(&self) -> Vec<H>
    where
        H: Clone,
    {
        (0..self.holes.len())
            .filter(|&i| !self.hole_is_redundant(i))
            .map(|i| self.holes[i].handle.clone())
            .chain(self.entries.iter().rev().map(|e| e.handle.clone()))
            .collect()
    }

    /// Swaps in new handles, in [`live_handles`](Self::live_handles) order,
    /// and forgets the redundant holes. Returns every handle the index no
    /// longer references, or `None` if the count does not match.
    pub fn rehandle(&mut self, handles: Vec<H>) -> Option<Vec<H>>
    where
        H: PartialEq,
    {
        let keep: Vec<bool> = (0..self.holes.len())
            .map(|i| !self.hole_is_redundant(i))
            .collect();
        let live = keep.iter().filter(|k| **k).count() + self.entries.len();
        if handles.len() != live {
            return None;
        }

        let mut retired = Vec::new();
        for (hole, keep) in std::mem::take(&mut self.holes).into_iter().zip(keep) {
            if keep {
                self.holes.push(hole);
            } else {
                retired.push(hole.handle);
            }
        }
        let slots = self
            .holes
            .iter_mut()
            .map(|h| &mut h.handle)
            .chain(self.entries.iter_mut().rev().map(|e| &mut e.handle));
        for (slot, handle) in slots.zip(handles) {
            let old = std::mem::replace(slot, handle);
            if *slot != old {
                retired.push(old);
            }
        }
        Some(retired)
    }

    pub fn drain(&mut self) -> Vec<H> {
        let mut handles: Vec<H> = self.holes.drain(..).map(|h| h.handle).collect();
        handles.extend(self.entries.drain(..).map(|e| e.handle));
        handles
    }
}

/// Rebuilds a [`TimeIndex`] from a chain walk, newest snapshot first.
///
/// For each exact timestamp the first snapshot seen wins. A tombstone hides
/// every put seen after it (older in the chain) whose timestamp it covers,
/// and stays in the index as a hole. Handles that end up outside the index
/// are collected for release.
#[derive(Debug)]
pub struct Replay<H> {
    entries: Vec<Entry<H>>,
    seen: HashSet<Timestamp>,
    // newest first, as walked
    holes: Vec<Hole<H>>,
    discarded: Vec<H>,
    reached_genesis: bool,
}

impl<H> Default for Replay<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            holes: Vec::new(),
            discarded: Vec::new(),
            reached_genesis: false,
        }
    }
}

impl<H> Replay<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next (older) snapshot. Returns `false` once the snapshot
    /// came after the genesis marker, which a well-formed chain never has.
    pub fn visit(&mut self, snapshot: Snapshot<H>) -> bool {
        if self.reached_genesis {
            self.discarded.push(snapshot.handle);
            return false;
        }
        match snapshot.record {
            Record::Genesis => {
                self.reached_genesis = true;
                self.discarded.push(snapshot.handle);
            }
            Record::Tombstone { range } => {
                self.holes.push(Hole {
                    range,
                    handle: snapshot.handle,
                });
            }
            Record::Put { at } => {
                let hidden = self.holes.iter().any(|h| h.range.contains(&at));
                if hidden || !self.seen.insert(at) {
                    self.discarded.push(snapshot.handle);
                } else {
                    self.entries.push(Entry {
                        at,
                        handle: snapshot.handle,
                    });
                }
            }
        }
        true
    }

    pub fn reached_genesis(&self) -> bool {
        self.reached_genesis
    }

    /// Sorts the surviving entries into an index. Also returns the handles
    /// that were not kept.
    pub fn finish(self) -> (TimeIndex<H>, Vec<H>) {
        let mut entries = self.entries;
        order::sort_by_key(&mut entries, |e| &e.at);
        let mut holes = self.holes;
        holes.reverse();
        (TimeIndex { entries, holes }, self.discarded)
    }

    /// Every handle seen so far, for an aborted rebuild.
    pub fn into_handles(self) -> Vec<H> {
        let mut handles = self.discarded;
        handles.extend(self.holes.into_iter().map(|h| h.handle));
        handles.extend(self.entries.into_iter().map(|e| e.handle));
        handles
    }
}
