use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::{Batch, Db, Transactional, Tree};

use super::{Compaction, Record, Snapshot, SnapshotStore, Walk};
use crate::config::Config;
use crate::error::{Error, Result, StoreContext};

const HEAD: &[u8] = b"head";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    fn key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn from_key(key: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Error::store("decode snapshot id", format!("bad key length {}", key.len())))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    parent: Option<SnapshotId>,
    record: Record,
}

/// Snapshot chain kept in an embedded sled database.
///
/// `snapshots` maps an id to its parent and record, `payloads` maps the same
/// id to the zstd-compressed value, and `meta` holds the head id.
pub struct EmbeddedStore {
    db: Db,
    snapshots: Tree,
    payloads: Tree,
    meta: Tree,
    compression_level: i32,
}

impl EmbeddedStore {
    fn exists(location: &Path) -> bool {
        location.join("conf").exists()
    }

    fn from_db(db: Db, config: &Config) -> Result<Self> {
        let snapshots = db.open_tree("snapshots").store_context("open snapshots tree")?;
        let payloads = db.open_tree("payloads").store_context("open payloads tree")?;
        let meta = db.open_tree("meta").store_context("open meta tree")?;
        Ok(Self {
            db,
            snapshots,
            payloads,
            meta,
            compression_level: config.embedded.compression_level,
        })
    }

    fn entry(&self, id: SnapshotId) -> Result<Entry> {
        let raw = self
            .snapshots
            .get(id.key())
            .with_store_context(|| format!("read snapshot {}", id))?
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))?;
        serde_json::from_slice(&raw).with_store_context(|| format!("decode snapshot {}", id))
    }

    fn write(&self, id: SnapshotId, entry: &Entry, payload: Option<&[u8]>) -> Result<()> {
        let encoded = serde_json::to_vec(entry).store_context("encode snapshot")?;
        let key = id.key();
        (&self.snapshots, &self.payloads, &self.meta)
            .transaction(|(snapshots, payloads, meta)| {
                if let Some(payload) = payload {
                    payloads.insert(&key[..], payload)?;
                }
                snapshots.insert(&key[..], encoded.as_slice())?;
                meta.insert(HEAD, &key[..])?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| Error::store(format!("write snapshot {}", id), format!("{:?}", e)))
    }

    fn genesis(&self) -> Result<SnapshotId> {
        for snapshot in self.walk_from_head()? {
            let snapshot = snapshot?;
            if snapshot.record == Record::Genesis {
                return Ok(snapshot.handle);
            }
        }
        Err(Error::store(
            "find genesis snapshot",
            "chain does not end in a genesis snapshot",
        ))
    }
}

struct EmbeddedWalk<'a> {
    store: &'a EmbeddedStore,
    next: Option<SnapshotId>,
}

impl Iterator for EmbeddedWalk<'_> {
    type Item = Result<Snapshot<SnapshotId>>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.store.entry(id) {
            Ok(entry) => {
                self.next = entry.parent;
                Some(Ok(Snapshot {
                    handle: id,
                    record: entry.record,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl SnapshotStore for EmbeddedStore {
    type Handle = SnapshotId;

    fn init(location: &Path, config: &Config) -> Result<Self> {
        if Self::exists(location) {
            return Err(Error::AlreadyExists(location.to_path_buf()));
        }
        let db = sled::open(location)
            .with_store_context(|| format!("create sled database at {}", location.display()))?;
        let store = Self::from_db(db, config)?;
        let id = SnapshotId(store.db.generate_id().store_context("allocate snapshot id")?);
        store.write(
            id,
            &Entry {
                parent: None,
                record: Record::Genesis,
            },
            None,
        )?;
        info!("created embedded store at {}", location.display());
        Ok(store)
    }

    fn open(location: &Path, config: &Config) -> Result<Self> {
        if !Self::exists(location) {
            return Err(Error::NotFound(format!("no store at {}", location.display())));
        }
        let db = sled::open(location)
            .with_store_context(|| format!("open sled database at {}", location.display()))?;
        let store = Self::from_db(db, config)?;
        if store.meta.get(HEAD).store_context("read head")?.is_none() {
            return Err(Error::NotFound(format!(
                "no snapshot chain at {}",
                location.display()
            )));
        }
        Ok(store)
    }

    fn create_snapshot(
        &mut self,
        parent: &SnapshotId,
        record: &Record,
        payload: &[u8],
    ) -> Result<SnapshotId> {
        let compressed = if payload.is_empty() {
            None
        } else {
            Some(zstd::encode_all(payload, self.compression_level).store_context("compress payload")?)
        };
        let id = SnapshotId(self.db.generate_id().store_context("allocate snapshot id")?);
        let entry = Entry {
            parent: Some(*parent),
            record: record.clone(),
        };
        self.write(id, &entry, compressed.as_deref())?;
        debug!("stored snapshot {} ({} bytes)", id, payload.len());
        Ok(id)
    }

    fn fetch_payload(&self, handle: &SnapshotId) -> Result<Vec<u8>> {
        let compressed = self
            .payloads
            .get(handle.key())
            .with_store_context(|| format!("read payload of snapshot {}", handle))?
            .ok_or_else(|| Error::NotFound(format!("snapshot {} carries no value", handle)))?;
        zstd::decode_all(compressed.as_ref())
            .with_store_context(|| format!("decompress payload of snapshot {}", handle))
    }

    fn head(&self) -> Result<SnapshotId> {
        let raw = self
            .meta
            .get(HEAD)
            .store_context("read head")?
            .ok_or_else(|| Error::store("read head", "store has no head"))?;
        SnapshotId::from_key(&raw)
    }

    fn walk_from_head(&self) -> Result<Walk<'_, SnapshotId>> {
        Ok(Box::new(EmbeddedWalk {
            store: self,
            next: Some(self.head()?),
        }))
    }

    fn compact(&mut self, live: &[SnapshotId]) -> Result<Compaction<SnapshotId>> {
        let genesis = self.genesis()?;
        let mut relinked = Vec::with_capacity(live.len());
        let mut parent = genesis;
        for &id in live {
            let mut entry = self.entry(id)?;
            entry.parent = Some(parent);
            let encoded = serde_json::to_vec(&entry).store_context("encode snapshot")?;
            relinked.push((id.key(), encoded));
            parent = id;
        }
        let head = parent.key();

        // every relink and the head move land in one transaction
        (&self.snapshots, &self.meta)
            .transaction(|(snapshots, meta)| {
                for (key, encoded) in &relinked {
                    snapshots.insert(&key[..], encoded.as_slice())?;
                }
                meta.insert(HEAD, &head[..])?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| Error::store("relink live snapshots", format!("{:?}", e)))?;

        let keep: HashSet<SnapshotId> = live.iter().copied().chain(Some(genesis)).collect();
        let mut doomed = Vec::new();
        for item in self.snapshots.iter() {
            let (key, _) = item.store_context("scan snapshots")?;
            let id = SnapshotId::from_key(&key)?;
            if !keep.contains(&id) {
                doomed.push(id);
            }
        }
        let mut snapshots = Batch::default();
        let mut payloads = Batch::default();
        for id in &doomed {
            snapshots.remove(&id.key()[..]);
            payloads.remove(&id.key()[..]);
        }
        self.snapshots
            .apply_batch(snapshots)
            .store_context("remove unreachable snapshots")?;
        self.payloads
            .apply_batch(payloads)
            .store_context("remove unreachable payloads")?;
        self.db.flush().store_context("flush")?;

        info!(
            "compacted embedded store: {} snapshots kept, {} reclaimed",
            live.len(),
            doomed.len()
        );
        Ok(Compaction {
            handles: live.to_vec(),
            reclaimed: doomed.len(),
        })
    }

    fn close(self) -> Result<()> {
        self.db.flush().store_context("flush")?;
        Ok(())
    }
}
