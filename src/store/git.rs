use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use git2::{Commit, ErrorCode, Oid, Repository, Signature, Sort, Time};
use log::{debug, info};

use super::{Compaction, Record, Snapshot, SnapshotStore, Walk};
use crate::config::Config;
use crate::error::{Error, Result, StoreContext};

const AUTHOR: &str = "zeitdb";
const EMAIL: &str = "zeitdb@localhost";
const VALUE: &str = "value";
const SUBJECT_PREFIX: &str = "zeitdb ";

/// Snapshot chain kept as commits on `HEAD` of a bare git repository.
///
/// Each commit message holds a subject line plus the JSON-encoded [`Record`];
/// put payloads live in a blob named `value` in the commit tree.
pub struct GitStore {
    repo: Repository,
}

impl GitStore {
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    fn signature(record: &Record) -> Result<Signature<'static>> {
        let time = Time::new(record.time().timestamp(), 0);
        Signature::new(AUTHOR, EMAIL, &time).store_context("build commit signature")
    }

    fn find_commit(&self, oid: Oid) -> Result<Commit<'_>> {
        self.repo.find_commit(oid).map_err(|e| match e.code() {
            ErrorCode::NotFound => Error::NotFound(format!("snapshot {}", oid)),
            _ => Error::store(format!("look up snapshot {}", oid), e),
        })
    }

    fn snapshot(&self, oid: Oid) -> Result<Snapshot<Oid>> {
        let commit = self.find_commit(oid)?;
        let record = decode_message(commit.message().unwrap_or_default())
            .map_err(|e| Error::store(format!("decode snapshot {}", oid), e))?;
        Ok(Snapshot { handle: oid, record })
    }

    fn genesis(&self) -> Result<Oid> {
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

    /// Deletes loose objects that are not reachable from `HEAD`.
    fn prune(&self) -> Result<usize> {
        let mut reachable = HashSet::new();
        let mut walk = self.repo.revwalk().store_context("start prune walk")?;
        walk.push_head().store_context("start prune walk")?;
        for oid in walk {
            let oid = oid.store_context("walk chain")?;
            let commit = self.find_commit(oid)?;
            let tree = commit.tree().store_context("read snapshot tree")?;
            reachable.insert(oid);
            reachable.insert(tree.id());
            reachable.extend(tree.iter().map(|entry| entry.id()));
        }

        let mut objects = Vec::new();
        self.repo
            .odb()
            .and_then(|odb| {
                odb.foreach(|oid| {
                    objects.push(*oid);
                    true
                })
            })
            .store_context("list objects")?;

        let dir = self.repo.path().join("objects");
        let mut reclaimed = 0;
        for oid in objects.into_iter().filter(|oid| !reachable.contains(oid)) {
            let hex = oid.to_string();
            let path = dir.join(&hex[..2]).join(&hex[2..]);
            match fs::remove_file(&path) {
                Ok(()) => reclaimed += 1,
                // packed or already gone
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::store(
                        format!("remove object {}", path.display()),
                        e,
                    ))
                }
            }
        }
        Ok(reclaimed)
    }
}

fn subject(record: &Record) -> &'static str {
    match record {
        Record::Genesis => "zeitdb create",
        Record::Put { .. } => "zeitdb put",
        Record::Tombstone { .. } => "zeitdb delete",
    }
}

fn encode_message(record: &Record) -> Result<String> {
    let body = serde_json::to_string(record).store_context("encode record")?;
    Ok(format!("{}\n\n{}\n", subject(record), body))
}

fn decode_message(message: &str) -> std::result::Result<Record, String> {
    let (head, body) = message
        .split_once("\n\n")
        .ok_or_else(|| "missing record body".to_string())?;
    if !head.starts_with(SUBJECT_PREFIX) {
        return Err(format!("unexpected subject {:?}", head));
    }
    let record: Record = serde_json::from_str(body.trim()).map_err(|e| e.to_string())?;
    if subject(&record) != head {
        return Err(format!("subject {:?} does not match record", head));
    }
    Ok(record)
}

impl SnapshotStore for GitStore {
    type Handle = Oid;

    fn init(location: &Path, config: &Config) -> Result<Self> {
        if Repository::open(location).is_ok() {
            return Err(Error::AlreadyExists(location.to_path_buf()));
        }
        let repo = Repository::init_bare(location)
            .with_store_context(|| format!("init repository at {}", location.display()))?;
        repo.config()
            .and_then(|mut cfg| cfg.set_i32("core.compression", config.git.compression))
            .store_context("set core.compression")?;

        {
            let tree_id = repo
                .treebuilder(None)
                .and_then(|tb| tb.write())
                .store_context("write genesis tree")?;
            let tree = repo.find_tree(tree_id).store_context("write genesis tree")?;
            let sig = Self::signature(&Record::Genesis)?;
            repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &encode_message(&Record::Genesis)?,
                &tree,
                &[],
            )
            .store_context("write genesis snapshot")?;
        }

        info!("created git store at {}", location.display());
        Ok(Self { repo })
    }

    fn open(location: &Path, _config: &Config) -> Result<Self> {
        let repo = Repository::open(location).map_err(|e| match e.code() {
            ErrorCode::NotFound => {
                Error::NotFound(format!("no store at {}", location.display()))
            }
            _ => Error::store(format!("open repository at {}", location.display()), e),
        })?;
        Ok(Self { repo })
    }

    fn create_snapshot(&mut self, parent: &Oid, record: &Record, payload: &[u8]) -> Result<Oid> {
        let mut tb = self.repo.treebuilder(None).store_context("build snapshot tree")?;
        if !payload.is_empty() {
            let blob = self.repo.blob(payload).store_context("write payload blob")?;
            tb.insert(VALUE, blob, git2::FileMode::Blob.into())
                .store_context("build snapshot tree")?;
        }
        let tree_id = tb.write().store_context("write snapshot tree")?;
        let tree = self.repo.find_tree(tree_id).store_context("write snapshot tree")?;
        let parent = self.find_commit(*parent)?;
        let sig = Self::signature(record)?;

        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &sig,
                &sig,
                &encode_message(record)?,
                &tree,
                &[&parent],
            )
            .store_context("write snapshot commit")?;
        debug!("committed {} as {}", subject(record), oid);
        Ok(oid)
    }

    fn fetch_payload(&self, handle: &Oid) -> Result<Vec<u8>> {
        let commit = self.find_commit(*handle)?;
        let tree = commit.tree().store_context("read snapshot tree")?;
        let entry = tree
            .get_name(VALUE)
            .ok_or_else(|| Error::NotFound(format!("snapshot {} carries no value", handle)))?;
        let blob = self
            .repo
            .find_blob(entry.id())
            .with_store_context(|| format!("read payload of snapshot {}", handle))?;
        Ok(blob.content().to_vec())
    }

    fn head(&self) -> Result<Oid> {
        let head = self.repo.head().store_context("resolve HEAD")?;
        head.target()
            .ok_or_else(|| Error::store("resolve HEAD", "HEAD is not a direct reference"))
    }

    fn walk_from_head(&self) -> Result<Walk<'_, Oid>> {
        let mut walk = self.repo.revwalk().store_context("start chain walk")?;
        walk.set_sorting(Sort::TOPOLOGICAL)
            .store_context("start chain walk")?;
        walk.push_head().store_context("start chain walk")?;
        Ok(Box::new(walk.map(move |oid| {
            let oid = oid.store_context("walk chain")?;
            self.snapshot(oid)
        })))
    }

    fn compact(&mut self, live: &[Oid]) -> Result<Compaction<Oid>> {
        let mut parent = self.find_commit(self.genesis()?)?;
        let mut handles = Vec::with_capacity(live.len());
        for oid in live {
            let old = self.find_commit(*oid)?;
            let tree = old.tree().store_context("read snapshot tree")?;
            let message = old.message().unwrap_or_default();
            let new = self
                .repo
                .commit(None, &old.author(), &old.committer(), message, &tree, &[&parent])
                .with_store_context(|| format!("rewrite snapshot {}", oid))?;
            parent = self.find_commit(new)?;
            handles.push(new);
        }

        self.repo
            .head()
            .and_then(|mut head| head.set_target(parent.id(), "zeitdb compact").map(|_| ()))
            .store_context("move HEAD")?;

        let reclaimed = self.prune()?;
        info!(
            "compacted git store: {} snapshots kept, {} objects reclaimed",
            handles.len(),
            reclaimed
        );
        Ok(Compaction { handles, reclaimed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn ts(secs: i64) -> crate::store::Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 500).unwrap()
    }

    fn init(dir: &TempDir) -> GitStore {
        GitStore::init(&dir.path().join("db"), &Config::default()).unwrap()
    }

    #[test]
    fn test_init_writes_genesis() {
        let dir = TempDir::new().unwrap();
        let store = init(&dir);
        let chain: Vec<_> = store.walk_from_head().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].record, Record::Genesis);
        assert_eq!(chain[0].handle, store.head().unwrap());
        let commit = store.repository().find_commit(chain[0].handle).unwrap();
        assert_eq!(commit.time().seconds(), 0);
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        let _store = init(&dir);
        let err = GitStore::init(&dir.path().join("db"), &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = GitStore::open(&dir.path().join("nope"), &Config::default())
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_sub_second_time() {
        let dir = TempDir::new().unwrap();
        let mut store = init(&dir);
        let head = store.head().unwrap();
        let rec = Record::Put { at: ts(3) };
        let oid = store.create_snapshot(&head, &rec, b"hello").unwrap();

        assert_eq!(store.head().unwrap(), oid);
        assert_eq!(store.fetch_payload(&oid).unwrap(), b"hello");
        let first = store.walk_from_head().unwrap().next().unwrap().unwrap();
        assert_eq!(first.record, rec);

        let commit = store.repository().find_commit(oid).unwrap();
        assert_eq!(commit.author().when().seconds(), ts(3).timestamp());
        assert_eq!(commit.parent_id(0).unwrap(), head);
    }

    #[test]
    fn test_walk_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut store = init(&dir);
        for i in 0..3 {
            let head = store.head().unwrap();
            store
                .create_snapshot(&head, &Record::Put { at: ts(i) }, format!("v{}", i).as_bytes())
                .unwrap();
        }
        let records: Vec<_> = store
            .walk_from_head()
            .unwrap()
            .map(|s| s.unwrap().record)
            .collect();
        assert_eq!(
            records,
            vec![
                Record::Put { at: ts(2) },
                Record::Put { at: ts(1) },
                Record::Put { at: ts(0) },
                Record::Genesis,
            ]
        );
    }

    #[test]
    fn test_fetch_payload_of_genesis_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = init(&dir);
        let err = store.fetch_payload(&store.head().unwrap()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_foreign_commit_is_rejected() {
        assert!(decode_message("initial commit\n").is_err());
        assert!(decode_message("zeitdb put\n\n{\"kind\":\"genesis\"}").is_err());
        assert_eq!(
            decode_message("zeitdb create\n\n{\"kind\":\"genesis\"}\n"),
            Ok(Record::Genesis)
        );
    }

    #[test]
    fn test_compact_drops_unlisted_snapshots() {
        let dir = TempDir::new().unwrap();
        let mut store = init(&dir);
        let mut oids = Vec::new();
        for i in 0..3 {
            let head = store.head().unwrap();
            let payload = format!("payload {}", i);
            oids.push(
                store
                    .create_snapshot(&head, &Record::Put { at: ts(i) }, payload.as_bytes())
                    .unwrap(),
            );
        }

        let kept = vec![oids[0], oids[2]];
        let compaction = store.compact(&kept).unwrap();
        assert_eq!(compaction.handles.len(), 2);
        // dropped commit, its tree and blob, plus the rewritten third commit
        assert!(compaction.reclaimed >= 3);

        let records: Vec<_> = store
            .walk_from_head()
            .unwrap()
            .map(|s| s.unwrap().record)
            .collect();
        assert_eq!(
            records,
            vec![Record::Put { at: ts(2) }, Record::Put { at: ts(0) }, Record::Genesis]
        );
        assert_eq!(
            store.fetch_payload(&compaction.handles[1]).unwrap(),
            b"payload 2"
        );
        let hex = oids[1].to_string();
        let loose = store
            .repository()
            .path()
            .join("objects")
            .join(&hex[..2])
            .join(&hex[2..]);
        assert!(!loose.exists());
    }
}
