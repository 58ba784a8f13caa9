//! zeitdb: a time-indexed key/value store.
//!
//! Values are written under a timestamp and read back with a floor lookup:
//! the value current at, or most recently before, the queried instant. Every
//! write is an immutable snapshot appended to a chain kept by a
//! [`SnapshotStore`]; the in-memory [`TimeIndex`] is rebuilt from that chain
//! whenever a [`Database`] is opened.
//!
//! ```no_run
//! use chrono::Utc;
//! use zeitdb::GitDatabase;
//!
//! # fn main() -> zeitdb::Result<()> {
//! let mut db = GitDatabase::create("/tmp/zeit")?;
//! let t = Utc::now();
//! db.put(t, b"value 1")?;
//! assert_eq!(db.get(t)?, b"value 1");
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod chronos;
pub mod config;
pub mod db;
pub mod error;
pub mod store;

pub use chronos::{Clock, FixedClock, SystemClock, TimeIndex};
pub use config::{Backend, Config};
pub use db::{CompactReport, Database, EmbeddedDatabase, GitDatabase};
pub use error::{Error, Result};
pub use store::{EmbeddedStore, GitStore, SnapshotStore, TimeRange, Timestamp};
