//! lumokv: an embedded, single-writer multi-reader MVCC key-value store.
//!
//! Data lives in one memory-mapped file of fixed-size pages organised as
//! copy-on-write B-trees. Readers see the snapshot that was current when they
//! began; the one writer builds the next snapshot and publishes it through
//! one of two meta pages.
//!
//! ```no_run
//! use lumokv::{Database, EnvConfig, Environment, TableOptions};
//!
//! # fn main() -> lumokv::Result<()> {
//! let env = Environment::open("/tmp/lumokv-demo", EnvConfig::default())?;
//! let mut txn = env.begin_rw_txn()?;
//! let db = Database::create(&mut txn, Some("fruit"), TableOptions::create())?;
//! db.insert(&mut txn, b"apple", b"red")?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! assert_eq!(db.get(&txn, b"apple")?.as_deref(), Some(&b"red"[..]));
//! # Ok(())
//! # }
//! ```

mod btree;
mod config;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod flock;
mod meta;
mod midl;
mod page;
mod snapshot;
mod store;
mod transaction;
mod types;
mod value;

pub use config::{
    os_page_size, DupOptions, Durability, EnvConfig, GcPolicy, Geometry, KeyOrder, TableOptions,
};
pub use constants::{
    DbFlags, EnvFlags, WriteFlags, DATA_VERSION, MAX_PAGE_SIZE, MIN_PAGE_SIZE, VERSION_MAJOR,
    VERSION_MINOR, VERSION_PATCH,
};
pub use cursor::{Cursor, Iter, Pair};
pub use database::Database;
pub use env::Environment;
pub use error::{Error, Result};
pub use transaction::Transaction;
pub use types::{CursorOp, EnvInfo, ReaderInfo, RemoveMode, Stat};
pub use value::{Key, TypedDatabase, Value};
