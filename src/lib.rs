//! Embedded, single-file, transactional key/value store built on a
//! copy-on-write B+tree over a memory-mapped file.
//!
//! Data lives in ordered buckets of arbitrary byte keys and values; buckets
//! nest. One writable transaction runs at a time alongside any number of
//! read transactions, and a two-meta-page commit protocol keeps the file
//! consistent across crashes.
//!
//! ```no_run
//! use cowdb::{Db, Options};
//!
//! # fn main() -> cowdb::Result<()> {
//! let db = Db::open("app.db", Options::default())?;
//! db.update(|tx| {
//!     let mut bucket = tx.create_bucket_if_not_exists(b"widgets")?;
//!     bucket.put(b"foo", b"bar")?;
//!     Ok(())
//! })?;
//! db.view(|tx| {
//!     let bucket = tx.bucket(b"widgets")?;
//!     assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod bucket;
mod config;
mod cursor;
mod db;
mod error;
mod freelist;
mod meta;
mod node;
mod page;
mod tx;

pub use bucket::{Bucket, BucketMut, BucketStats};
pub use config::{Key, PageId, TxId, Value};
pub use cursor::{Cursor, CursorMut};
pub use db::{Db, DbStats, Options};
pub use error::{Error, Result};
pub use tx::Tx;
