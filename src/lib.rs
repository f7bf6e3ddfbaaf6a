//! snapkv: an embedded transactional key/value engine.
//!
//! All keys live in an ordered copy-on-write tree. Every commit publishes a
//! new immutable snapshot, so readers never block and never see partial
//! writes, while a single writer at a time appends its changes to a
//! transaction log. Small values are kept inside the index, larger ones stay
//! where the log wrote them until the compactor moves them out of mostly
//! obsolete files.
//!
//! # Features
//!
//! * Snapshot isolated transactions with a single, FIFO admitted writer
//! * Ordered cursors that stay coherent while other cursors modify the tree
//! * Crash recovery from key index snapshots plus transaction log replay
//! * Background compaction with rate limits and cooperative cancellation
//! * Optional snappy compression of keys, values and key index files
//!
//! # Basic Usage
//!
//! ```
//! use snapkv::{db::KeyValueDb, option::Options};
//!
//! let dir = tempfile::tempdir().expect("failed to create temp dir");
//! let mut opts = Options::default();
//! opts.dir_path = dir.path().to_path_buf();
//! let db = KeyValueDb::open(opts).expect("failed to open snapkv");
//!
//! let tx = db.start_writing_transaction().expect("failed to start transaction");
//! tx.put(b"hello", b"world").expect("failed to put");
//! tx.commit().expect("failed to commit");
//!
//! let tx = db.start_read_only_transaction().expect("failed to start transaction");
//! let value = tx.get(b"hello").expect("failed to get");
//! assert_eq!(value.as_deref(), Some(&b"world"[..]));
//! ```

mod data;

mod fio;
mod index;
mod recovery;
mod root;
mod scheduler;

pub mod compactor;
pub mod compression;
pub mod cursor;
pub mod db;
#[cfg(test)]
mod db_test;
pub mod errors;
pub mod option;
pub mod transaction;
pub mod util;
