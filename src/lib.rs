//! # TetherDB
//!
//! **Embedded, async, document-style key-value store for resource-constrained Rust.**
//!
//! TetherDB stores JSON documents under string keys with native TTL expiry,
//! tag-based and predicate queries, and a choice of backing: a volatile
//! in-memory arena or a persistent file-backed B-tree. A single cooperative
//! worker serialises every mutation, so the store behaves identically on a
//! `current_thread` runtime and never blocks your `tokio` executor.
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use tetherdb::TetherDb;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = TetherDb::new().await?;
//!
//!     // Write with an engine-generated key
//!     let doc = json!({"name": "John", "age": 30}).as_object().unwrap().clone();
//!     let key = db.put(doc).await?;
//!
//!     // Read
//!     let value = db.get(&key).await?;
//!     assert!(value.is_some());
//!
//!     // Query with MongoDB-style predicates
//!     let adults = db.query(json!({"age": {"$gte": 18}})).await?;
//!     assert_eq!(adults.len(), 1);
//!
//!     // Delete
//!     db.delete(&key).await?;
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Guarantees
//!
//! - **Ordered**: queries emit documents in tree key order
//! - **TTL Native**: expired records are never returned, even before a sweep
//!   physically reclaims them; TTLs survive restarts on file backings
//! - **Serialised Writes**: one cooperative worker applies mutations in
//!   enqueue order; reads hold a shared lease the worker waits out
//! - **Bounded Memory**: fixed-size page cache, min-heap TTL index, and a
//!   backpressured operation queue
//! - **Best-Effort Durability**: adaptive flush cadence with checksummed
//!   pages; torn writes surface as `Corrupt`, never as silent misreads
//!
//! ## Configuration
//!
//! ```no_run
//! # use std::time::Duration;
//! # use tetherdb::TetherDb;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = TetherDb::builder()
//!     .filename("./data.db")
//!     .btree_pagesize(1024)
//!     .btree_cachesize(64)
//!     .ttl_check_interval(Duration::from_secs(30))
//!     .open()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, TetherError>`:
//!
//! ```no_run
//! # use tetherdb::{TetherDb, TetherError};
//! # async fn example(db: &TetherDb) -> Result<(), Box<dyn std::error::Error>> {
//! match db.get("user:100").await {
//!     Ok(Some(doc)) => println!("Found: {doc:?}"),
//!     Ok(None) => println!("Not found"),
//!     Err(TetherError::Io(e)) => eprintln!("I/O error: {e}"),
//!     Err(TetherError::Corrupt(msg)) => eprintln!("Data corruption: {msg}"),
//!     Err(err) => eprintln!("{err}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! TetherDB layers a document store over a paged B+ tree:
//! - Byte-addressable **Backing** (growable memory arena or file)
//! - Paged **B-tree** with leaf chaining, overflow chains for large
//!   documents, per-page CRC32, and an LRU page cache
//! - **TTL index**: an in-memory min-heap over persisted side entries
//! - **Query engine** evaluating predicate documents during ordered scans
//! - A single cooperative **worker** draining the operation queue with
//!   adaptive flush and periodic expiry sweeps

#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

pub(crate) mod backing;
pub(crate) mod btree;
pub(crate) mod cache;
pub(crate) mod codec;
pub(crate) mod config;
pub(crate) mod engine;
pub(crate) mod errors;
pub(crate) mod flush;
pub(crate) mod helpers;
pub(crate) mod page;
pub(crate) mod query;
pub(crate) mod stats;
pub(crate) mod store;
pub(crate) mod ttl;
pub(crate) mod worker;

pub use codec::Document;
pub use config::{Builder, Config};
pub use errors::{Result, TetherError};
pub use stats::TetherStats;
pub use store::{BatchTtl, PutOptions, TetherDb};
