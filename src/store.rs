use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, mpsc, oneshot};

use crate::backing::Backing;
use crate::btree::BTree;
use crate::codec::Document;
use crate::config::{Builder, Config};
use crate::engine::Engine;
use crate::errors::{Result, TetherError};
use crate::flush::FlushTracker;
use crate::helpers::{get_now, get_now_micros};
use crate::page::MAX_KEY_SIZE;
use crate::stats::TetherStats;
use crate::worker::{OpKind, OpOutput, Operation, Worker, WorkerConfig};

/// Longest caller-supplied key; the reserved side-entry prefix (5 bytes)
/// must still fit inside the tree's key budget
const MAX_RECORD_KEY: usize = MAX_KEY_SIZE - 5;

/// Operation queue depth; senders park here under load (backpressure)
const QUEUE_DEPTH: usize = 64;

/// Options for a put: time-to-live and tags
#[derive(Debug, Default, Clone)]
pub struct PutOptions {
    ttl: Option<Duration>,
    tags: Vec<String>,
}

impl PutOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire the record this long after the write
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Tags stored into the document's reserved `_tags` field
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-batch TTL assignment for `put_batch`
#[derive(Debug, Clone, Default)]
pub enum BatchTtl {
    /// No item expires
    #[default]
    None,
    /// One TTL applied to every item
    Uniform(Duration),
    /// Positionally aligned per-item TTLs; length must match the batch
    PerItem(Vec<Option<Duration>>),
}

/// Embedded document store: JSON documents under string keys, TTL expiry,
/// and predicate queries over a B-tree backing.
///
/// Cloning is cheap; clones share the same store.
///
/// # Examples
///
/// ```no_run
/// use serde_json::json;
/// use tetherdb::TetherDb;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db = TetherDb::new().await?;
///
///     let doc = json!({"name": "John", "age": 30});
///     let key = db.put(doc.as_object().unwrap().clone()).await?;
///
///     let fetched = db.get(&key).await?;
///     assert!(fetched.is_some());
///
///     db.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct TetherDb {
    inner: Arc<Shared>,
}

struct Shared {
    tx: mpsc::Sender<Operation>,
    state: Arc<RwLock<Engine>>,
    closed: AtomicBool,
    lock_timeout: Duration,
    op_timeout: Option<Duration>,
    key_counter: AtomicU64,
}

impl TetherDb {
    /// Open a volatile in-memory store with default configuration.
    ///
    /// For custom configuration, see [`TetherDb::builder`].
    pub async fn new() -> Result<Self> {
        Self::open_with_config(Config::default()).await
    }

    /// Open a persistent store backed by the given file.
    ///
    /// The file is created when absent; an existing file must contain a
    /// valid tree or the open fails with `Corrupt`.
    pub async fn with_file(path: impl Into<PathBuf>) -> Result<Self> {
        let config =
            Config { filename: Some(path.into()), in_memory: false, ..Config::default() };
        Self::open_with_config(config).await
    }

    /// Builder for custom configuration
    ///
    /// ```no_run
    /// # use tetherdb::TetherDb;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = TetherDb::builder()
    ///     .filename("./data.db")
    ///     .btree_pagesize(1024)
    ///     .open()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Scoped acquisition: open the store, run `f`, and close on every exit
    /// path.
    ///
    /// ```no_run
    /// # use serde_json::json;
    /// # use tetherdb::{Config, TetherDb};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let count = TetherDb::scoped(Config::default(), |db| async move {
    ///     db.put(json!({"v": 1}).as_object().unwrap().clone()).await?;
    ///     db.len().await
    /// })
    /// .await?;
    /// assert_eq!(count, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn scoped<F, Fut, T>(config: Config, f: F) -> Result<T>
    where
        F: FnOnce(TetherDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let db = Self::open_with_config(config).await?;
        let result = f(db.clone()).await;
        let closed = db.close().await;
        match result {
            Ok(value) => closed.map(|()| value),
            err => err,
        }
    }

    pub(crate) async fn open_with_config(config: Config) -> Result<Self> {
        config.validate()?;

        let backing = if config.in_memory {
            Backing::memory(config.ram_percentage)
        } else {
            let Some(path) = config.filename.as_ref() else {
                return Err(TetherError::Encoding(
                    "filename is required for file-backed storage".into(),
                ));
            };
            Backing::open_file(path).await?
        };

        let btree = BTree::open(backing, config.btree_pagesize, config.btree_cachesize).await?;
        let ttl_index = Engine::load_ttl_index(&btree).await?;
        let flush = FlushTracker::new(config.adaptive_threshold, config.auto_flush());

        let mut engine = Engine::new(btree, ttl_index, flush);
        // Reclaim entries that expired while the store was closed
        engine.sweep(get_now()).await?;

        let state = Arc::new(RwLock::new(engine));
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        let worker = Worker::new(
            Arc::clone(&state),
            rx,
            WorkerConfig {
                lock_timeout: config.lock_timeout,
                max_retries: config.max_retries,
                retry_delay: config.retry_delay,
                ttl_check_interval: config.ttl_check_interval,
                cleanup_interval: config.cleanup_interval,
            },
        );
        tokio::spawn(worker.run());

        Ok(Self {
            inner: Arc::new(Shared {
                tx,
                state,
                closed: AtomicBool::new(false),
                lock_timeout: config.lock_timeout,
                op_timeout: config.op_timeout,
                key_counter: AtomicU64::new(0),
            }),
        })
    }

    /// Store a document under an engine-generated key
    pub async fn put(&self, doc: Document) -> Result<String> {
        self.put_with(doc, PutOptions::new()).await
    }

    /// Store a document under an engine-generated key, with TTL and tags
    ///
    /// ```no_run
    /// # use std::time::Duration;
    /// # use serde_json::json;
    /// # use tetherdb::{PutOptions, TetherDb};
    /// # async fn example(db: &TetherDb) -> Result<(), Box<dyn std::error::Error>> {
    /// let doc = json!({"temp": 22.5}).as_object().unwrap().clone();
    /// let key = db
    ///     .put_with(doc, PutOptions::new().ttl(Duration::from_secs(3600)).tags(["sensor"]))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn put_with(&self, doc: Document, options: PutOptions) -> Result<String> {
        let key = self.generate_key();
        self.enqueue_put(key, doc, options).await
    }

    /// Store a document under a caller-supplied key, overwriting any prior
    /// document and cancelling its TTL
    pub async fn put_keyed(&self, key: &str, doc: Document) -> Result<String> {
        self.put_keyed_with(key, doc, PutOptions::new()).await
    }

    /// Caller-supplied key form of [`TetherDb::put_with`]
    pub async fn put_keyed_with(
        &self,
        key: &str,
        doc: Document,
        options: PutOptions,
    ) -> Result<String> {
        validate_record_key(key)?;
        self.enqueue_put(key.to_string(), doc, options).await
    }

    async fn enqueue_put(&self, key: String, doc: Document, options: PutOptions) -> Result<String> {
        let ttl = options.ttl.filter(|ttl| !ttl.is_zero());
        let kind = OpKind::Put { key, doc, ttl, tags: options.tags };
        match self.enqueue(kind).await? {
            OpOutput::Key(key) => Ok(key),
            _ => Err(TetherError::Encoding("unexpected put completion".into())),
        }
    }

    /// Retrieve a document. Missing and expired-but-unswept records both
    /// read as `None`.
    pub async fn get(&self, key: &str) -> Result<Option<Document>> {
        if validate_record_key(key).is_err() {
            return Ok(None);
        }
        let engine = self.read_lock().await?;
        engine.get(key, get_now()).await
    }

    /// Delete a record; returns whether a live record existed.
    /// TTL-expired records are treated as already gone.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if validate_record_key(key).is_err() {
            return Ok(false);
        }
        match self.enqueue(OpKind::Delete { key: key.to_string() }).await? {
            OpOutput::Existed(existed) => Ok(existed),
            _ => Err(TetherError::Encoding("unexpected delete completion".into())),
        }
    }

    /// Remove every record and clear TTL state; returns the records removed
    pub async fn purge(&self) -> Result<usize> {
        match self.enqueue(OpKind::Purge).await? {
            OpOutput::Count(count) => Ok(count),
            _ => Err(TetherError::Encoding("unexpected purge completion".into())),
        }
    }

    /// Store a batch of documents under engine-generated keys.
    ///
    /// The returned keys are positionally aligned with the input. The batch
    /// is all-or-nothing at the result level: one oversized item fails the
    /// whole batch.
    pub async fn put_batch(&self, items: Vec<Document>, ttls: BatchTtl) -> Result<Vec<String>> {
        let ttl_list = expand_batch_ttls(&ttls, items.len())?;
        let items = items
            .into_iter()
            .zip(ttl_list)
            .map(|(doc, ttl)| (self.generate_key(), doc, ttl))
            .collect();

        match self.enqueue(OpKind::PutBatch { items }).await? {
            OpOutput::Keys(keys) => Ok(keys),
            _ => Err(TetherError::Encoding("unexpected batch completion".into())),
        }
    }

    /// Delete a batch of keys; returns how many live records were removed
    pub async fn delete_batch(&self, keys: Vec<String>) -> Result<usize> {
        match self.enqueue(OpKind::DeleteBatch { keys }).await? {
            OpOutput::Count(count) => Ok(count),
            _ => Err(TetherError::Encoding("unexpected batch completion".into())),
        }
    }

    /// Evaluate a predicate document over the store.
    ///
    /// Results follow tree key order; a top-level `$limit` bounds them.
    ///
    /// ```no_run
    /// # use serde_json::json;
    /// # use tetherdb::TetherDb;
    /// # async fn example(db: &TetherDb) -> Result<(), Box<dyn std::error::Error>> {
    /// let adults = db.query(json!({"age": {"$gte": 18}, "$limit": 10})).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query(&self, predicate: Value) -> Result<Vec<Document>> {
        let engine = self.read_lock().await?;
        engine.query(&predicate, get_now()).await
    }

    /// Drive one TTL sweep synchronously; returns the records reclaimed
    pub async fn cleanup(&self) -> Result<usize> {
        match self.enqueue(OpKind::Cleanup).await? {
            OpOutput::Count(count) => Ok(count),
            _ => Err(TetherError::Encoding("unexpected cleanup completion".into())),
        }
    }

    /// Force a durability barrier
    pub async fn flush(&self) -> Result<()> {
        self.enqueue(OpKind::Flush).await.map(|_| ())
    }

    /// Count live records
    ///
    /// **Note**: This is an O(N) operation—scans all keys.
    pub async fn len(&self) -> Result<usize> {
        let engine = self.read_lock().await?;
        engine.count(get_now()).await
    }

    /// Check if the store holds no live records
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Store statistics
    pub async fn stats(&self) -> Result<TetherStats> {
        let engine = self.read_lock().await?;
        Ok(TetherStats::new(&engine))
    }

    /// Drain pending operations, flush, and stop the worker. Idempotent;
    /// operations submitted afterwards fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        let op = Operation { kind: OpKind::Close, deadline: None, reply };
        if self.inner.tx.send(op).await.is_err() {
            // Worker already exited; nothing left to drain
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Ok(()),
        }
    }

    async fn enqueue(&self, kind: OpKind) -> Result<OpOutput> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TetherError::Closed);
        }

        let deadline = self.inner.op_timeout.map(|timeout| Instant::now() + timeout);
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Operation { kind, deadline, reply })
            .await
            .map_err(|_| TetherError::Closed)?;
        rx.await.map_err(|_| TetherError::Closed)?
    }

    /// Shared lease for reads and queries; excludes worker mutations for
    /// its lifetime
    async fn read_lock(&self) -> Result<RwLockReadGuard<'_, Engine>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TetherError::Closed);
        }
        tokio::time::timeout(self.inner.lock_timeout, self.inner.state.read())
            .await
            .map_err(|_| TetherError::LockTimeout)
    }

    /// Opaque unique key: epoch seconds, a subsecond component, and a
    /// process-wide counter. Monotonic within a process, so no existence
    /// probe is needed.
    fn generate_key(&self) -> String {
        let seq = self.inner.key_counter.fetch_add(1, Ordering::SeqCst);
        format!("{:010}-{:06}-{:06}", get_now(), get_now_micros(), seq % 1_000_000)
    }
}

fn validate_record_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TetherError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_RECORD_KEY {
        return Err(TetherError::InvalidKey(
            format!("key length {} exceeds {MAX_RECORD_KEY} bytes", key.len()).into(),
        ));
    }
    Ok(())
}

fn expand_batch_ttls(ttls: &BatchTtl, items: usize) -> Result<Vec<Option<Duration>>> {
    match ttls {
        BatchTtl::None => Ok(vec![None; items]),
        BatchTtl::Uniform(ttl) => {
            let ttl = Some(*ttl).filter(|ttl| !ttl.is_zero());
            Ok(vec![ttl; items])
        }
        BatchTtl::PerItem(list) => {
            if list.len() != items {
                return Err(TetherError::Encoding(
                    format!("TTL list has {} entries for {items} items", list.len()).into(),
                ));
            }
            Ok(list.iter().map(|ttl| ttl.filter(|ttl| !ttl.is_zero())).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique_and_ordered() {
        let counter = AtomicU64::new(0);
        let mut keys = Vec::new();
        for _ in 0..100 {
            let seq = counter.fetch_add(1, Ordering::SeqCst);
            keys.push(format!("{:010}-{:06}-{:06}", get_now(), get_now_micros(), seq % 1_000_000));
        }

        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 100, "generated keys must not collide");
    }

    #[test]
    fn test_record_key_validation() {
        assert!(validate_record_key("user:1").is_ok());
        assert!(validate_record_key(&"k".repeat(MAX_RECORD_KEY)).is_ok());

        assert!(validate_record_key("").is_err());
        assert!(validate_record_key(&"k".repeat(MAX_RECORD_KEY + 1)).is_err());
    }

    #[test]
    fn test_batch_ttl_expansion() {
        assert_eq!(expand_batch_ttls(&BatchTtl::None, 3).unwrap(), vec![None, None, None]);

        let uniform = expand_batch_ttls(&BatchTtl::Uniform(Duration::from_secs(60)), 2).unwrap();
        assert_eq!(uniform, vec![Some(Duration::from_secs(60)); 2]);

        // Zero TTLs normalise to "no expiry"
        let zeros = expand_batch_ttls(&BatchTtl::Uniform(Duration::ZERO), 2).unwrap();
        assert_eq!(zeros, vec![None, None]);

        let per_item = expand_batch_ttls(
            &BatchTtl::PerItem(vec![Some(Duration::from_secs(1)), None]),
            2,
        )
        .unwrap();
        assert_eq!(per_item, vec![Some(Duration::from_secs(1)), None]);

        // Length mismatch fails the batch up front
        assert!(expand_batch_ttls(&BatchTtl::PerItem(vec![None]), 2).is_err());
    }
}
