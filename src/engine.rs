//! Storage engine state: the tree, the TTL index, and flush accounting.
//!
//! The worker mutates an `Engine` through the write half of the store's
//! lock; reads and queries run on the caller side under the read half. All
//! TTL bookkeeping goes through here so the heap, the live map, and the
//! persisted side entries never drift apart.

use std::time::Duration;

use serde_json::Value;

use crate::btree::BTree;
use crate::codec::{self, Document};
use crate::errors::Result;
use crate::flush::FlushTracker;
use crate::query::Predicate;
use crate::ttl::{self, TtlIndex};

/// Yield to the scheduler after this many deletions in one sweep
const SWEEP_YIELD_EVERY: usize = 16;

pub(crate) struct Engine {
    pub btree: BTree,
    pub ttl: TtlIndex,
    pub flush: FlushTracker,
}

impl Engine {
    pub fn new(btree: BTree, ttl: TtlIndex, flush: FlushTracker) -> Self {
        Self { btree, ttl, flush }
    }

    /// Rebuild the TTL heap from persisted side entries
    pub async fn load_ttl_index(btree: &BTree) -> Result<TtlIndex> {
        let mut index = TtlIndex::default();
        let mut cursor = btree.cursor(Some(ttl::side_prefix()), Some(ttl::side_prefix_end()));
        while let Some((side, value)) = btree.cursor_next(&mut cursor).await? {
            let key = ttl::record_key_from_side(&side)?;
            let expire_at = ttl::decode_expiry(&value)?;
            index.insert(key, expire_at);
        }
        Ok(index)
    }

    /// Store a document under `key`, replacing any prior document and
    /// cancelling its TTL
    pub async fn put(
        &mut self,
        key: &str,
        mut doc: Document,
        ttl: Option<Duration>,
        tags: &[String],
        now: u64,
    ) -> Result<()> {
        codec::attach_tags(&mut doc, tags);
        let encoded = codec::encode_document(&doc)?;

        self.btree.put(key.as_bytes(), &encoded).await?;

        let cancelled = self.ttl.cancel(key);
        match ttl {
            Some(ttl) => {
                let expire_at = now + ttl.as_secs();
                self.btree.put(&ttl::side_key(key), &ttl::encode_expiry(expire_at)).await?;
                self.ttl.insert(key, expire_at);
            }
            None if cancelled => {
                self.btree.delete(&ttl::side_key(key)).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Remove a record. Expired-but-unswept records are reclaimed but
    /// reported as already gone.
    pub async fn remove(&mut self, key: &str, now: u64) -> Result<bool> {
        let was_expired = self.ttl.is_expired(key, now);
        let existed = self.btree.delete(key.as_bytes()).await?;
        if self.ttl.cancel(key) {
            self.btree.delete(&ttl::side_key(key)).await?;
        }
        Ok(existed && !was_expired)
    }

    /// Drop every record and clear TTL state; returns the records removed
    pub async fn purge(&mut self) -> Result<usize> {
        let mut count = 0;
        let mut cursor = self.btree.cursor(None, Some(vec![ttl::RESERVED_PREFIX]));
        while self.btree.cursor_next(&mut cursor).await?.is_some() {
            count += 1;
        }

        self.btree.clear().await?;
        self.ttl.clear();
        self.flush.reset();
        Ok(count)
    }

    /// One TTL-driven expiry pass; returns the records reclaimed
    pub async fn sweep(&mut self, now: u64) -> Result<usize> {
        let mut swept = 0;
        while let Some(key) = self.ttl.pop_expired(now) {
            self.btree.delete(key.as_bytes()).await?;
            self.btree.delete(&ttl::side_key(&key)).await?;
            swept += 1;
            if swept % SWEEP_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        if swept > 0 {
            self.btree.flush().await?;
            self.flush.reset();
        }
        Ok(swept)
    }

    /// Fallback full scan: reconcile side entries with live records.
    ///
    /// Catches drift the heap cannot see, e.g. side entries left behind by a
    /// crash between a record delete and its side-entry delete.
    pub async fn full_scan(&mut self, now: u64) -> Result<usize> {
        let mut sides = Vec::new();
        let mut cursor =
            self.btree.cursor(Some(ttl::side_prefix()), Some(ttl::side_prefix_end()));
        while let Some((side, value)) = self.btree.cursor_next(&mut cursor).await? {
            let key = ttl::record_key_from_side(&side)?.to_string();
            let expire_at = ttl::decode_expiry(&value)?;
            sides.push((key, expire_at));
        }

        let mut reclaimed = 0;
        for (key, expire_at) in sides {
            let orphaned = self.btree.get(key.as_bytes()).await?.is_none();
            if expire_at <= now || orphaned {
                self.btree.delete(key.as_bytes()).await?;
                self.btree.delete(&ttl::side_key(&key)).await?;
                self.ttl.cancel(&key);
                reclaimed += 1;
                if reclaimed % SWEEP_YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }

        if reclaimed > 0 {
            tracing::debug!("full scan reclaimed {reclaimed} entries");
            self.btree.flush().await?;
            self.flush.reset();
        }
        Ok(reclaimed)
    }

    /// Point read; expired-but-unswept records read as absent
    pub async fn get(&self, key: &str, now: u64) -> Result<Option<Document>> {
        if self.ttl.is_expired(key, now) {
            return Ok(None);
        }
        match self.btree.get(key.as_bytes()).await? {
            Some(bytes) => Ok(Some(codec::decode_document(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Evaluate a predicate over the store in key order
    pub async fn query(&self, predicate: &Value, now: u64) -> Result<Vec<Document>> {
        let predicate = Predicate::parse(predicate)?;
        let mut results = Vec::new();

        // Side entries sort after every record key, so the scan stops at the
        // reserved prefix
        let mut cursor = self.btree.cursor(None, Some(vec![ttl::RESERVED_PREFIX]));
        while let Some((key, value)) = self.btree.cursor_next(&mut cursor).await? {
            if let Ok(key) = std::str::from_utf8(&key)
                && self.ttl.is_expired(key, now)
            {
                continue;
            }

            let doc = codec::decode_document(&value)?;
            if predicate.matches(&doc) {
                results.push(doc);
                if predicate.limit().is_some_and(|limit| results.len() >= limit) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        Ok(results)
    }

    /// Count live records. O(N): scans every key.
    pub async fn count(&self, now: u64) -> Result<usize> {
        let mut count = 0;
        let mut cursor = self.btree.cursor(None, Some(vec![ttl::RESERVED_PREFIX]));
        while let Some((key, _)) = self.btree.cursor_next(&mut cursor).await? {
            if let Ok(key) = std::str::from_utf8(&key)
                && self.ttl.is_expired(key, now)
            {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backing::Backing;
    use crate::helpers::get_now;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn memory_engine() -> Engine {
        let btree = BTree::open(Backing::memory(25), 512, 32).await.unwrap();
        Engine::new(btree, TtlIndex::default(), FlushTracker::new(true, Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine.put("u1", doc(json!({"name": "John"})), None, &[], now).await.unwrap();
        let fetched = engine.get("u1", now).await.unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&json!("John")));
    }

    #[tokio::test]
    async fn test_ttl_side_entry_lifecycle() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine
            .put("temp", doc(json!({"x": 1})), Some(Duration::from_secs(60)), &[], now)
            .await
            .unwrap();
        assert_eq!(engine.ttl.expiry_of("temp"), Some(now + 60));
        assert!(engine.btree.get(&ttl::side_key("temp")).await.unwrap().is_some());

        // Overwrite without TTL cancels and removes the side entry
        engine.put("temp", doc(json!({"x": 2})), None, &[], now).await.unwrap();
        assert_eq!(engine.ttl.expiry_of("temp"), None);
        assert!(engine.btree.get(&ttl::side_key("temp")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_record_invisible_before_sweep() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine
            .put("temp", doc(json!({"x": 1})), Some(Duration::from_secs(5)), &[], now)
            .await
            .unwrap();

        // Physically present, logically gone once the clock passes expiry
        assert!(engine.get("temp", now).await.unwrap().is_some());
        assert!(engine.get("temp", now + 6).await.unwrap().is_none());
        assert!(engine.btree.get(b"temp").await.unwrap().is_some());

        let swept = engine.sweep(now + 6).await.unwrap();
        assert_eq!(swept, 1);
        assert!(engine.btree.get(b"temp").await.unwrap().is_none());
        assert_eq!(engine.sweep(now + 6).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_treats_expired_as_gone() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine
            .put("temp", doc(json!({"x": 1})), Some(Duration::from_secs(5)), &[], now)
            .await
            .unwrap();

        // Delete after expiry reports false but reclaims the record
        assert!(!engine.remove("temp", now + 6).await.unwrap());
        assert!(engine.btree.get(b"temp").await.unwrap().is_none());
        assert!(engine.ttl.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_index_rebuild() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine
            .put("a", doc(json!({"v": 1})), Some(Duration::from_secs(100)), &[], now)
            .await
            .unwrap();
        engine
            .put("b", doc(json!({"v": 2})), Some(Duration::from_secs(200)), &[], now)
            .await
            .unwrap();
        engine.put("c", doc(json!({"v": 3})), None, &[], now).await.unwrap();

        let rebuilt = Engine::load_ttl_index(&engine.btree).await.unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.expiry_of("a"), Some(now + 100));
        assert_eq!(rebuilt.expiry_of("b"), Some(now + 200));
        assert_eq!(rebuilt.expiry_of("c"), None);
    }

    #[tokio::test]
    async fn test_full_scan_reclaims_orphaned_side_entries() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine
            .put("orphan", doc(json!({"v": 1})), Some(Duration::from_secs(100)), &[], now)
            .await
            .unwrap();

        // Simulate drift: the record vanishes but its side entry remains
        engine.btree.delete(b"orphan").await.unwrap();

        let reclaimed = engine.full_scan(now).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(engine.btree.get(&ttl::side_key("orphan")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_counts_and_clears() {
        let mut engine = memory_engine().await;
        let now = get_now();

        for i in 0..5 {
            engine
                .put(&format!("key-{i}"), doc(json!({"v": i})), None, &[], now)
                .await
                .unwrap();
        }
        engine
            .put("ttl-key", doc(json!({"v": 9})), Some(Duration::from_secs(60)), &[], now)
            .await
            .unwrap();

        assert_eq!(engine.purge().await.unwrap(), 6);
        assert_eq!(engine.count(now).await.unwrap(), 0);
        assert!(engine.ttl.is_empty());
    }

    #[tokio::test]
    async fn test_query_skips_side_entries_and_expired() {
        let mut engine = memory_engine().await;
        let now = get_now();

        engine.put("live", doc(json!({"kind": "x"})), None, &[], now).await.unwrap();
        engine
            .put("dying", doc(json!({"kind": "x"})), Some(Duration::from_secs(5)), &[], now)
            .await
            .unwrap();

        let all = engine.query(&json!({}), now).await.unwrap();
        assert_eq!(all.len(), 2);

        // After expiry the dying record is filtered without a sweep
        let later = engine.query(&json!({}), now + 10).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].get("kind"), Some(&json!("x")));
    }
}
