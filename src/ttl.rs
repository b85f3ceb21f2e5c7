use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{Result, TetherError};

/// Reserved namespace byte for side entries. No valid UTF-8 sequence starts
/// with 0xFE, so record keys can never collide with this prefix and side
/// entries sort after every record in the tree.
pub const RESERVED_PREFIX: u8 = 0xFE;

const SIDE_TAG: &[u8] = b"ttl:";

/// Side-entry key for a record key: `0xFE "ttl:" <key>`
pub fn side_key(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + SIDE_TAG.len() + key.len());
    out.push(RESERVED_PREFIX);
    out.extend_from_slice(SIDE_TAG);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Inclusive lower bound of the side-entry namespace
pub fn side_prefix() -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + SIDE_TAG.len());
    out.push(RESERVED_PREFIX);
    out.extend_from_slice(SIDE_TAG);
    out
}

/// Exclusive upper bound of the side-entry namespace
pub fn side_prefix_end() -> Vec<u8> {
    let mut out = side_prefix();
    if let Some(last) = out.last_mut() {
        *last += 1;
    }
    out
}

/// Extract the record key from a side-entry key
pub fn record_key_from_side(side: &[u8]) -> Result<&str> {
    let stripped = side
        .strip_prefix(&[RESERVED_PREFIX])
        .and_then(|rest| rest.strip_prefix(SIDE_TAG))
        .ok_or_else(|| TetherError::Corrupt("malformed TTL side-entry key".into()))?;
    std::str::from_utf8(stripped)
        .map_err(|_| TetherError::Corrupt("non-UTF-8 record key in TTL side entry".into()))
}

/// Side-entry value: expiry seconds since epoch, 8-byte big-endian
pub fn encode_expiry(expire_at: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, expire_at);
    buf
}

pub fn decode_expiry(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(TetherError::Corrupt(
            format!("TTL side entry value has {} bytes, expected 8", bytes.len()).into(),
        ));
    }
    Ok(BigEndian::read_u64(bytes))
}

/// Entry in the expiry heap
#[derive(Eq, PartialEq)]
struct TtlEntry {
    expire_at: u64,
    key: String,
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is max-heap by default)
        other.expire_at.cmp(&self.expire_at).then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// In-memory expiry tracker.
///
/// The heap finds the next expiring key cheaply; the live map is the source
/// of truth so cancellation is O(1). A heap entry whose expiry no longer
/// matches the live map is dead and skipped on pop; the heap is rebuilt when
/// dead entries outnumber live ones.
#[derive(Default)]
pub struct TtlIndex {
    heap: BinaryHeap<TtlEntry>,
    live: HashMap<String, u64>,
    dead: usize,
}

impl TtlIndex {
    /// Track a key's expiry. Re-insertion replaces the live expiry; the old
    /// heap entry becomes dead.
    pub fn insert(&mut self, key: &str, expire_at: u64) {
        if self.live.insert(key.to_string(), expire_at).is_some() {
            self.dead += 1;
        }
        self.heap.push(TtlEntry { expire_at, key: key.to_string() });
        self.maybe_compact();
    }

    /// Logically cancel a key's expiry. Returns whether it was tracked.
    pub fn cancel(&mut self, key: &str) -> bool {
        let cancelled = self.live.remove(key).is_some();
        if cancelled {
            self.dead += 1;
            self.maybe_compact();
        }
        cancelled
    }

    pub fn expiry_of(&self, key: &str) -> Option<u64> {
        self.live.get(key).copied()
    }

    pub fn is_expired(&self, key: &str, now: u64) -> bool {
        self.expiry_of(key).is_some_and(|expire_at| expire_at <= now)
    }

    /// Remove and return the next expired key, skipping dead entries.
    /// Never returns a live, unexpired key.
    pub fn pop_expired(&mut self, now: u64) -> Option<String> {
        while let Some(entry) = self.heap.peek() {
            if entry.expire_at > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry exists");
            match self.live.get(&entry.key) {
                Some(&expire_at) if expire_at == entry.expire_at => {
                    self.live.remove(&entry.key);
                    return Some(entry.key);
                }
                _ => {
                    // Dead entry: cancelled or superseded by a re-insert
                    self.dead = self.dead.saturating_sub(1);
                }
            }
        }
        None
    }

    /// Number of live TTL-bearing keys
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.dead = 0;
    }

    fn maybe_compact(&mut self) {
        if self.dead <= self.live.len() {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(key, &expire_at)| TtlEntry { expire_at, key: key.clone() })
            .collect();
        self.dead = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_key_layout() {
        let side = side_key("user:1");
        assert_eq!(side[0], RESERVED_PREFIX);
        assert_eq!(&side[1..5], b"ttl:");
        assert_eq!(record_key_from_side(&side).unwrap(), "user:1");
    }

    #[test]
    fn test_side_prefix_bounds() {
        let side = side_key("anything");
        assert!(side.as_slice() >= side_prefix().as_slice());
        assert!(side.as_slice() < side_prefix_end().as_slice());

        // Record keys sort strictly before the reserved namespace
        assert!(b"zzzz".as_slice() < side_prefix().as_slice());
    }

    #[test]
    fn test_expiry_encoding_is_big_endian() {
        let buf = encode_expiry(0x0102_0304_0506_0708);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decode_expiry(&buf).unwrap(), 0x0102_0304_0506_0708);

        assert!(decode_expiry(&buf[..4]).is_err());
    }

    #[test]
    fn test_min_heap_ordering() {
        let mut index = TtlIndex::default();

        // Insert out of order
        index.insert("key3", 3000);
        index.insert("key1", 1000);
        index.insert("key2", 2000);

        // Pop in expiry order
        assert_eq!(index.pop_expired(1000), Some("key1".to_string()));
        assert_eq!(index.pop_expired(2000), Some("key2".to_string()));
        assert_eq!(index.pop_expired(3000), Some("key3".to_string()));
        assert_eq!(index.pop_expired(9999), None);
    }

    #[test]
    fn test_pop_never_returns_live_key() {
        let mut index = TtlIndex::default();
        index.insert("later", 2000);

        assert_eq!(index.pop_expired(1000), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_cancellation_skips_dead_entry() {
        let mut index = TtlIndex::default();
        index.insert("cancel_me", 1000);
        index.insert("keep", 2000);

        assert!(index.cancel("cancel_me"));
        assert!(!index.cancel("cancel_me"));

        assert_eq!(index.pop_expired(1500), None);
        assert_eq!(index.pop_expired(2500), Some("keep".to_string()));
    }

    #[test]
    fn test_reinsert_replaces_expiry() {
        let mut index = TtlIndex::default();
        index.insert("key", 1000);
        index.insert("key", 5000);

        assert_eq!(index.expiry_of("key"), Some(5000));

        // The stale heap entry at 1000 must be skipped
        assert_eq!(index.pop_expired(1500), None);
        assert_eq!(index.pop_expired(5000), Some("key".to_string()));
        assert!(index.is_empty());
    }

    #[test]
    fn test_is_expired() {
        let mut index = TtlIndex::default();
        index.insert("key", 1000);

        assert!(!index.is_expired("key", 999));
        assert!(index.is_expired("key", 1000));
        assert!(index.is_expired("key", 2000));
        assert!(!index.is_expired("untracked", 2000));
    }

    #[test]
    fn test_compaction_bounds_dead_entries() {
        let mut index = TtlIndex::default();

        for i in 0..100 {
            index.insert(&format!("key-{i}"), 1000 + i);
        }
        for i in 0..99 {
            index.cancel(&format!("key-{i}"));
        }

        // One live key remains; compaction keeps the heap from carrying
        // 99 dead entries
        assert_eq!(index.len(), 1);
        assert!(index.heap.len() <= 2, "heap holds {} entries", index.heap.len());
        assert_eq!(index.pop_expired(2000), Some("key-99".to_string()));
    }
}
