//! Ordered key/value map over a block backing.
//!
//! A paged B+ tree: internal pages route by separator keys, leaf pages hold
//! the entries and chain left-to-right for ordered scans. Values above the
//! inline threshold spill into overflow page chains so a small page size
//! still accommodates documents up to the codec ceiling. Freed pages are
//! recycled through a free list threaded from the meta block.
//!
//! Mutations land in the page cache and reach the backing on eviction or at
//! the explicit `flush` barrier. Every page is checksummed; a torn write
//! surfaces as `Corrupt` on the next read rather than a silent misroute.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::backing::Backing;
use crate::cache::PageCache;
use crate::errors::{Result, TetherError};
use crate::page::{
    self, InternalNode, LeafEntry, LeafNode, MAX_KEY_SIZE, META_SIZE, Meta, NO_PAGE, Node, ValueRef,
};

pub struct BTree {
    inner: Mutex<Inner>,
    /// Bumped on every mutation; cursors re-seek when it moves under them
    generation: AtomicU64,
}

struct Inner {
    backing: Backing,
    meta: Meta,
    cache: PageCache,
    page_size: usize,
    /// Dirty pages evicted inside sync sections, awaiting write-back
    pending_writeback: Vec<(u32, Vec<u8>)>,
}

/// Restartable ordered scan position.
///
/// A cursor does not pin pages or hold locks between pulls; it remembers the
/// last key it returned and re-seeks if the tree mutated underneath it.
pub struct Cursor {
    to: Option<Vec<u8>>,
    state: CursorState,
    generation: u64,
}

enum CursorState {
    /// Not yet positioned; seek to this inclusive key (None = first leaf)
    Start(Option<Vec<u8>>),
    At { leaf: u32, idx: usize, last_key: Vec<u8> },
    Done,
}

impl BTree {
    /// Open a tree over the backing, initialising it when empty.
    ///
    /// An existing tree keeps its stored page size; the configured value only
    /// applies to fresh backings.
    pub async fn open(backing: Backing, page_size: usize, cache_pages: usize) -> Result<Self> {
        let mut inner = Inner {
            backing,
            meta: Meta {
                page_size: page_size as u32,
                root: 1,
                next_page: 2,
                free_head: NO_PAGE,
                leaf_head: 1,
            },
            cache: PageCache::new(cache_pages),
            page_size,
            pending_writeback: Vec::new(),
        };

        if inner.backing.len() < META_SIZE as u64 {
            // Fresh backing: meta block plus one empty leaf as the root
            inner
                .write_node(1, &Node::Leaf(LeafNode { entries: Vec::new(), next_leaf: NO_PAGE }))?;
            inner.flush().await?;
        } else {
            let mut buf = [0u8; META_SIZE];
            inner.backing.read_at(0, &mut buf).await?;
            let meta = Meta::decode(&buf)?;
            if meta.page_size as usize != page_size {
                tracing::debug!(
                    "backing uses page size {}, ignoring configured {page_size}",
                    meta.page_size
                );
            }
            inner.page_size = meta.page_size as usize;
            inner.meta = meta;
        }

        Ok(Self { inner: Mutex::new(inner), generation: AtomicU64::new(1) })
    }

    /// Point lookup
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;

        let (leaf_id, _) = inner.find_leaf(key).await?;
        let leaf = inner.read_leaf(leaf_id).await?;
        match leaf.entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(idx) => {
                let value = inner.read_value(&leaf.entries[idx].value).await?;
                Ok(Some(value))
            }
            Err(_) => Ok(None),
        }
    }

    /// Insert or overwrite
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;

        let (leaf_id, path) = inner.find_leaf(key).await?;
        let mut leaf = inner.read_leaf(leaf_id).await?;
        let value_ref = inner.write_value(value).await?;

        match leaf.entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(idx) => {
                let old = std::mem::replace(&mut leaf.entries[idx].value, value_ref);
                inner.free_value(&old).await?;
            }
            Err(idx) => {
                leaf.entries.insert(idx, LeafEntry { key: key.to_vec(), value: value_ref });
            }
        }

        if Node::Leaf(leaf.clone()).fits(inner.page_size) {
            inner.write_node(leaf_id, &Node::Leaf(leaf))?;
        } else {
            inner.split_leaf(leaf_id, leaf, path).await?;
        }

        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Remove a key; returns whether it existed
    pub async fn delete(&self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;

        let (leaf_id, _) = inner.find_leaf(key).await?;
        let mut leaf = inner.read_leaf(leaf_id).await?;
        match leaf.entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(idx) => {
                let entry = leaf.entries.remove(idx);
                inner.free_value(&entry.value).await?;
                inner.write_node(leaf_id, &Node::Leaf(leaf))?;
                self.generation.fetch_add(1, Ordering::Release);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Ordered scan over `[from, to)`; `None` bounds are open
    pub fn cursor(&self, from: Option<Vec<u8>>, to: Option<Vec<u8>>) -> Cursor {
        Cursor {
            to,
            state: CursorState::Start(from),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Pull the next entry from a cursor
    pub async fn cursor_next(&self, cursor: &mut Cursor) -> Result<Option<(Bytes, Bytes)>> {
        let mut inner = self.inner.lock().await;
        let generation = self.generation.load(Ordering::Acquire);

        let (mut leaf_id, mut idx) = match &cursor.state {
            CursorState::Done => return Ok(None),
            CursorState::Start(seek) => {
                let seek = seek.clone();
                inner.seek_position(seek.as_deref(), false).await?
            }
            CursorState::At { leaf, idx, last_key } => {
                if cursor.generation == generation {
                    (*leaf, *idx)
                } else {
                    // Tree changed under the cursor: resume after the last
                    // key we handed out
                    let last_key = last_key.clone();
                    cursor.generation = generation;
                    inner.seek_position(Some(&last_key), true).await?
                }
            }
        };
        cursor.generation = generation;

        loop {
            let leaf = inner.read_leaf(leaf_id).await?;
            if idx < leaf.entries.len() {
                let entry = &leaf.entries[idx];
                if let Some(to) = &cursor.to
                    && entry.key.as_slice() >= to.as_slice()
                {
                    cursor.state = CursorState::Done;
                    return Ok(None);
                }

                let key = entry.key.clone();
                let value = inner.read_value(&entry.value).await?;
                cursor.state = CursorState::At { leaf: leaf_id, idx: idx + 1, last_key: key.clone() };
                return Ok(Some((Bytes::from(key), value)));
            }

            if leaf.next_leaf == NO_PAGE {
                cursor.state = CursorState::Done;
                return Ok(None);
            }
            leaf_id = leaf.next_leaf;
            idx = 0;
        }
    }

    /// Push dirty pages and the meta block through to the backing
    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush().await
    }

    /// Drop every entry and reset the tree to a single empty leaf
    pub async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let page_size = inner.page_size;

        // Pending write-backs target pages that no longer exist
        inner.pending_writeback.clear();
        inner.cache.clear();
        inner.meta = Meta {
            page_size: page_size as u32,
            root: 1,
            next_page: 2,
            free_head: NO_PAGE,
            leaf_head: 1,
        };
        inner.backing.set_len((page_size * 2) as u64).await?;
        inner.write_node(1, &Node::Leaf(LeafNode { entries: Vec::new(), next_leaf: NO_PAGE }))?;
        inner.flush().await?;

        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(TetherError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(TetherError::InvalidKey(
            format!("key length {} exceeds {MAX_KEY_SIZE} bytes", key.len()).into(),
        ));
    }
    Ok(())
}

impl Inner {
    /// Values above this stay inline in the leaf; larger ones spill to
    /// overflow chains so several entries always fit per page
    fn inline_threshold(&self) -> usize {
        self.page_size / 4
    }

    async fn read_page(&mut self, id: u32) -> Result<Vec<u8>> {
        self.drain_writeback().await?;
        if let Some(buf) = self.cache.get(id) {
            return Ok(buf.to_vec());
        }

        let mut buf = vec![0u8; self.page_size];
        self.backing.read_at(u64::from(id) * self.page_size as u64, &mut buf).await?;
        self.put_cached(id, buf.clone(), false).await?;
        Ok(buf)
    }

    async fn put_cached(&mut self, id: u32, buf: Vec<u8>, dirty: bool) -> Result<()> {
        if let Some((victim, victim_buf, victim_dirty)) = self.cache.put(id, buf, dirty)
            && victim_dirty
        {
            self.backing.write_at(u64::from(victim) * self.page_size as u64, &victim_buf).await?;
        }
        Ok(())
    }

    fn write_node(&mut self, id: u32, node: &Node) -> Result<()> {
        let buf = node.encode(self.page_size)?;
        // Write-back happens on eviction; defer it so node writes stay sync
        let evicted = self.cache.put(id, buf, true);
        if let Some((victim, victim_buf, victim_dirty)) = evicted
            && victim_dirty
        {
            self.pending_writeback.push((victim, victim_buf));
        }
        Ok(())
    }

    async fn read_node(&mut self, id: u32) -> Result<Node> {
        let buf = self.read_page(id).await?;
        Node::decode(&buf)
    }

    async fn read_leaf(&mut self, id: u32) -> Result<LeafNode> {
        match self.read_node(id).await? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => {
                Err(TetherError::Corrupt(format!("expected leaf at page {id}").into()))
            }
        }
    }

    /// Descend to the leaf for `key`, recording the child slot taken at each
    /// internal node so splits can insert separators on the way back up
    async fn find_leaf(&mut self, key: &[u8]) -> Result<(u32, Vec<(u32, usize)>)> {
        let mut id = self.meta.root;
        let mut path = Vec::new();

        loop {
            match self.read_node(id).await? {
                Node::Internal(node) => {
                    let slot = node.entries.partition_point(|(sep, _)| sep.as_slice() <= key);
                    let child =
                        if slot == 0 { node.leftmost } else { node.entries[slot - 1].1 };
                    path.push((id, slot));
                    id = child;
                }
                Node::Leaf(_) => return Ok((id, path)),
            }
        }
    }

    /// Position for a scan: leaf id and entry index of the first key
    /// `>= seek` (or `> seek` when `exclusive`)
    async fn seek_position(
        &mut self,
        seek: Option<&[u8]>,
        exclusive: bool,
    ) -> Result<(u32, usize)> {
        match seek {
            None => Ok((self.meta.leaf_head, 0)),
            Some(key) => {
                let (leaf_id, _) = self.find_leaf(key).await?;
                let leaf = self.read_leaf(leaf_id).await?;
                let idx = if exclusive {
                    leaf.entries.partition_point(|entry| entry.key.as_slice() <= key)
                } else {
                    leaf.entries.partition_point(|entry| entry.key.as_slice() < key)
                };
                Ok((leaf_id, idx))
            }
        }
    }

    async fn split_leaf(
        &mut self,
        leaf_id: u32,
        mut leaf: LeafNode,
        path: Vec<(u32, usize)>,
    ) -> Result<()> {
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let right_id = self.alloc_page().await?;

        let right = LeafNode { entries: right_entries, next_leaf: leaf.next_leaf };
        leaf.next_leaf = right_id;
        let separator = right.entries[0].key.clone();

        self.write_node(right_id, &Node::Leaf(right))?;
        self.write_node(leaf_id, &Node::Leaf(leaf))?;
        self.insert_into_parent(path, separator, right_id).await
    }

    async fn insert_into_parent(
        &mut self,
        mut path: Vec<(u32, usize)>,
        mut separator: Vec<u8>,
        mut right_id: u32,
    ) -> Result<()> {
        loop {
            let Some((parent_id, slot)) = path.pop() else {
                // Root split: grow the tree by one level
                let new_root = self.alloc_page().await?;
                let node =
                    InternalNode { leftmost: self.meta.root, entries: vec![(separator, right_id)] };
                self.write_node(new_root, &Node::Internal(node))?;
                self.meta.root = new_root;
                return Ok(());
            };

            let mut node = match self.read_node(parent_id).await? {
                Node::Internal(node) => node,
                Node::Leaf(_) => {
                    return Err(TetherError::Corrupt(
                        format!("expected internal node at page {parent_id}").into(),
                    ));
                }
            };

            // The new right sibling sits immediately after the slot we
            // descended through
            node.entries.insert(slot, (separator, right_id));

            if Node::Internal(node.clone()).fits(self.page_size) {
                self.write_node(parent_id, &Node::Internal(node))?;
                return Ok(());
            }

            let mid = node.entries.len() / 2;
            let mut right_entries = node.entries.split_off(mid);
            let (promoted, right_leftmost) = right_entries.remove(0);

            let new_right = InternalNode { leftmost: right_leftmost, entries: right_entries };
            let new_right_id = self.alloc_page().await?;
            self.write_node(new_right_id, &Node::Internal(new_right))?;
            self.write_node(parent_id, &Node::Internal(node))?;

            separator = promoted;
            right_id = new_right_id;
        }
    }

    async fn alloc_page(&mut self) -> Result<u32> {
        if self.meta.free_head != NO_PAGE {
            let id = self.meta.free_head;
            let buf = self.read_page(id).await?;
            self.meta.free_head = page::decode_free(&buf)?;
            return Ok(id);
        }

        let id = self.meta.next_page;
        self.meta.next_page += 1;
        Ok(id)
    }

    fn free_page(&mut self, id: u32) {
        let buf = page::encode_free(self.meta.free_head, self.page_size);
        let evicted = self.cache.put(id, buf, true);
        if let Some((victim, victim_buf, victim_dirty)) = evicted
            && victim_dirty
        {
            self.pending_writeback.push((victim, victim_buf));
        }
        self.meta.free_head = id;
    }

    /// Store value bytes, spilling to an overflow chain when oversized
    async fn write_value(&mut self, value: &[u8]) -> Result<ValueRef> {
        if value.len() <= self.inline_threshold() {
            return Ok(ValueRef::Inline(value.to_vec()));
        }

        let capacity = page::overflow_capacity(self.page_size);
        let mut next = NO_PAGE;
        // Build the chain tail-first so each page links forward
        for chunk in value.chunks(capacity).rev() {
            let id = self.alloc_page().await?;
            let buf = page::encode_overflow(chunk, next, self.page_size)?;
            self.put_cached(id, buf, true).await?;
            next = id;
        }

        Ok(ValueRef::Overflow { total_len: value.len() as u32, head: next })
    }

    async fn read_value(&mut self, value: &ValueRef) -> Result<Bytes> {
        match value {
            ValueRef::Inline(bytes) => Ok(Bytes::from(bytes.clone())),
            ValueRef::Overflow { total_len, head } => {
                let mut out = Vec::with_capacity(*total_len as usize);
                let mut id = *head;
                while id != NO_PAGE {
                    let buf = self.read_page(id).await?;
                    let (chunk, next) = page::decode_overflow(&buf)?;
                    out.extend_from_slice(&chunk);
                    id = next;
                }
                if out.len() != *total_len as usize {
                    return Err(TetherError::Corrupt(
                        format!("overflow chain length {} != {total_len}", out.len()).into(),
                    ));
                }
                Ok(Bytes::from(out))
            }
        }
    }

    async fn free_value(&mut self, value: &ValueRef) -> Result<()> {
        if let ValueRef::Overflow { head, .. } = value {
            let mut id = *head;
            while id != NO_PAGE {
                let buf = self.read_page(id).await?;
                let (_, next) = page::decode_overflow(&buf)?;
                self.free_page(id);
                id = next;
            }
        }
        Ok(())
    }

    /// Write back pages evicted during sync sections
    async fn drain_writeback(&mut self) -> Result<()> {
        while let Some((id, buf)) = self.pending_writeback.pop() {
            self.backing.write_at(u64::from(id) * self.page_size as u64, &buf).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.drain_writeback().await?;
        for (id, buf) in self.cache.take_dirty() {
            self.backing.write_at(u64::from(id) * self.page_size as u64, &buf).await?;
        }
        let meta_buf = self.meta.encode();
        self.backing.write_at(0, &meta_buf).await?;
        self.backing.sync().await
    }
}
