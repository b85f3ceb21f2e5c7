use std::collections::HashMap;

/// A page held in the cache
struct Frame {
    buf: Vec<u8>,
    dirty: bool,
    last_used: u64,
}

/// Fixed-capacity LRU cache of raw pages.
///
/// Eviction hands the victim back to the caller; write-back of dirty pages
/// is the pager's job. Victim selection is a linear scan over at most
/// `capacity` frames.
pub struct PageCache {
    capacity: usize,
    frames: HashMap<u32, Frame>,
    clock: u64,
}

/// A page evicted from the cache: (page id, buffer, dirty)
pub type Evicted = (u32, Vec<u8>, bool);

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, frames: HashMap::with_capacity(capacity + 1), clock: 0 }
    }

    /// Fetch a page, refreshing its recency
    pub fn get(&mut self, id: u32) -> Option<&[u8]> {
        self.clock += 1;
        let clock = self.clock;
        self.frames.get_mut(&id).map(|frame| {
            frame.last_used = clock;
            frame.buf.as_slice()
        })
    }

    /// Insert or replace a page. Returns the evicted victim, if any.
    pub fn put(&mut self, id: u32, buf: Vec<u8>, dirty: bool) -> Option<Evicted> {
        self.clock += 1;
        // Replacing an existing page keeps its dirty bit sticky until write-back
        let dirty = dirty || self.frames.get(&id).is_some_and(|frame| frame.dirty);
        self.frames.insert(id, Frame { buf, dirty, last_used: self.clock });

        if self.frames.len() <= self.capacity {
            return None;
        }

        let victim = self
            .frames
            .iter()
            .min_by_key(|(_, frame)| frame.last_used)
            .map(|(id, _)| *id)
            .expect("cache over capacity implies at least one frame");
        let frame = self.frames.remove(&victim).expect("victim frame exists");
        Some((victim, frame.buf, frame.dirty))
    }

    /// Drain every dirty page for write-back, clearing the dirty bits
    pub fn take_dirty(&mut self) -> Vec<(u32, Vec<u8>)> {
        let mut dirty: Vec<(u32, Vec<u8>)> = self
            .frames
            .iter_mut()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, frame)| {
                frame.dirty = false;
                (*id, frame.buf.clone())
            })
            .collect();
        // Deterministic write order keeps sequential backings happy
        dirty.sort_by_key(|(id, _)| *id);
        dirty
    }

    pub fn remove(&mut self, id: u32) {
        self.frames.remove(&id);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn has_dirty(&self) -> bool {
        self.frames.values().any(|frame| frame.dirty)
    }
}
