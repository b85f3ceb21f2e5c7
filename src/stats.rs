use crate::engine::Engine;

/// Store statistics and flush accounting
pub struct TetherStats {
    /// Live TTL-bearing records tracked by the expiry index
    pub ttl_entries: usize,

    /// Mutations applied over the store's lifetime
    pub ops_lifetime: u64,

    /// Mutations applied since the last durability barrier
    pub ops_since_flush: u64,

    /// Current flush threshold (adaptive ladder or fixed)
    pub flush_threshold: u64,
}

impl TetherStats {
    pub(crate) fn new(engine: &Engine) -> Self {
        Self {
            ttl_entries: engine.ttl.len(),
            ops_lifetime: engine.flush.ops_lifetime(),
            ops_since_flush: engine.flush.ops_since_flush(),
            flush_threshold: engine.flush.threshold(),
        }
    }
}
