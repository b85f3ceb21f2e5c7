use std::time::{SystemTime, UNIX_EPOCH};

pub const KIBI: usize = 1024;
pub const MEBI: usize = KIBI * KIBI;

/// Encoded document size ceiling
pub const MAX_DOC_SIZE: usize = 8 * KIBI;

pub fn get_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

pub fn get_now_micros() -> u64 {
    u64::from(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_micros())
}
