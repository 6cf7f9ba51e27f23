use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic identifier source starting at 1.
///
/// Connection ids and request ids each own one of these, so the two
/// namespaces never share a counter. Ids are never reused; wraparound after
/// 2^32 allocations is not handled.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
