use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::numerics::MOST_POSITIVE_EXACT_FLOAT;

/// Ids stay below 2^53 so hosts holding numbers as doubles store them exactly.
const LAST_ID: u64 = MOST_POSITIVE_EXACT_FLOAT as u64 - 1;

/// Ids for calls, host instances, sources and gensyms. Clones hand out from the same sequence.
#[derive(Clone, Debug)]
pub struct Counter(Arc<AtomicU64>);

impl Default for Counter {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl Counter {
    fn starting_at(first: u64) -> Self {
        Counter(Arc::new(AtomicU64::new(first)))
    }

    /// Next id, starting over at 1 after `LAST_ID`.
    pub fn next(&self) -> u64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let following = if current >= LAST_ID { 1 } else { current + 1 };
            match self.0.compare_exchange_weak(
                current,
                following,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}
