//! Small internal helpers shared across the engine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates the next process-wide unique id.
///
/// Every [`crate::target::Target`] gets one of these at construction and
/// keeps it for its whole lifetime, including across builder mutations and
/// clones of the handle.
pub(crate) fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
