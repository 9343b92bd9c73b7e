//! Coarse-grained expiry wheel for idle-connection kickoff.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

/// Anything the wheel keeps alive until its bucket expires. Life is
/// extended by filing the same `Arc` into a later bucket; the interesting
/// work (closing an idle connection) happens in the entry's `Drop` impl
/// when the last filed copy goes away.
pub type WheelEntry = Arc<dyn Any + Send + Sync>;

/// A single-level wheel of entry buckets, advanced once per second by the
/// owning event loop.
///
/// `insert_entry(delay, e)` files `e` so it is dropped between `delay` and
/// `delay + 1` seconds later unless re-filed first. The wheel grows on
/// demand to cover the largest delay it has seen.
pub struct TimingWheel {
    buckets: VecDeque<Vec<WheelEntry>>,
}

impl TimingWheel {
    pub fn new(buckets: usize) -> Self {
        let mut wheel = VecDeque::with_capacity(buckets.max(1));
        wheel.resize_with(buckets.max(1), Vec::new);
        Self { buckets: wheel }
    }

    /// File `entry` to survive `delay_secs` more ticks.
    pub fn insert_entry(&mut self, delay_secs: usize, entry: WheelEntry) {
        if delay_secs >= self.buckets.len() {
            self.buckets.resize_with(delay_secs + 1, Vec::new);
        }
        self.buckets[delay_secs].push(entry);
    }

    /// Rotate the wheel one tick, returning the expired bucket.
    ///
    /// The caller drops the returned entries after releasing any lock
    /// around the wheel: entry destructors re-enter the engine (they force
    /// connections closed) and must not find the wheel held.
    #[must_use]
    pub fn advance(&mut self) -> Vec<WheelEntry> {
        let expired = self.buckets.pop_front().unwrap_or_default();
        self.buckets.push_back(Vec::new());
        expired
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagOnDrop(Arc<AtomicBool>);
    impl Drop for FlagOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn entries_expire_after_their_delay() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut wheel = TimingWheel::new(4);
        wheel.insert_entry(2, Arc::new(FlagOnDrop(dropped.clone())));

        drop(wheel.advance());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(wheel.advance());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(wheel.advance());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn refiling_extends_life() {
        let dropped = Arc::new(AtomicBool::new(false));
        let entry: WheelEntry = Arc::new(FlagOnDrop(dropped.clone()));
        let mut wheel = TimingWheel::new(4);
        wheel.insert_entry(1, entry.clone());

        drop(wheel.advance());
        // refresh before the original bucket expires
        wheel.insert_entry(1, entry.clone());
        drop(entry);
        drop(wheel.advance());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(wheel.advance());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn wheel_grows_to_cover_large_delays() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut wheel = TimingWheel::new(2);
        wheel.insert_entry(10, Arc::new(FlagOnDrop(dropped.clone())));
        for _ in 0..10 {
            drop(wheel.advance());
        }
        assert!(!dropped.load(Ordering::SeqCst));
        drop(wheel.advance());
        assert!(dropped.load(Ordering::SeqCst));
    }
}
