//! Injected time and id sources so cache behavior is reproducible in tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Wall-clock source for cache entry timestamps.
pub trait KernelClock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_unix(&self) -> i64;
}

/// Production clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl KernelClock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Test clock that returns a fixed instant, advanceable by hand.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn at(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl KernelClock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source of build ids stamped on cache reports.
pub trait BuildIdFactory: Send + Sync {
    fn next_build_id(&self) -> String;
}

/// Production factory: random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidBuildIds;

impl BuildIdFactory for UuidBuildIds {
    fn next_build_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Test factory: "build-1", "build-2", ...
#[derive(Debug, Default)]
pub struct SequentialBuildIds {
    next: AtomicU64,
}

impl BuildIdFactory for SequentialBuildIds {
    fn next_build_id(&self) -> String {
        format!("build-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::at(100);
        assert_eq!(clock.now_unix(), 100);
        clock.advance(25);
        assert_eq!(clock.now_unix(), 125);
    }

    #[test]
    fn test_sequential_build_ids() {
        let ids = SequentialBuildIds::default();
        assert_eq!(ids.next_build_id(), "build-1");
        assert_eq!(ids.next_build_id(), "build-2");
    }

    #[test]
    fn test_uuid_build_ids_are_unique() {
        let ids = UuidBuildIds;
        assert_ne!(ids.next_build_id(), ids.next_build_id());
    }
}
