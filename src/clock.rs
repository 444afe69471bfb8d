//! Monotonic time and opaque ID generation (C1).
//!
//! Every other component reads "now" and mints IDs through these two
//! traits rather than calling `Instant::now()`/`Uuid::new_v4()` directly,
//! so tests can supply deterministic clocks and IDs.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
///
/// `now_instant()` is used for ages, TTLs, and timeouts (never affected by
/// system clock adjustments); `now_utc()` is used for the timestamps that
/// are part of the visible data model (`SessionRecord::createdAt`, etc).
pub trait Clock: Send + Sync {
    /// Monotonic instant, for durations and deadlines.
    fn now_instant(&self) -> Instant;
    /// Wall-clock time, for timestamps exposed to clients.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of opaque, globally unique identifiers.
///
/// IDs must not encode information a client could exploit: no monotonic
/// counters, no embedded addresses. A random UUIDv4 satisfies this.
pub trait IdGenerator: Send + Sync {
    /// Mint a new opaque ID.
    fn new_id(&self) -> String;
}

/// Production ID generator, UUIDv4 text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Deterministic clock for tests: `now_utc` is fixed at construction,
    /// `now_instant` still advances with real time since `Instant` cannot
    /// be forged without `unsafe`.
    pub struct FixedClock {
        pub fixed_utc: DateTime<Utc>,
    }

    impl Clock for FixedClock {
        fn now_instant(&self) -> Instant {
            Instant::now()
        }

        fn now_utc(&self) -> DateTime<Utc> {
            self.fixed_utc
        }
    }

    /// Sequential ID generator for assertions that need predictable IDs.
    #[derive(Default)]
    pub struct SequentialIds {
        counter: Arc<AtomicU64>,
        prefix: &'static str,
    }

    impl SequentialIds {
        pub fn new(prefix: &'static str) -> Self {
            Self {
                counter: Arc::new(AtomicU64::new(0)),
                prefix,
            }
        }
    }

    impl IdGenerator for SequentialIds {
        fn new_id(&self) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", self.prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_instant();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_instant();
        assert!(b > a);
    }

    #[test]
    fn uuid_generator_produces_unique_ids() {
        let gen = UuidGenerator;
        let a = gen.new_id();
        let b = gen.new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
