//! C5: a single tracked browser instance.
//!
//! [`BrowserInstance`] generalizes a tracked-browser wrapper: same
//! id/age/health-timestamp shape, but wrapping a `Box<dyn BrowserHandle>`
//! instead of a concrete `headless_chrome::Browser`, and carrying the
//! pool-facing state (`state`, `currentSessionId`, `pageCount`) the state
//! machine needs instead of leaving that bookkeeping to the pool's
//! surrounding maps.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::driver::{BrowserHandle, Probe};
use crate::error::{CoreError, Result};

/// Rough baseline for a freshly launched Chrome process (main process plus
/// GPU/network helper processes), before any renderer/page overhead.
const BASE_MEMORY_ESTIMATE_BYTES: u64 = 120 * 1024 * 1024;
/// Rough per-page renderer overhead, added on open and removed on close.
const PAGE_MEMORY_ESTIMATE_BYTES: u64 = 50 * 1024 * 1024;

/// Where a [`BrowserInstance`] sits in the state machine:
/// `launching → idle ⇄ active → draining → terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Launching,
    Idle,
    Active,
    Draining,
    Terminated,
}

/// One live browser subprocess plus the bookkeeping the pool needs to
/// acquire, release, health-check, and recycle it.
pub struct BrowserInstance {
    id: String,
    handle: Box<dyn BrowserHandle>,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    max_pages: u32,
    page_count: AtomicU32,
    state: Mutex<BrowserState>,
    current_session_id: Mutex<Option<String>>,
    healthy: Mutex<bool>,
    last_health_check_at: Mutex<Instant>,
    last_activity_at: Mutex<Instant>,
    error_count: AtomicU64,
    total_pages_created: AtomicU64,
    memory_estimate_bytes: AtomicU64,
}

impl BrowserInstance {
    /// Wrap a freshly launched driver handle. Starts in `Launching` and
    /// the caller is expected to move it to `Idle` once it is registered
    /// with the pool.
    pub fn new(id: String, handle: Box<dyn BrowserHandle>, max_pages: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            created_at_utc: Utc::now(),
            max_pages,
            page_count: AtomicU32::new(0),
            state: Mutex::new(BrowserState::Launching),
            current_session_id: Mutex::new(None),
            healthy: Mutex::new(true),
            last_health_check_at: Mutex::new(now),
            last_activity_at: Mutex::new(now),
            error_count: AtomicU64::new(0),
            total_pages_created: AtomicU64::new(0),
            memory_estimate_bytes: AtomicU64::new(BASE_MEMORY_ESTIMATE_BYTES),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &dyn BrowserHandle {
        self.handle.as_ref()
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at_utc
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }

    pub fn state(&self) -> BrowserState {
        *self.state.lock().expect("browser state lock poisoned")
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current_session_id
            .lock()
            .expect("browser session lock poisoned")
            .clone()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn has_capacity(&self) -> bool {
        self.page_count.load(Ordering::SeqCst) < self.max_pages
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn total_pages_created(&self) -> u64 {
        self.total_pages_created.load(Ordering::SeqCst)
    }

    /// Rough resident-memory estimate: a fixed base cost plus a per
    /// currently-open-page overhead. Not a real RSS sample (the driver
    /// contract has no `Performance.getMetrics` call), but a cheap signal
    /// for the recycler's `recycleAfterMemory` threshold.
    pub fn memory_estimate_bytes(&self) -> u64 {
        self.memory_estimate_bytes.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.lock().expect("browser health lock poisoned")
    }

    pub fn last_health_check_at(&self) -> Instant {
        *self
            .last_health_check_at
            .lock()
            .expect("browser health-check lock poisoned")
    }

    /// Time of the last acquire or release. The pool's idle-selection
    /// tie-break prefers the browser with the most recent one.
    pub fn last_activity_at(&self) -> Instant {
        *self
            .last_activity_at
            .lock()
            .expect("browser activity lock poisoned")
    }

    fn touch_activity(&self) {
        *self.last_activity_at.lock().expect("browser activity lock poisoned") = Instant::now();
    }

    /// Mark `launching → idle` on successful launch admission.
    pub fn mark_admitted(&self) {
        *self.state.lock().expect("browser state lock poisoned") = BrowserState::Idle;
    }

    /// Acquire this browser exclusively for `session_id`. Fails with
    /// `FailedPrecondition` if it is not currently `Idle`.
    pub fn acquire(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("browser state lock poisoned");
        if *state != BrowserState::Idle {
            return Err(CoreError::FailedPrecondition(format!(
                "browser {} is not idle (state={:?})",
                self.id, *state
            )));
        }
        *state = BrowserState::Active;
        *self
            .current_session_id
            .lock()
            .expect("browser session lock poisoned") = Some(session_id.to_string());
        drop(state);
        self.touch_activity();
        Ok(())
    }

    /// Release this browser back to `Idle`. Verifies `session_id` matches
    /// the current exclusive holder, `Release` contract.
    pub fn release(&self, session_id: &str) -> Result<()> {
        let mut held = self
            .current_session_id
            .lock()
            .expect("browser session lock poisoned");
        match held.as_deref() {
            Some(owner) if owner == session_id => {}
            Some(_) => {
                return Err(CoreError::Forbidden(format!(
                    "browser {} is not held by session {session_id}",
                    self.id
                )));
            }
            None => {
                return Err(CoreError::FailedPrecondition(format!(
                    "browser {} is not currently active",
                    self.id
                )));
            }
        }
        *held = None;
        drop(held);
        *self.state.lock().expect("browser state lock poisoned") = BrowserState::Idle;
        self.touch_activity();
        Ok(())
    }

    /// `(idle | active) → draining`, selected by the recycler, the
    /// unhealthy flag, or a shutdown sequence.
    pub fn begin_drain(&self) {
        *self.state.lock().expect("browser state lock poisoned") = BrowserState::Draining;
    }

    /// `draining → terminated`, once `pageCount == 0` or the hard-kill
    /// timeout has elapsed.
    pub fn mark_terminated(&self) {
        *self.state.lock().expect("browser state lock poisoned") = BrowserState::Terminated;
    }

    pub fn note_page_opened(&self) {
        self.page_count.fetch_add(1, Ordering::SeqCst);
        self.total_pages_created.fetch_add(1, Ordering::SeqCst);
        self.memory_estimate_bytes.fetch_add(PAGE_MEMORY_ESTIMATE_BYTES, Ordering::SeqCst);
    }

    pub fn note_page_closed(&self) {
        self.page_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            Some(c.saturating_sub(1))
        }).ok();
        self.memory_estimate_bytes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
            Some(m.saturating_sub(PAGE_MEMORY_ESTIMATE_BYTES))
        }).ok();
    }

    pub fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Run the driver's liveness probe and update `healthy`/`lastHealthCheckAt`.
    pub fn check_health(&self) -> Probe {
        let probe = self.handle.probe();
        *self.healthy.lock().expect("browser health lock poisoned") = probe == Probe::Healthy;
        *self
            .last_health_check_at
            .lock()
            .expect("browser health-check lock poisoned") = Instant::now();
        if probe != Probe::Healthy {
            self.note_error();
        }
        probe
    }
}

impl std::fmt::Debug for BrowserInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("page_count", &self.page_count())
            .field("max_pages", &self.max_pages)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::driver::Driver;

    fn instance() -> BrowserInstance {
        let driver = MockDriver::new();
        let handle = driver.launch(&Default::default()).unwrap();
        let inst = BrowserInstance::new("b1".into(), handle, 5);
        inst.mark_admitted();
        inst
    }

    #[test]
    fn acquire_then_release_round_trips_state() {
        let inst = instance();
        assert_eq!(inst.state(), BrowserState::Idle);
        inst.acquire("s1").unwrap();
        assert_eq!(inst.state(), BrowserState::Active);
        assert_eq!(inst.current_session_id().as_deref(), Some("s1"));
        inst.release("s1").unwrap();
        assert_eq!(inst.state(), BrowserState::Idle);
        assert!(inst.current_session_id().is_none());
    }

    #[test]
    fn acquire_twice_fails_precondition() {
        let inst = instance();
        inst.acquire("s1").unwrap();
        let err = inst.acquire("s2").unwrap_err();
        assert!(matches!(err, CoreError::FailedPrecondition(_)));
    }

    #[test]
    fn release_by_wrong_session_is_forbidden() {
        let inst = instance();
        inst.acquire("s1").unwrap();
        let err = inst.release("s2").unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[test]
    fn page_count_tracks_open_and_close() {
        let inst = instance();
        inst.note_page_opened();
        inst.note_page_opened();
        assert_eq!(inst.page_count(), 2);
        assert_eq!(inst.total_pages_created(), 2);
        inst.note_page_closed();
        assert_eq!(inst.page_count(), 1);
    }

    #[test]
    fn has_capacity_respects_max_pages() {
        let driver = MockDriver::new();
        let handle = driver.launch(&Default::default()).unwrap();
        let inst = BrowserInstance::new("b1".into(), handle, 1);
        assert!(inst.has_capacity());
        inst.note_page_opened();
        assert!(!inst.has_capacity());
    }

    #[test]
    fn unhealthy_probe_bumps_error_count() {
        let driver = MockDriver::new();
        let handle = driver.launch(&Default::default()).unwrap();
        let control = driver.last_control().unwrap();
        let inst = BrowserInstance::new("b1".into(), handle, 5);
        control.simulate_crash();
        let probe = inst.check_health();
        assert_eq!(probe, Probe::Disconnected);
        assert!(!inst.is_healthy());
        assert_eq!(inst.error_count(), 1);
    }
}
