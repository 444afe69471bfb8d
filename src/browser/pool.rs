//! C6: the bounded pool of browser instances.
//!
//! Generalizes a pool's available/active maps, fixed lock order, and
//! background tick thread into the full acquire/release contract: sticky
//! acquisition, a bounded FIFO waiter queue, circuit-breaker-gated launch,
//! tie-break ordering for idle selection and scale-down, and the state
//! machine `launching -> idle <-> active -> draining -> terminated`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::browser::instance::{BrowserInstance, BrowserState};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::IdGenerator;
use crate::driver::{Driver, DriverLaunchOptions, PageHandle, Probe};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};

/// Circuit breaker key guarding browser acquisition/launch, exposed for
/// introspection (`Health()`).
pub const BREAKER_ACQUIRE: &str = "browser-acquisition";
/// Circuit breaker key guarding page creation, exposed for introspection.
pub const BREAKER_PAGE_CREATE: &str = "page-creation";

/// Tunables for [`BrowserPool`].
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub min_browsers: usize,
    pub max_browsers: usize,
    pub max_pages_per_browser: u32,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub acquire_timeout: Duration,
    pub max_queue_len: usize,
    pub launch_options: DriverLaunchOptions,
    pub launch_retries: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_browsers: 1,
            max_browsers: 5,
            max_pages_per_browser: 5,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            max_queue_len: 64,
            launch_options: DriverLaunchOptions::default(),
            launch_retries: 2,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Point-in-time counts, for the scaler and `Health()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSnapshot {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub draining: usize,
    pub queued_waiters: usize,
}

struct Waiter {
    session_id: String,
    tx: oneshot::Sender<Result<Arc<BrowserInstance>>>,
}

/// Bounded set of long-lived browser processes.
pub struct BrowserPool {
    config: BrowserPoolConfig,
    driver: Arc<dyn Driver>,
    ids: Arc<dyn IdGenerator>,
    circuit: Arc<CircuitBreaker>,
    events: EventBus,
    browsers: DashMap<String, Arc<BrowserInstance>>,
    sticky: DashMap<String, String>,
    consecutive_unhealthy: DashMap<String, u32>,
    waiters: AsyncMutex<VecDeque<Waiter>>,
    shutting_down: AtomicBool,
    reclaim_pressure: AtomicBool,
    next_launch_index: AtomicUsize,
}

impl BrowserPool {
    pub fn new(
        config: BrowserPoolConfig,
        driver: Arc<dyn Driver>,
        ids: Arc<dyn IdGenerator>,
        circuit: Arc<CircuitBreaker>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            driver,
            ids,
            circuit,
            events,
            browsers: DashMap::new(),
            sticky: DashMap::new(),
            consecutive_unhealthy: DashMap::new(),
            waiters: AsyncMutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            reclaim_pressure: AtomicBool::new(false),
            next_launch_index: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &BrowserPoolConfig {
        &self.config
    }

    /// Launch `minBrowsers` up front.
    pub async fn warmup(&self) -> Result<()> {
        let deficit = self.config.min_browsers.saturating_sub(self.browsers.len());
        if deficit == 0 {
            log::debug!("pool already has min_browsers={}, skipping warmup", self.config.min_browsers);
            return Ok(());
        }
        log::info!("warming up pool: launching {deficit} browser(s) to reach min_browsers={}", self.config.min_browsers);
        for _ in 0..deficit {
            let browser = self.launch_one().await?;
            browser.mark_admitted();
        }
        log::info!("✅ warmup complete, pool at {} browser(s)", self.browsers.len());
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snap = PoolSnapshot::default();
        for entry in self.browsers.iter() {
            snap.total += 1;
            match entry.value().state() {
                BrowserState::Idle => snap.idle += 1,
                BrowserState::Active => snap.active += 1,
                BrowserState::Draining | BrowserState::Launching => snap.draining += 1,
                BrowserState::Terminated => {}
            }
        }
        snap
    }

    pub fn size(&self) -> usize {
        self.browsers.len()
    }

    pub fn set_reclaim_pressure(&self, under_pressure: bool) {
        self.reclaim_pressure.store(under_pressure, Ordering::Relaxed);
    }

    pub fn get_browser(&self, browser_id: &str) -> Option<Arc<BrowserInstance>> {
        self.browsers.get(browser_id).map(|b| b.clone())
    }

    pub fn browser_ids(&self) -> Vec<String> {
        self.browsers.iter().map(|e| e.key().clone()).collect()
    }

    /// Acquire a browser for `session_id`, four-step sequence.
    pub async fn acquire(&self, session_id: &str) -> Result<Arc<BrowserInstance>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoreError::Unavailable("pool is shutting down".into()));
        }

        // Step 1: sticky.
        if let Some(browser_id) = self.sticky.get(session_id).map(|e| e.clone()) {
            if let Some(browser) = self.browsers.get(&browser_id) {
                if browser.acquire(session_id).is_ok() {
                    log::debug!("session {session_id} reattached to its sticky browser {browser_id}");
                    self.events.publish(CoreEvent::BrowserAcquired {
                        browser_id: browser_id.clone(),
                        session_id: session_id.to_string(),
                    });
                    return Ok(browser.clone());
                }
            }
        }

        // Step 2: any idle browser, tie-broken by pick_idle's reclaim-pressure rule.
        if let Some(browser) = self.pick_idle() {
            browser.acquire(session_id)?;
            self.sticky.insert(session_id.to_string(), browser.id().to_string());
            self.events.publish(CoreEvent::BrowserAcquired {
                browser_id: browser.id().to_string(),
                session_id: session_id.to_string(),
            });
            return Ok(browser);
        }

        // Step 3: launch, gated by the acquisition breaker.
        if self.browsers.len() < self.config.max_browsers {
            match self.launch_one().await {
                Ok(browser) => {
                    browser.mark_admitted();
                    browser.acquire(session_id)?;
                    self.sticky.insert(session_id.to_string(), browser.id().to_string());
                    self.events.publish(CoreEvent::BrowserAcquired {
                        browser_id: browser.id().to_string(),
                        session_id: session_id.to_string(),
                    });
                    return Ok(browser);
                }
                Err(CoreError::Unavailable(_)) => {
                    // Breaker open: fall through to the wait queue.
                }
                Err(e) => return Err(e),
            }
        }

        // Step 4: FIFO wait queue, bounded, respecting acquireTimeout.
        log::debug!("pool saturated at {} browsers, queueing session {session_id}", self.browsers.len());
        self.wait_for_release(session_id).await
    }

    fn pick_idle(&self) -> Option<Arc<BrowserInstance>> {
        let under_pressure = self.reclaim_pressure.load(Ordering::Relaxed);
        let mut best: Option<Arc<BrowserInstance>> = None;
        for entry in self.browsers.iter() {
            let browser = entry.value();
            if browser.state() != BrowserState::Idle || !browser.is_healthy() {
                continue;
            }
            best = Some(match best {
                None => browser.clone(),
                Some(current) => {
                    if under_pressure {
                        // Prefer the oldest (likely memory-leaked).
                        if browser.age() > current.age() {
                            browser.clone()
                        } else {
                            current
                        }
                    } else {
                        // Prefer the warmest: most recent lastActivityAt.
                        if browser.last_activity_at() > current.last_activity_at() {
                            browser.clone()
                        } else {
                            current
                        }
                    }
                }
            });
        }
        best
    }

    async fn wait_for_release(&self, session_id: &str) -> Result<Arc<BrowserInstance>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            if waiters.len() >= self.config.max_queue_len {
                return Err(CoreError::ResourceExhausted("acquire queue is full".into()));
            }
            waiters.push_back(Waiter {
                session_id: session_id.to_string(),
                tx,
            });
        }
        match tokio::time::timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Unavailable("pool shut down while waiting".into())),
            Err(_) => {
                let mut waiters = self.waiters.lock().await;
                waiters.retain(|w| w.session_id != session_id);
                log::warn!("⚠️ session {session_id} timed out waiting {:?} for a browser", self.config.acquire_timeout);
                Err(CoreError::ResourceExhausted(format!(
                    "no browser available within {:?}",
                    self.config.acquire_timeout
                )))
            }
        }
    }

    /// Serve exactly one queued waiter with a freshly idle/launched browser.
    async fn serve_one_waiter(&self, browser: &Arc<BrowserInstance>) {
        let waiter = {
            let mut waiters = self.waiters.lock().await;
            waiters.pop_front()
        };
        if let Some(waiter) = waiter {
            let result = browser.acquire(&waiter.session_id).map(|_| {
                self.sticky
                    .insert(waiter.session_id.clone(), browser.id().to_string());
                self.events.publish(CoreEvent::BrowserAcquired {
                    browser_id: browser.id().to_string(),
                    session_id: waiter.session_id.clone(),
                });
                browser.clone()
            });
            let _ = waiter.tx.send(result);
        }
    }

    /// Release `browser_id` back to the pool. Verifies `session_id` owns it.
    pub async fn release(&self, browser_id: &str, session_id: &str) -> Result<()> {
        let browser = self
            .browsers
            .get(browser_id)
            .map(|b| b.clone())
            .ok_or_else(|| CoreError::NotFound(format!("browser {browser_id} not found")))?;
        browser.release(session_id)?;
        log::debug!("session {session_id} released browser {browser_id}");
        self.events.publish(CoreEvent::BrowserReleased {
            browser_id: browser_id.to_string(),
            session_id: session_id.to_string(),
        });
        self.serve_one_waiter(&browser).await;
        Ok(())
    }

    /// Create a page inside `browser_id`, enforcing capacity and gating
    /// through the `page-creation` breaker.
    pub async fn create_page(&self, browser_id: &str, session_id: &str) -> Result<Box<dyn PageHandle>> {
        let browser = self
            .browsers
            .get(browser_id)
            .map(|b| b.clone())
            .ok_or_else(|| CoreError::NotFound(format!("browser {browser_id} not found")))?;
        if browser.current_session_id().as_deref() != Some(session_id) {
            return Err(CoreError::Forbidden(format!(
                "browser {browser_id} is not held by session {session_id}"
            )));
        }
        if !browser.has_capacity() {
            return Err(CoreError::ResourceExhausted(format!(
                "browser {browser_id} is at max pages ({})",
                browser.max_pages()
            )));
        }

        let circuit = self.circuit.clone();
        let cfg = self.config.circuit_breaker;
        let key = BREAKER_PAGE_CREATE.to_string();
        let browser_for_call = browser.clone();
        let result = tokio::task::spawn_blocking(move || {
            circuit.call(&key, cfg, || browser_for_call.handle().new_page())
        })
        .await
        .map_err(|e| CoreError::Internal(format!("page-creation task panicked: {e}")))?;

        match result {
            Ok(page) => {
                browser.note_page_opened();
                Ok(page)
            }
            Err(e) => {
                browser.note_error();
                Err(e)
            }
        }
    }

    pub fn close_page(&self, browser_id: &str) {
        if let Some(browser) = self.browsers.get(browser_id) {
            browser.note_page_closed();
        }
    }

    async fn launch_one(&self) -> Result<Arc<BrowserInstance>> {
        log::debug!("launching a new browser instance...");
        let driver = self.driver.clone();
        let options = self.config.launch_options.clone();
        let circuit = self.circuit.clone();
        let cfg = self.config.circuit_breaker;
        let key = BREAKER_ACQUIRE.to_string();
        let retries = self.config.launch_retries;

        let handle = tokio::task::spawn_blocking(move || {
            circuit.call(&key, cfg, || {
                let mut last_err = None;
                for attempt in 0..=retries {
                    match driver.launch(&options) {
                        Ok(h) => return Ok(h),
                        Err(e) => {
                            log::warn!("browser launch attempt {attempt} failed: {e}");
                            last_err = Some(e);
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| CoreError::Internal("launch failed".into())))
            })
        })
        .await
        .map_err(|e| CoreError::Internal(format!("launch task panicked: {e}")))??;

        let id = self.ids.new_id();
        let browser = Arc::new(BrowserInstance::new(id.clone(), handle, self.config.max_pages_per_browser));
        self.browsers.insert(id.clone(), browser.clone());
        log::info!("✅ launched browser {id} (pool now at {})", self.browsers.len());
        self.events.publish(CoreEvent::BrowserLaunched { browser_id: id });
        Ok(browser)
    }

    /// Launch up to `k` more browsers, never exceeding `maxBrowsers`.
    /// Newly launched browsers first serve any queued waiters.
    pub async fn scale_up(&self, k: usize) -> Result<usize> {
        let room = self.config.max_browsers.saturating_sub(self.browsers.len());
        let to_launch = k.min(room);
        if to_launch == 0 {
            return Ok(0);
        }
        log::info!("scaling up: launching {to_launch} browser(s)");
        let mut launched = 0;
        for _ in 0..to_launch {
            let browser = self.launch_one().await?;
            browser.mark_admitted();
            self.serve_one_waiter(&browser).await;
            launched += 1;
        }
        Ok(launched)
    }

    /// Mark one idle browser draining, never dropping below `minBrowsers`.
    /// Returns the drained browser id, if any.
    pub fn mark_one_for_drain(&self) -> Option<String> {
        if self.browsers.len() <= self.config.min_browsers {
            return None;
        }
        let candidate = self
            .browsers
            .iter()
            .filter(|e| e.value().state() == BrowserState::Idle)
            .max_by_key(|e| e.value().age())
            .map(|e| e.key().clone());
        if let Some(id) = &candidate {
            if let Some(browser) = self.browsers.get(id) {
                browser.begin_drain();
                log::info!("draining browser {id} (scale-down)");
                self.events.publish(CoreEvent::RecycleStarted { browser_id: id.clone() });
            }
        }
        candidate
    }

    /// Cooperatively finish draining `browser_id`: wait up to
    /// `drain_timeout` for `pageCount == 0`, then force-terminate.
    pub async fn finish_drain(&self, browser_id: &str, drain_timeout: Duration) {
        let Some(browser) = self.get_browser(browser_id) else { return };
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while browser.page_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        browser.mark_terminated();
        let _ = browser.handle().close();
        self.browsers.remove(browser_id);
        self.consecutive_unhealthy.remove(browser_id);
        self.sticky.retain(|_, v| v.as_str() != browser_id);
        log::info!("browser {browser_id} retired (recycled)");
        self.events.publish(CoreEvent::BrowserRetired {
            browser_id: browser_id.to_string(),
            reason: "recycled".into(),
        });
    }

    /// One health-loop tick: probe every browser, and mark
    /// `unhealthy` any that fail twice in a row. Returns the ids that
    /// *newly* became unhealthy this tick, for the health monitor (C12)
    /// to run its recovery chain against.
    pub async fn health_tick(&self) -> Vec<String> {
        let mut newly_unhealthy = Vec::new();
        let ids = self.browser_ids();
        for id in ids {
            let Some(browser) = self.get_browser(&id) else { continue };
            let handle_clone = browser.clone();
            let probe = tokio::task::spawn_blocking(move || handle_clone.check_health())
                .await
                .unwrap_or(Probe::Disconnected);

            let count = if probe == Probe::Healthy {
                self.consecutive_unhealthy.remove(&id);
                if !browser.is_healthy() {
                    self.events.publish(CoreEvent::HealthCheckRecovered { browser_id: id.clone() });
                }
                0
            } else {
                let mut entry = self.consecutive_unhealthy.entry(id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            if count >= 2 && browser.state() != BrowserState::Draining {
                log::warn!("⚠️ browser {id} failed {count} consecutive health probes ({probe:?}), quarantining");
                browser.begin_drain();
                self.events.publish(CoreEvent::HealthCheckFailed {
                    browser_id: id.clone(),
                    reason: format!("{probe:?}"),
                });
                newly_unhealthy.push(id);
            }
        }
        newly_unhealthy
    }

    /// Refuse new acquires, drain queued waiters with `Unavailable`, close
    /// every browser within `deadline` (hard-killing stragglers).
    pub async fn shutdown(&self, deadline: Duration) {
        log::info!("pool shutting down: draining {} browser(s) within {:?}", self.browsers.len(), deadline);
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut waiters = self.waiters.lock().await;
        while let Some(waiter) = waiters.pop_front() {
            let _ = waiter
                .tx
                .send(Err(CoreError::Unavailable("pool is shutting down".into())));
        }
        drop(waiters);

        let deadline_at = tokio::time::Instant::now() + deadline;
        let ids = self.browser_ids();
        for id in ids {
            if let Some(browser) = self.get_browser(&id) {
                browser.begin_drain();
                while browser.page_count() > 0 && tokio::time::Instant::now() < deadline_at {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                browser.mark_terminated();
                let _ = browser.handle().close();
            }
        }
        self.browsers.clear();
        self.sticky.clear();
        log::info!("✅ pool shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UuidGenerator;
    use crate::driver::mock::MockDriver;

    fn pool(config: BrowserPoolConfig) -> BrowserPool {
        BrowserPool::new(
            config,
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn acquire_sticks_to_the_same_browser() {
        let pool = pool(BrowserPoolConfig {
            max_browsers: 2,
            ..Default::default()
        });
        let b1 = pool.acquire("s1").await.unwrap();
        pool.release(b1.id(), "s1").await.unwrap();
        let b2 = pool.acquire("s1").await.unwrap();
        assert_eq!(b1.id(), b2.id());
    }

    #[tokio::test]
    async fn saturated_pool_times_out_with_resource_exhausted() {
        let pool = pool(BrowserPoolConfig {
            max_browsers: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let _held = pool.acquire("s1").await.unwrap();
        let start = std::time::Instant::now();
        let err = pool.acquire("s2").await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn release_wakes_exactly_one_waiter() {
        let pool = Arc::new(pool(BrowserPoolConfig {
            max_browsers: 1,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        }));
        let held = pool.acquire("s1").await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("s2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held.id(), "s1").await.unwrap();
        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.id(), held.id());
    }

    #[tokio::test]
    async fn create_page_respects_max_pages_per_browser() {
        let pool = pool(BrowserPoolConfig {
            max_browsers: 1,
            max_pages_per_browser: 1,
            ..Default::default()
        });
        let browser = pool.acquire("s1").await.unwrap();
        pool.create_page(browser.id(), "s1").await.unwrap();
        let err = pool.create_page(browser.id(), "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn create_page_by_non_owner_is_forbidden() {
        let pool = pool(BrowserPoolConfig {
            max_browsers: 1,
            ..Default::default()
        });
        let browser = pool.acquire("s1").await.unwrap();
        let err = pool.create_page(browser.id(), "s2").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn health_tick_quarantines_after_two_failures() {
        let driver = Arc::new(MockDriver::new());
        let pool = BrowserPool::new(
            BrowserPoolConfig { max_browsers: 1, ..Default::default() },
            driver.clone(),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        );
        let browser = pool.acquire("s1").await.unwrap();
        pool.release(browser.id(), "s1").await.unwrap();
        let control = driver.last_control().unwrap();
        control.simulate_crash();

        assert!(pool.health_tick().await.is_empty());
        let newly_unhealthy = pool.health_tick().await;
        assert_eq!(newly_unhealthy, vec![browser.id().to_string()]);
        assert_eq!(browser.state(), BrowserState::Draining);
    }

    #[tokio::test]
    async fn scale_down_never_drops_below_min_browsers() {
        let pool = pool(BrowserPoolConfig {
            min_browsers: 1,
            max_browsers: 2,
            ..Default::default()
        });
        pool.warmup().await.unwrap();
        assert!(pool.mark_one_for_drain().is_none());
    }
}
