//! C11: scaler and recycler.
//!
//! A stateless-policy-on-a-tick loop: it has no lifecycle of its own, just
//! a function of the pool's current snapshot, run periodically, with no
//! state that would need to survive a restart beyond the rolling
//! utilization window. Each tick: sample utilization, smooth it over the
//! last N samples, and either scale up, mark one browser down for drain,
//! or do nothing, always respecting `cooldown`/`minBrowsers`/`maxBrowsers`/
//! `maxScaleStep`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::browser::instance::BrowserState;
use crate::browser::pool::BrowserPool;
use crate::events::{CoreEvent, EventBus};

/// Tunables for [`Scaler`].
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub tick_interval: Duration,
    pub window_size: usize,
    pub scale_up_utilization: f64,
    pub scale_down_utilization: f64,
    pub cooldown: Duration,
    pub max_scale_step: usize,
    pub drain_timeout: Duration,
    /// A browser having served more than this many pages over its
    /// lifetime is a recycle candidate.
    pub recycle_after_pages: u64,
    /// A browser older than this is a recycle candidate.
    pub recycle_after_age: Duration,
    /// A browser whose estimated memory footprint exceeds this is a
    /// recycle candidate.
    pub recycle_after_memory_bytes: u64,
    /// A browser with more than this many driver errors is a recycle
    /// candidate.
    pub recycle_after_errors: u64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            window_size: 5,
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.2,
            cooldown: Duration::from_secs(60),
            max_scale_step: 2,
            drain_timeout: Duration::from_secs(30),
            recycle_after_pages: 500,
            recycle_after_age: Duration::from_secs(2 * 60 * 60),
            recycle_after_memory_bytes: 1024 * 1024 * 1024,
            recycle_after_errors: 20,
        }
    }
}

/// What one tick decided to do, for logging/tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleDecision {
    None,
    ScaledUp(usize),
    ScaledDown,
    Recycled,
    Cooldown,
}

/// One idle/active browser that tripped at least one recycle condition,
/// ranked by how many it tripped.
#[derive(Debug, Clone)]
struct RecycleCandidate {
    browser_id: String,
    urgency: u32,
}

/// Periodic utilization-driven scale-up/scale-down policy over a [`BrowserPool`].
pub struct Scaler {
    pool: Arc<BrowserPool>,
    config: ScalerConfig,
    samples: Mutex<VecDeque<f64>>,
    last_scale_at: Mutex<Option<Instant>>,
    events: EventBus,
}

impl Scaler {
    pub fn new(pool: Arc<BrowserPool>, config: ScalerConfig, events: EventBus) -> Self {
        let window_size = config.window_size;
        Self {
            pool,
            config,
            samples: Mutex::new(VecDeque::with_capacity(window_size)),
            last_scale_at: Mutex::new(None),
            events,
        }
    }

    fn smoothed_utilization(&self, sample: f64) -> f64 {
        let mut samples = self.samples.lock().expect("scaler sample lock poisoned");
        samples.push_back(sample);
        while samples.len() > self.config.window_size {
            samples.pop_front();
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    fn in_cooldown(&self) -> bool {
        match *self.last_scale_at.lock().expect("scaler cooldown lock poisoned") {
            Some(at) => at.elapsed() < self.config.cooldown,
            None => false,
        }
    }

    fn mark_scaled(&self) {
        *self.last_scale_at.lock().expect("scaler cooldown lock poisoned") = Some(Instant::now());
    }

    /// Run one policy tick. Returns the decision made, mainly for tests.
    pub async fn tick(&self) -> ScaleDecision {
        let snapshot = self.pool.snapshot();
        if snapshot.total == 0 {
            return ScaleDecision::None;
        }
        let utilization = snapshot.active as f64 / snapshot.total as f64;
        let smoothed = self.smoothed_utilization(utilization);

        if !self.in_cooldown() {
            if smoothed >= self.config.scale_up_utilization && snapshot.total < self.pool.config().max_browsers {
                let launched = self.pool.scale_up(self.config.max_scale_step).await.unwrap_or(0);
                if launched > 0 {
                    self.mark_scaled();
                    self.events.publish(CoreEvent::ScaledUp {
                        by: launched,
                        new_size: self.pool.size(),
                    });
                    return ScaleDecision::ScaledUp(launched);
                }
            } else if smoothed <= self.config.scale_down_utilization && snapshot.total > self.pool.config().min_browsers {
                if let Some(browser_id) = self.pool.mark_one_for_drain() {
                    self.mark_scaled();
                    self.pool.finish_drain(&browser_id, self.config.drain_timeout).await;
                    self.events.publish(CoreEvent::ScaledDown {
                        by: 1,
                        new_size: self.pool.size(),
                    });
                    return ScaleDecision::ScaledDown;
                }
            }
        }

        if self.recycle_tick().await {
            return ScaleDecision::Recycled;
        }

        if self.in_cooldown() {
            ScaleDecision::Cooldown
        } else {
            ScaleDecision::None
        }
    }

    /// Score every idle/active browser against the five recycle
    /// conditions (pages served, age, memory estimate, error count,
    /// unhealthy), most urgent first.
    fn recycle_candidates(&self) -> Vec<RecycleCandidate> {
        let mut candidates = Vec::new();
        for id in self.pool.browser_ids() {
            let Some(browser) = self.pool.get_browser(&id) else { continue };
            if !matches!(browser.state(), BrowserState::Idle | BrowserState::Active) {
                continue;
            }
            let mut urgency = 0u32;
            if browser.total_pages_created() > self.config.recycle_after_pages {
                urgency += 1;
            }
            if browser.age() > self.config.recycle_after_age {
                urgency += 1;
            }
            if browser.memory_estimate_bytes() > self.config.recycle_after_memory_bytes {
                urgency += 1;
            }
            if browser.error_count() > self.config.recycle_after_errors {
                urgency += 1;
            }
            if !browser.is_healthy() {
                urgency += 1;
            }
            if urgency > 0 {
                candidates.push(RecycleCandidate { browser_id: id, urgency });
            }
        }
        candidates.sort_by(|a, b| b.urgency.cmp(&a.urgency));
        candidates
    }

    /// Drain the single most urgent recycle candidate, if any, never
    /// dropping the pool below `minBrowsers`. Cooperative: waits up to
    /// `drainTimeout` for the browser's pages to close before forcing.
    async fn recycle_tick(&self) -> bool {
        if self.pool.size() <= self.pool.config().min_browsers {
            return false;
        }
        let Some(top) = self.recycle_candidates().into_iter().next() else {
            return false;
        };
        let Some(browser) = self.pool.get_browser(&top.browser_id) else {
            return false;
        };
        if browser.state() == BrowserState::Draining {
            return false;
        }
        log::info!("recycling browser {} (urgency={})", top.browser_id, top.urgency);
        browser.begin_drain();
        self.events.publish(CoreEvent::RecycleStarted { browser_id: top.browser_id.clone() });
        self.pool.finish_drain(&top.browser_id, self.config.drain_timeout).await;
        true
    }
}

pub fn spawn_scaler_loop(scaler: Arc<Scaler>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let interval = scaler.config.tick_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let decision = scaler.tick().await;
                    log::debug!("scaler tick: {decision:?}");
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreaker;
    use crate::clock::UuidGenerator;
    use crate::driver::mock::MockDriver;
    use crate::browser::pool::BrowserPoolConfig;

    fn pool(config: BrowserPoolConfig) -> Arc<BrowserPool> {
        Arc::new(BrowserPool::new(
            config,
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ))
    }

    #[tokio::test]
    async fn idle_pool_never_scales() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        pool.warmup().await.unwrap();
        let scaler = Scaler::new(pool, ScalerConfig { window_size: 1, ..Default::default() }, EventBus::default());
        assert_eq!(scaler.tick().await, ScaleDecision::None);
    }

    #[tokio::test]
    async fn full_utilization_scales_up() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        let _held = pool.acquire("s1").await.unwrap();
        let scaler = Scaler::new(pool, ScalerConfig { window_size: 1, scale_up_utilization: 0.5, ..Default::default() }, EventBus::default());
        let decision = scaler.tick().await;
        assert!(matches!(decision, ScaleDecision::ScaledUp(_)));
    }

    #[tokio::test]
    async fn second_tick_within_cooldown_is_a_no_op() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        let _held = pool.acquire("s1").await.unwrap();
        let scaler = Scaler::new(
            pool,
            ScalerConfig { window_size: 1, scale_up_utilization: 0.5, cooldown: Duration::from_secs(60), ..Default::default() },
            EventBus::default(),
        );
        assert!(matches!(scaler.tick().await, ScaleDecision::ScaledUp(_)));
        assert_eq!(scaler.tick().await, ScaleDecision::Cooldown);
    }

    #[tokio::test]
    async fn low_utilization_scales_down_but_not_below_min() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        pool.scale_up(2).await.unwrap();
        let scaler = Scaler::new(pool.clone(), ScalerConfig { window_size: 1, scale_down_utilization: 0.9, ..Default::default() }, EventBus::default());
        assert_eq!(scaler.tick().await, ScaleDecision::ScaledDown);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn browser_over_recycle_after_pages_gets_recycled() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        pool.scale_up(2).await.unwrap();
        let over_limit = pool.browser_ids().into_iter().next().unwrap();
        let browser = pool.get_browser(&over_limit).unwrap();
        for _ in 0..5 {
            browser.note_page_opened();
        }
        let scaler = Scaler::new(
            pool.clone(),
            ScalerConfig {
                window_size: 1,
                recycle_after_pages: 3,
                drain_timeout: Duration::from_millis(20),
                scale_down_utilization: -1.0,
                ..Default::default()
            },
            EventBus::default(),
        );
        assert_eq!(scaler.tick().await, ScaleDecision::Recycled);
        assert!(pool.get_browser(&over_limit).is_none());
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn recycling_never_drops_below_min_browsers() {
        let pool = pool(BrowserPoolConfig { min_browsers: 1, max_browsers: 3, ..Default::default() });
        pool.warmup().await.unwrap();
        let only = pool.browser_ids().into_iter().next().unwrap();
        pool.get_browser(&only).unwrap().note_error();
        for _ in 0..25 {
            pool.get_browser(&only).unwrap().note_error();
        }
        let scaler = Scaler::new(
            pool.clone(),
            ScalerConfig { window_size: 1, recycle_after_errors: 1, ..Default::default() },
            EventBus::default(),
        );
        assert_eq!(scaler.tick().await, ScaleDecision::None);
        assert_eq!(pool.size(), 1);
    }
}
