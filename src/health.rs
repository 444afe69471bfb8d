//! C12: health monitor and recovery.
//!
//! Generalizes a single liveness `ping` into a pluggable [`Strategy`] trait
//! so a future façade-specific probe (e.g. a WebSocket keep-alive) can be
//! swapped in without touching the monitor itself, plus a three-stage
//! escalating recovery chain driven off the pool's own liveness probe:
//! soft reconnect, kill-and-relaunch, delete-and-reprovision. A browser
//! escalates to the next stage only after failing the current one twice
//! in a row.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::browser::instance::BrowserInstance;
use crate::browser::pool::BrowserPool;
use crate::driver::Probe;
use crate::events::{CoreEvent, EventBus};

/// One issue a [`Strategy`] can flag about a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    Unresponsive,
    TooManyErrors { count: u64 },
    TooOld { age: Duration },
}

/// Pluggable liveness/quality check over one browser.
pub trait Strategy: Send + Sync {
    fn check(&self, browser: &BrowserInstance) -> Vec<Issue>;
}

/// The default strategy: just the driver's own liveness probe.
pub struct ProbeStrategy;

impl Strategy for ProbeStrategy {
    fn check(&self, browser: &BrowserInstance) -> Vec<Issue> {
        if browser.is_healthy() {
            Vec::new()
        } else {
            vec![Issue::Unresponsive]
        }
    }
}

/// The three escalating recovery actions, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    /// Re-probe; many "unresponsive" blips are transient.
    SoftReconnect,
    /// Drain and relaunch a replacement, trading the browser's identity.
    KillAndRelaunch,
    /// Drop the slot entirely; the scaler/pool re-provisions on demand.
    DeleteAndReprovision,
}

const STAGES: [RecoveryStage; 3] = [
    RecoveryStage::SoftReconnect,
    RecoveryStage::KillAndRelaunch,
    RecoveryStage::DeleteAndReprovision,
];

/// Consecutive failures of the current stage before escalating.
const ESCALATE_AFTER: u32 = 2;

/// Runs the pool's liveness tick and the recovery chain for anything it
/// finds newly unhealthy.
pub struct HealthMonitor {
    pool: Arc<BrowserPool>,
    strategy: Arc<dyn Strategy>,
    stage_index: DashMap<String, usize>,
    consecutive_failures: DashMap<String, u32>,
    tick_interval: Duration,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BrowserPool>, strategy: Arc<dyn Strategy>, tick_interval: Duration, events: EventBus) -> Self {
        Self {
            pool,
            strategy,
            stage_index: DashMap::new(),
            consecutive_failures: DashMap::new(),
            tick_interval,
            events,
        }
    }

    /// One full monitor tick: probe every browser via the pool, then run
    /// the recovery chain for anything that just crossed into unhealthy.
    pub async fn tick(&self) -> Vec<String> {
        let newly_unhealthy = self.pool.health_tick().await;
        for id in &newly_unhealthy {
            self.recover_one(id).await;
        }
        newly_unhealthy
    }

    fn current_stage(&self, browser_id: &str) -> RecoveryStage {
        let idx = self.stage_index.get(browser_id).map(|v| *v).unwrap_or(0);
        STAGES[idx.min(STAGES.len() - 1)]
    }

    async fn recover_one(&self, browser_id: &str) {
        let stage = self.current_stage(browser_id);
        let recovered = self.attempt(stage, browser_id).await;

        if recovered {
            self.stage_index.remove(browser_id);
            self.consecutive_failures.remove(browser_id);
            self.events.publish(CoreEvent::HealthCheckRecovered { browser_id: browser_id.to_string() });
            return;
        }

        let failures = {
            let mut entry = self.consecutive_failures.entry(browser_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if failures >= ESCALATE_AFTER {
            let idx = self.stage_index.get(browser_id).map(|v| *v).unwrap_or(0);
            let next = (idx + 1).min(STAGES.len() - 1);
            self.stage_index.insert(browser_id.to_string(), next);
            self.consecutive_failures.insert(browser_id.to_string(), 0);
            log::warn!(
                "browser {browser_id} escalating to recovery stage {:?} after {failures} failures",
                STAGES[next]
            );
        }
    }

    async fn attempt(&self, stage: RecoveryStage, browser_id: &str) -> bool {
        match stage {
            RecoveryStage::SoftReconnect => {
                let Some(browser) = self.pool.get_browser(browser_id) else { return false };
                if !self.strategy.check(&browser).is_empty() {
                    return false;
                }
                let probe = tokio::task::spawn_blocking(move || browser.check_health())
                    .await
                    .unwrap_or(Probe::Disconnected);
                probe == Probe::Healthy
            }
            RecoveryStage::KillAndRelaunch => {
                self.pool.finish_drain(browser_id, Duration::from_secs(5)).await;
                self.pool.scale_up(1).await.map(|n| n > 0).unwrap_or(false)
            }
            RecoveryStage::DeleteAndReprovision => {
                self.pool.finish_drain(browser_id, Duration::from_secs(1)).await;
                let _ = self.pool.scale_up(1).await;
                true
            }
        }
    }
}

pub fn spawn_health_loop(monitor: Arc<HealthMonitor>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let interval = monitor.tick_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let unhealthy = monitor.tick().await;
                    if !unhealthy.is_empty() {
                        log::debug!("health tick found {} newly unhealthy browser(s)", unhealthy.len());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::pool::BrowserPoolConfig;
    use crate::circuit::CircuitBreaker;
    use crate::clock::UuidGenerator;
    use crate::driver::mock::MockDriver;

    fn monitor(pool: Arc<BrowserPool>) -> HealthMonitor {
        HealthMonitor::new(pool, Arc::new(ProbeStrategy), Duration::from_secs(30), EventBus::default())
    }

    #[tokio::test]
    async fn healthy_pool_reports_nothing_unhealthy() {
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { max_browsers: 1, ..Default::default() },
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        pool.warmup().await.unwrap();
        let monitor = monitor(pool);
        assert!(monitor.tick().await.is_empty());
    }

    #[tokio::test]
    async fn crashed_browser_escalates_through_recovery_stages() {
        let driver = Arc::new(MockDriver::new());
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { min_browsers: 1, max_browsers: 2, ..Default::default() },
            driver.clone(),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        pool.warmup().await.unwrap();
        let browser_id = pool.browser_ids().remove(0);
        driver.last_control().unwrap().simulate_crash();

        let monitor = monitor(pool.clone());
        // First pool tick just counts one failure, nothing newly unhealthy yet.
        assert!(monitor.tick().await.is_empty());
        // Second pool tick crosses the pool's own two-strikes threshold and
        // triggers stage 1 (soft reconnect), which fails since the probe is
        // still crashed.
        let unhealthy = monitor.tick().await;
        assert_eq!(unhealthy, vec![browser_id.clone()]);
        assert_eq!(monitor.consecutive_failures.get(&browser_id).map(|v| *v), Some(1));
    }
}
