//! C7: per-operation circuit breaker.
//!
//! Keyed by operation name (`"browser-acquisition"`, `"page-creation"`,
//! ...). Each key's state machine (`closed -> open -> half-open -> closed`)
//! transitions atomically under its own per-key lock, never under the
//! bus-wide lock of [`EventBus`](crate::events::EventBus) or any pool lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};

/// Tunables for one breaker key.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failures within the current closed window before tripping open.
    pub error_threshold: u32,
    /// How long a tripped breaker stays open before admitting probes.
    pub open_duration: Duration,
    /// Concurrent probes admitted once half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 10,
            open_duration: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { probes_remaining: u32, successes: u32 },
}

struct Breaker {
    state: Mutex<State>,
    config: CircuitBreakerConfig,
}

/// Observable snapshot of one breaker key, for introspection/health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Per-operation failure gate protecting acquire and page-create.
pub struct CircuitBreaker {
    breakers: DashMap<String, Breaker>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            events,
        }
    }

    fn breaker(&self, key: &str, config: CircuitBreakerConfig) -> dashmap::mapref::one::RefMut<'_, String, Breaker> {
        self.breakers.entry(key.to_string()).or_insert_with(|| Breaker {
            state: Mutex::new(State::Closed { failures: 0 }),
            config,
        })
    }

    pub fn status(&self, key: &str) -> BreakerStatus {
        match self.breakers.get(key) {
            None => BreakerStatus::Closed,
            Some(b) => match *b.state.lock().expect("breaker lock poisoned") {
                State::Closed { .. } => BreakerStatus::Closed,
                State::Open { .. } => BreakerStatus::Open,
                State::HalfOpen { .. } => BreakerStatus::HalfOpen,
            },
        }
    }

    /// Decide whether `key` currently admits a call. Transitions
    /// `open -> half-open` on its own once `open_duration` elapses.
    fn admit(&self, key: &str, config: CircuitBreakerConfig) -> bool {
        let breaker = self.breaker(key, config);
        let mut state = breaker.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= breaker.config.open_duration {
                    *state = State::HalfOpen {
                        probes_remaining: breaker.config.half_open_probes,
                        successes: 0,
                    };
                    log::info!("circuit '{key}' half-open after {:?}, admitting probes", breaker.config.open_duration);
                    self.events.publish(CoreEvent::CircuitHalfOpen { key: key.to_string() });
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probes_remaining, .. } => probes_remaining > 0,
        }
    }

    fn record_success(&self, key: &str) {
        if let Some(breaker) = self.breakers.get(key) {
            let mut state = breaker.state.lock().expect("breaker lock poisoned");
            match *state {
                State::Closed { .. } => *state = State::Closed { failures: 0 },
                State::HalfOpen { probes_remaining, successes } => {
                    let successes = successes + 1;
                    if successes >= breaker.config.half_open_probes {
                        *state = State::Closed { failures: 0 };
                        log::info!("✅ circuit '{key}' closed after {successes} successful probe(s)");
                        self.events.publish(CoreEvent::CircuitClosed { key: key.to_string() });
                    } else {
                        *state = State::HalfOpen {
                            probes_remaining: probes_remaining.saturating_sub(1),
                            successes,
                        };
                    }
                }
                State::Open { .. } => {}
            }
        }
    }

    fn record_failure(&self, key: &str, config: CircuitBreakerConfig) {
        let breaker = self.breaker(key, config);
        let mut state = breaker.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= breaker.config.error_threshold {
                    *state = State::Open { since: Instant::now() };
                    log::warn!("⚠️ circuit '{key}' tripped open after {failures} consecutive failure(s)");
                    self.events.publish(CoreEvent::CircuitOpened { key: key.to_string() });
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open { since: Instant::now() };
                log::warn!("⚠️ circuit '{key}' reopened: probe failed while half-open");
                self.events.publish(CoreEvent::CircuitOpened { key: key.to_string() });
            }
            State::Open { .. } => {}
        }
    }

    /// Run `f` under the breaker at `key`. If the breaker is open and no
    /// `fallback` is given, short-circuits with `Unavailable` without
    /// calling `f`. A fallback's success never closes the breaker.
    pub fn call<T>(&self, key: &str, config: CircuitBreakerConfig, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.call_with_fallback(key, config, f, || {
            Err(CoreError::Unavailable(format!("circuit '{key}' is open")))
        })
    }

    pub fn call_with_fallback<T>(
        &self,
        key: &str,
        config: CircuitBreakerConfig,
        f: impl FnOnce() -> Result<T>,
        fallback: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !self.admit(key, config) {
            return fallback();
        }
        match f() {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(key, config);
                Err(err)
            }
        }
    }
}
