//! Top-level facade wiring every component together.
//!
//! `Core` is what a transport (out of scope here) would hold one instance
//! of: it owns the session store, credential verifier, browser pool, page/
//! context managers, scaler, and health monitor, and exposes exactly the
//! session/context/status operations below. Every operation that touches a
//! session-owned resource takes the caller's `sessionId` and relies on the
//! manager underneath (`ContextManager`/`PageManager`) to enforce
//! ownership; `Core` adds no ownership logic of its own, it only assembles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::action::{ActionExecutor, ActionRequest, ActionResponse, ACTION_NAMES};
use crate::auth::{ApiKeyStore, Credential, CredentialVerifier, Principal, UserStore};
use crate::browser::pool::{BrowserPool, BREAKER_ACQUIRE};
use crate::circuit::{BreakerStatus, CircuitBreaker};
use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::config::CoreConfig;
use crate::context::{ContextInfo, ContextManager};
use crate::driver::Driver;
use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::health::{spawn_health_loop, HealthMonitor, ProbeStrategy};
use crate::page::{spawn_idle_sweep_loop, PageInfo, PageManager, PageOptions};
use crate::scaler::{spawn_scaler_loop, Scaler};
use crate::session::{spawn_purge_loop, NewSession, SessionStore};

/// Result of `CreateSession`.
#[derive(Debug, Clone)]
pub struct SessionLogin {
    pub session_id: String,
    pub user_id: String,
    pub roles: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub access_token: String,
    pub refresh_token: String,
}

/// One row of `ListSessions`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Overall health verdict for `Health()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Result of `Health()`.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_browsers: usize,
    pub idle_browsers: usize,
    pub active_browsers: usize,
    pub draining_browsers: usize,
    pub queued_waiters: usize,
    pub acquire_breaker: BreakerStatus,
    pub issues: Vec<String>,
}

/// Result of `Catalog()`.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub actions: &'static [&'static str],
    pub transports: &'static [&'static str],
    pub auth_methods: &'static [&'static str],
}

/// The join handles of every background loop `Core::start` spawns, kept so
/// `Core::shutdown` can signal and await them.
struct BackgroundLoops {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Everything the core needs to serve `CreateSession`/`CreateContext`/
/// `ExecuteAction` and friends, fully wired.
pub struct Core {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    sessions: Arc<SessionStore>,
    verifier: Arc<CredentialVerifier>,
    users: UserStore,
    pool: Arc<BrowserPool>,
    pages: Arc<PageManager>,
    actions: Arc<ActionExecutor>,
    contexts: Arc<ContextManager>,
    scaler: Arc<Scaler>,
    health: Arc<HealthMonitor>,
    circuit: Arc<CircuitBreaker>,
    background: std::sync::Mutex<Option<BackgroundLoops>>,
}

impl Core {
    /// Assemble every component from one [`CoreConfig`], a driver
    /// implementation, and the credential material a deployment supplies
    /// out of band (HMAC secret, registered users, registered API keys).
    pub fn new(config: CoreConfig, driver: Arc<dyn Driver>, hmac_secret: &[u8], users: UserStore, api_keys: ApiKeyStore) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);
        let events = EventBus::default();

        let circuit = Arc::new(CircuitBreaker::new(events.clone()));
        let pool = Arc::new(BrowserPool::new(config.pool.clone(), driver, ids.clone(), circuit.clone(), events.clone()));
        let sessions = Arc::new(SessionStore::new(clock.clone(), ids.clone(), events.clone()));
        let verifier = Arc::new(CredentialVerifier::new(hmac_secret, api_keys, sessions.clone(), events.clone()));
        let pages = Arc::new(PageManager::new(pool.clone(), clock.clone(), ids.clone(), events.clone()));
        let actions = Arc::new(ActionExecutor::new(pages.clone()));
        let contexts = Arc::new(ContextManager::new(
            pool.clone(),
            pages.clone(),
            actions.clone(),
            clock.clone(),
            ids.clone(),
            events.clone(),
        ));
        let scaler = Arc::new(Scaler::new(pool.clone(), config.scaler.clone(), events.clone()));
        let health = Arc::new(HealthMonitor::new(
            pool.clone(),
            Arc::new(ProbeStrategy),
            config.health_monitor.tick_interval,
            events.clone(),
        ));

        Self {
            config,
            clock,
            events,
            sessions,
            verifier,
            users,
            pool,
            pages,
            actions,
            contexts,
            scaler,
            health,
            circuit,
            background: std::sync::Mutex::new(None),
        }
    }

    /// Warm up the pool and start every background loop (session purge,
    /// idle-page sweep, scaler tick, health tick). Call once at startup.
    pub async fn start(&self) -> Result<()> {
        log::info!("starting core: warming up browser pool...");
        self.pool.warmup().await?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handles = vec![
            spawn_purge_loop(self.sessions.clone(), self.config.session_store.purge_interval, shutdown_rx.clone()),
            spawn_idle_sweep_loop(
                self.pages.clone(),
                self.config.page_manager.idle_sweep_interval,
                self.config.page_manager.idle_threshold,
                shutdown_rx.clone(),
            ),
            spawn_scaler_loop(self.scaler.clone(), shutdown_rx.clone()),
            spawn_health_loop(self.health.clone(), shutdown_rx),
        ];
        *self.background.lock().expect("background-loop lock poisoned") = Some(BackgroundLoops { shutdown_tx, handles });
        log::info!("✅ core started: pool warmed, background loops running");
        Ok(())
    }

    /// Signal every background loop to stop, await them, then drain the
    /// pool itself.
    pub async fn shutdown(&self, deadline: Duration) {
        log::info!("core shutdown requested, deadline {deadline:?}");
        let loops = self.background.lock().expect("background-loop lock poisoned").take();
        if let Some(loops) = loops {
            let _ = loops.shutdown_tx.send(true);
            for handle in loops.handles {
                let _ = handle.await;
            }
        }
        self.pool.shutdown(deadline).await;
        log::info!("✅ core shutdown complete");
    }

    /// Resolve any of the three credential shapes to a [`Principal`].
    /// The caller (whatever sits above this core) uses the resolved
    /// `session_id` for every subsequent call below.
    pub fn authenticate(&self, credential: &Credential) -> Result<Principal> {
        self.verifier.verify(credential, self.clock.now_utc())
    }

    /// `CreateSession(username, password, duration?)`.
    pub fn create_session(&self, username: &str, password: &str, duration: Option<Duration>) -> Result<SessionLogin> {
        let user = self
            .users
            .verify_password(username, password)
            .ok_or_else(|| CoreError::Unauthenticated("invalid username or password".into()))?;
        let record = self.sessions.create(NewSession {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            duration: duration.unwrap_or(self.config.session_store.default_session_duration),
            metadata: serde_json::json!({}),
        });
        let now = record.created_at;
        let claims = crate::auth::AccessTokenClaims {
            sub: record.user_id.clone(),
            username: record.username.clone(),
            roles: record.roles.iter().cloned().collect(),
            session_id: record.session_id.clone(),
            iat: now.timestamp(),
            exp: record.expires_at.timestamp(),
        };
        let access_token = self.verifier.issue_access_token(&claims)?;
        let refresh_token = self.verifier.issue_refresh_token(&claims)?;
        log::debug!("session {} created for user {username}", record.session_id);
        Ok(SessionLogin {
            session_id: record.session_id,
            user_id: record.user_id,
            roles: record.roles.into_iter().collect(),
            expires_at: record.expires_at,
            access_token,
            refresh_token,
        })
    }

    /// `DeleteSession(sessionId)`. Closes every context/page the
    /// session owns before removing the record itself.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.contexts.delete_contexts_for_session(session_id);
        self.pages.close_pages_for_session(session_id);
        if self.sessions.delete(session_id) {
            log::debug!("session {session_id} deleted");
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("session {session_id} not found")))
        }
    }

    /// `ListSessions(userId)`.
    pub fn list_sessions(&self, user_id: &str) -> Vec<SessionSummary> {
        self.sessions
            .list_by_user(user_id)
            .into_iter()
            .map(|r| SessionSummary {
                session_id: r.session_id,
                user_id: r.user_id,
                username: r.username,
                created_at: r.created_at,
                last_activity_at: r.last_activity_at,
                expires_at: r.expires_at,
            })
            .collect()
    }

    /// `CreateContext(sessionId, options?)`. Fails with
    /// `Unauthenticated` if the session is not live, otherwise delegates to
    /// the context manager, which acquires a browser from the pool.
    pub async fn create_context(&self, session_id: &str) -> Result<ContextInfo> {
        self.require_live_session(session_id)?;
        self.contexts.create_context(session_id).await
    }

    /// `ListContexts(sessionId)`.
    pub fn list_contexts(&self, session_id: &str) -> Vec<ContextInfo> {
        self.contexts.list_for_session(session_id)
    }

    /// `CloseContext(sessionId, contextId)`.
    pub fn close_context(&self, session_id: &str, context_id: &str) -> Result<()> {
        self.contexts.delete_context(context_id, session_id)
    }

    /// Create a page inside an existing context, with caller-supplied
    /// options (viewport, user agent, cookies, ...).
    pub async fn create_page(&self, context_id: &str, session_id: &str, options: PageOptions) -> Result<PageInfo> {
        self.contexts.create_page(context_id, session_id, options).await
    }

    /// `ExecuteAction(contextId, sessionId, action, args)`, the
    /// single entry point for driving a page inside a context.
    pub fn execute_action(&self, context_id: &str, session_id: &str, request: ActionRequest) -> Result<ActionResponse> {
        self.contexts.execute_action(context_id, session_id, request)
    }

    fn require_live_session(&self, session_id: &str) -> Result<()> {
        self.sessions
            .get(session_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::Unauthenticated(format!("session {session_id} expired or unknown")))
    }

    /// `Health()`. `warning` once the pool has no idle capacity and
    /// a queued waiter; `critical` once the acquire breaker has tripped.
    pub fn health(&self) -> HealthReport {
        let snapshot = self.pool.snapshot();
        let acquire_breaker = self.circuit.status(BREAKER_ACQUIRE);
        let mut issues = Vec::new();

        let status = if acquire_breaker == BreakerStatus::Open {
            issues.push("browser acquisition circuit breaker is open".to_string());
            HealthStatus::Critical
        } else if snapshot.idle == 0 && snapshot.queued_waiters > 0 {
            issues.push("pool saturated: no idle browsers and callers are queued".to_string());
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            total_browsers: snapshot.total,
            idle_browsers: snapshot.idle,
            active_browsers: snapshot.active,
            draining_browsers: snapshot.draining,
            queued_waiters: snapshot.queued_waiters,
            acquire_breaker,
            issues,
        }
    }

    /// `Catalog()`. Transports are listed for completeness only;
    /// none of them are implemented by this crate.
    pub fn catalog(&self) -> Catalog {
        Catalog {
            actions: ACTION_NAMES,
            transports: &["rest", "grpc", "websocket", "mcp"],
            auth_methods: &["bearer", "apiKey", "rawSessionId"],
        }
    }
}
