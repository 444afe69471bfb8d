//! # browser-pool-core
//!
//! The internal core behind a pooled, multi-tenant headless-browser compute
//! service: a bounded fleet of browser processes, sessions that own logical
//! contexts, contexts that own pages projected onto pool browsers, and a
//! fixed action dispatch table (navigate, evaluate, screenshot, PDF, cookies,
//! ...) that drives them.
//!
//! Four transports (REST, gRPC, WebSocket, and an MCP-style tool protocol)
//! would sit in front of this crate in a full deployment. None of them are
//! built here; this crate is exactly the part a transport calls into, not
//! the transport itself. A transport authenticates the caller (via
//! [`auth::CredentialVerifier`]), resolves a [`auth::Principal`], and then
//! drives [`core::Core`]'s operations with that principal's `session_id`.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │      Transport façade (out of scope: REST/gRPC/WS/MCP)     │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ authenticate, then call Core
//!                             ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                           core::Core                        │
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────────┐ │
//! │  │ session (C3) │──▶│ context (C9)  │──▶│ page manager (C8)│ │
//! │  │ auth    (C4) │   │ action   (C10)│   └────────┬─────────┘ │
//! │  └─────────────┘   └───────────────┘            │           │
//! │                                                   ▼           │
//! │  ┌─────────────┐   ┌───────────────┐   ┌──────────────────┐ │
//! │  │ scaler (C11) │◀─▶│ browser pool  │◀─▶│ circuit breaker  │ │
//! │  │ health (C12) │   │    (C5/C6)    │   │       (C7)       │ │
//! │  └─────────────┘   └───────┬───────┘   └──────────────────┘ │
//! └───────────────────────────┼───────────────────────────────────┘
//!                             ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │        driver::Driver (headless_chrome, or a test mock)     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use browser_pool_core::auth::{ApiKeyStore, UserRecord, UserStore};
//! use browser_pool_core::config::CoreConfig;
//! use browser_pool_core::core::Core;
//! use browser_pool_core::driver::chrome::ChromeDriver;
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> browser_pool_core::error::Result<()> {
//! let mut users = UserStore::new();
//! users.register(UserRecord {
//!     user_id: "u1".into(),
//!     username: "demo".into(),
//!     roles: HashSet::from(["user".to_string()]),
//!     password_digest: browser_pool_core::auth::digest_secret("demo123!"),
//! });
//!
//! let core = Core::new(
//!     CoreConfig::default(),
//!     Arc::new(ChromeDriver::default()),
//!     b"replace-with-a-real-secret",
//!     users,
//!     ApiKeyStore::new(),
//! );
//! core.start().await?;
//!
//! let login = core.create_session("demo", "demo123!", None)?;
//! let ctx = core.create_context(&login.session_id).await?;
//! // ... create a page, execute actions, eventually:
//! core.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment configuration
//!
//! With the `env-config` feature (on by default), [`config::env::from_env`]
//! loads every pool/session/page/health tunable from the process
//! environment, optionally staged through an `app.env` file, exactly as
//! documented on [`config`].
//!
//! ## Test tooling
//!
//! The `test-utils` feature (and `#[cfg(test)]` builds of this crate itself)
//! expose [`driver::mock::MockDriver`], a fully deterministic implementation
//! of the [`driver::Driver`] contract, so downstream crates embedding this
//! core can exercise pool, session, and action-dispatch behaviour without a
//! real browser.
//!
//! ## What's out of scope
//!
//! Deliberately not this crate's job: the four transport façades
//! themselves, metrics/tracing export (structured logging via `log` is
//! carried, nothing more), TLS/process bootstrap, persistent session
//! history (the session store is authoritative in-memory state; a durable
//! backing is a write-through replica, not built here), cross-node
//! distribution, and page-script sandboxing beyond what the browser itself
//! provides.

#![warn(missing_docs)]

pub mod action;
pub mod auth;
pub mod browser;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod context;
pub mod core;
pub mod driver;
pub mod error;
pub mod events;
pub mod health;
pub mod page;
pub mod scaler;
pub mod session;

// ============================================================================
// Re-exports (Public API)
// ============================================================================

pub use config::{CoreConfig, CoreConfigBuilder};
pub use core::{Catalog, Core, HealthReport, HealthStatus, SessionLogin, SessionSummary};
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus};

#[cfg(feature = "env-config")]
pub use config::env::from_env;
