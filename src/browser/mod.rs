//! C5 (single browser) and C6 (the pool of them).

pub mod instance;
pub mod pool;

pub use instance::{BrowserInstance, BrowserState};
pub use pool::{BrowserPool, BrowserPoolConfig, PoolSnapshot, BREAKER_ACQUIRE, BREAKER_PAGE_CREATE};
