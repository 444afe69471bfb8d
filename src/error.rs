//! Unified error type for the browser compute core.
//!
//! [`CoreError`] is the single error type every component returns. Its
//! variants are exactly the client-visible error codes of the external
//! interface (`Unauthenticated`, `Forbidden`, `NotFound`, `InvalidArgument`,
//! `FailedPrecondition`, `ResourceExhausted`, `DeadlineExceeded`,
//! `Internal`, `Unavailable`); whatever transport sits in front of this
//! crate maps them onto its own status-code space one-to-one.
//!
//! # Classification
//!
//! Beyond the wire-visible code, [`CoreError::class`] answers the
//! caller/resource/driver/fatal question the error-handling design
//! requires: caller errors never touch a resource counter, resource errors
//! never mark a target unhealthy, driver errors increment a page's error
//! count but leave it in place, and fatal conditions are never returned
//! directly: they are handled by the health monitor and only ever
//! surface to a caller as a resource or driver error.

/// Errors that can occur anywhere in the browser compute core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Credential missing, malformed, or its session expired.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller authenticated but does not own the resource it targeted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No such session, context, page, or browser.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or schema-invalid arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the target's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Pool or queue capacity exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The caller's deadline elapsed before the operation completed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A driver-level failure (navigation, evaluation, screenshot, ...).
    #[error("internal error: {0}")]
    Internal(String),

    /// Circuit breaker open, or the core is shutting down.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Broad classification used by error-handling policy: which actors
/// are allowed to retry, and which resource counters an error touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Argument, auth, or ownership mistake. No retry, no counter bump.
    Caller,
    /// Pool exhausted, breaker open, deadline missed. Target stays healthy.
    Resource,
    /// Navigation/evaluation/etc. failure. Bumps the page's error count.
    Driver,
}

impl CoreError {
    /// Classify this error per the caller/resource/driver taxonomy.
    ///
    /// Fatal errors (browser disconnected/unresponsive) have no variant of
    /// their own. A fatal condition is never surfaced as such to a caller;
    /// it is handled asynchronously by the health monitor, and the in-flight call that
    /// observed it returns [`CoreError::Unavailable`] or
    /// [`CoreError::Internal`], both of which classify normally here.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Unauthenticated(_)
            | CoreError::Forbidden(_)
            | CoreError::NotFound(_)
            | CoreError::InvalidArgument(_) => ErrorClass::Caller,
            CoreError::FailedPrecondition(_)
            | CoreError::ResourceExhausted(_)
            | CoreError::DeadlineExceeded(_)
            | CoreError::Unavailable(_) => ErrorClass::Resource,
            CoreError::Internal(_) => ErrorClass::Driver,
        }
    }

    /// The client-visible error code name, exactly as listed in the
    /// external interface's error table.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated(_) => "Unauthenticated",
            CoreError::Forbidden(_) => "Forbidden",
            CoreError::NotFound(_) => "NotFound",
            CoreError::InvalidArgument(_) => "InvalidArgument",
            CoreError::FailedPrecondition(_) => "FailedPrecondition",
            CoreError::ResourceExhausted(_) => "ResourceExhausted",
            CoreError::DeadlineExceeded(_) => "DeadlineExceeded",
            CoreError::Internal(_) => "Internal",
            CoreError::Unavailable(_) => "Unavailable",
        }
    }
}

impl From<String> for CoreError {
    fn from(msg: String) -> Self {
        CoreError::Internal(msg)
    }
}

impl From<&str> for CoreError {
    fn from(msg: &str) -> Self {
        CoreError::Internal(msg.to_string())
    }
}

/// Standard result type used across the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            CoreError::Forbidden("x".into()).class(),
            ErrorClass::Caller
        );
        assert_eq!(
            CoreError::ResourceExhausted("x".into()).class(),
            ErrorClass::Resource
        );
        assert_eq!(CoreError::Internal("x".into()).class(), ErrorClass::Driver);
    }

    #[test]
    fn code_matches_client_taxonomy() {
        assert_eq!(CoreError::Unauthenticated("x".into()).code(), "Unauthenticated");
        assert_eq!(CoreError::Unavailable("x".into()).code(), "Unavailable");
    }

    #[test]
    fn string_conversions_land_on_internal() {
        let err: CoreError = "boom".into();
        assert!(matches!(err, CoreError::Internal(_)));
        let err: CoreError = "boom".to_string().into();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[test]
    fn is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CoreError>();
    }
}
