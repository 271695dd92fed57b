//! Metrics facade for modelgate crates.
//!
//! Re-exports the `metrics` macros so callers depend on a single crate, and
//! keeps metric names in one place. Nothing is recorded until the embedding
//! process installs a recorder.

pub use metrics::{counter, histogram};

/// OAuth connect/refresh lifecycle metrics.
pub mod oauth {
    /// Completed `connect()` calls, labelled by `provider`.
    pub const CONNECT_TOTAL: &str = "oauth_connect_total";
    /// `connect()` calls that ended with `success: false`.
    pub const CONNECT_FAILURES_TOTAL: &str = "oauth_connect_failures_total";
    /// Refresh attempts triggered by an expired access token.
    pub const REFRESH_TOTAL: &str = "oauth_refresh_total";
    pub const REFRESH_FAILURES_TOTAL: &str = "oauth_refresh_failures_total";
    pub const DISCONNECT_TOTAL: &str = "oauth_disconnect_total";
    /// Wall time of the authorization-code exchange request.
    pub const TOKEN_EXCHANGE_DURATION_SECONDS: &str = "oauth_token_exchange_duration_seconds";
}
