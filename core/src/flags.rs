use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    pub ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

    /// Fallback when no key is supplied through the session context.
    pub ANTHROPIC_API_KEY: Option<&str> = None;
    pub ANTHROPIC_VERSION: &str = "2023-06-01";
    pub GATEWAY_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

    pub GATEWAY_REQUEST_MAX_RETRIES: u64 = 4;

    /// A streaming adapter that produces no delta for this long is considered
    /// stalled and the turn fails with `timeout`.
    pub GATEWAY_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Soft per-call budget for the non-streaming (polling) adapter.
    pub GATEWAY_REMOTE_TIMEOUT_MS: Duration = Duration::from_millis(120_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Base URL of the remote conversation service, when one is deployed.
    pub GATEWAY_REMOTE_BASE_URL: Option<&str> = None;

    /// Fixture path for offline tests (see adapters/http_api.rs).
    pub GATEWAY_SSE_FIXTURE: Option<&str> = None;
}
