//! Application-wide constants for the portal client.
//!
//! Timing and sizing values live here so the session, push and inbox
//! layers agree on them. `Config` may override the reconnect bounds.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for identity and API calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Push channel
// ============================================================================

/// First reconnect delay after a failed handshake or a dropped connection.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay. Doubling stops here.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Query parameter carrying the bearer token on the push endpoint URL.
pub const PUSH_TOKEN_PARAM: &str = "token";

/// Frame `type` value for notification frames.
pub const NOTIFICATION_FRAME_TYPE: &str = "notification";

/// Maximum characters of a rejected payload echoed into logs.
pub const LOG_PAYLOAD_PREVIEW: usize = 100;

// ============================================================================
// Server
// ============================================================================

/// Default base URL of the remote API.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Default push endpoint.
pub const DEFAULT_PUSH_URL: &str = "ws://localhost:5000";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_bounds_are_ordered() {
        assert!(RECONNECT_INITIAL_DELAY > Duration::ZERO);
        assert!(RECONNECT_MAX_DELAY >= RECONNECT_INITIAL_DELAY);
    }
}
