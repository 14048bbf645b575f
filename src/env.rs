//! Runtime environment detection.
//!
//! Provides a single source of truth for determining the runtime environment
//! (test, development, production) based on the `HR_PORTAL_ENV` environment variable.
//!
//! # Usage
//!
//! ```rust
//! use hr_portal::env::{Environment, is_any_test};
//!
//! if Environment::current().is_any_test() {
//!     // Use file storage instead of the OS keyring
//! }
//!
//! let _ = is_any_test();
//! ```
//!
//! # Environment Variable
//!
//! Set `HR_PORTAL_ENV` to one of:
//! - `test` - Test mode (file token storage, tmp config dir)
//! - `system_test` - System test mode (real servers, file token storage)
//! - `development` or `dev` - Development mode (debug logging by default)
//! - (anything else or unset) - Production mode

/// Environment variable read by [`Environment::current`].
pub const ENV_VAR: &str = "HR_PORTAL_ENV";

/// Runtime environment for the portal client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - file storage, no keyring.
    Test,
    /// System test environment - real collaborators, file storage.
    SystemTest,
}

impl Environment {
    /// Detect current environment from `HR_PORTAL_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var(ENV_VAR).ok().as_deref())
    }

    /// Map a raw `HR_PORTAL_ENV` value to an environment.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("system_test") => Self::SystemTest,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if running in any test mode (test or system_test).
    /// Use this to skip OS keyring and use file storage instead.
    #[must_use]
    pub fn is_any_test(self) -> bool {
        matches!(self, Self::Test | Self::SystemTest)
    }

    /// Returns `true` if this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::SystemTest => write!(f, "system_test"),
        }
    }
}

/// Returns `true` if running in any test mode (unit tests or system tests).
#[must_use]
pub fn is_any_test() -> bool {
    Environment::current().is_any_test()
}

/// Returns `true` if keyring should be bypassed (any test mode).
///
/// Returns true for both `HR_PORTAL_ENV=test` and `HR_PORTAL_ENV=system_test`.
#[must_use]
pub fn should_skip_keyring() -> bool {
    is_any_test()
}
