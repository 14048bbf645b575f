//! CLI subcommand implementations for hr-portal.
//!
//! Commands are organized into submodules by domain:
//!
//! - [`account`] - Session management (login, signup, logout, whoami)
//! - [`listen`] - Headless inbox consumer that prints live notifications
//!
//! # Usage
//!
//! Commands are invoked from the main CLI dispatcher:
//!
//! ```ignore
//! use hr_portal::commands;
//!
//! commands::account::login(&config, storage, "ada@example.com", &password).await?;
//! commands::listen::run(config, storage).await?;
//! ```

pub mod account;
pub mod listen;

#[doc(inline)]
pub use account::{login, logout, read_password, signup, whoami};

/// The current version of hr-portal, derived from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
