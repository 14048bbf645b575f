//! HR Portal - session and real-time notification core.
//!
//! This crate provides the client-side core of the HR portal: the
//! authentication-token lifecycle that gates all data access, and the push
//! pipeline that keeps a live, deduplicated inbox fed by a persistent
//! WebSocket.
//!
//! # Architecture
//!
//! The crate follows a centralized state store pattern:
//!
//! - **Portal** - Central orchestrator, owns the components, runs the delivery loop
//! - **SessionStore** - Credential, profile and epoch; the only writer of all three
//! - **PushChannelManager** - One socket per session epoch, reconnecting with backoff
//! - **DeliveryBridge** - Drops stale or misaddressed frames, feeds the inbox
//! - **Inbox** - Ordered, deduplicated records with an incremental unread count
//!
//! Control flows one way: session change → channel opens or closes →
//! inbound frames → bridge → inbox mutation → rendering layer.
//!
//! # Modules
//!
//! - [`session`] - Session store and epochs
//! - [`push`] - Push channel manager and frame format
//! - [`notifications`] - Notification records and the inbox
//! - [`bridge`] - Frame delivery rules
//! - [`portal`] - Orchestrator used by the rendering layer
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod api;
pub mod auth;
pub mod bridge;
pub mod commands;
pub mod notifications;
pub mod portal;
pub mod push;
pub mod session;
pub mod ws;

pub mod config;
pub mod constants;
pub mod env;
pub mod keyring;

// Re-export commonly used types
pub use auth::{AuthError, Credential, UserId, UserProfile};
pub use bridge::{DeliveryBridge, DeliveryOutcome};
pub use config::Config;
pub use notifications::{Inbox, NotificationKind, NotificationRecord, Priority};
pub use push::{ChannelError, ChannelState, ChannelStatus, PushChannelManager};
pub use session::{SessionSnapshot, SessionStore};

// Re-export Portal
pub use portal::Portal;
