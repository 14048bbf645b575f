//! Push channel: a single long-lived WebSocket carrying server notifications.
//!
//! The channel follows the session. It connects once a validated credential
//! exists, reconnects with bounded exponential backoff when the socket
//! drops, and closes when the credential goes away. Every inbound frame is
//! stamped with the epoch of the connection that received it so consumers
//! can discard frames that outlived their session.
//!
//! # Architecture
//!
//! ```text
//! SessionStore ──watch<SessionSnapshot>──► PushChannelManager (background task)
//!                                               │
//!                                               ├── watch<ChannelStatus> ──► observers
//!                                               └── mpsc<StampedFrame>  ──► DeliveryBridge
//! ```
//!
//! # Frame format
//!
//! ```json
//! {"type": "notification", "userId": 7, "category": "leave",
//!  "message": "Leave approved", "priority": "high", "id": "n-123"}
//! ```
//!
//! Text frames with another `type` are ignored. Frames that are not JSON
//! objects, lack `type`, or carry a `notification` with missing or
//! out-of-range fields are malformed and dropped without affecting the
//! connection.

pub mod connection;

pub use connection::{Backoff, PushChannelManager, PushSettings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::UserId;
use crate::constants::NOTIFICATION_FRAME_TYPE;
use crate::notifications::{NotificationKind, Priority};

/// Lifecycle of the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection and none wanted, or shut down.
    #[default]
    Closed,
    /// Dialing, or waiting out a backoff delay before dialing again.
    Connecting,
    /// Handshake complete; frames are flowing.
    Open,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        })
    }
}

/// Push channel failures.
///
/// None of these are surfaced to the user directly; they are logged and
/// recorded in [`ChannelStatus::last_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The WebSocket could not be established.
    HandshakeFailed(String),
    /// A frame could not be decoded. The connection stays up.
    FrameMalformed(String),
    /// An open connection ended.
    ConnectionDropped(String),
    /// An outbound message was attempted while the channel was not open.
    NotConnected,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandshakeFailed(e) => write!(f, "push handshake failed: {e}"),
            Self::FrameMalformed(e) => write!(f, "malformed push frame: {e}"),
            Self::ConnectionDropped(e) => write!(f, "push connection dropped: {e}"),
            Self::NotConnected => write!(f, "push channel is not connected"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Observable channel status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Epoch of the credential the channel is serving.
    pub epoch: u64,
    /// Current state.
    pub state: ChannelState,
    /// Connection attempts since the channel was last open.
    pub attempt: u32,
    /// Delay before the next dial, while waiting out a backoff.
    pub retry_in_ms: Option<u64>,
    /// Most recent failure since the channel was last open.
    pub last_error: Option<ChannelError>,
}

/// Payload of a `notification` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFrame {
    /// Addressee.
    pub user_id: UserId,
    /// Notification kind.
    pub category: NotificationKind,
    /// Display text.
    pub message: String,
    /// Urgency.
    pub priority: Priority,
    /// Server-assigned id, used for deduplication when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A notification addressed to some user.
    Notification(NotificationFrame),
    /// A well-formed frame of a type this client does not handle.
    Ignored(String),
}

/// A notification frame tagged with the epoch of the connection that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedFrame {
    /// Connection epoch.
    pub epoch: u64,
    /// Frame payload.
    pub frame: NotificationFrame,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, ChannelError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ChannelError::FrameMalformed(format!("invalid JSON: {e}")))?;

    let Some(object) = value.as_object() else {
        return Err(ChannelError::FrameMalformed("frame is not an object".to_string()));
    };
    let frame_type = object
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ChannelError::FrameMalformed("missing \"type\"".to_string()))?;

    if frame_type != NOTIFICATION_FRAME_TYPE {
        return Ok(InboundFrame::Ignored(frame_type.to_string()));
    }

    let frame: NotificationFrame = serde_json::from_value(value)
        .map_err(|e| ChannelError::FrameMalformed(e.to_string()))?;
    if frame.id.as_deref().is_some_and(str::is_empty) {
        return Err(ChannelError::FrameMalformed("empty notification id".to_string()));
    }
    Ok(InboundFrame::Notification(frame))
}

/// First `max` characters of `text`, for log lines.
pub(crate) fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notification_frame() {
        let frame = parse_frame(
            r#"{"type":"notification","userId":7,"category":"leave","message":"Leave approved","priority":"high","id":"n-1"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Notification(NotificationFrame {
                user_id: 7,
                category: NotificationKind::Leave,
                message: "Leave approved".to_string(),
                priority: Priority::High,
                id: Some("n-1".to_string()),
            })
        );
    }

    #[test]
    fn id_is_optional() {
        let frame = parse_frame(
            r#"{"type":"notification","userId":1,"category":"info","message":"hi","priority":"low"}"#,
        )
        .unwrap();
        let InboundFrame::Notification(frame) = frame else {
            panic!("expected notification");
        };
        assert!(frame.id.is_none());
    }

    #[test]
    fn other_types_are_ignored_not_malformed() {
        assert_eq!(
            parse_frame(r#"{"type":"presence","online":3}"#).unwrap(),
            InboundFrame::Ignored("presence".to_string())
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let cases = [
            "not json",
            "[1,2,3]",
            r#"{"userId":7}"#,
            r#"{"type":"notification","userId":"seven","category":"info","message":"m","priority":"low"}"#,
            r#"{"type":"notification","userId":7,"category":"urgent","message":"m","priority":"low"}"#,
            r#"{"type":"notification","userId":7,"category":"info","message":"m","priority":"critical"}"#,
            r#"{"type":"notification","userId":7,"category":"info","priority":"low"}"#,
            r#"{"type":"notification","userId":7,"category":"info","message":"m","priority":"low","id":""}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_frame(case), Err(ChannelError::FrameMalformed(_))),
                "expected malformed: {case}"
            );
        }
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("short", 100), "short");
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ChannelError::NotConnected.to_string(),
            "push channel is not connected"
        );
        assert!(ChannelError::HandshakeFailed("refused".into())
            .to_string()
            .contains("refused"));
    }
}
