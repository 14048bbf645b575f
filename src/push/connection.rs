//! Background task that owns the push WebSocket.
//!
//! [`PushChannelManager::spawn`] starts a task that watches the session.
//! For every distinct (epoch, credential) target it dials the push
//! endpoint, pumps frames until the socket drops or the session moves on,
//! and reconnects with exponential backoff in between. At most one socket
//! is live at a time; an old socket is closed before the next one is
//! dialed.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    parse_frame, preview, ChannelError, ChannelState, ChannelStatus, InboundFrame, StampedFrame,
};
use crate::auth::Credential;
use crate::config::Config;
use crate::constants::LOG_PAYLOAD_PREVIEW;
use crate::session::SessionSnapshot;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// How long a superseded socket gets to send its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSettings {
    /// Push endpoint (`ws`, `wss`, `http` or `https`).
    pub url: String,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
}

impl PushSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.push_url.clone(),
            initial_backoff: config.reconnect_initial(),
            max_backoff: config.reconnect_max(),
        }
    }
}

/// Exponential reconnect delay: doubles from `initial` up to `max`.
///
/// The delay is never zero, so a server that rejects every handshake
/// cannot drive a hot loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// New backoff. A zero `initial` is raised to one millisecond and `max`
    /// is raised to `initial` if smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Outbound text queued for the open socket.
#[derive(Debug)]
struct OutboundMessage {
    epoch: u64,
    text: String,
}

/// Handle to the push channel task.
///
/// Dropping the handle stops the task and closes the socket.
#[derive(Debug)]
pub struct PushChannelManager {
    status_rx: watch::Receiver<ChannelStatus>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancellationToken,
}

impl PushChannelManager {
    /// Spawn the channel task.
    ///
    /// The task follows `session_rx` and sends every notification frame to
    /// `frame_tx`, stamped with the epoch of the connection it arrived on.
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        settings: PushSettings,
        session_rx: watch::Receiver<SessionSnapshot>,
        frame_tx: mpsc::UnboundedSender<StampedFrame>,
    ) -> Self {
        let epoch = session_rx.borrow().epoch;
        let (status_tx, status_rx) = watch::channel(ChannelStatus {
            epoch,
            ..ChannelStatus::default()
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let ctx = LoopContext {
            settings,
            status_tx,
            frame_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(run_channel_loop(ctx, session_rx, outbound_rx));

        Self {
            status_rx,
            outbound_tx,
            cancel,
        }
    }

    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        self.status_rx.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    /// Send a JSON message over the open socket.
    ///
    /// Nothing is queued while the channel is not open; the caller gets
    /// [`ChannelError::NotConnected`] instead.
    pub fn send(&self, payload: &serde_json::Value) -> Result<(), ChannelError> {
        let epoch = {
            let status = self.status_rx.borrow();
            if status.state != ChannelState::Open {
                return Err(ChannelError::NotConnected);
            }
            status.epoch
        };
        let message = OutboundMessage {
            epoch,
            text: payload.to_string(),
        };
        if self.outbound_tx.send(message).is_err() {
            return Err(ChannelError::NotConnected);
        }
        Ok(())
    }

    /// Stop the task. The channel ends in [`ChannelState::Closed`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything the task needs besides the receivers it polls.
struct LoopContext {
    settings: PushSettings,
    status_tx: watch::Sender<ChannelStatus>,
    frame_tx: mpsc::UnboundedSender<StampedFrame>,
    cancel: CancellationToken,
}

impl LoopContext {
    fn publish(&self, status: ChannelStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::debug!(
                "[Push] Status {} -> {} (epoch {}, attempt {})",
                current.state,
                status.state,
                status.epoch,
                status.attempt
            );
            *current = status;
            true
        });
    }

    fn record_error(&self, error: ChannelError) {
        self.status_tx.send_modify(|current| current.last_error = Some(error));
    }
}

/// Credential identity the channel should be connected for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectTarget {
    epoch: u64,
    credential: Credential,
}

impl ConnectTarget {
    fn from_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        snapshot.channel_credential().map(|credential| Self {
            epoch: snapshot.epoch,
            credential: credential.clone(),
        })
    }
}

/// Why the task stopped serving a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochExit {
    /// The session moved to a different credential or logged out.
    Superseded,
    /// Shutdown was requested or the session store is gone.
    Shutdown,
}

/// Why the message loop of an open socket returned.
#[derive(Debug)]
enum MessageLoopExit {
    /// Socket ended; reconnect after backoff.
    Dropped(ChannelError),
    /// Stop serving this target.
    Exit(EpochExit),
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Top-level task: one iteration per session target.
async fn run_channel_loop(
    ctx: LoopContext,
    mut session_rx: watch::Receiver<SessionSnapshot>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    loop {
        let (epoch, target) = {
            let snapshot = session_rx.borrow_and_update();
            (snapshot.epoch, ConnectTarget::from_snapshot(&snapshot))
        };

        let Some(target) = target else {
            ctx.publish(ChannelStatus {
                epoch,
                ..ChannelStatus::default()
            });
            let keep_going = tokio::select! {
                () = ctx.cancel.cancelled() => false,
                changed = session_rx.changed() => changed.is_ok(),
            };
            if keep_going {
                continue;
            }
            break;
        };

        match run_epoch(&ctx, &target, &mut session_rx, &mut outbound_rx).await {
            EpochExit::Superseded => {
                log::info!("[Push] Session changed, leaving epoch {}", target.epoch);
            }
            EpochExit::Shutdown => break,
        }
    }

    let epoch = ctx.status_tx.borrow().epoch;
    ctx.publish(ChannelStatus {
        epoch,
        ..ChannelStatus::default()
    });
    log::info!("[Push] Channel task stopped");
}

/// Resolve once the session no longer wants `target`.
///
/// Snapshot changes that keep the same target (a profile refresh, say)
/// are absorbed here and never cause a reconnect.
async fn wait_superseded(
    session_rx: &mut watch::Receiver<SessionSnapshot>,
    target: &ConnectTarget,
) -> EpochExit {
    loop {
        if session_rx.changed().await.is_err() {
            return EpochExit::Shutdown;
        }
        let next = ConnectTarget::from_snapshot(&session_rx.borrow_and_update());
        if next.as_ref() != Some(target) {
            return EpochExit::Superseded;
        }
    }
}

/// Connect, pump and reconnect for a single target until it is superseded.
async fn run_epoch(
    ctx: &LoopContext,
    target: &ConnectTarget,
    session_rx: &mut watch::Receiver<SessionSnapshot>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
) -> EpochExit {
    let epoch = target.epoch;

    let url = match ws::push_url(&ctx.settings.url, target.credential.as_str()) {
        Ok(url) => url,
        Err(e) => {
            // A bad endpoint will not fix itself; wait for the session to move on.
            log::error!("[Push] Cannot build push URL: {e:#}");
            ctx.publish(ChannelStatus {
                epoch,
                last_error: Some(ChannelError::HandshakeFailed(format!("{e:#}"))),
                ..ChannelStatus::default()
            });
            return tokio::select! {
                () = ctx.cancel.cancelled() => EpochExit::Shutdown,
                exit = wait_superseded(session_rx, target) => exit,
            };
        }
    };

    let mut backoff = Backoff::new(ctx.settings.initial_backoff, ctx.settings.max_backoff);
    let mut attempt: u32 = 0;
    let mut last_error: Option<ChannelError> = None;

    loop {
        attempt = attempt.saturating_add(1);
        ctx.publish(ChannelStatus {
            epoch,
            state: ChannelState::Connecting,
            attempt,
            retry_in_ms: None,
            last_error: last_error.clone(),
        });
        log::info!(
            "[Push] Connecting to {} (epoch {}, attempt {})",
            ws::redact(&url),
            epoch,
            attempt
        );

        let connected = tokio::select! {
            () = ctx.cancel.cancelled() => return EpochExit::Shutdown,
            exit = wait_superseded(session_rx, target) => return exit,
            result = ws::connect(&url) => result,
        };

        let failure = match connected {
            Ok((mut writer, mut reader)) => {
                log::info!("[Push] Channel open (epoch {})", epoch);
                backoff.reset();
                attempt = 0;
                while let Ok(stale) = outbound_rx.try_recv() {
                    log::debug!(
                        "[Push] Discarding outbound message from before reconnect (epoch {})",
                        stale.epoch
                    );
                }
                ctx.publish(ChannelStatus {
                    epoch,
                    state: ChannelState::Open,
                    ..ChannelStatus::default()
                });

                let exit = run_message_loop(
                    ctx,
                    target,
                    &mut writer,
                    &mut reader,
                    session_rx,
                    outbound_rx,
                )
                .await;
                drop(reader);
                close_in_background(writer);

                match exit {
                    MessageLoopExit::Dropped(error) => error,
                    MessageLoopExit::Exit(exit) => return exit,
                }
            }
            Err(e) => ChannelError::HandshakeFailed(format!("{e:#}")),
        };

        let delay = backoff.next_delay();
        log::warn!("[Push] {} (epoch {}, retrying in {:?})", failure, epoch, delay);
        last_error = Some(failure);
        ctx.publish(ChannelStatus {
            epoch,
            state: ChannelState::Connecting,
            attempt,
            retry_in_ms: Some(duration_ms(delay)),
            last_error: last_error.clone(),
        });

        tokio::select! {
            () = ctx.cancel.cancelled() => return EpochExit::Shutdown,
            exit = wait_superseded(session_rx, target) => return exit,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Send a close frame without blocking the task on a slow peer.
fn close_in_background(writer: WsWriter) {
    tokio::spawn(async move {
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("[Push] Close failed: {e:#}"),
            Err(_) => log::debug!("[Push] Close timed out"),
        }
    });
}

/// Pump frames on an open socket.
async fn run_message_loop(
    ctx: &LoopContext,
    target: &ConnectTarget,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    session_rx: &mut watch::Receiver<SessionSnapshot>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
) -> MessageLoopExit {
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                log::info!("[Push] Shutdown requested, closing connection");
                return MessageLoopExit::Exit(EpochExit::Shutdown);
            }

            exit = wait_superseded(session_rx, target) => return MessageLoopExit::Exit(exit),

            Some(message) = outbound_rx.recv() => {
                if message.epoch == target.epoch {
                    if let Err(e) = writer.send_text(&message.text).await {
                        return MessageLoopExit::Dropped(ChannelError::ConnectionDropped(format!("{e:#}")));
                    }
                    log::trace!("[Push] Sent {} bytes", message.text.len());
                } else {
                    log::debug!("[Push] Dropping outbound message for epoch {}", message.epoch);
                }
            }

            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if !forward_text(ctx, target.epoch, &text) {
                        return MessageLoopExit::Exit(EpochExit::Shutdown);
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let error = ChannelError::FrameMalformed(format!("binary frame ({} bytes)", data.len()));
                    log::warn!("[Push] {}", error);
                    ctx.record_error(error);
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        return MessageLoopExit::Dropped(ChannelError::ConnectionDropped(format!("{e:#}")));
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    return MessageLoopExit::Dropped(ChannelError::ConnectionDropped(
                        format!("closed by server ({code}) {reason}").trim_end().to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return MessageLoopExit::Dropped(ChannelError::ConnectionDropped(format!("{e:#}")));
                }
                None => {
                    return MessageLoopExit::Dropped(ChannelError::ConnectionDropped("stream ended".to_string()));
                }
            },
        }
    }
}

/// Decode a text frame and hand notifications to the consumer.
///
/// Returns `false` when the consumer is gone.
fn forward_text(ctx: &LoopContext, epoch: u64, text: &str) -> bool {
    match parse_frame(text) {
        Ok(InboundFrame::Notification(frame)) => {
            log::debug!(
                "[Push] Notification for user {} ({}, {})",
                frame.user_id,
                frame.category,
                frame.priority
            );
            let stamped = StampedFrame {
                epoch,
                frame,
                received_at: Utc::now(),
            };
            if ctx.frame_tx.send(stamped).is_err() {
                log::info!("[Push] Frame consumer dropped, stopping channel");
                return false;
            }
        }
        Ok(InboundFrame::Ignored(frame_type)) => {
            log::trace!("[Push] Ignoring frame type {frame_type}");
        }
        Err(error) => {
            log::warn!("[Push] {}: {}", error, preview(text, LOG_PAYLOAD_PREVIEW));
            ctx.record_error(error);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(epoch: u64, token: Option<&str>, user_id: Option<i64>) -> SessionSnapshot {
        SessionSnapshot {
            epoch,
            credential: token.map(Credential::new),
            user_id,
        }
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_never_zero() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert!(backoff.next_delay() > Duration::ZERO);
        assert!(backoff.next_delay() > Duration::ZERO);
    }

    #[test]
    fn target_requires_validated_credential() {
        assert!(ConnectTarget::from_snapshot(&snapshot(1, None, None)).is_none());
        assert!(ConnectTarget::from_snapshot(&snapshot(1, Some("tok"), None)).is_none());
        let target = ConnectTarget::from_snapshot(&snapshot(3, Some("tok"), Some(7))).unwrap();
        assert_eq!(target.epoch, 3);
        assert_eq!(target.credential.as_str(), "tok");
    }

    #[test]
    fn settings_follow_config() {
        let config = Config {
            push_url: "wss://push.example.com".to_string(),
            reconnect_initial_ms: 250,
            reconnect_max_ms: 4_000,
            ..Config::default()
        };
        let settings = PushSettings::from_config(&config);
        assert_eq!(settings.url, "wss://push.example.com");
        assert_eq!(settings.initial_backoff, Duration::from_millis(250));
        assert_eq!(settings.max_backoff, Duration::from_secs(4));
    }

    fn settings(url: &str) -> PushSettings {
        PushSettings {
            url: url.to_string(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn closed_without_credential() {
        let (_session_tx, session_rx) = watch::channel(snapshot(0, None, None));
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let manager = PushChannelManager::spawn(settings("ws://127.0.0.1:1"), session_rx, frame_tx);

        tokio::task::yield_now().await;
        assert_eq!(manager.status().state, ChannelState::Closed);
        assert_eq!(
            manager.send(&serde_json::json!({"type": "ping"})),
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn handshake_failure_retries_until_logout() {
        let (session_tx, session_rx) = watch::channel(snapshot(1, Some("tok"), Some(7)));
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let manager = PushChannelManager::spawn(settings("ws://127.0.0.1:1"), session_rx, frame_tx);
        let mut status_rx = manager.subscribe_status();

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| s.attempt >= 2),
        )
        .await
        .expect("retry within timeout")
        .unwrap()
        .clone();
        assert_eq!(status.epoch, 1);
        assert_eq!(status.state, ChannelState::Connecting);
        assert!(matches!(status.last_error, Some(ChannelError::HandshakeFailed(_))));

        session_tx.send_replace(snapshot(2, None, None));
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| s.state == ChannelState::Closed),
        )
        .await
        .expect("closed within timeout")
        .unwrap()
        .clone();
        assert_eq!(status.epoch, 2);
    }

    #[tokio::test]
    async fn invalid_push_url_waits_for_session_change() {
        let (_session_tx, session_rx) = watch::channel(snapshot(1, Some("tok"), Some(7)));
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let manager = PushChannelManager::spawn(settings("ftp://example.com"), session_rx, frame_tx);
        let mut status_rx = manager.subscribe_status();

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| s.last_error.is_some()),
        )
        .await
        .expect("error within timeout")
        .unwrap()
        .clone();
        assert_eq!(status.state, ChannelState::Closed);
        assert_eq!(status.attempt, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_channel() {
        let (_session_tx, session_rx) = watch::channel(snapshot(1, Some("tok"), Some(7)));
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let manager = PushChannelManager::spawn(settings("ws://127.0.0.1:1"), session_rx, frame_tx);
        let mut status_rx = manager.subscribe_status();
        status_rx
            .wait_for(|s| s.state == ChannelState::Connecting)
            .await
            .unwrap();

        manager.shutdown();
        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| s.state == ChannelState::Closed),
        )
        .await
        .expect("closed within timeout")
        .unwrap();
    }
}
