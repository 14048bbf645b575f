//! Portal - central orchestrator for the session and notification core.
//!
//! Owns the session store, the push channel, the delivery bridge and the
//! inbox, and runs the delivery loop that connects them. The rendering
//! layer talks only to the [`Portal`]: it reads the inbox and session state
//! and calls the gesture methods (`login`, `logout`, `mark_read`, ...).
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────┐
//!            │          Portal          │
//!            │  - owns all components   │
//!            │  - runs delivery loop    │
//!            └────────────┬─────────────┘
//!                         │
//!     ┌───────────────┬───┴────────────┬───────────────┐
//!     ▼               ▼                ▼               ▼
//!  SessionStore  PushChannelManager  DeliveryBridge   Inbox
//!  (credential,  (socket per epoch)  (epoch + user    (records,
//!   epoch)                            filtering)       unread)
//! ```
//!
//! The inbox is emptied whenever the session epoch advances, so a new login
//! never sees the previous user's notifications.

use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::auth::{AuthError, HttpIdentityApi, IdentityApi, SignupRequest, UserProfile};
use crate::bridge::{DeliveryBridge, DeliveryOutcome};
use crate::config::Config;
use crate::keyring::TokenStore;
use crate::notifications::{Inbox, NotificationKind, NotificationRecord, Priority, SharedInbox};
use crate::push::{ChannelError, ChannelStatus, PushChannelManager, PushSettings, StampedFrame};
use crate::session::{SessionSnapshot, SessionStore};

/// Central orchestrator.
#[derive(Debug)]
pub struct Portal {
    config: Config,
    session: SessionStore,
    inbox: SharedInbox,
    bridge: DeliveryBridge,
    api: ApiClient,
    channel: PushChannelManager,
    revision_tx: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
}

impl Portal {
    /// Build the portal against the HTTP identity endpoint from `config`.
    ///
    /// See [`Self::with_identity`].
    pub async fn start(config: Config, storage: Arc<dyn TokenStore>) -> anyhow::Result<Self> {
        let identity = HttpIdentityApi::new(&config.api_base_url, config.request_timeout())?;
        Self::with_identity(config, Arc::new(identity), storage).await
    }

    /// Build the portal and bring it up.
    ///
    /// Spawns the push channel and the delivery loop, then validates a
    /// stored token if one was found. Validation failures are logged, not
    /// returned: any failure leaves the portal logged out.
    pub async fn with_identity(
        config: Config,
        identity: Arc<dyn IdentityApi>,
        storage: Arc<dyn TokenStore>,
    ) -> anyhow::Result<Self> {
        let session = SessionStore::new(identity, storage);
        let inbox = Inbox::shared();
        let bridge = DeliveryBridge::new(session.clone(), Arc::clone(&inbox));
        let api = ApiClient::new(&config.api_base_url, config.request_timeout(), session.clone())?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let channel = PushChannelManager::spawn(
            PushSettings::from_config(&config),
            session.subscribe(),
            frame_tx,
        );

        let (revision_tx, _) = watch::channel(0);
        let revision_tx = Arc::new(revision_tx);
        let cancel = CancellationToken::new();

        tokio::spawn(run_delivery_loop(DeliveryLoop {
            bridge: bridge.clone(),
            inbox: Arc::clone(&inbox),
            revision_tx: Arc::clone(&revision_tx),
            frame_rx,
            session_rx: session.subscribe(),
            cancel: cancel.clone(),
        }));

        let portal = Self {
            config,
            session,
            inbox,
            bridge,
            api,
            channel,
            revision_tx,
            cancel,
        };

        if portal.session.is_loading() {
            match portal.session.validate().await {
                Ok(profile) => log::info!("[Portal] Session restored for user {}", profile.id),
                Err(e) => log::warn!("[Portal] Stored session not restored: {e}"),
            }
        }

        Ok(portal)
    }

    fn inbox_read(&self) -> RwLockReadGuard<'_, Inbox> {
        self.inbox.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbox_write(&self) -> RwLockWriteGuard<'_, Inbox> {
        self.inbox.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_revision(&self, inbox: &Inbox) {
        self.revision_tx.send_replace(inbox.revision());
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The session store.
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Authenticated client for the data endpoints.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    // =========================================================================
    // Session gestures
    // =========================================================================

    /// Log in. On success the push channel follows automatically.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<UserProfile, AuthError> {
        self.session.login(identifier, secret).await
    }

    /// Register and log in.
    pub async fn signup(&self, request: &SignupRequest) -> Result<UserProfile, AuthError> {
        self.session.signup(request).await
    }

    /// Log out and empty the inbox.
    pub fn logout(&self) {
        self.session.logout();
        let mut inbox = self.inbox_write();
        if inbox.enter_epoch(self.session.epoch()) {
            self.publish_revision(&inbox);
        }
    }

    /// Re-fetch the current user's profile.
    pub async fn refresh_user(&self) -> Result<UserProfile, AuthError> {
        self.session.refresh_user().await
    }

    /// Current session view.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// A credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Validated profile of the current user.
    pub fn profile(&self) -> Option<UserProfile> {
        self.session.profile()
    }

    // =========================================================================
    // Inbox gestures
    // =========================================================================

    /// Records newest-first.
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.inbox_read().to_vec()
    }

    /// Number of unread records.
    pub fn unread_count(&self) -> usize {
        self.inbox_read().unread_count()
    }

    /// Mark one record read.
    pub fn mark_read(&self, id: &str) -> bool {
        let mut inbox = self.inbox_write();
        let changed = inbox.mark_read(id);
        if changed {
            self.publish_revision(&inbox);
        }
        changed
    }

    /// Mark every record read.
    pub fn mark_all_read(&self) -> usize {
        let mut inbox = self.inbox_write();
        let changed = inbox.mark_all_read();
        if changed > 0 {
            self.publish_revision(&inbox);
        }
        changed
    }

    /// Dismiss a record.
    pub fn remove(&self, id: &str) -> Option<NotificationRecord> {
        let mut inbox = self.inbox_write();
        let removed = inbox.remove(id);
        if removed.is_some() {
            self.publish_revision(&inbox);
        }
        removed
    }

    /// Add a client-side notification.
    pub fn notify_local(&self, kind: NotificationKind, message: impl Into<String>, priority: Priority) -> String {
        let id = self.bridge.notify_local(kind, message, priority);
        self.publish_revision(&self.inbox_read());
        id
    }

    /// Receive the inbox revision after every change.
    pub fn subscribe_inbox(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    // =========================================================================
    // Push channel
    // =========================================================================

    /// Push channel status.
    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Receive every push channel status change.
    pub fn subscribe_channel_status(&self) -> watch::Receiver<ChannelStatus> {
        self.channel.subscribe_status()
    }

    /// Send a JSON message over the open push channel.
    pub fn send(&self, payload: &serde_json::Value) -> Result<(), ChannelError> {
        self.channel.send(payload)
    }

    /// Stop the push channel and the delivery loop.
    pub fn shutdown(&self) {
        log::info!("[Portal] Shutting down");
        self.channel.shutdown();
        self.cancel.cancel();
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the delivery loop task.
struct DeliveryLoop {
    bridge: DeliveryBridge,
    inbox: SharedInbox,
    revision_tx: Arc<watch::Sender<u64>>,
    frame_rx: mpsc::UnboundedReceiver<StampedFrame>,
    session_rx: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl DeliveryLoop {
    /// Move the inbox to the current session epoch.
    fn reconcile_epoch(&mut self) {
        let epoch = self.session_rx.borrow_and_update().epoch;
        let mut inbox = self.inbox.write().unwrap_or_else(PoisonError::into_inner);
        let previous = inbox.epoch();
        if inbox.enter_epoch(epoch) {
            log::info!("[Portal] Session epoch {} -> {}, inbox cleared", previous, epoch);
            self.revision_tx.send_replace(inbox.revision());
        }
    }

    fn deliver(&self, frame: StampedFrame) {
        if let DeliveryOutcome::Delivered(_) = self.bridge.deliver(frame) {
            let revision = self.inbox.read().unwrap_or_else(PoisonError::into_inner).revision();
            self.revision_tx.send_replace(revision);
        }
    }
}

/// Route frames from the push channel into the inbox until cancelled.
async fn run_delivery_loop(mut state: DeliveryLoop) {
    log::info!("[Portal] Delivery loop starting");
    state.reconcile_epoch();

    loop {
        // Session changes first: a frame from a new epoch must not be
        // delivered before the inbox of the old epoch is cleared.
        tokio::select! {
            biased;

            () = state.cancel.cancelled() => break,

            changed = state.session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                state.reconcile_epoch();
            }

            frame = state.frame_rx.recv() => {
                let Some(frame) = frame else { break };
                state.reconcile_epoch();
                state.deliver(frame);
            }
        }
    }

    log::info!("[Portal] Delivery loop exiting");
}
