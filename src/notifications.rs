//! Notification records and the in-memory inbox.
//!
//! The [`Inbox`] is the single source of truth rendered by the UI. It holds
//! records newest-first by insertion order (never re-sorted by timestamp, so
//! clock skew cannot reorder items already on screen), deduplicated by id.
//!
//! # Invariants
//!
//! - ids are unique; a second `add` with a known id is a no-op
//! - `read` only moves from `false` to `true`
//! - [`Inbox::unread_count`] is maintained incrementally and always equals the
//!   number of unread records when any method returns
//!
//! All operations are synchronous. Callers share the inbox as
//! [`SharedInbox`] and never hold the lock across an `.await`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared reference to the inbox.
pub type SharedInbox = Arc<RwLock<Inbox>>;

/// Category of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Neutral information.
    Info,
    /// Something needs attention.
    Warning,
    /// An operation succeeded.
    Success,
    /// An operation failed.
    Error,
    /// Leave request updates.
    Leave,
    /// Scheduled reminders.
    Reminder,
}

impl NotificationKind {
    /// Wire name (`"leave"`, `"error"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Error => "error",
            Self::Leave => "leave",
            Self::Reminder => "reminder",
        }
    }

    /// Icon family the rendering layer shows for this kind.
    pub fn icon(self) -> &'static str {
        match self {
            Self::Success => "check",
            Self::Warning | Self::Error => "alert",
            Self::Leave => "calendar",
            Self::Reminder => "bell",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information.
    Low,
    /// Default urgency.
    Medium,
    /// Needs prompt attention.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// One notification shown in the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Identity used for deduplication.
    pub id: String,
    /// Category.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Display text.
    pub message: String,
    /// Urgency.
    pub priority: Priority,
    /// Whether the user has seen it.
    pub read: bool,
    /// When the client created the record.
    pub timestamp: DateTime<Utc>,
}

impl NotificationRecord {
    /// Unread record stamped now.
    pub fn new(id: impl Into<String>, kind: NotificationKind, message: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            kind,
            message: message.into(),
            priority,
            read: false,
            timestamp: Utc::now(),
        }
    }

    /// Unread record with a freshly generated id.
    pub fn local(kind: NotificationKind, message: impl Into<String>, priority: Priority) -> Self {
        Self::new(generate_id(), kind, message, priority)
    }
}

/// New unique notification id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Ordered, deduplicated notification collection.
///
/// The inbox belongs to one session epoch at a time; see [`Inbox::enter_epoch`].
#[derive(Debug, Default)]
pub struct Inbox {
    records: VecDeque<NotificationRecord>,
    ids: HashSet<String>,
    unread: usize,
    revision: u64,
    epoch: u64,
}

impl Inbox {
    /// Empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty inbox behind a shared lock.
    pub fn shared() -> SharedInbox {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Prepend `record` unless its id is already present.
    ///
    /// Returns `true` if the record was inserted.
    pub fn add(&mut self, record: NotificationRecord) -> bool {
        if self.ids.contains(&record.id) {
            log::debug!("[Inbox] Duplicate notification {} ignored", record.id);
            return false;
        }
        if !record.read {
            self.unread += 1;
        }
        self.ids.insert(record.id.clone());
        self.records.push_front(record);
        self.revision += 1;
        true
    }

    /// Mark one record read. Unknown ids and already-read records are no-ops.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        if record.read {
            return false;
        }
        record.read = true;
        self.unread -= 1;
        self.revision += 1;
        true
    }

    /// Mark every record read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let changed = self.unread;
        if changed == 0 {
            return 0;
        }
        for record in &mut self.records {
            record.read = true;
        }
        self.unread = 0;
        self.revision += 1;
        changed
    }

    /// Dismiss a record. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        let record = self.records.remove(index)?;
        self.ids.remove(&record.id);
        if !record.read {
            self.unread -= 1;
        }
        self.revision += 1;
        Some(record)
    }

    /// Move the inbox to session `epoch`, dropping the previous epoch's
    /// records. Epochs at or below the current one are a no-op, so records
    /// added after an epoch change survive a late reconcile of that change.
    ///
    /// Returns `true` if the epoch advanced.
    pub fn enter_epoch(&mut self, epoch: u64) -> bool {
        if epoch <= self.epoch {
            return false;
        }
        log::debug!("[Inbox] Epoch {} -> {}, dropping {} records", self.epoch, epoch, self.records.len());
        self.epoch = epoch;
        self.clear();
        true
    }

    /// Session epoch the records belong to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        if self.records.is_empty() {
            return;
        }
        self.records.clear();
        self.ids.clear();
        self.unread = 0;
        self.revision += 1;
    }

    /// Number of unread records.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Records newest-first.
    pub fn records(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.iter()
    }

    /// Owned copy of the records, newest-first.
    pub fn to_vec(&self) -> Vec<NotificationRecord> {
        self.records.iter().cloned().collect()
    }

    /// Look up a record by id.
    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        if !self.ids.contains(id) {
            return None;
        }
        self.records.iter().find(|r| r.id == id)
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Incremented by every mutation that changed something.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
