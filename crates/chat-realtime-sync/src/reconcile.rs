//! Reconciliation of push, poll and optimistic-local arrivals.
//!
//! Each conversation keeps one transcript ordered by `created_at`
//! (arrival order breaks ties). Authoritative messages are keyed by id;
//! an optimistic entry is replaced by the first authoritative message from
//! the same sender with equal content inside the match window.

use crate::types::{ConversationKey, Message, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Default window within which an optimistic message matches its stored copy.
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(10);

/// Which path delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySource {
    Push,
    Poll,
    /// Local insert or the outbound store's acknowledgement.
    Local,
    /// Persisted history loaded on open.
    History,
}

/// Lifecycle of one transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Optimistic, waiting for storage to acknowledge.
    Pending,
    /// Carries an authoritative id.
    Delivered,
    /// The outbound store rejected the message.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    /// Stable local handle; survives replacement of an optimistic entry.
    pub local_id: Uuid,
    pub message: Message,
    pub delivery: DeliveryState,
}

/// What a single arrival did to the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptChange {
    /// Optimistic entry added.
    Pending { local_id: Uuid },
    /// New authoritative entry appended or inserted.
    Inserted { local_id: Uuid },
    /// An optimistic entry now carries its authoritative id.
    Confirmed { local_id: Uuid },
    /// An already-known message changed its read flag.
    ReadStateChanged { local_id: Uuid },
    /// Sending an optimistic entry failed.
    Failed { local_id: Uuid },
}

impl TranscriptChange {
    pub fn local_id(&self) -> Uuid {
        match *self {
            TranscriptChange::Pending { local_id }
            | TranscriptChange::Inserted { local_id }
            | TranscriptChange::Confirmed { local_id }
            | TranscriptChange::ReadStateChanged { local_id }
            | TranscriptChange::Failed { local_id } => local_id,
        }
    }
}

/// Ordered, duplicate-free message list for one conversation.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    match_window: chrono::Duration,
}

impl Transcript {
    pub fn new(match_window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            match_window: chrono::Duration::from_std(match_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: Uuid) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.local_id == local_id)
    }

    /// Add a locally composed message before storage acknowledges it.
    pub fn insert_optimistic(&mut self, mut message: Message) -> TranscriptChange {
        message.id = None;
        let local_id = Uuid::new_v4();
        self.insert_sorted(TranscriptEntry {
            local_id,
            message,
            delivery: DeliveryState::Pending,
        });
        TranscriptChange::Pending { local_id }
    }

    /// Merge an authoritative message. `None` means nothing changed.
    ///
    /// Messages without an id are treated as optimistic inserts.
    pub fn apply(&mut self, message: Message) -> Option<TranscriptChange> {
        let Some(id) = message.id.clone() else {
            return Some(self.insert_optimistic(message));
        };

        if let Some(entry) = self.find_by_id_mut(&id) {
            if entry.message.is_read != message.is_read {
                entry.message.is_read = message.is_read;
                return Some(TranscriptChange::ReadStateChanged {
                    local_id: entry.local_id,
                });
            }
            debug!(id = %id, "Dropping duplicate message");
            return None;
        }

        if let Some(index) = self.find_optimistic_match(&message) {
            let mut entry = self.entries.remove(index);
            entry.message = message;
            entry.delivery = DeliveryState::Delivered;
            let local_id = entry.local_id;
            self.insert_sorted_at_or_after(entry, index);
            return Some(TranscriptChange::Confirmed { local_id });
        }

        let local_id = Uuid::new_v4();
        self.insert_sorted(TranscriptEntry {
            local_id,
            message,
            delivery: DeliveryState::Delivered,
        });
        Some(TranscriptChange::Inserted { local_id })
    }

    /// Restore a send that was persisted before storage acknowledged it.
    ///
    /// The request that carried it belonged to an earlier session, so it comes
    /// back as `Failed`. A later authoritative copy still confirms it. Sends
    /// already in this transcript are left untouched.
    pub fn restore_unsent(&mut self, mut message: Message) -> Option<TranscriptChange> {
        message.id = None;
        let known = self.entries.iter().any(|entry| {
            entry.message.id.is_none()
                && entry.message.sender_id == message.sender_id
                && entry.message.content == message.content
                && entry.message.created_at == message.created_at
        });
        if known {
            return None;
        }
        let local_id = Uuid::new_v4();
        self.insert_sorted(TranscriptEntry {
            local_id,
            message,
            delivery: DeliveryState::Failed,
        });
        Some(TranscriptChange::Failed { local_id })
    }

    /// Flag a pending optimistic entry as failed.
    pub fn mark_failed(&mut self, local_id: Uuid) -> Option<TranscriptChange> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.local_id == local_id && entry.delivery == DeliveryState::Pending)?;
        entry.delivery = DeliveryState::Failed;
        Some(TranscriptChange::Failed { local_id })
    }

    /// Mark every unread message addressed to `reader_id` as read.
    pub fn mark_read_by(&mut self, reader_id: &str) -> Vec<TranscriptChange> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.message.is_inbound_for(reader_id) && !entry.message.is_read)
            .map(|entry| {
                entry.message.is_read = true;
                TranscriptChange::ReadStateChanged {
                    local_id: entry.local_id,
                }
            })
            .collect()
    }

    fn find_by_id_mut(&mut self, id: &MessageId) -> Option<&mut TranscriptEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.message.id.as_ref() == Some(id))
    }

    /// Oldest optimistic entry matching sender and content within the window.
    fn find_optimistic_match(&self, message: &Message) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.message.id.is_none()
                && entry.delivery != DeliveryState::Delivered
                && entry.message.sender_id == message.sender_id
                && entry.message.content == message.content
                && within(entry.message.created_at, message.created_at, self.match_window)
        })
    }

    fn insert_sorted(&mut self, entry: TranscriptEntry) {
        let at = self
            .entries
            .partition_point(|existing| existing.message.created_at <= entry.message.created_at);
        self.entries.insert(at, entry);
    }

    /// Re-insert a replaced entry, keeping its old slot when the order allows.
    fn insert_sorted_at_or_after(&mut self, entry: TranscriptEntry, index: usize) {
        let created_at = entry.message.created_at;
        let fits_before = index == 0 || self.entries[index - 1].message.created_at <= created_at;
        let fits_after = self
            .entries
            .get(index)
            .map_or(true, |next| created_at <= next.message.created_at);
        if fits_before && fits_after {
            self.entries.insert(index, entry);
        } else {
            self.insert_sorted(entry);
        }
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    (a - b).abs() <= window
}

/// Transcripts for every conversation plus per-counterpart unread counters.
#[derive(Debug)]
pub struct Reconciler {
    transcripts: HashMap<ConversationKey, Transcript>,
    unread: HashMap<String, u32>,
    match_window: Duration,
}

impl Reconciler {
    pub fn new(match_window: Duration) -> Self {
        Self {
            transcripts: HashMap::new(),
            unread: HashMap::new(),
            match_window,
        }
    }

    pub fn transcript(&self, conversation: &ConversationKey) -> Option<&Transcript> {
        self.transcripts.get(conversation)
    }

    pub fn transcript_mut(&mut self, conversation: &ConversationKey) -> &mut Transcript {
        let window = self.match_window;
        self.transcripts
            .entry(conversation.clone())
            .or_insert_with(|| Transcript::new(window))
    }

    pub fn apply(&mut self, conversation: &ConversationKey, message: Message) -> Option<TranscriptChange> {
        self.transcript_mut(conversation).apply(message)
    }

    /// Merge a message loaded from local history.
    pub fn restore(&mut self, conversation: &ConversationKey, message: Message) -> Option<TranscriptChange> {
        let transcript = self.transcript_mut(conversation);
        if message.is_authoritative() {
            transcript.apply(message)
        } else {
            transcript.restore_unsent(message)
        }
    }

    pub fn insert_optimistic(&mut self, conversation: &ConversationKey, message: Message) -> TranscriptChange {
        self.transcript_mut(conversation).insert_optimistic(message)
    }

    pub fn mark_failed(&mut self, conversation: &ConversationKey, local_id: Uuid) -> Option<TranscriptChange> {
        self.transcripts.get_mut(conversation)?.mark_failed(local_id)
    }

    pub fn entry(&self, conversation: &ConversationKey, local_id: Uuid) -> Option<&TranscriptEntry> {
        self.transcripts.get(conversation)?.get(local_id)
    }

    pub fn unread_count(&self, counterpart_id: &str) -> u32 {
        self.unread.get(counterpart_id).copied().unwrap_or(0)
    }

    /// Bump the unread counter for a counterpart and return the new value.
    pub fn increment_unread(&mut self, counterpart_id: &str) -> u32 {
        let count = self.unread.entry(counterpart_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Zero the counter; returns true when it was non-zero.
    pub fn reset_unread(&mut self, counterpart_id: &str) -> bool {
        self.unread.remove(counterpart_id).is_some_and(|count| count > 0)
    }

    pub fn clear(&mut self) {
        self.transcripts.clear();
        self.unread.clear();
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_WINDOW)
    }
}
