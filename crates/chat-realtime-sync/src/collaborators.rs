//! Interfaces the sync core consumes.
//!
//! Concrete backends live in sibling crates (`supabase-rest-client`,
//! `realtime-phoenix-transport`); tests use in-memory fakes.

use crate::error::SyncResult;
use crate::types::{ConversationKey, Message};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server-side change filter attached to a push subscription.
///
/// Also evaluated client-side, so a transport that cannot filter still
/// delivers only matching rows to descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Every inserted message.
    All,
    /// Messages addressed to one participant.
    Receiver(String),
    /// Messages sent by one participant.
    Sender(String),
    /// Messages exchanged inside one conversation.
    Conversation(ConversationKey),
}

impl ChangeFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            ChangeFilter::All => true,
            ChangeFilter::Receiver(id) => &message.receiver_id == id,
            ChangeFilter::Sender(id) => &message.sender_id == id,
            ChangeFilter::Conversation(key) => &message.conversation_key() == key,
        }
    }

    /// Row filter in `column=eq.value` form, when the backend can apply it.
    ///
    /// Conversation filters need two columns, which realtime row filters
    /// cannot express; those are applied on the client only.
    pub fn server_filter(&self) -> Option<String> {
        match self {
            ChangeFilter::Receiver(id) => Some(format!("receiver_id=eq.{id}")),
            ChangeFilter::Sender(id) => Some(format!("sender_id=eq.{id}")),
            ChangeFilter::All | ChangeFilter::Conversation(_) => None,
        }
    }
}

/// What the transport needs to open one named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub table: String,
    pub filter: ChangeFilter,
}

/// Hooks the underlying client supports, reported once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Whether `Opened`/`Closed` events will ever be emitted.
    pub supports_connection_events: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            supports_connection_events: true,
        }
    }
}

/// Out-of-band notifications from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Underlying connection is open.
    Opened,
    /// Underlying connection dropped.
    Closed { reason: Option<String> },
    /// Server confirmed a channel subscription.
    Subscribed { channel: String },
    /// Server rejected a channel subscription or it timed out.
    SubscribeFailed { channel: String, reason: String },
    /// A row change matching a channel's filter.
    Change { channel: String, message: Message },
}

/// Sender half handed to the connector for one connection's events.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Obtains (lazily initializing) the realtime-capable client.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Fails with `ConfigurationMissing` when the endpoint or credential is
    /// absent, otherwise with `LibraryUnavailable`.
    async fn connect(&self, events: TransportEventSender) -> SyncResult<Arc<dyn TransportClient>>;
}

/// One live transport connection multiplexing many channels.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn capabilities(&self) -> TransportCapabilities;

    /// Request a channel; confirmation arrives as `TransportEvent::Subscribed`.
    async fn open_channel(&self, spec: &ChannelSpec) -> SyncResult<Arc<dyn TransportChannel>>;

    /// Close the connection and every channel on it.
    async fn disconnect(&self);
}

/// A channel opened on a transport client.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn unsubscribe(&self) -> SyncResult<()>;
}

/// Pull-based retrieval of a whole conversation.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Must fail on any transport or storage error instead of returning a
    /// partial result.
    async fn fetch_messages(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>>;
}

/// Local history, keyed by conversation.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn persist_optimistic(
        &self,
        conversation: &ConversationKey,
        local_id: Uuid,
        message: &Message,
    ) -> SyncResult<()>;

    /// Store an acknowledged message, replacing the optimistic record
    /// `replaces` when given.
    async fn persist_authoritative(
        &self,
        conversation: &ConversationKey,
        message: &Message,
        replaces: Option<Uuid>,
    ) -> SyncResult<()>;

    /// Persisted messages in `created_at` order.
    async fn load(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>>;
}

/// Unread badge updates.
pub trait UnreadSink: Send + Sync {
    fn on_unread_count_changed(&self, counterpart_id: &str, count: u32);
}

/// Host-side focus query consulted before counting a message as unread.
pub trait FocusTracker: Send + Sync {
    fn is_conversation_focused(&self, counterpart_id: &str) -> bool;
}

/// Marks messages read in the message store.
#[async_trait]
pub trait ReadReceiptSink: Send + Sync {
    async fn mark_conversation_read(
        &self,
        conversation: &ConversationKey,
        reader_id: &str,
    ) -> SyncResult<()>;
}

/// Persists outgoing messages; returns the stored row with its id.
#[async_trait]
pub trait OutboundMessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> SyncResult<Message>;
}

/// Sink and tracker used when the host does not care.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl UnreadSink for Noop {
    fn on_unread_count_changed(&self, _counterpart_id: &str, _count: u32) {}
}

impl FocusTracker for Noop {
    fn is_conversation_focused(&self, _counterpart_id: &str) -> bool {
        false
    }
}

#[async_trait]
impl ReadReceiptSink for Noop {
    async fn mark_conversation_read(
        &self,
        _conversation: &ConversationKey,
        _reader_id: &str,
    ) -> SyncResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_filter_matching() {
        let message = Message::optimistic("admin-1", "u1", "hello", Utc::now());

        assert!(ChangeFilter::All.matches(&message));
        assert!(ChangeFilter::Receiver("u1".into()).matches(&message));
        assert!(!ChangeFilter::Receiver("admin-1".into()).matches(&message));
        assert!(ChangeFilter::Sender("admin-1".into()).matches(&message));
        assert!(ChangeFilter::Conversation(ConversationKey::new("u1", "admin-1")).matches(&message));
        assert!(!ChangeFilter::Conversation(ConversationKey::new("u1", "admin-2")).matches(&message));
    }

    #[test]
    fn test_server_filter() {
        assert_eq!(
            ChangeFilter::Receiver("u1".into()).server_filter().as_deref(),
            Some("receiver_id=eq.u1")
        );
        assert!(ChangeFilter::All.server_filter().is_none());
        assert!(ChangeFilter::Conversation(ConversationKey::new("a", "b"))
            .server_filter()
            .is_none());
    }
}
