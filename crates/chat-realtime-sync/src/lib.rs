//! # chat-realtime-sync
//!
//! Client-side realtime/polling reconciliation for NGOBRAS chat.
//!
//! A [`SubscriptionManager`] keeps each conversation's transcript consistent
//! across three delivery paths:
//!
//! - **Push**: realtime channel subscriptions through a [`TransportConnector`].
//! - **Poll**: periodic [`MessageFetcher`] pulls while push is unavailable.
//! - **Optimistic**: local inserts from [`SubscriptionManager::send_message`].
//!
//! ## Components
//!
//! | Module | Role |
//! |---|---|
//! | [`transport_selector`] | Decides whether push is attempted for a host |
//! | [`channel`] | Descriptors, handles, transport bring-up with bounded retry |
//! | [`reconnect`] | rust-fsm reconnection machine with exponential backoff |
//! | [`polling`] | Self-rescheduling poll loop with its own backoff |
//! | [`reconcile`] | Ordered, duplicate-free transcripts and unread counters |
//! | [`manager`] | Composition root tying the above together |
//!
//! ## Example
//!
//! ```ignore
//! use chat_realtime_sync::{
//!     Collaborators, ConversationKey, SubscriptionDescriptor, SubscriptionManager, SyncConfig,
//! };
//!
//! let manager = SubscriptionManager::new("u1", SyncConfig::from_config(&config), collaborators);
//! let conversation = ConversationKey::new("u1", "admin-1");
//! manager
//!     .open_conversation(SubscriptionDescriptor::for_conversation(conversation.clone(), |event| {
//!         println!("{}: {}", event.message.sender_id, event.message.content);
//!     }))
//!     .await;
//! manager.send_message(&conversation, "hi").await?;
//! manager.cleanup().await;
//! ```

pub mod channel;
pub mod collaborators;
pub mod error;
pub mod history;
pub mod manager;
pub mod polling;
pub mod reconcile;
pub mod reconnect;
pub mod session;
pub mod transport_selector;
pub mod types;

pub use channel::{
    ChannelHandle, ConnectionHandle, MessageCallback, MessageEvent, SubscriptionDescriptor,
    TransportInitializer, MESSAGES_TABLE,
};
pub use collaborators::{
    ChangeFilter, ChannelSpec, FocusTracker, HistoryStore, MessageFetcher, Noop,
    OutboundMessageStore, ReadReceiptSink, TransportCapabilities, TransportChannel,
    TransportClient, TransportConnector, TransportEvent, TransportEventSender, UnreadSink,
};
pub use error::{SyncError, SyncResult};
pub use history::{FileHistoryStore, InMemoryHistoryStore};
pub use manager::{Collaborators, SendReceipt, SubscriptionManager, SyncConfig, SyncStatus};
pub use polling::{PollSnapshot, PollingConfig, PollingDriver};
pub use reconcile::{
    DeliverySource, DeliveryState, Reconciler, Transcript, TranscriptChange, TranscriptEntry,
};
pub use reconnect::{ConnectionState, ReconnectDecision, ReconnectPolicy, Reconnector};
pub use session::SessionContext;
pub use transport_selector::{is_push_transport_enabled, resolve_push_enabled};
pub use types::{assistant_participant, is_assistant, ConversationKey, Message, MessageId};
