//! Realtime channel adapter: descriptors, handles and transport bring-up.

use crate::collaborators::{
    ChangeFilter, ChannelSpec, TransportCapabilities, TransportChannel, TransportClient,
    TransportConnector, TransportEventSender,
};
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{DeliverySource, DeliveryState, TranscriptChange};
use crate::types::{ConversationKey, Message};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Table realtime subscriptions listen on.
pub const MESSAGES_TABLE: &str = "messages";

/// Reconciled change delivered to a descriptor's callback.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub conversation: ConversationKey,
    pub local_id: Uuid,
    pub message: Message,
    pub delivery: DeliveryState,
    pub change: TranscriptChange,
    pub source: DeliverySource,
}

pub type MessageCallback = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// A logical subscription: unique channel name, filter and callback.
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    pub channel_name: String,
    /// Conversation polled on behalf of this subscription.
    pub conversation: ConversationKey,
    pub filter: ChangeFilter,
    pub on_message: MessageCallback,
}

impl SubscriptionDescriptor {
    pub fn new(
        channel_name: impl Into<String>,
        conversation: ConversationKey,
        filter: ChangeFilter,
        on_message: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            conversation,
            filter,
            on_message: Arc::new(on_message),
        }
    }

    /// Descriptor for a conversation, filtered to messages inside it.
    pub fn for_conversation(
        conversation: ConversationKey,
        on_message: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Self {
        let name = format!("chat-{}", conversation.storage_key());
        let filter = ChangeFilter::Conversation(conversation.clone());
        Self::new(name, conversation, filter, on_message)
    }

    pub fn spec(&self) -> ChannelSpec {
        ChannelSpec {
            name: self.channel_name.clone(),
            table: MESSAGES_TABLE.to_string(),
            filter: self.filter.clone(),
        }
    }

    /// True when this descriptor wants to see `message` from `conversation`.
    pub fn accepts(&self, conversation: &ConversationKey, message: &Message) -> bool {
        &self.conversation == conversation && self.filter.matches(message)
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("channel_name", &self.channel_name)
            .field("conversation", &self.conversation)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`; equal handles refer to the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    name: String,
    id: u64,
}

impl ChannelHandle {
    pub(crate) fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub(crate) struct RegisteredChannel {
    pub descriptor: SubscriptionDescriptor,
    pub handle: ChannelHandle,
    /// Live transport channel; `None` while polling or reconnecting.
    pub channel: Option<Arc<dyn TransportChannel>>,
}

/// At most one entry per channel name.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: HashMap<String, RegisteredChannel>,
    next_id: u64,
}

impl ChannelRegistry {
    pub fn get(&self, name: &str) -> Option<&RegisteredChannel> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut RegisteredChannel> {
        self.channels.get_mut(name)
    }

    /// Register a descriptor, returning its (possibly pre-existing) handle
    /// and whether it was newly inserted.
    pub fn register(&mut self, descriptor: SubscriptionDescriptor) -> (ChannelHandle, bool) {
        if let Some(existing) = self.channels.get(&descriptor.channel_name) {
            return (existing.handle.clone(), false);
        }
        self.next_id += 1;
        let handle = ChannelHandle::new(&descriptor.channel_name, self.next_id);
        self.channels.insert(
            descriptor.channel_name.clone(),
            RegisteredChannel {
                descriptor,
                handle: handle.clone(),
                channel: None,
            },
        );
        (handle, true)
    }

    pub fn remove(&mut self, name: &str) -> Option<RegisteredChannel> {
        self.channels.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors in subscription order.
    pub fn descriptors(&self) -> Vec<SubscriptionDescriptor> {
        let mut entries: Vec<_> = self.channels.values().collect();
        entries.sort_by_key(|entry| entry.handle.id());
        entries
            .into_iter()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Distinct conversations across all descriptors.
    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<_> = self
            .channels
            .values()
            .map(|entry| entry.descriptor.conversation.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Detach every live transport channel, keeping the descriptors.
    pub fn detach_all(&mut self) -> Vec<Arc<dyn TransportChannel>> {
        self.channels
            .values_mut()
            .filter_map(|entry| entry.channel.take())
            .collect()
    }

    /// Remove everything, returning live transport channels for teardown.
    pub fn drain(&mut self) -> Vec<Arc<dyn TransportChannel>> {
        self.channels
            .drain()
            .filter_map(|(_, entry)| entry.channel)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// An initialized transport client plus the generation it belongs to.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub client: Arc<dyn TransportClient>,
    pub capabilities: TransportCapabilities,
    /// Bumped on every (re)initialization; stale events are dropped.
    pub generation: u64,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("capabilities", &self.capabilities)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Brings up the transport client with bounded wait-and-retry.
#[derive(Clone)]
pub struct TransportInitializer {
    connector: Arc<dyn TransportConnector>,
    attempts: u32,
    retry_delay: Duration,
}

impl TransportInitializer {
    pub fn new(connector: Arc<dyn TransportConnector>, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            connector,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Obtain a client. `ConfigurationMissing` fails immediately; other
    /// errors are retried and finally reported as `LibraryUnavailable`.
    pub async fn initialize(
        &self,
        events: TransportEventSender,
        generation: u64,
    ) -> SyncResult<ConnectionHandle> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match self.connector.connect(events.clone()).await {
                Ok(client) => {
                    let capabilities = client.capabilities();
                    if !capabilities.supports_connection_events {
                        info!("Transport does not report connection events");
                    }
                    info!(attempt, generation, "Realtime transport initialized");
                    return Ok(ConnectionHandle {
                        client,
                        capabilities,
                        generation,
                    });
                }
                Err(err @ SyncError::ConfigurationMissing(_)) => {
                    warn!(error = %err, "Realtime transport not configured");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "Realtime transport initialization failed"
                    );
                    last_error = Some(err);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(SyncError::LibraryUnavailable(reason))
    }
}
