//! Test harness with fake collaborators for the subscription manager.
//!
//! Every fake records what it was asked to do behind `Arc<Mutex<..>>` so
//! tests can assert on calls after driving the manager with paused time.

#![allow(dead_code)]

use async_trait::async_trait;
use chat_realtime_sync::{
    ChannelSpec, Collaborators, ConversationKey, FocusTracker, InMemoryHistoryStore, Message,
    MessageEvent, MessageFetcher, MessageId, OutboundMessageStore, ReadReceiptSink,
    SubscriptionDescriptor, SubscriptionManager, SyncConfig, SyncError, SyncResult,
    TransportCapabilities, TransportChannel, TransportClient, TransportConnector, TransportEvent,
    TransportEventSender, UnreadSink,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const USER: &str = "u1";
pub const ADMIN: &str = "admin-1";

/// Fixed wall-clock origin for message timestamps.
pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_714_557_600_000 + ms).unwrap()
}

pub fn stored(id: i64, sender: &str, receiver: &str, content: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: Some(MessageId::from(id)),
        ..Message::optimistic(sender, receiver, content, created_at)
    }
}

pub fn admin_conversation() -> ConversationKey {
    ConversationKey::new(USER, ADMIN)
}

/// Let spawned tasks (event loop, reconnect timers) run without moving time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFetcher {
    rows: Mutex<Vec<Message>>,
    failures_remaining: AtomicU32,
    calls: Mutex<Vec<Duration>>,
    delay: Mutex<Duration>,
    origin: Mutex<Option<Instant>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        let fetcher = Self::default();
        *fetcher.origin.lock().unwrap() = Some(Instant::now());
        Arc::new(fetcher)
    }

    pub fn insert(&self, message: Message) {
        self.rows.lock().unwrap().push(message);
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Elapsed (virtual) time of every fetch call.
    pub fn call_times(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageFetcher for FakeFetcher {
    async fn fetch_messages(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>> {
        let origin = self.origin.lock().unwrap().unwrap_or_else(Instant::now);
        self.calls.lock().unwrap().push(origin.elapsed());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::FetchFailed("503 Service Unavailable".into()));
        }

        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|message| &message.conversation_key() == conversation)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How the fake transport answers `open_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open and confirm with `Subscribed`.
    Confirm,
    /// Open but never confirm.
    Silent,
    /// `open_channel` returns an error.
    Reject,
    /// Open, then report `SubscribeFailed`.
    FailAsync,
}

pub struct FakeConnector {
    behavior: Mutex<OpenBehavior>,
    fail_connect: AtomicBool,
    missing_config: AtomicBool,
    connect_delay: Mutex<Duration>,
    open_delay: Arc<Mutex<Duration>>,
    unsubscribe_delay: Arc<Mutex<Duration>>,
    supports_events: AtomicBool,
    connect_times: Mutex<Vec<Duration>>,
    origin: Instant,
    sender: Mutex<Option<TransportEventSender>>,
    opened: Arc<Mutex<Vec<String>>>,
    unsubscribed: Arc<Mutex<Vec<String>>>,
    disconnects: Arc<AtomicU32>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(OpenBehavior::Confirm),
            fail_connect: AtomicBool::new(false),
            missing_config: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            open_delay: Arc::new(Mutex::new(Duration::ZERO)),
            unsubscribe_delay: Arc::new(Mutex::new(Duration::ZERO)),
            supports_events: AtomicBool::new(true),
            connect_times: Mutex::new(Vec::new()),
            origin: Instant::now(),
            sender: Mutex::new(None),
            opened: Arc::new(Mutex::new(Vec::new())),
            unsubscribed: Arc::new(Mutex::new(Vec::new())),
            disconnects: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn set_behavior(&self, behavior: OpenBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_missing_config(&self, missing: bool) {
        self.missing_config.store(missing, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Delay every `open_channel` call, including on existing clients.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_unsubscribe_delay(&self, delay: Duration) {
        *self.unsubscribe_delay.lock().unwrap() = delay;
    }

    pub fn set_supports_events(&self, supported: bool) {
        self.supports_events.store(supported, Ordering::SeqCst);
    }

    /// Push an event on the most recent connection.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(event);
        }
    }

    pub fn connect_times(&self) -> Vec<Duration> {
        self.connect_times.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_times.lock().unwrap().len()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, events: TransportEventSender) -> SyncResult<Arc<dyn TransportClient>> {
        self.connect_times.lock().unwrap().push(self.origin.elapsed());

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.missing_config.load(Ordering::SeqCst) {
            return Err(SyncError::ConfigurationMissing("SUPABASE_ANON_KEY".into()));
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SyncError::LibraryUnavailable("connection refused".into()));
        }

        let _ = events.send(TransportEvent::Opened);
        *self.sender.lock().unwrap() = Some(events.clone());
        Ok(Arc::new(FakeClient {
            events,
            behavior: *self.behavior.lock().unwrap(),
            supports_events: self.supports_events.load(Ordering::SeqCst),
            opened: Arc::clone(&self.opened),
            unsubscribed: Arc::clone(&self.unsubscribed),
            open_delay: Arc::clone(&self.open_delay),
            unsubscribe_delay: Arc::clone(&self.unsubscribe_delay),
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

struct FakeClient {
    events: TransportEventSender,
    behavior: OpenBehavior,
    supports_events: bool,
    opened: Arc<Mutex<Vec<String>>>,
    unsubscribed: Arc<Mutex<Vec<String>>>,
    open_delay: Arc<Mutex<Duration>>,
    unsubscribe_delay: Arc<Mutex<Duration>>,
    disconnects: Arc<AtomicU32>,
}

#[async_trait]
impl TransportClient for FakeClient {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_connection_events: self.supports_events,
        }
    }

    async fn open_channel(&self, spec: &ChannelSpec) -> SyncResult<Arc<dyn TransportChannel>> {
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.behavior == OpenBehavior::Reject {
            return Err(SyncError::SubscriptionFailed {
                channel: spec.name.clone(),
                reason: "join rejected".into(),
            });
        }
        self.opened.lock().unwrap().push(spec.name.clone());
        match self.behavior {
            OpenBehavior::Confirm => {
                let _ = self.events.send(TransportEvent::Subscribed {
                    channel: spec.name.clone(),
                });
            }
            OpenBehavior::FailAsync => {
                let _ = self.events.send(TransportEvent::SubscribeFailed {
                    channel: spec.name.clone(),
                    reason: "timed out".into(),
                });
            }
            OpenBehavior::Silent | OpenBehavior::Reject => {}
        }
        Ok(Arc::new(FakeChannel {
            name: spec.name.clone(),
            unsubscribed: Arc::clone(&self.unsubscribed),
            delay: Arc::clone(&self.unsubscribe_delay),
        }))
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeChannel {
    name: String,
    unsubscribed: Arc<Mutex<Vec<String>>>,
    delay: Arc<Mutex<Duration>>,
}

#[async_trait]
impl TransportChannel for FakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn unsubscribe(&self) -> SyncResult<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.unsubscribed.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingUnread {
    pub updates: Mutex<Vec<(String, u32)>>,
}

impl UnreadSink for RecordingUnread {
    fn on_unread_count_changed(&self, counterpart_id: &str, count: u32) {
        self.updates
            .lock()
            .unwrap()
            .push((counterpart_id.to_string(), count));
    }
}

#[derive(Default)]
pub struct FakeFocus {
    pub focused: Mutex<HashSet<String>>,
}

impl FocusTracker for FakeFocus {
    fn is_conversation_focused(&self, counterpart_id: &str) -> bool {
        self.focused.lock().unwrap().contains(counterpart_id)
    }
}

#[derive(Default)]
pub struct RecordingReceipts {
    pub calls: Mutex<Vec<(ConversationKey, String)>>,
}

#[async_trait]
impl ReadReceiptSink for RecordingReceipts {
    async fn mark_conversation_read(
        &self,
        conversation: &ConversationKey,
        reader_id: &str,
    ) -> SyncResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((conversation.clone(), reader_id.to_string()));
        Ok(())
    }
}

/// Outbound store that writes the row where the fetcher can see it.
pub struct FakeOutbound {
    fetcher: Arc<FakeFetcher>,
    next_id: AtomicI64,
    fail: AtomicBool,
    ack_delay: Mutex<Duration>,
}

impl FakeOutbound {
    pub fn new(fetcher: Arc<FakeFetcher>) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            next_id: AtomicI64::new(42),
            fail: AtomicBool::new(false),
            ack_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl OutboundMessageStore for FakeOutbound {
    async fn insert_message(&self, message: &Message) -> SyncResult<Message> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::FetchFailed("insert rejected".into()));
        }
        let stored = Message {
            id: Some(MessageId::from(self.next_id.fetch_add(1, Ordering::SeqCst))),
            ..message.clone()
        };
        self.fetcher.insert(stored.clone());

        let delay = *self.ack_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub manager: SubscriptionManager,
    pub fetcher: Arc<FakeFetcher>,
    pub connector: Arc<FakeConnector>,
    pub outbound: Arc<FakeOutbound>,
    pub history: Arc<InMemoryHistoryStore>,
    pub unread: Arc<RecordingUnread>,
    pub focus: Arc<FakeFocus>,
    pub receipts: Arc<RecordingReceipts>,
    pub events: Arc<Mutex<Vec<MessageEvent>>>,
}

impl TestHarness {
    pub fn new(config: SyncConfig) -> Self {
        let fetcher = FakeFetcher::new();
        let connector = FakeConnector::new();
        let outbound = FakeOutbound::new(Arc::clone(&fetcher));
        let history = Arc::new(InMemoryHistoryStore::new());
        let unread = Arc::new(RecordingUnread::default());
        let focus = Arc::new(FakeFocus::default());
        let receipts = Arc::new(RecordingReceipts::default());

        let collaborators = Collaborators::new(
            fetcher.clone(),
            connector.clone(),
            outbound.clone(),
        )
        .with_history(history.clone())
        .with_unread_sink(unread.clone())
        .with_focus_tracker(focus.clone())
        .with_read_receipts(receipts.clone());

        Self {
            manager: SubscriptionManager::new(USER, config, collaborators),
            fetcher,
            connector,
            outbound,
            history,
            unread,
            focus,
            receipts,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Push-enabled harness with quick initialization retries.
    pub fn push() -> Self {
        Self::new(test_config(true))
    }

    /// Polling-only harness.
    pub fn polling() -> Self {
        Self::new(test_config(false))
    }

    /// Descriptor for the admin conversation that records every event.
    pub fn admin_descriptor(&self) -> SubscriptionDescriptor {
        self.descriptor_for(admin_conversation())
    }

    pub fn descriptor_for(&self, conversation: ConversationKey) -> SubscriptionDescriptor {
        let events = Arc::clone(&self.events);
        SubscriptionDescriptor::for_conversation(conversation, move |event| {
            events.lock().unwrap().push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<MessageEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contents(&self, conversation: &ConversationKey) -> Vec<String> {
        self.manager
            .transcript(conversation)
            .into_iter()
            .map(|entry| entry.message.content)
            .collect()
    }

    pub fn unread_updates(&self) -> Vec<(String, u32)> {
        self.unread.updates.lock().unwrap().clone()
    }
}

pub fn test_config(push_enabled: bool) -> SyncConfig {
    SyncConfig {
        init_attempts: 1,
        ..SyncConfig::default()
    }
    .with_push_enabled(push_enabled)
}
