//! # Subscription Manager
//!
//! Composition root for one chat session. It owns the channel registry,
//! the reconnection machine, the polling driver and the reconciler, and is
//! the only place where delivery paths meet.
//!
//! ## Delivery paths
//!
//! ```text
//!   TransportConnector ──events──▶ event loop ─┐
//!                                             ├──▶ Reconciler ──▶ callbacks,
//!   PollingDriver ──fetch_messages──▶ poll ───┤                   unread sink,
//!                                             │                   history
//!   send_message ──optimistic insert──────────┘
//! ```
//!
//! ## Concurrency
//!
//! Shared state lives behind a `std::sync::Mutex` that is never held across
//! an await or while host callbacks run. Every spawned task captures the
//! session epoch; `cleanup()` bumps it, aborts timers and detaches channels
//! before its first await, so late network results are dropped. Callbacks
//! run under a separate dispatch lock that `cleanup()` waits on, so none
//! fires after cleanup returns.
//!
//! The manager is written for a current-thread runtime (one session per UI
//! thread) but stays correct on a multi-thread runtime.

use crate::channel::{
    ChannelHandle, ChannelRegistry, ConnectionHandle, MessageCallback, MessageEvent,
    SubscriptionDescriptor, TransportInitializer,
};
use crate::collaborators::{
    FocusTracker, HistoryStore, MessageFetcher, Noop, OutboundMessageStore, ReadReceiptSink,
    TransportConnector, TransportEvent, UnreadSink,
};
use crate::error::{SyncError, SyncResult};
use crate::history::InMemoryHistoryStore;
use crate::polling::{PollSnapshot, PollTick, PollingConfig, PollingDriver};
use crate::reconcile::{
    DeliverySource, DeliveryState, Reconciler, TranscriptChange, TranscriptEntry,
    DEFAULT_MATCH_WINDOW,
};
use crate::reconnect::{
    ConnectionMachineState, ConnectionState, ReconnectDecision, ReconnectPolicy, Reconnector,
};
use crate::session::SessionContext;
use crate::transport_selector::resolve_push_enabled;
use crate::types::{ConversationKey, Message};
use chat_config_and_utils::{Config, RealtimeSettings};
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runtime configuration for a subscription manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Result of the transport selector; false means poll only.
    pub push_enabled: bool,
    pub reconnect: ReconnectPolicy,
    pub polling: PollingConfig,
    /// How many times transport initialization is attempted.
    pub init_attempts: u32,
    pub init_retry_delay: Duration,
    /// Optimistic/authoritative match window.
    pub match_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            reconnect: ReconnectPolicy::default(),
            polling: PollingConfig::default(),
            init_attempts: 5,
            init_retry_delay: Duration::from_secs(1),
            match_window: DEFAULT_MATCH_WINDOW,
        }
    }
}

impl SyncConfig {
    /// Build from realtime settings, resolving the transport for `app_url`.
    pub fn from_settings(settings: &RealtimeSettings, app_url: &str) -> Self {
        Self {
            push_enabled: resolve_push_enabled(settings.transport_mode, app_url),
            reconnect: ReconnectPolicy {
                max_retries: settings.max_retries,
                base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
            },
            polling: PollingConfig {
                base_interval: Duration::from_millis(settings.poll_interval_ms),
                max_interval: Duration::from_millis(settings.poll_max_interval_ms),
                growth_factor: settings.poll_growth_factor,
            },
            init_attempts: settings.init_attempts,
            init_retry_delay: Duration::from_millis(settings.init_retry_delay_ms),
            match_window: Duration::from_millis(settings.optimistic_match_window_ms),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::from_settings(&config.realtime, &config.app_url)
    }

    pub fn with_push_enabled(mut self, push_enabled: bool) -> Self {
        self.push_enabled = push_enabled;
        self
    }
}

/// External collaborators the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn MessageFetcher>,
    pub connector: Arc<dyn TransportConnector>,
    pub history: Arc<dyn HistoryStore>,
    pub unread: Arc<dyn UnreadSink>,
    pub focus: Arc<dyn FocusTracker>,
    pub receipts: Arc<dyn ReadReceiptSink>,
    pub outbound: Arc<dyn OutboundMessageStore>,
}

impl Collaborators {
    /// Required collaborators plus in-memory history and no-op sinks.
    pub fn new(
        fetcher: Arc<dyn MessageFetcher>,
        connector: Arc<dyn TransportConnector>,
        outbound: Arc<dyn OutboundMessageStore>,
    ) -> Self {
        Self {
            fetcher,
            connector,
            history: Arc::new(InMemoryHistoryStore::new()),
            unread: Arc::new(Noop),
            focus: Arc::new(Noop),
            receipts: Arc::new(Noop),
            outbound,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_unread_sink(mut self, unread: Arc<dyn UnreadSink>) -> Self {
        self.unread = unread;
        self
    }

    pub fn with_focus_tracker(mut self, focus: Arc<dyn FocusTracker>) -> Self {
        self.focus = focus;
        self
    }

    pub fn with_read_receipts(mut self, receipts: Arc<dyn ReadReceiptSink>) -> Self {
        self.receipts = receipts;
        self
    }
}

/// Observable sync health for the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub push_enabled: bool,
    pub polling: bool,
    pub poll_interval: Duration,
    pub consecutive_poll_failures: u32,
    pub channels: usize,
}

/// Result of [`SubscriptionManager::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub local_id: Uuid,
    pub delivery: DeliveryState,
    /// Stored row when the outbound store acknowledged the message.
    pub stored: Option<Message>,
}

struct State {
    session: SessionContext,
    registry: ChannelRegistry,
    reconnector: Reconnector,
    reconciler: Reconciler,
    connection: Option<ConnectionHandle>,
    /// Last issued connection generation.
    generation: u64,
    /// Bumped by every cleanup.
    epoch: u64,
    /// Cleanups currently in progress.
    teardowns: u32,
    event_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl State {
    fn is_live(&self, epoch: u64) -> bool {
        self.teardowns == 0 && self.epoch == epoch
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

enum SubscribeStep {
    Open(ConnectionHandle, ChannelHandle, u64),
    Connect(ChannelHandle, u64),
}

/// Side effects collected under the state lock and run after it is released.
#[derive(Default)]
struct Outcome {
    events: Vec<(MessageCallback, MessageEvent)>,
    unread: Vec<(String, u32)>,
    persist: Vec<(ConversationKey, Message, Option<Uuid>)>,
}

struct Inner {
    config: SyncConfig,
    collaborators: Collaborators,
    initializer: TransportInitializer,
    state: Mutex<State>,
    polling: PollingDriver,
    /// Serializes the transport bring-up.
    connect_lock: tokio::sync::Mutex<()>,
    /// Held while host callbacks run.
    dispatch_lock: Mutex<()>,
    status_tx: watch::Sender<SyncStatus>,
}

/// Multiplexes channels over one transport and reconciles every delivery
/// path into one transcript per conversation.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(
        local_user_id: impl Into<String>,
        config: SyncConfig,
        collaborators: Collaborators,
    ) -> Self {
        let local_user_id = local_user_id.into();
        let initializer = TransportInitializer::new(
            Arc::clone(&collaborators.connector),
            config.init_attempts,
            config.init_retry_delay,
        );
        let initial_status = SyncStatus {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            push_enabled: config.push_enabled,
            polling: false,
            poll_interval: config.polling.base_interval,
            consecutive_poll_failures: 0,
            channels: 0,
        };
        let (status_tx, _) = watch::channel(initial_status);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let polling = PollingDriver::new(config.polling.clone(), poll_tick(weak.clone()))
                .with_observer(poll_observer(weak.clone()));
            Inner {
                state: Mutex::new(State {
                    session: SessionContext::new(local_user_id),
                    registry: ChannelRegistry::default(),
                    reconnector: Reconnector::new(config.reconnect.clone()),
                    reconciler: Reconciler::new(config.match_window),
                    connection: None,
                    generation: 0,
                    epoch: 0,
                    teardowns: 0,
                    event_task: None,
                    reconnect_task: None,
                }),
                config,
                collaborators,
                initializer,
                polling,
                connect_lock: tokio::sync::Mutex::new(()),
                dispatch_lock: Mutex::new(()),
                status_tx,
            }
        });

        Self { inner }
    }

    /// Register a descriptor and, when push is available, open its channel.
    ///
    /// Returns the channel handle (the same one on every call for a name),
    /// or `None` when delivery for this descriptor is polling-only: push
    /// disabled, push abandoned for the session, or cleanup in progress.
    pub async fn subscribe(&self, descriptor: SubscriptionDescriptor) -> Option<ChannelHandle> {
        self.inner.subscribe(descriptor).await
    }

    /// Tear down one channel. Unknown names are a silent no-op.
    pub async fn unsubscribe(&self, channel_name: &str) {
        self.inner.unsubscribe(channel_name).await;
    }

    /// Tear down every channel, stop polling and cancel reconnects.
    ///
    /// Idempotent. Resets the manager so it can be used for a new session.
    pub async fn cleanup(&self) {
        self.inner.cleanup().await;
    }

    /// Focus a conversation, reset its unread count, mark it read, hydrate
    /// persisted history and subscribe to it.
    ///
    /// Switching to a conversation backed by a different channel
    /// unsubscribes the previous one.
    pub async fn open_conversation(&self, descriptor: SubscriptionDescriptor) -> Option<ChannelHandle> {
        self.inner.open_conversation(descriptor).await
    }

    /// Insert a message optimistically and hand it to the outbound store.
    ///
    /// A rejected send is not an error: the entry stays in the transcript
    /// with [`DeliveryState::Failed`].
    pub async fn send_message(
        &self,
        conversation: &ConversationKey,
        content: impl Into<String>,
    ) -> SyncResult<SendReceipt> {
        self.inner.send_message(conversation, content.into()).await
    }

    /// Drop focus (e.g. the chat view was closed).
    pub fn blur_conversation(&self) {
        self.inner.lock_state().session.blur();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().reconnector.state()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch_state(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn transcript(&self, conversation: &ConversationKey) -> Vec<TranscriptEntry> {
        self.inner
            .lock_state()
            .reconciler
            .transcript(conversation)
            .map(|transcript| transcript.entries().to_vec())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, counterpart_id: &str) -> u32 {
        self.inner.lock_state().reconciler.unread_count(counterpart_id)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.lock_state().registry.names()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.is_running()
    }

    pub fn poll_snapshot(&self) -> PollSnapshot {
        self.inner.polling.snapshot()
    }

    pub fn session(&self) -> SessionContext {
        self.inner.lock_state().session.clone()
    }

    pub fn local_user_id(&self) -> String {
        self.inner.lock_state().session.local_user_id().to_string()
    }
}

fn poll_tick(weak: Weak<Inner>) -> PollTick {
    Arc::new(move || -> BoxFuture<'static, SyncResult<()>> {
        let weak = weak.clone();
        Box::pin(async move {
            match weak.upgrade() {
                Some(inner) => inner.poll_once().await,
                None => Ok(()),
            }
        })
    })
}

fn poll_observer(weak: Weak<Inner>) -> Arc<dyn Fn(PollSnapshot) + Send + Sync> {
    Arc::new(move |_snapshot: PollSnapshot| {
        if let Some(inner) = weak.upgrade() {
            let state = inner.lock_state();
            inner.publish_status(&state);
        }
    })
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_status(&self, state: &State) {
        let poll = self.polling.snapshot();
        let next = SyncStatus {
            state: state.reconnector.state(),
            retry_count: state.reconnector.retry_count(),
            push_enabled: self.config.push_enabled,
            polling: poll.running,
            poll_interval: poll.interval,
            consecutive_poll_failures: poll.consecutive_failures,
            channels: state.registry.len(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn start_polling(&self, reason: &str) {
        if self.polling.start_polling() {
            info!(reason, "Falling back to polling");
        }
    }

    // ---------------------------------------------------------------
    // Subscribe / unsubscribe / cleanup
    // ---------------------------------------------------------------

    async fn subscribe(self: &Arc<Self>, descriptor: SubscriptionDescriptor) -> Option<ChannelHandle> {
        let name = descriptor.channel_name.clone();
        let step = {
            let mut state = self.lock_state();
            if state.teardowns > 0 {
                debug!(channel = %name, "Ignoring subscribe during cleanup");
                return None;
            }
            let (handle, inserted) = state.registry.register(descriptor.clone());

            if !self.config.push_enabled {
                state.reconnector.on_push_disabled();
                self.start_polling("push transport disabled for this host");
                self.publish_status(&state);
                return None;
            }
            if state.reconnector.is_fallback() {
                self.start_polling("push abandoned for this session");
                self.publish_status(&state);
                return None;
            }
            if !inserted {
                debug!(channel = %name, "Channel already registered");
                return Some(handle);
            }
            self.publish_status(&state);

            match state.connection.clone() {
                Some(connection) => SubscribeStep::Open(connection, handle, state.epoch),
                None if *state.reconnector.machine_state() == ConnectionMachineState::Retrying => {
                    debug!(channel = %name, "Reconnect pending, channel will open with it");
                    return Some(handle);
                }
                None => SubscribeStep::Connect(handle, state.epoch),
            }
        };

        let (connection, handle, epoch) = match step {
            SubscribeStep::Open(connection, handle, epoch) => (connection, handle, epoch),
            SubscribeStep::Connect(handle, epoch) => match self.ensure_connected(epoch).await {
                Ok(Some(connection)) => (connection, handle, epoch),
                Ok(None) => {
                    let state = self.lock_state();
                    let registered = state
                        .registry
                        .get(&name)
                        .is_some_and(|entry| entry.handle == handle);
                    return (registered && !state.reconnector.is_fallback()).then_some(handle);
                }
                Err(SyncError::Closed) => return None,
                Err(err) => {
                    warn!(channel = %name, error = %err, "Realtime unavailable, polling instead");
                    return None;
                }
            },
        };
        self.open_channel(epoch, &connection, descriptor, handle).await
    }

    /// Return the live connection, initializing the transport if needed.
    ///
    /// `Ok(None)` means a reconnect or fallback owns the transport now.
    async fn ensure_connected(self: &Arc<Self>, epoch: u64) -> SyncResult<Option<ConnectionHandle>> {
        let _connecting = self.connect_lock.lock().await;

        let generation = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) {
                return Err(SyncError::Closed);
            }
            if let Some(connection) = &state.connection {
                return Ok(Some(connection.clone()));
            }
            let machine_state = state.reconnector.machine_state().clone();
            match machine_state {
                ConnectionMachineState::Disconnected => {
                    state.reconnector.begin_connect();
                }
                ConnectionMachineState::Connecting => {}
                _ => return Ok(None),
            }
            state.generation += 1;
            self.publish_status(&state);
            state.generation
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let result = self.initializer.initialize(events_tx, generation).await;

        let abandoned = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) || state.generation != generation {
                result.ok()
            } else {
                return match result {
                    Ok(connection) => {
                        state.event_task = Some(self.spawn_event_loop(generation, events_rx));
                        state.connection = Some(connection.clone());
                        Ok(Some(connection))
                    }
                    Err(err) => {
                        state.reconnector.on_init_failed();
                        self.start_polling("transport initialization failed");
                        self.publish_status(&state);
                        Err(err)
                    }
                };
            }
        };
        if let Some(connection) = abandoned {
            connection.client.disconnect().await;
        }
        Err(SyncError::Closed)
    }

    async fn open_channel(
        self: &Arc<Self>,
        epoch: u64,
        connection: &ConnectionHandle,
        descriptor: SubscriptionDescriptor,
        handle: ChannelHandle,
    ) -> Option<ChannelHandle> {
        let name = descriptor.channel_name.clone();
        match connection.client.open_channel(&descriptor.spec()).await {
            Ok(channel) => {
                let stale = {
                    let mut state = self.lock_state();
                    let current = state.is_live(epoch)
                        && state
                            .connection
                            .as_ref()
                            .is_some_and(|live| live.generation == connection.generation);
                    match state.registry.get_mut(&name) {
                        Some(entry) if current && entry.handle == handle => {
                            entry.channel = Some(channel);
                            None
                        }
                        _ => Some(channel),
                    }
                };
                match stale {
                    None => {
                        debug!(channel = %name, "Channel opened");
                        Some(handle)
                    }
                    Some(channel) => {
                        debug!(channel = %name, "Dropping channel opened for a stale session");
                        if let Err(err) = channel.unsubscribe().await {
                            debug!(channel = %name, error = %err, "Stale channel teardown failed");
                        }
                        None
                    }
                }
            }
            Err(err) => {
                warn!(channel = %name, error = %err, "Subscription failed, falling back to polling");
                self.on_connection_lost(connection.generation);
                let state = self.lock_state();
                (state.is_live(epoch) && !state.reconnector.is_fallback()).then_some(handle)
            }
        }
    }

    async fn unsubscribe(&self, channel_name: &str) {
        let channel = {
            let mut state = self.lock_state();
            let Some(entry) = state.registry.remove(channel_name) else {
                debug!(channel = %channel_name, "Unsubscribe for unknown channel");
                return;
            };
            if state.registry.is_empty() {
                self.polling.stop_polling();
            }
            self.publish_status(&state);
            entry.channel
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.unsubscribe().await {
                debug!(channel = %channel_name, error = %err, "Channel teardown failed");
            }
        }
        info!(channel = %channel_name, "Unsubscribed");
    }

    async fn cleanup(&self) {
        let (channels, connection) = {
            let mut state = self.lock_state();
            state.teardowns += 1;
            state.epoch += 1;
            state.abort_tasks();
            self.polling.stop_polling();
            let channels = state.registry.drain();
            let connection = state.connection.take();
            state.reconnector.reset();
            state.reconciler.clear();
            state.session.clear();
            self.publish_status(&state);
            (channels, connection)
        };

        // Wait out any callback already running.
        drop(self.dispatch_lock.lock().unwrap_or_else(|p| p.into_inner()));

        for channel in channels {
            if let Err(err) = channel.unsubscribe().await {
                debug!(channel = %channel.name(), error = %err, "Channel teardown failed");
            }
        }
        if let Some(connection) = connection {
            connection.client.disconnect().await;
        }

        let mut state = self.lock_state();
        state.teardowns = state.teardowns.saturating_sub(1);
        info!("Subscription manager cleaned up");
    }

    // ---------------------------------------------------------------
    // Transport events and reconnection
    // ---------------------------------------------------------------

    fn spawn_event_loop(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_event(generation, event).await;
            }
            debug!(generation, "Transport event stream ended");
        })
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let epoch = {
            let state = self.lock_state();
            if state.teardowns > 0 || state.generation != generation {
                return;
            }
            state.epoch
        };

        match event {
            TransportEvent::Opened => debug!(generation, "Transport connected"),
            TransportEvent::Closed { reason } => {
                warn!(generation, reason = reason.as_deref().unwrap_or("unknown"), "Transport disconnected");
                self.on_connection_lost(generation);
            }
            TransportEvent::Subscribed { channel } => self.on_channel_subscribed(&channel),
            TransportEvent::SubscribeFailed { channel, reason } => {
                let err = SyncError::SubscriptionFailed { channel, reason };
                warn!(error = %err, "Falling back to polling");
                self.on_connection_lost(generation);
            }
            TransportEvent::Change { channel, message } => {
                let accepted = self
                    .lock_state()
                    .registry
                    .get(&channel)
                    .is_some_and(|entry| entry.descriptor.filter.matches(&message));
                if accepted {
                    self.ingest(epoch, vec![message], DeliverySource::Push).await;
                } else {
                    debug!(channel = %channel, "Dropping change for unregistered channel");
                }
            }
        }
    }

    fn on_channel_subscribed(&self, channel: &str) {
        let mut state = self.lock_state();
        if state.registry.get(channel).is_none() {
            return;
        }
        if state.reconnector.on_subscribed() {
            let reports_loss = state
                .connection
                .as_ref()
                .map_or(true, |live| live.capabilities.supports_connection_events);
            if reports_loss {
                self.polling.stop_polling();
                info!(channel = %channel, "Push delivery confirmed");
            } else {
                // A silent disconnect would go unnoticed; polling stays as the safety net.
                self.start_polling("transport does not report disconnects");
                info!(channel = %channel, "Push delivery confirmed, polling kept");
            }
        }
        self.publish_status(&state);
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock_state();
        if state.teardowns > 0 || state.generation != generation {
            return;
        }

        let decision = state.reconnector.on_connection_lost();
        if decision == ReconnectDecision::Ignore {
            return;
        }

        let stale = state.connection.take();
        let detached = state.registry.detach_all();
        if let Some(task) = state.event_task.take() {
            task.abort();
        }
        tokio::spawn(teardown(stale, detached));

        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                self.start_polling("connection lost");
                let epoch = state.epoch;
                let weak = Arc::downgrade(self);
                state.reconnect_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.reconnect(epoch, attempt).await;
                    }
                }));
            }
            ReconnectDecision::Fallback => {
                self.start_polling("reconnect attempts exhausted");
            }
            ReconnectDecision::Ignore => {}
        }
        self.publish_status(&state);
    }

    async fn reconnect(self: &Arc<Self>, epoch: u64, attempt: u32) {
        let _connecting = self.connect_lock.lock().await;

        let generation = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) {
                return;
            }
            state.reconnector.on_retry_started();
            state.generation += 1;
            state.generation
        };
        info!(attempt, generation, "Reconnecting realtime transport");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let result = self.initializer.initialize(events_tx, generation).await;

        let ready = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) || state.generation != generation {
                Err(result.ok())
            } else {
                match result {
                    Ok(connection) if state.registry.is_empty() => {
                        // Nothing left to resubscribe: no confirmation would ever arrive.
                        info!(attempt, "No channels left after reconnect, going idle");
                        state.reconnector.reset();
                        self.polling.stop_polling();
                        self.publish_status(&state);
                        Err(Some(connection))
                    }
                    Ok(connection) => {
                        state.event_task = Some(self.spawn_event_loop(generation, events_rx));
                        state.connection = Some(connection.clone());
                        Ok((connection, state.registry.descriptors()))
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "Re-initialization failed, polling for the rest of the session");
                        state.reconnector.on_init_failed();
                        self.start_polling("re-initialization failed");
                        self.publish_status(&state);
                        return;
                    }
                }
            }
        };
        drop(_connecting);

        let (connection, descriptors) = match ready {
            Ok(ready) => ready,
            Err(abandoned) => {
                if let Some(connection) = abandoned {
                    connection.client.disconnect().await;
                }
                return;
            }
        };

        for descriptor in descriptors {
            let handle = {
                let state = self.lock_state();
                match state.registry.get(&descriptor.channel_name) {
                    Some(entry) => entry.handle.clone(),
                    None => continue,
                }
            };
            // `None` here can also mean the descriptor was dropped while its
            // open was in flight; only a lost connection ends the loop.
            self.open_channel(epoch, &connection, descriptor, handle).await;
            let still_connected = {
                let state = self.lock_state();
                state.is_live(epoch)
                    && state
                        .connection
                        .as_ref()
                        .is_some_and(|current| current.generation == generation)
            };
            if !still_connected {
                break;
            }
        }
    }

    // ---------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------

    async fn poll_once(self: &Arc<Self>) -> SyncResult<()> {
        let (epoch, conversations) = {
            let state = self.lock_state();
            if state.teardowns > 0 {
                return Ok(());
            }
            (state.epoch, state.registry.conversations())
        };

        let mut failure = None;
        for conversation in conversations {
            match self.collaborators.fetcher.fetch_messages(&conversation).await {
                Ok(messages) => {
                    debug!(conversation = %conversation, count = messages.len(), "Poll fetched");
                    self.ingest(epoch, messages, DeliverySource::Poll).await;
                }
                Err(err) => {
                    debug!(conversation = %conversation, error = %err, "Poll fetch failed");
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Merge arrivals into the transcripts and run the resulting effects.
    async fn ingest(&self, epoch: u64, messages: Vec<Message>, source: DeliverySource) {
        if messages.is_empty() {
            return;
        }
        // Host focus is queried before taking the state lock.
        let focused: HashSet<String> = messages
            .iter()
            .map(|message| message.sender_id.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|sender| self.collaborators.focus.is_conversation_focused(sender))
            .map(str::to_string)
            .collect();

        let outcome = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) {
                return;
            }
            let local_user = state.session.local_user_id().to_string();
            let mut outcome = Outcome::default();

            for message in messages {
                let conversation = message.conversation_key();
                if !conversation.involves(&local_user) {
                    debug!(conversation = %conversation, "Ignoring message for another user");
                    continue;
                }
                let inbound_unread = message.is_inbound_for(&local_user) && !message.is_read;
                let sender = message.sender_id.clone();
                let change = if source == DeliverySource::History {
                    state.reconciler.restore(&conversation, message)
                } else {
                    state.reconciler.apply(&conversation, message)
                };
                let Some(change) = change else {
                    continue;
                };

                let counts_as_unread = matches!(change, TranscriptChange::Inserted { .. })
                    && source != DeliverySource::History
                    && inbound_unread
                    && !state.session.is_focused(&sender)
                    && !focused.contains(&sender);
                if counts_as_unread {
                    let count = state.reconciler.increment_unread(&sender);
                    outcome.unread.push((sender, count));
                }
                collect_effects(&state, &conversation, change, source, &mut outcome);
            }
            outcome
        };

        self.deliver(epoch, outcome).await;
    }

    /// Run callbacks and sinks, then persist.
    async fn deliver(&self, epoch: u64, outcome: Outcome) {
        let Outcome {
            events,
            unread,
            persist,
        } = outcome;

        {
            let _dispatching = self.dispatch_lock.lock().unwrap_or_else(|p| p.into_inner());
            if !self.lock_state().is_live(epoch) {
                return;
            }
            for (counterpart, count) in &unread {
                self.collaborators
                    .unread
                    .on_unread_count_changed(counterpart, *count);
            }
            for (callback, event) in &events {
                callback(event);
            }
        }

        for (conversation, message, replaces) in persist {
            if let Err(err) = self
                .collaborators
                .history
                .persist_authoritative(&conversation, &message, replaces)
                .await
            {
                warn!(conversation = %conversation, error = %err, "Failed to persist history");
            }
        }
    }

    // ---------------------------------------------------------------
    // Composite operations
    // ---------------------------------------------------------------

    async fn open_conversation(
        self: &Arc<Self>,
        descriptor: SubscriptionDescriptor,
    ) -> Option<ChannelHandle> {
        let conversation = descriptor.conversation.clone();
        let (epoch, local_user, previous, reset) = {
            let mut state = self.lock_state();
            if state.teardowns > 0 {
                return None;
            }
            let local_user = state.session.local_user_id().to_string();
            let Some(counterpart) = conversation.counterpart_of(&local_user).map(str::to_string)
            else {
                warn!(conversation = %conversation, "Refusing to open a conversation without the local user");
                return None;
            };
            let previous = state
                .session
                .focus(conversation.clone(), &descriptor.channel_name);
            let reset = state
                .reconciler
                .reset_unread(&counterpart)
                .then(|| (counterpart, 0));
            (state.epoch, local_user, previous, reset)
        };
        info!(conversation = %conversation, "Opening conversation");

        if let Some(previous) = previous {
            self.unsubscribe(&previous).await;
        }
        if let Some(reset) = reset {
            let outcome = Outcome {
                unread: vec![reset],
                ..Outcome::default()
            };
            self.deliver(epoch, outcome).await;
        }

        let handle = self.subscribe(descriptor).await;

        match self.collaborators.history.load(&conversation).await {
            Ok(messages) => {
                debug!(conversation = %conversation, count = messages.len(), "Hydrating history");
                self.ingest(epoch, messages, DeliverySource::History).await;
            }
            Err(err) => warn!(conversation = %conversation, error = %err, "Failed to load history"),
        }

        let outcome = {
            let mut state = self.lock_state();
            if !state.is_live(epoch) {
                return None;
            }
            let changes = state
                .reconciler
                .transcript_mut(&conversation)
                .mark_read_by(&local_user);
            let mut outcome = Outcome::default();
            for change in changes {
                collect_effects(&state, &conversation, change, DeliverySource::Local, &mut outcome);
            }
            outcome
        };
        self.deliver(epoch, outcome).await;

        if let Err(err) = self
            .collaborators
            .receipts
            .mark_conversation_read(&conversation, &local_user)
            .await
        {
            warn!(conversation = %conversation, error = %err, "Failed to mark conversation read");
        }

        handle
    }

    async fn send_message(
        &self,
        conversation: &ConversationKey,
        content: String,
    ) -> SyncResult<SendReceipt> {
        let (epoch, local_id, message, outcome) = {
            let mut state = self.lock_state();
            if state.teardowns > 0 {
                return Err(SyncError::Closed);
            }
            let local_user = state.session.local_user_id().to_string();
            let counterpart = conversation
                .counterpart_of(&local_user)
                .ok_or_else(|| SyncError::NotParticipant(conversation.to_string()))?
                .to_string();
            let message = Message::optimistic(local_user, counterpart, content, Utc::now());
            let change = state.reconciler.insert_optimistic(conversation, message.clone());
            let mut outcome = Outcome::default();
            collect_effects(&state, conversation, change, DeliverySource::Local, &mut outcome);
            (state.epoch, change.local_id(), message, outcome)
        };
        self.deliver(epoch, outcome).await;

        if let Err(err) = self
            .collaborators
            .history
            .persist_optimistic(conversation, local_id, &message)
            .await
        {
            warn!(conversation = %conversation, error = %err, "Failed to persist optimistic message");
        }

        match self.collaborators.outbound.insert_message(&message).await {
            Ok(stored) if stored.id.is_some() => {
                self.ingest(epoch, vec![stored.clone()], DeliverySource::Local).await;
                let delivery = self
                    .lock_state()
                    .reconciler
                    .entry(conversation, local_id)
                    .map(|entry| entry.delivery)
                    .unwrap_or(DeliveryState::Delivered);
                Ok(SendReceipt {
                    local_id,
                    delivery,
                    stored: Some(stored),
                })
            }
            Ok(_) => {
                warn!(local_id = %local_id, "Outbound store acknowledged without an id");
                Ok(SendReceipt {
                    local_id,
                    delivery: DeliveryState::Pending,
                    stored: None,
                })
            }
            Err(err) => {
                warn!(local_id = %local_id, error = %err, "Send failed");
                let outcome = {
                    let mut state = self.lock_state();
                    if !state.is_live(epoch) {
                        return Err(SyncError::Closed);
                    }
                    let mut outcome = Outcome::default();
                    if let Some(change) = state.reconciler.mark_failed(conversation, local_id) {
                        collect_effects(&state, conversation, change, DeliverySource::Local, &mut outcome);
                    }
                    outcome
                };
                self.deliver(epoch, outcome).await;
                let delivery = self
                    .lock_state()
                    .reconciler
                    .entry(conversation, local_id)
                    .map(|entry| entry.delivery)
                    .unwrap_or(DeliveryState::Failed);
                Ok(SendReceipt {
                    local_id,
                    delivery,
                    stored: None,
                })
            }
        }
    }
}

/// Queue callbacks and history writes for one transcript change.
fn collect_effects(
    state: &State,
    conversation: &ConversationKey,
    change: TranscriptChange,
    source: DeliverySource,
    outcome: &mut Outcome,
) {
    let Some(entry) = state.reconciler.entry(conversation, change.local_id()) else {
        return;
    };

    if source != DeliverySource::History {
        match change {
            TranscriptChange::Inserted { .. } | TranscriptChange::ReadStateChanged { .. } => {
                if entry.message.is_authoritative() {
                    outcome
                        .persist
                        .push((conversation.clone(), entry.message.clone(), None));
                }
            }
            TranscriptChange::Confirmed { local_id } => {
                outcome
                    .persist
                    .push((conversation.clone(), entry.message.clone(), Some(local_id)));
            }
            TranscriptChange::Pending { .. } | TranscriptChange::Failed { .. } => {}
        }
    }

    for descriptor in state.registry.descriptors() {
        if descriptor.accepts(conversation, &entry.message) {
            outcome.events.push((
                Arc::clone(&descriptor.on_message),
                MessageEvent {
                    conversation: conversation.clone(),
                    local_id: entry.local_id,
                    message: entry.message.clone(),
                    delivery: entry.delivery,
                    change,
                    source,
                },
            ));
        }
    }
}

async fn teardown(
    connection: Option<ConnectionHandle>,
    channels: Vec<Arc<dyn crate::collaborators::TransportChannel>>,
) {
    for channel in channels {
        if let Err(err) = channel.unsubscribe().await {
            debug!(channel = %channel.name(), error = %err, "Channel teardown failed");
        }
    }
    if let Some(connection) = connection {
        connection.client.disconnect().await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.abort_tasks();
    }
}
