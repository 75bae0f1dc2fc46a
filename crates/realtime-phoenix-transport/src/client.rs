//! WebSocket client for Supabase Realtime.
//!
//! One socket per [`PhoenixClient`]; every logical channel is a Phoenix
//! topic joined over it. Reconnection is not handled here: a dropped socket
//! is reported as [`TransportEvent::Closed`] and the subscription manager
//! decides whether to build a new client.

use crate::messages::{
    topic_for, PhoenixMessage, EVENT_CLOSE, EVENT_ERROR, EVENT_POSTGRES_CHANGES, EVENT_REPLY,
    EVENT_SYSTEM, PHOENIX_TOPIC,
};
use crate::{PhoenixError, PhoenixResult};
use async_trait::async_trait;
use chat_config_and_utils::Config;
use chat_realtime_sync::{
    ChannelSpec, SyncError, SyncResult, TransportCapabilities, TransportChannel, TransportClient,
    TransportConnector, TransportEvent, TransportEventSender,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

/// Realtime client configuration.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Supabase project URL or a full realtime websocket URL.
    pub endpoint: String,
    /// Project anon key, sent as `apikey`.
    pub api_key: String,
    /// User JWT for row-level security; the anon key is used when absent.
    pub access_token: Option<String>,
    pub heartbeat_interval: Duration,
    /// How long a join may go unanswered before it counts as failed.
    pub join_timeout: Duration,
}

impl Default for PhoenixConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl PhoenixConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.supabase_url.clone(),
            api_key: config.supabase_anon_key.clone(),
            heartbeat_interval: Duration::from_secs(config.realtime.heartbeat_interval_secs),
            ..Self::default()
        }
    }

    /// `ws(s)://<host>/realtime/v1/websocket?apikey=..&vsn=1.0.0`
    pub fn socket_url(&self) -> PhoenixResult<Url> {
        if self.endpoint.trim().is_empty() {
            return Err(PhoenixError::Config("realtime endpoint URL".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(PhoenixError::Config("realtime API key".into()));
        }

        let mut url = Url::parse(self.endpoint.trim())?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(PhoenixError::Config(format!(
                    "unsupported realtime scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| PhoenixError::Config(format!("cannot use scheme {scheme}")))?;
        if !url.path().ends_with("/websocket") {
            let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    fn token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

/// [`TransportConnector`] that opens a fresh Phoenix socket per call.
#[derive(Debug, Clone)]
pub struct PhoenixConnector {
    config: PhoenixConfig,
}

impl PhoenixConnector {
    pub fn new(config: PhoenixConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for PhoenixConnector {
    async fn connect(&self, events: TransportEventSender) -> SyncResult<Arc<dyn TransportClient>> {
        let client = PhoenixClient::connect(self.config.clone(), events).await?;
        Ok(Arc::new(client))
    }
}

/// State shared by the socket tasks and the channel handles.
struct Shared {
    events: TransportEventSender,
    outbound: mpsc::Sender<WsMessage>,
    next_ref: AtomicU64,
    /// Join ref -> channel name, until the server replies.
    pending_joins: Mutex<HashMap<String, String>>,
    /// Topic -> channel name.
    topics: Mutex<HashMap<String, String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Shared {
    fn make_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn emit(&self, event: TransportEvent) {
        if !self.closing.load(Ordering::Acquire) {
            let _ = self.events.send(event);
        }
    }

    async fn send(&self, message: PhoenixMessage) -> PhoenixResult<()> {
        let json = message.to_json()?;
        self.outbound
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| PhoenixError::Send(e.to_string()))
    }

    fn channel_for_topic(&self, topic: &str) -> Option<String> {
        self.topics.lock().get(topic).cloned()
    }

    fn handle_frame(&self, text: &str) {
        let message = match PhoenixMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse realtime message");
                return;
            }
        };

        match message.event.as_str() {
            EVENT_REPLY if message.topic == PHOENIX_TOPIC => {
                debug!("Heartbeat acknowledged");
            }
            EVENT_REPLY => {
                let joined = message
                    .msg_ref
                    .as_ref()
                    .and_then(|join_ref| self.pending_joins.lock().remove(join_ref));
                let Some(channel) = joined else {
                    debug!(topic = %message.topic, "Reply to a non-join request");
                    return;
                };
                if message.status() == Some("ok") {
                    info!(channel = %channel, "Joined realtime channel");
                    self.emit(TransportEvent::Subscribed { channel });
                } else {
                    let reason = message.error_reason();
                    warn!(channel = %channel, reason = %reason, "Realtime join rejected");
                    self.emit(TransportEvent::SubscribeFailed { channel, reason });
                }
            }
            EVENT_POSTGRES_CHANGES => {
                let Some(channel) = self.channel_for_topic(&message.topic) else {
                    debug!(topic = %message.topic, "Change for a topic we left");
                    return;
                };
                match message.change_record() {
                    Some(record) => self.emit(TransportEvent::Change {
                        channel,
                        message: record,
                    }),
                    None => warn!(channel = %channel, "Change without a message record"),
                }
            }
            EVENT_SYSTEM if message.status() == Some("error") => {
                if let Some(channel) = self.channel_for_topic(&message.topic) {
                    let reason = message.error_reason();
                    warn!(channel = %channel, reason = %reason, "Realtime system error");
                    self.emit(TransportEvent::SubscribeFailed { channel, reason });
                }
            }
            EVENT_ERROR => {
                if let Some(channel) = self.channel_for_topic(&message.topic) {
                    self.pending_joins.lock().retain(|_, name| *name != channel);
                    self.emit(TransportEvent::SubscribeFailed {
                        channel,
                        reason: "channel error".into(),
                    });
                }
            }
            EVENT_CLOSE => debug!(topic = %message.topic, "Channel closed"),
            other => debug!(topic = %message.topic, event = other, "Ignoring realtime event"),
        }
    }
}

/// A connected realtime socket.
pub struct PhoenixClient {
    shared: Arc<Shared>,
    config: PhoenixConfig,
    writer: JoinHandle<()>,
}

impl PhoenixClient {
    /// Open the socket and start the reader, writer and heartbeat tasks.
    pub async fn connect(config: PhoenixConfig, events: TransportEventSender) -> PhoenixResult<Self> {
        let url = config.socket_url()?;
        info!(host = url.host_str().unwrap_or_default(), "Connecting to realtime");

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<WsMessage>(100);

        let shared = Arc::new(Shared {
            events,
            outbound: msg_tx,
            next_ref: AtomicU64::new(0),
            pending_joins: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close(_));
                if write.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        let heartbeat = {
            let shared = Arc::downgrade(&shared);
            let period = config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                loop {
                    ticks.tick().await;
                    let Some(shared) = shared.upgrade() else { break };
                    let heartbeat = PhoenixMessage::heartbeat(&shared.make_ref());
                    if shared.send(heartbeat).await.is_err() {
                        break;
                    }
                }
            })
        };

        let reader = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut reason = None;
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => shared.handle_frame(&text),
                        Ok(WsMessage::Ping(data)) => {
                            let _ = shared.outbound.send(WsMessage::Pong(data)).await;
                        }
                        Ok(WsMessage::Close(frame)) => {
                            reason = frame.map(|f| f.reason.as_str().to_string());
                            info!("Realtime connection closed");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Realtime socket error");
                            reason = Some(e.to_string());
                            break;
                        }
                    }
                }
                shared.emit(TransportEvent::Closed { reason });
            })
        };

        shared.tasks.lock().extend([heartbeat, reader]);
        shared.emit(TransportEvent::Opened);

        Ok(Self {
            shared,
            config,
            writer,
        })
    }

    fn spawn_join_timeout(&self, join_ref: String, channel: String) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let timeout = self.config.join_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = shared.upgrade() else { return };
            if shared.pending_joins.lock().remove(&join_ref).is_some() {
                warn!(channel = %channel, "Realtime join timed out");
                shared.emit(TransportEvent::SubscribeFailed {
                    channel,
                    reason: "join timed out".into(),
                });
            }
        });
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

#[async_trait]
impl TransportClient for PhoenixClient {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_connection_events: true,
        }
    }

    async fn open_channel(&self, spec: &ChannelSpec) -> SyncResult<Arc<dyn TransportChannel>> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(PhoenixError::NotConnected.into());
        }
        let join_ref = self.shared.make_ref();
        let topic = topic_for(&spec.name);

        self.shared
            .topics
            .lock()
            .insert(topic.clone(), spec.name.clone());
        self.shared
            .pending_joins
            .lock()
            .insert(join_ref.clone(), spec.name.clone());

        let join = PhoenixMessage::join(spec, &join_ref, self.config.token());
        if let Err(err) = self.shared.send(join).await {
            self.shared.pending_joins.lock().remove(&join_ref);
            self.shared.topics.lock().remove(&topic);
            return Err(SyncError::SubscriptionFailed {
                channel: spec.name.clone(),
                reason: err.to_string(),
            });
        }
        debug!(channel = %spec.name, join_ref = %join_ref, "Join sent");
        self.spawn_join_timeout(join_ref, spec.name.clone());

        Ok(Arc::new(PhoenixChannel {
            name: spec.name.clone(),
            topic,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.shared.outbound.try_send(WsMessage::Close(None));
        info!("Disconnected from realtime");
    }
}

impl Drop for PhoenixClient {
    fn drop(&mut self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        self.writer.abort();
    }
}

/// One joined topic.
struct PhoenixChannel {
    name: String,
    topic: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportChannel for PhoenixChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn unsubscribe(&self) -> SyncResult<()> {
        self.shared.topics.lock().remove(&self.topic);
        self.shared
            .pending_joins
            .lock()
            .retain(|_, name| *name != self.name);
        if self.shared.closing.load(Ordering::Acquire) {
            return Ok(());
        }
        let leave = PhoenixMessage::leave(&self.topic, &self.shared.make_ref());
        self.shared.send(leave).await?;
        debug!(channel = %self.name, "Left realtime channel");
        Ok(())
    }
}
