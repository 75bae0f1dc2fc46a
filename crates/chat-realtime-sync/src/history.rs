//! Local chat history stores.

use crate::collaborators::HistoryStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{ConversationKey, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// One persisted history line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HistoryRecord {
    /// Set while the message is still optimistic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_id: Option<Uuid>,
    #[serde(flatten)]
    message: Message,
}

fn upsert_optimistic(records: &mut Vec<HistoryRecord>, local_id: Uuid, message: &Message) {
    if records.iter().any(|record| record.local_id == Some(local_id)) {
        return;
    }
    let mut message = message.clone();
    message.id = None;
    insert_sorted(
        records,
        HistoryRecord {
            local_id: Some(local_id),
            message,
        },
    );
}

fn upsert_authoritative(records: &mut Vec<HistoryRecord>, message: &Message, replaces: Option<Uuid>) {
    if let Some(local_id) = replaces {
        records.retain(|record| record.local_id != Some(local_id));
    }
    if let Some(existing) = records
        .iter_mut()
        .find(|record| record.message.id.is_some() && record.message.id == message.id)
    {
        existing.message.is_read = message.is_read;
        return;
    }
    insert_sorted(
        records,
        HistoryRecord {
            local_id: None,
            message: message.clone(),
        },
    );
}

fn insert_sorted(records: &mut Vec<HistoryRecord>, record: HistoryRecord) {
    let at = records.partition_point(|r| r.message.created_at <= record.message.created_at);
    records.insert(at, record);
}

/// JSON history file per conversation under a base directory.
///
/// Writes are serialized through one async lock and replace the file
/// atomically (write to a temp file, then rename).
#[derive(Debug)]
pub struct FileHistoryStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, conversation: &ConversationKey) -> PathBuf {
        self.dir.join(format!("{}.json", conversation.storage_key()))
    }

    async fn read_records(&self, path: &Path) -> SyncResult<Vec<HistoryRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_records(&self, path: &Path, records: &[HistoryRecord]) -> SyncResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn update<F>(&self, conversation: &ConversationKey, apply: F) -> SyncResult<()>
    where
        F: FnOnce(&mut Vec<HistoryRecord>),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.file_for(conversation);
        let mut records = match self.read_records(&path).await {
            Ok(records) => records,
            Err(SyncError::Json(err)) => {
                warn!(path = %path.display(), error = %err, "Discarding unreadable history");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        apply(&mut records);
        self.write_records(&path, &records).await?;
        debug!(conversation = %conversation, entries = records.len(), "History saved");
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn persist_optimistic(
        &self,
        conversation: &ConversationKey,
        local_id: Uuid,
        message: &Message,
    ) -> SyncResult<()> {
        self.update(conversation, |records| upsert_optimistic(records, local_id, message))
            .await
    }

    async fn persist_authoritative(
        &self,
        conversation: &ConversationKey,
        message: &Message,
        replaces: Option<Uuid>,
    ) -> SyncResult<()> {
        self.update(conversation, |records| {
            upsert_authoritative(records, message, replaces)
        })
        .await
    }

    async fn load(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>> {
        let records = self.read_records(&self.file_for(conversation)).await?;
        Ok(records.into_iter().map(|record| record.message).collect())
    }
}

/// History kept in memory for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    conversations: Mutex<HashMap<ConversationKey, Vec<HistoryRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation with already-stored messages.
    pub async fn seed(&self, conversation: &ConversationKey, messages: Vec<Message>) {
        let mut conversations = self.conversations.lock().await;
        let records = conversations.entry(conversation.clone()).or_default();
        for message in messages {
            upsert_authoritative(records, &message, None);
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn persist_optimistic(
        &self,
        conversation: &ConversationKey,
        local_id: Uuid,
        message: &Message,
    ) -> SyncResult<()> {
        let mut conversations = self.conversations.lock().await;
        upsert_optimistic(
            conversations.entry(conversation.clone()).or_default(),
            local_id,
            message,
        );
        Ok(())
    }

    async fn persist_authoritative(
        &self,
        conversation: &ConversationKey,
        message: &Message,
        replaces: Option<Uuid>,
    ) -> SyncResult<()> {
        let mut conversations = self.conversations.lock().await;
        upsert_authoritative(
            conversations.entry(conversation.clone()).or_default(),
            message,
            replaces,
        );
        Ok(())
    }

    async fn load(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>> {
        let conversations = self.conversations.lock().await;
        Ok(conversations
            .get(conversation)
            .map(|records| records.iter().map(|record| record.message.clone()).collect())
            .unwrap_or_default())
    }
}
