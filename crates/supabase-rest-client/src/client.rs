//! Supabase REST API client for the `messages` table.

use crate::error::{RestClientError, RestClientResult};
use async_trait::async_trait;
use chat_config_and_utils::Config;
use chat_realtime_sync::{
    ConversationKey, Message, MessageFetcher, OutboundMessageStore, ReadReceiptSink, SyncResult,
    MESSAGES_TABLE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

/// Supabase REST API client for chat messages.
#[derive(Clone)]
pub struct SupabaseClient {
    http_client: reqwest::Client,
    api_url: String,
    anon_key: String,
    /// User session token; the anon key is used when absent.
    access_token: Option<String>,
}

impl SupabaseClient {
    /// Create a new Supabase client.
    ///
    /// # Arguments
    /// * `api_url` - The Supabase project API URL (e.g., `https://xyz.supabase.co`)
    /// * `anon_key` - The Supabase anonymous API key
    pub fn new(api_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    /// Build a client from the loaded configuration.
    pub fn from_config(config: &Config) -> RestClientResult<Self> {
        if !config.has_supabase_credentials() {
            return Err(RestClientError::Config(
                "Supabase URL or anon key is not set".into(),
            ));
        }
        Ok(Self::new(&config.supabase_url, &config.supabase_anon_key))
    }

    /// Authenticate requests as a signed-in user.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Build the REST API URL for a table.
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    fn bearer(&self) -> String {
        format!(
            "Bearer {}",
            self.access_token.as_deref().unwrap_or(&self.anon_key)
        )
    }

    /// All messages exchanged between the two participants, oldest first.
    pub async fn fetch_conversation(
        &self,
        conversation: &ConversationKey,
    ) -> RestClientResult<Vec<Message>> {
        let url = self.rest_url(MESSAGES_TABLE);
        let filter = conversation_filter(conversation);

        debug!(conversation = %conversation, "Fetching conversation");

        let messages: Vec<Message> = self
            .get(
                &url,
                &[
                    ("select", "*"),
                    ("or", filter.as_str()),
                    ("order", "created_at.asc"),
                ],
            )
            .await?;

        debug!(conversation = %conversation, count = messages.len(), "Conversation fetched");
        Ok(messages)
    }

    /// Mark every unread message addressed to `reader_id` in the
    /// conversation as read.
    pub async fn mark_read(
        &self,
        conversation: &ConversationKey,
        reader_id: &str,
    ) -> RestClientResult<()> {
        let Some(counterpart) = conversation.counterpart_of(reader_id) else {
            return Ok(());
        };
        let url = self.rest_url(MESSAGES_TABLE);
        let sender = format!("eq.{counterpart}");
        let receiver = format!("eq.{reader_id}");

        debug!(conversation = %conversation, reader_id, "Marking conversation read");

        self.patch(
            &url,
            &[
                ("sender_id", sender.as_str()),
                ("receiver_id", receiver.as_str()),
                ("is_read", "eq.false"),
            ],
            &serde_json::json!({ "is_read": true }),
        )
        .await
    }

    /// Insert a message and return the stored row.
    pub async fn insert(&self, message: &Message) -> RestClientResult<Message> {
        let url = self.rest_url(MESSAGES_TABLE);

        debug!(receiver_id = %message.receiver_id, "Inserting message");

        let rows: Vec<Message> = self.post_returning(&url, message).await?;
        let stored = rows.into_iter().next().ok_or(RestClientError::EmptyResponse)?;

        debug!(id = ?stored.id, "Message stored");
        Ok(stored)
    }

    // =========================================================================
    // HTTP helpers
    // =========================================================================

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> RestClientResult<T> {
        let response = self
            .http_client
            .get(url)
            .query(query)
            .header("apikey", &self.anon_key)
            .header("Authorization", self.bearer())
            .header("Accept", "application/json")
            .send()
            .await?;

        let response = self.check_response(response).await?;
        Ok(response.json().await?)
    }

    /// Perform a PATCH update.
    async fn patch<T: Serialize>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &T,
    ) -> RestClientResult<()> {
        let response = self
            .http_client
            .patch(url)
            .query(query)
            .header("apikey", &self.anon_key)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        self.check_response(response).await?;
        Ok(())
    }

    /// POST that asks PostgREST to echo the inserted rows.
    async fn post_returning<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> RestClientResult<T> {
        let response = self
            .http_client
            .post(url)
            .header("apikey", &self.anon_key)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;

        let response = self.check_response(response).await?;
        Ok(response.json().await?)
    }

    /// Check HTTP response for errors.
    async fn check_response(&self, response: reqwest::Response) -> RestClientResult<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("Supabase request failed: {} - {}", status, body);
            return Err(RestClientError::Supabase {
                status,
                message: body,
            });
        }
        Ok(response)
    }
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("api_url", &self.api_url)
            .field("authenticated", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}

/// PostgREST `or=` filter matching both directions of a conversation.
fn conversation_filter(conversation: &ConversationKey) -> String {
    let (a, b) = conversation.participants();
    let (a, b) = (quote(a), quote(b));
    format!(
        "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))"
    )
}

/// Double-quote a filter value so reserved characters stay literal.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl MessageFetcher for SupabaseClient {
    async fn fetch_messages(&self, conversation: &ConversationKey) -> SyncResult<Vec<Message>> {
        Ok(self.fetch_conversation(conversation).await?)
    }
}

#[async_trait]
impl ReadReceiptSink for SupabaseClient {
    async fn mark_conversation_read(
        &self,
        conversation: &ConversationKey,
        reader_id: &str,
    ) -> SyncResult<()> {
        Ok(self.mark_read(conversation, reader_id).await?)
    }
}

#[async_trait]
impl OutboundMessageStore for SupabaseClient {
    async fn insert_message(&self, message: &Message) -> SyncResult<Message> {
        Ok(self.insert(message).await?)
    }
}
