//! Phoenix channel protocol messages (JSON serializer, vsn 1.0.0).

use chat_realtime_sync::{ChannelSpec, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_SYSTEM: &str = "system";

/// Topic for a logical channel name.
pub fn topic_for(channel: &str) -> String {
    format!("realtime:{channel}")
}

/// A frame sent to or received from the realtime server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// `phx_join` subscribing to INSERTs on the channel's table.
    pub fn join(spec: &ChannelSpec, join_ref: &str, access_token: &str) -> Self {
        let mut change = json!({
            "event": "INSERT",
            "schema": "public",
            "table": spec.table,
        });
        if let Some(filter) = spec.filter.server_filter() {
            change["filter"] = json!(filter);
        }
        let payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        });
        let mut message = Self::new(topic_for(&spec.name), EVENT_JOIN, payload).with_ref(join_ref);
        message.join_ref = Some(join_ref.to_string());
        message
    }

    pub fn leave(topic: &str, msg_ref: &str) -> Self {
        Self::new(topic, EVENT_LEAVE, json!({})).with_ref(msg_ref)
    }

    pub fn heartbeat(msg_ref: &str) -> Self {
        Self::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({})).with_ref(msg_ref)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// `status` of a `phx_reply` or `system` payload.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// Human-readable reason carried by an error reply.
    pub fn error_reason(&self) -> String {
        self.payload
            .pointer("/response/reason")
            .or_else(|| self.payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("join rejected")
            .to_string()
    }

    /// Row carried by a `postgres_changes` event, if it is a message row.
    pub fn change_record(&self) -> Option<Message> {
        if self.event != EVENT_POSTGRES_CHANGES {
            return None;
        }
        let record = self
            .payload
            .pointer("/data/record")
            .or_else(|| self.payload.get("record"))?;
        serde_json::from_value(record.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_realtime_sync::{ChangeFilter, ConversationKey, MessageId};

    fn spec(filter: ChangeFilter) -> ChannelSpec {
        ChannelSpec {
            name: "admin-messages-u1".into(),
            table: "messages".into(),
            filter,
        }
    }

    #[test]
    fn test_join_carries_postgres_changes_filter() {
        let join = PhoenixMessage::join(&spec(ChangeFilter::Receiver("u1".into())), "1", "anon");

        assert_eq!(join.topic, "realtime:admin-messages-u1");
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.msg_ref.as_deref(), Some("1"));
        let change = &join.payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "receiver_id=eq.u1");
        assert_eq!(join.payload["access_token"], "anon");
    }

    #[test]
    fn test_join_without_server_filter() {
        let filter = ChangeFilter::Conversation(ConversationKey::new("u1", "admin-1"));
        let join = PhoenixMessage::join(&spec(filter), "2", "anon");
        assert!(join.payload["config"]["postgres_changes"][0]
            .get("filter")
            .is_none());
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let json = PhoenixMessage::heartbeat("7").to_json().unwrap();
        assert_eq!(
            json,
            r#"{"topic":"phoenix","event":"heartbeat","payload":{},"ref":"7"}"#
        );
    }

    #[test]
    fn test_parse_error_reply() {
        let reply = PhoenixMessage::from_json(
            r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"3"}"#,
        )
        .unwrap();
        assert_eq!(reply.status(), Some("error"));
        assert_eq!(reply.error_reason(), "unauthorized");
    }

    #[test]
    fn test_change_record_parses_message_row() {
        let change = PhoenixMessage::from_json(
            r#"{"topic":"realtime:x","event":"postgres_changes","payload":{"ids":[1],"data":{"type":"INSERT","schema":"public","table":"messages","record":{"id":42,"sender_id":"admin-1","receiver_id":"u1","content":"hi","chat_type":"admin","is_read":false,"created_at":"2024-05-01T10:00:00Z"}}},"ref":null}"#,
        )
        .unwrap();

        let message = change.change_record().unwrap();
        assert_eq!(message.id, Some(MessageId::from(42)));
        assert_eq!(message.content, "hi");
    }

    #[test]
    fn test_change_record_ignores_other_events() {
        let reply = PhoenixMessage::new("realtime:x", EVENT_REPLY, json!({"status": "ok"}));
        assert!(reply.change_record().is_none());
    }
}
