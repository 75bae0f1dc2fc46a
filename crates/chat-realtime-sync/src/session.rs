//! Per-session context owned by the subscription manager.

use crate::types::ConversationKey;

/// The local user and which conversation currently has focus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    local_user_id: String,
    focused: Option<ConversationKey>,
    /// Channel backing the focused conversation; replaced on partner switch.
    active_channel: Option<String>,
}

impl SessionContext {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            focused: None,
            active_channel: None,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn focused(&self) -> Option<&ConversationKey> {
        self.focused.as_ref()
    }

    /// The other participant of the focused conversation.
    pub fn focused_counterpart(&self) -> Option<&str> {
        self.focused
            .as_ref()
            .and_then(|key| key.counterpart_of(&self.local_user_id))
    }

    pub fn is_focused(&self, counterpart_id: &str) -> bool {
        self.focused_counterpart() == Some(counterpart_id)
    }

    /// Focus a conversation, returning the channel that backed the previous
    /// one when it differs from `channel`.
    pub fn focus(&mut self, conversation: ConversationKey, channel: &str) -> Option<String> {
        self.focused = Some(conversation);
        match self.active_channel.replace(channel.to_string()) {
            Some(previous) if previous != channel => Some(previous),
            _ => None,
        }
    }

    pub fn blur(&mut self) {
        self.focused = None;
    }

    pub fn clear(&mut self) {
        self.focused = None;
        self.active_channel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_tracks_counterpart() {
        let mut session = SessionContext::new("u1");
        assert!(!session.is_focused("admin-1"));

        session.focus(ConversationKey::new("admin-1", "u1"), "admin-messages-u1");
        assert!(session.is_focused("admin-1"));
        assert_eq!(session.focused_counterpart(), Some("admin-1"));

        session.blur();
        assert!(!session.is_focused("admin-1"));
    }

    #[test]
    fn test_partner_switch_returns_previous_channel() {
        let mut session = SessionContext::new("u1");

        assert_eq!(session.focus(ConversationKey::new("u1", "admin-1"), "chat-admin-1"), None);
        assert_eq!(session.focus(ConversationKey::new("u1", "admin-1"), "chat-admin-1"), None);
        assert_eq!(
            session.focus(ConversationKey::new("u1", "admin-2"), "chat-admin-2"),
            Some("chat-admin-1".to_string())
        );
    }
}
