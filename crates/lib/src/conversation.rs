//! Conversation log and the bounded context window sent with each message.
//!
//! The log always starts with a seed greeting (id [`SEED_MESSAGE_ID`]) which is never sent to
//! the backend nor persisted. Message ids are monotonic epoch milliseconds and each timestamp is
//! derived from its id, so timestamps are strictly increasing within a conversation.

use crate::config::ContextConfig;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const SEED_MESSAGE_ID: i64 = 0;

/// Never trim the window below this many messages, whatever the budget.
const MIN_WINDOW: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn is_seed(&self) -> bool {
        self.id == SEED_MESSAGE_ID
    }

    /// Length as counted against the context budget (characters, not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Fields that may change after a message is created.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub metadata: Option<serde_json::Value>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            metadata: None,
        }
    }
}

/// Summary of the last computed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub messages_in_context: usize,
    pub context_characters: usize,
    pub context_truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub messages: Vec<Message>,
    pub info: ContextInfo,
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    messages: Vec<Message>,
    context_info: ContextInfo,
    window_size: usize,
    max_length: usize,
    last_id: i64,
}

fn seed_message(text: &str) -> Message {
    Message {
        id: SEED_MESSAGE_ID,
        text: text.to_string(),
        sender: Sender::Bot,
        timestamp: Utc::now(),
        status: MessageStatus::Delivered,
        is_error: false,
        metadata: None,
    }
}

impl ConversationContext {
    pub fn new(greeting: &str, config: &ContextConfig) -> Self {
        Self {
            messages: vec![seed_message(greeting)],
            context_info: ContextInfo::default(),
            window_size: config.window_size,
            max_length: config.max_length,
            last_id: SEED_MESSAGE_ID,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn context_info(&self) -> ContextInfo {
        self.context_info
    }

    pub fn get(&self, id: i64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Messages other than the seed greeting.
    pub fn conversation(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.messages.iter().filter(|m| !m.is_seed())
    }

    /// Next id/timestamp pair: current epoch millis, bumped past the last issued id if needed.
    fn next_stamp(&mut self) -> (i64, DateTime<Utc>) {
        let id = Utc::now().timestamp_millis().max(self.last_id + 1);
        self.last_id = id;
        let ts = Utc
            .timestamp_millis_opt(id)
            .single()
            .unwrap_or_else(Utc::now);
        (id, ts)
    }

    /// Create and append a message; returns its id.
    pub fn push(
        &mut self,
        sender: Sender,
        text: impl Into<String>,
        status: MessageStatus,
        is_error: bool,
        metadata: Option<serde_json::Value>,
    ) -> i64 {
        let (id, timestamp) = self.next_stamp();
        self.messages.push(Message {
            id,
            text: text.into(),
            sender,
            timestamp,
            status,
            is_error,
            metadata,
        });
        id
    }

    /// Append an existing message (e.g. one restored from a session).
    pub fn append(&mut self, message: Message) {
        self.last_id = self.last_id.max(message.id);
        self.messages.push(message);
    }

    /// Update status and/or metadata of a message. Returns false if the id is unknown.
    pub fn patch(&mut self, id: i64, updates: MessagePatch) -> bool {
        let Some(m) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        if let Some(status) = updates.status {
            m.status = status;
        }
        if let Some(metadata) = updates.metadata {
            m.metadata = Some(metadata);
        }
        true
    }

    /// Drop every non-seed message newer than `timestamp`. Returns how many were removed.
    pub fn remove_after(&mut self, timestamp: DateTime<Utc>) -> usize {
        let before = self.messages.len();
        self.messages
            .retain(|m| m.is_seed() || m.timestamp <= timestamp);
        before - self.messages.len()
    }

    /// Back to a single seed greeting with empty context info.
    pub fn reset(&mut self, greeting: &str) {
        self.messages = vec![seed_message(greeting)];
        self.context_info = ContextInfo::default();
    }

    /// Replace everything after the seed with `messages` and adopt `info`.
    pub fn restore(&mut self, messages: Vec<Message>, info: ContextInfo) {
        self.messages.retain(|m| m.is_seed());
        for m in messages.into_iter().filter(|m| !m.is_seed()) {
            self.append(m);
        }
        self.context_info = info;
    }

    /// Most recent `window_size` messages, trimmed from the oldest end while over the character
    /// budget (never below two). Records the result as the current context info.
    pub fn window_for_send(&mut self) -> ContextWindow {
        let qualifying: Vec<&Message> = self.conversation().collect();
        let start = qualifying.len().saturating_sub(self.window_size);
        let mut window: Vec<Message> = qualifying[start..].iter().map(|m| (*m).clone()).collect();

        let mut total: usize = window.iter().map(Message::char_len).sum();
        let mut truncated = false;
        while total > self.max_length && window.len() > MIN_WINDOW {
            let dropped = window.remove(0);
            total -= dropped.char_len();
            truncated = true;
        }
        if truncated {
            log::debug!(
                "context: truncated window to {} messages ({} chars)",
                window.len(),
                total
            );
        }

        let info = ContextInfo {
            messages_in_context: window.len(),
            context_characters: total,
            context_truncated: truncated,
        };
        self.context_info = info;
        ContextWindow {
            messages: window,
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConversationContext {
        ConversationContext::new("hello there", &ContextConfig::default())
    }

    fn exchange(c: &mut ConversationContext, n: usize, len: usize) {
        for i in 0..n {
            let sender = if i % 2 == 0 { Sender::User } else { Sender::Bot };
            c.push(sender, "x".repeat(len), MessageStatus::Delivered, false, None);
        }
    }

    #[test]
    fn starts_with_seed_only() {
        let mut c = ctx();
        assert_eq!(c.messages().len(), 1);
        assert!(c.messages()[0].is_seed());
        let w = c.window_for_send();
        assert!(w.messages.is_empty());
        assert_eq!(w.info, ContextInfo::default());
    }

    #[test]
    fn ids_and_timestamps_strictly_increase() {
        let mut c = ctx();
        exchange(&mut c, 50, 1);
        let conv: Vec<&Message> = c.conversation().collect();
        for pair in conv.windows(2) {
            assert!(pair[1].id > pair[0].id);
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }

    #[test]
    fn single_message_window() {
        let mut c = ctx();
        c.push(Sender::User, "Hello", MessageStatus::Sending, false, None);
        let w = c.window_for_send();
        assert_eq!(w.info.messages_in_context, 1);
        assert_eq!(w.info.context_characters, 5);
        assert!(!w.info.context_truncated);
        assert_eq!(c.context_info(), w.info);
    }

    #[test]
    fn window_keeps_ten_most_recent() {
        let mut c = ctx();
        exchange(&mut c, 12, 3);
        let newest: Vec<i64> = c.conversation().map(|m| m.id).skip(2).collect();
        let w = c.window_for_send();
        assert_eq!(w.messages.len(), 10);
        assert_eq!(w.messages.iter().map(|m| m.id).collect::<Vec<_>>(), newest);
        assert!(!w.info.context_truncated);
    }

    #[test]
    fn over_budget_window_is_trimmed_from_the_oldest_end() {
        let mut c = ctx();
        exchange(&mut c, 10, 1_000);
        let w = c.window_for_send();
        assert!(w.info.context_truncated);
        assert_eq!(w.info.messages_in_context, 8);
        assert_eq!(w.info.context_characters, 8_000);
        let last_id = c.conversation().last().unwrap().id;
        assert_eq!(w.messages.last().unwrap().id, last_id);
    }

    #[test]
    fn budget_floor_keeps_two_messages() {
        let mut c = ctx();
        exchange(&mut c, 5, 6_000);
        let w = c.window_for_send();
        assert_eq!(w.info.messages_in_context, 2);
        assert_eq!(w.info.context_characters, 12_000);
        assert!(w.info.context_truncated);
    }

    #[test]
    fn window_bounds_hold_for_varied_logs() {
        for n in 0..25 {
            for len in [1usize, 400, 900, 5_000] {
                let mut c = ctx();
                exchange(&mut c, n, len);
                let w = c.window_for_send();
                assert!(w.messages.len() <= 10);
                if n >= 2 {
                    assert!(w.messages.len() >= 2);
                }
                let natural: usize = c
                    .conversation()
                    .rev()
                    .take(10)
                    .map(Message::char_len)
                    .sum();
                if natural > 8_000 && n.min(10) > 2 {
                    assert!(w.info.context_truncated);
                    assert!(w.info.context_characters <= 8_000 || w.messages.len() == 2);
                }
                let sum: usize = w.messages.iter().map(Message::char_len).sum();
                assert_eq!(sum, w.info.context_characters);
            }
        }
    }

    #[test]
    fn counts_characters_not_bytes() {
        let mut c = ctx();
        c.push(Sender::User, "héllo", MessageStatus::Sent, false, None);
        assert_eq!(c.window_for_send().info.context_characters, 5);
    }

    #[test]
    fn patch_updates_status_and_metadata() {
        let mut c = ctx();
        let id = c.push(Sender::User, "hi", MessageStatus::Sending, false, None);
        assert!(c.patch(
            id,
            MessagePatch {
                status: Some(MessageStatus::Delivered),
                metadata: Some(serde_json::json!({"k": 1})),
            }
        ));
        let m = c.get(id).unwrap();
        assert_eq!(m.status, MessageStatus::Delivered);
        assert_eq!(m.metadata.as_ref().unwrap()["k"], 1);
        assert!(!c.patch(id + 1_000_000, MessagePatch::status(MessageStatus::Failed)));
    }

    #[test]
    fn remove_after_drops_newer_messages_and_keeps_seed() {
        let mut c = ctx();
        let first = c.push(Sender::User, "q1", MessageStatus::Delivered, false, None);
        c.push(Sender::Bot, "a1", MessageStatus::Delivered, false, None);
        c.push(Sender::Bot, "a1 again", MessageStatus::Delivered, false, None);
        let ts = c.get(first).unwrap().timestamp;
        assert_eq!(c.remove_after(ts), 2);
        assert_eq!(c.messages().len(), 2);
        assert!(c.messages()[0].is_seed());
        assert_eq!(c.messages()[1].id, first);
    }

    #[test]
    fn reset_returns_to_seed() {
        let mut c = ctx();
        exchange(&mut c, 4, 10);
        c.window_for_send();
        c.reset("fresh start");
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].text, "fresh start");
        assert_eq!(c.context_info(), ContextInfo::default());
    }

    #[test]
    fn restore_keeps_ids_monotonic() {
        let mut source = ctx();
        exchange(&mut source, 3, 5);
        let saved: Vec<Message> = source.conversation().cloned().collect();
        let max_id = saved.iter().map(|m| m.id).max().unwrap();

        let mut c = ctx();
        c.restore(saved.clone(), ContextInfo::default());
        assert_eq!(c.conversation().cloned().collect::<Vec<_>>(), saved);
        let id = c.push(Sender::User, "next", MessageStatus::Sending, false, None);
        assert!(id > max_id);
    }

    #[test]
    fn message_wire_format_is_camel_case() {
        let mut c = ctx();
        let id = c.push(Sender::Bot, "oops", MessageStatus::Failed, true, None);
        let json = serde_json::to_value(c.get(id).unwrap()).unwrap();
        assert_eq!(json["sender"], "bot");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["isError"], true);
        assert!(json.get("metadata").is_none());
    }
}
