use pv_channels::{ConversationKey, MessageId};
use serde::Serialize;
use tokio::time::Instant;

/// One admitted inbound message, already mapped from its platform payload.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub conversation_key: ConversationKey,
    pub text: String,
    pub message_id: MessageId,
    pub received_at: Instant,
    pub is_control_command: bool,
}

impl InboundEvent {
    pub fn new(
        conversation_key: ConversationKey,
        text: impl Into<String>,
        message_id: impl Into<MessageId>,
    ) -> Self {
        Self {
            conversation_key,
            text: text.into(),
            message_id: message_id.into(),
            received_at: Instant::now(),
            is_control_command: false,
        }
    }

    pub fn control(mut self, is_control_command: bool) -> Self {
        self.is_control_command = is_control_command;
        self
    }

    /// Backdates the arrival time to when the transport accepted the message.
    pub fn received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    /// Whether this event must skip the debounce window.
    pub(crate) fn bypasses_debounce(&self) -> bool {
        self.is_control_command || self.text.trim().is_empty()
    }
}

/// The unit of work handed to the reply engine. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoalescedTurn {
    pub conversation_key: ConversationKey,
    pub merged_text: String,
    pub anchor_message_id: MessageId,
    pub constituent_count: usize,
    /// Text of the control command that closed the window, if one did.
    pub control_text: Option<String>,
}

impl CoalescedTurn {
    /// Builds a turn from events of a single key, oldest first.
    ///
    /// Returns `None` for an empty batch.
    pub fn from_events(events: Vec<InboundEvent>) -> Option<Self> {
        let last = events.last()?;
        let conversation_key = last.conversation_key.clone();
        let anchor_message_id = last.message_id.clone();
        let constituent_count = events.len();
        let control_text = last
            .is_control_command
            .then(|| last.text.trim().to_string());

        let merged_text = events
            .iter()
            .map(|event| event.text.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        Some(Self {
            conversation_key,
            merged_text,
            anchor_message_id,
            constituent_count,
            control_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("wecom", "default", "u1", "u1").expect("valid key")
    }

    #[test]
    fn merges_in_order_and_anchors_on_last_event() {
        let events = vec![
            InboundEvent::new(key(), "  first", "m1"),
            InboundEvent::new(key(), "", "m2"),
            InboundEvent::new(key(), "third  ", "m3"),
        ];
        let turn = CoalescedTurn::from_events(events).expect("non-empty batch");
        assert_eq!(turn.merged_text, "first\nthird");
        assert_eq!(turn.anchor_message_id.as_str(), "m3");
        assert_eq!(turn.constituent_count, 3);
        assert_eq!(turn.control_text, None);
    }

    #[test]
    fn control_event_closing_a_window_is_kept_apart() {
        let events = vec![
            InboundEvent::new(key(), "draft", "m1"),
            InboundEvent::new(key(), " /new ", "m2").control(true),
        ];
        let turn = CoalescedTurn::from_events(events).expect("non-empty batch");
        assert_eq!(turn.merged_text, "draft\n/new");
        assert_eq!(turn.control_text.as_deref(), Some("/new"));
        assert_eq!(turn.anchor_message_id.as_str(), "m2");
    }

    #[test]
    fn empty_batch_builds_nothing() {
        assert!(CoalescedTurn::from_events(Vec::new()).is_none());
    }

    #[test]
    fn blank_and_control_events_bypass_debounce() {
        assert!(InboundEvent::new(key(), "   ", "m1").bypasses_debounce());
        assert!(
            InboundEvent::new(key(), "/new", "m2")
                .control(true)
                .bypasses_debounce()
        );
        assert!(!InboundEvent::new(key(), "hello", "m3").bypasses_debounce());
    }
}
