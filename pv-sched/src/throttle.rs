//! Rate limiting for in-place edits of a streaming reply.

use crate::traits::OutboundTransport;
use pv_channels::{ConversationKey, MessageId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct ThrottleState {
    accumulated: String,
    last_flush: Option<Instant>,
    edits: usize,
}

/// Limits placeholder edits to one per `interval`, plus one final edit.
///
/// Partials that land inside the interval are absorbed; there is no trailing timer.
/// The lock is held across the edit call so edits of one reply never overlap.
pub struct StreamThrottle {
    transport: Arc<dyn OutboundTransport>,
    key: ConversationKey,
    placeholder_id: MessageId,
    interval: Duration,
    state: Mutex<ThrottleState>,
}

impl StreamThrottle {
    pub fn new(
        transport: Arc<dyn OutboundTransport>,
        key: ConversationKey,
        placeholder_id: MessageId,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            key,
            placeholder_id,
            interval,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn placeholder_id(&self) -> &MessageId {
        &self.placeholder_id
    }

    /// Records the accumulated reply text and edits the placeholder if the interval allows.
    ///
    /// Returns whether an edit was attempted.
    pub async fn on_partial(&self, accumulated: &str) -> bool {
        let mut state = self.state.lock().await;
        state.accumulated.clear();
        state.accumulated.push_str(accumulated);

        let now = Instant::now();
        if let Some(last) = state.last_flush {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        state.last_flush = Some(now);
        self.edit(&mut state, accumulated).await;
        true
    }

    /// Unconditional final edit. `text` replaces the accumulated text when given.
    pub async fn on_complete(&self, text: Option<&str>) {
        let mut state = self.state.lock().await;
        if let Some(text) = text {
            state.accumulated = text.to_string();
        }
        let final_text = state.accumulated.clone();
        state.last_flush = Some(Instant::now());
        self.edit(&mut state, &final_text).await;
    }

    /// Number of successful edits so far.
    pub async fn edit_count(&self) -> usize {
        self.state.lock().await.edits
    }

    async fn edit(&self, state: &mut ThrottleState, text: &str) {
        match self
            .transport
            .edit_placeholder(&self.key, &self.placeholder_id, text)
            .await
        {
            Ok(()) => state.edits += 1,
            Err(e) => {
                tracing::warn!(
                    conversation_key = %self.key,
                    placeholder_id = %self.placeholder_id,
                    %e,
                    "placeholder edit failed"
                );
            }
        }
    }
}
