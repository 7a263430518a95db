//! Recording fakes shared by the scheduler's unit tests.

use crate::error::{Result, SchedError};
use crate::event::CoalescedTurn;
use crate::traits::{Notifier, OutboundTransport, ReplyChunk, ReplyEngine, ReplyStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use pv_channels::{ConversationKey, MessageId};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Placeholder { chat: String },
    Edit { id: String, text: String },
    Direct { chat: String, text: String, reply_to: Option<String> },
    Notice { chat: String, text: String },
}

pub struct RecordingTransport {
    pub editable: bool,
    pub fail_placeholder: bool,
    pub fail_edits: AtomicBool,
    /// Number of upcoming direct sends to reject.
    pub fail_sends: AtomicUsize,
    started: Instant,
    next_id: AtomicUsize,
    log: Mutex<Vec<(Duration, Delivery)>>,
}

impl RecordingTransport {
    pub fn new(editable: bool) -> Self {
        Self {
            editable,
            fail_placeholder: false,
            fail_edits: AtomicBool::new(false),
            fail_sends: AtomicUsize::new(0),
            started: Instant::now(),
            next_id: AtomicUsize::new(1),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.timed().into_iter().map(|(_, d)| d).collect()
    }

    /// Deliveries with their offset from construction time.
    pub fn timed(&self) -> Vec<(Duration, Delivery)> {
        self.log.lock().expect("log lock").clone()
    }

    fn record(&self, delivery: Delivery) {
        let at = self.started.elapsed();
        self.log.lock().expect("log lock").push((at, delivery));
    }

    fn mint_id(&self) -> MessageId {
        MessageId::new(format!("out-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    fn supports_placeholder(&self, _key: &ConversationKey) -> bool {
        self.editable
    }

    async fn create_placeholder(&self, key: &ConversationKey) -> Result<MessageId> {
        if self.fail_placeholder {
            return Err(SchedError::delivery("placeholder rejected"));
        }
        self.record(Delivery::Placeholder {
            chat: key.chat().to_string(),
        });
        Ok(self.mint_id())
    }

    async fn edit_placeholder(
        &self,
        _key: &ConversationKey,
        placeholder_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(SchedError::delivery("edit rejected"));
        }
        self.record(Delivery::Edit {
            id: placeholder_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_direct(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId> {
        let rejected = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SchedError::delivery("send rejected"));
        }
        self.record(Delivery::Direct {
            chat: key.chat().to_string(),
            text: text.to_string(),
            reply_to: reply_to.map(|id| id.to_string()),
        });
        Ok(self.mint_id())
    }
}

#[async_trait]
impl Notifier for RecordingTransport {
    async fn notify(&self, key: &ConversationKey, text: &str) -> Result<()> {
        self.record(Delivery::Notice {
            chat: key.chat().to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Replays a fixed list of deltas, each after its own delay; optionally ends with an error.
pub struct ScriptedEngine {
    pub steps: Vec<(Duration, String)>,
    pub fail_at_end: bool,
    pub fail_on_invoke: bool,
}

impl ScriptedEngine {
    pub fn new(steps: &[(u64, &str)]) -> Self {
        Self {
            steps: steps
                .iter()
                .map(|(ms, text)| (Duration::from_millis(*ms), text.to_string()))
                .collect(),
            fail_at_end: false,
            fail_on_invoke: false,
        }
    }
}

#[async_trait]
impl ReplyEngine for ScriptedEngine {
    async fn invoke(&self, _turn: &CoalescedTurn) -> Result<ReplyStream> {
        if self.fail_on_invoke {
            return Err(SchedError::engine("backend unavailable"));
        }
        let steps = self.steps.clone();
        let fail_at_end = self.fail_at_end;
        Ok(Box::pin(scripted_stream(steps, fail_at_end)))
    }
}

fn scripted_stream(
    steps: Vec<(Duration, String)>,
    fail_at_end: bool,
) -> impl futures_util::Stream<Item = Result<ReplyChunk>> + Send {
    let tail = fail_at_end.then(|| Err(SchedError::engine("stream interrupted")));
    futures_util::stream::iter(steps)
        .then(|(delay, text)| async move {
            tokio::time::sleep(delay).await;
            Ok(ReplyChunk::new(text))
        })
        .chain(futures_util::stream::iter(tail))
}
