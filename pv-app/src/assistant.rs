//! Reply engine: control commands answered locally, everything else sent to the model.

use crate::commands::{self, Command};
use crate::session::SessionManager;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use pv_channels::ConversationKey;
use pv_llm::{ChatMessage, LlmClient, StreamChunk, Usage};
use pv_sched::{CoalescedTurn, ReplyChunk, ReplyEngine, ReplyStream, SchedError};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub type ChunkStream = Pin<Box<dyn Stream<Item = pv_llm::Result<StreamChunk>> + Send>>;

/// The model backend the assistant talks to.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model(&self) -> &str;
    async fn chat_stream(&self, messages: &[ChatMessage]) -> pv_llm::Result<ChunkStream>;
}

#[async_trait]
impl ChatModel for LlmClient {
    fn model(&self) -> &str {
        LlmClient::model(self)
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> pv_llm::Result<ChunkStream> {
        LlmClient::chat_stream(self, messages).await
    }
}

pub struct AssistantEngine {
    model: Arc<dyn ChatModel>,
    system_prompt: String,
    sessions: Arc<SessionManager>,
    started_at: Instant,
}

impl AssistantEngine {
    pub fn new(
        model: Arc<dyn ChatModel>,
        system_prompt: impl Into<String>,
        sessions: Arc<SessionManager>,
        started_at: Instant,
    ) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            sessions,
            started_at,
        }
    }

    fn run_command(&self, key: &ConversationKey, command: Command) -> String {
        match command {
            Command::Reset => {
                self.sessions.reset(key);
                "Conversation reset.".to_string()
            }
            Command::Status => {
                let usage = self.sessions.usage(key);
                format!(
                    "model={}\nuptime_seconds={}\nhistory_messages={}\nprompt_tokens={} completion_tokens={}",
                    self.model.model(),
                    self.started_at.elapsed().as_secs(),
                    self.sessions.history_len(key),
                    usage.prompt_tokens,
                    usage.completion_tokens,
                )
            }
            Command::Help => commands::help_text(),
            Command::Unknown(name) => {
                format!("Unknown command {name}. Supported: {}", commands::SUPPORTED)
            }
        }
    }

    fn build_messages(&self, key: &ConversationKey, text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.sessions.history(key));
        messages.push(ChatMessage::user(text));
        messages
    }
}

struct ExchangeState {
    inner: ChunkStream,
    sessions: Arc<SessionManager>,
    key: ConversationKey,
    user_text: String,
    reply: String,
    usage: Usage,
    failed: bool,
}

impl ExchangeState {
    /// Commits the exchange to history. Only called once the model stream ended cleanly.
    fn commit(&self) {
        if self.reply.trim().is_empty() {
            return;
        }
        self.sessions
            .append_exchange(&self.key, &self.user_text, &self.reply, self.usage);
    }
}

/// Forwards model deltas and records the exchange when the stream finishes without error.
fn recording_stream(state: ExchangeState) -> ReplyStream {
    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        loop {
            match state.inner.next().await {
                Some(Ok(StreamChunk::Delta { content })) => {
                    state.reply.push_str(&content);
                    return Some((Ok(ReplyChunk::new(content)), state));
                }
                Some(Ok(StreamChunk::Done { usage })) => {
                    state.usage = usage;
                }
                Some(Err(e)) => {
                    tracing::warn!(conversation_key = %state.key, %e, "model stream failed");
                    state.failed = true;
                    return Some((Err(SchedError::engine(e)), state));
                }
                None => {
                    state.commit();
                    return None;
                }
            }
        }
    }))
}

fn single_reply(text: String) -> ReplyStream {
    Box::pin(futures_util::stream::once(async move {
        Ok::<_, SchedError>(ReplyChunk::new(text))
    }))
}

#[async_trait]
impl ReplyEngine for AssistantEngine {
    #[tracing::instrument(level = "info", skip_all, fields(conversation_key = %turn.conversation_key))]
    async fn invoke(&self, turn: &CoalescedTurn) -> pv_sched::Result<ReplyStream> {
        let key = &turn.conversation_key;
        if let Some(command) = turn.control_text.as_deref().and_then(commands::parse) {
            // Text buffered ahead of the command is dropped with it.
            tracing::debug!(
                ?command,
                constituents = turn.constituent_count,
                "control command"
            );
            return Ok(single_reply(self.run_command(key, command)));
        }
        if turn.merged_text.trim().is_empty() {
            return Ok(Box::pin(
                futures_util::stream::empty::<pv_sched::Result<ReplyChunk>>(),
            ));
        }

        let messages = self.build_messages(key, &turn.merged_text);
        tracing::debug!(
            history_messages = messages.len().saturating_sub(1),
            constituents = turn.constituent_count,
            "model request"
        );
        let inner = self
            .model
            .chat_stream(&messages)
            .await
            .map_err(SchedError::engine)?;
        Ok(recording_stream(ExchangeState {
            inner,
            sessions: self.sessions.clone(),
            key: key.clone(),
            user_text: turn.merged_text.clone(),
            reply: String::new(),
            usage: Usage::default(),
            failed: false,
        }))
    }
}
