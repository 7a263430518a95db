use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, StreamChunk, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    completions_url: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, api_base_url: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            completions_url: format!("{api_base_url}/chat/completions"),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = OpenAiChatRequest::new(&self.model, messages);

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "openai stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));

        let stream = futures_util::stream::unfold(
            (sse, Usage::default(), false),
            |(mut sse, mut usage, done)| async move {
                if done {
                    return None;
                }
                loop {
                    let next = sse.as_mut().next().await?;
                    match next {
                        Ok(SseEvent::Data(data)) => {
                            if data.trim() == "[DONE]" {
                                return Some((Ok(StreamChunk::Done { usage }), (sse, usage, true)));
                            }

                            let chunk: OpenAiStreamResponseChunk = match serde_json::from_str(&data)
                            {
                                Ok(v) => v,
                                Err(e) => {
                                    return Some((
                                        Err(LlmError::StreamParse(format!(
                                            "openai chunk json error={e} data={data}"
                                        ))),
                                        (sse, usage, true),
                                    ));
                                }
                            };

                            if let Some(err) = chunk.error {
                                return Some((
                                    Err(LlmError::Http(format!(
                                        "openai stream error: {}",
                                        err.message
                                    ))),
                                    (sse, usage, true),
                                ));
                            }

                            if let Some(u) = chunk.usage.as_ref() {
                                usage = Usage {
                                    prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                                    completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
                                };
                            }

                            let content = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.delta.content)
                                .filter(|content| !content.is_empty());
                            if let Some(content) = content {
                                return Some((
                                    Ok(StreamChunk::Delta { content }),
                                    (sse, usage, false),
                                ));
                            }
                        }
                        Ok(SseEvent::Other) => continue,
                        Err(e) => return Some((Err(e), (sse, usage, true))),
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl<'a> OpenAiChatRequest<'a> {
    fn new(model: &'a str, messages: &'a [ChatMessage]) -> Self {
        Self {
            model,
            messages,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Other,
}

/// Splits a byte stream into server-sent events. `\r\n` line endings are normalized.
fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer.drain(..idx + 2);

                    let data_lines: Vec<&str> = raw
                        .lines()
                        .filter_map(|line| line.strip_prefix("data:"))
                        .map(str::trim_start)
                        .collect();
                    if data_lines.is_empty() {
                        return Some((Ok(SseEvent::Other), (stream, buffer)));
                    }
                    return Some((Ok(SseEvent::Data(data_lines.join("\n"))), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}
