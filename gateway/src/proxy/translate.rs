//! Request/response translation between the public wire format and the
//! upstream client.
//!
//! Order matters: the body is validated and the model resolved before the
//! session or the network is touched, so bad requests cost nothing upstream.

use std::collections::VecDeque;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::config::StreamErrorPolicy;
use crate::errors::AppError;
use crate::models::catalog::ModelCatalog;
use crate::models::chat::{
    AssistantMessage, ChatChoice, ChatCompletion, ChatCompletionChunk, ChatRequest, ChunkChoice,
    ChunkDelta, ResponseCompletion, ResponseOutput, Role, TextChoice, TextCompletion, Usage,
};
use crate::proxy::stream::UpstreamEvent;
use crate::proxy::stream_bridge::UpstreamEventStream;
use crate::proxy::upstream::UpstreamChatClient;

/// Which public endpoint the response is shaped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Chat,
    Text,
    /// Agent-style `/v1/responses`.
    Response,
}

impl Surface {
    fn id_prefix(self) -> &'static str {
        match self {
            Surface::Chat => "chatcmpl-",
            Surface::Text => "cmpl-",
            Surface::Response => "resp-",
        }
    }
}

/// A validated request whose model already resolved.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub request: ChatRequest,
    pub upstream_model: String,
    pub surface: Surface,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CompletionBody {
    Chat(ChatCompletion),
    Text(TextCompletion),
    Response(ResponseCompletion),
}

/// One server-sent event of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Chunk(Value),
    Error(Value),
    Done,
}

pub struct Translator {
    catalog: ModelCatalog,
    upstream: UpstreamChatClient,
    default_model: String,
    stream_error_policy: StreamErrorPolicy,
}

impl Translator {
    pub fn new(
        catalog: ModelCatalog,
        upstream: UpstreamChatClient,
        default_model: String,
        stream_error_policy: StreamErrorPolicy,
    ) -> Self {
        Self {
            catalog,
            upstream,
            default_model,
            stream_error_policy,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn upstream(&self) -> &UpstreamChatClient {
        &self.upstream
    }

    /// Validates `body` and resolves its model. Never touches the upstream.
    pub fn prepare(&self, body: &Value, surface: Surface) -> Result<Prepared, AppError> {
        let request = match surface {
            Surface::Chat => ChatRequest::from_chat_json(body, &self.default_model)?,
            Surface::Text => ChatRequest::from_completion_json(body, &self.default_model)?,
            Surface::Response => ChatRequest::from_response_json(body, &self.default_model)?,
        };
        let upstream_model = self.catalog.resolve(&request.model)?.to_string();
        Ok(Prepared {
            request,
            upstream_model,
            surface,
        })
    }

    pub async fn complete(&self, prepared: &Prepared) -> Result<CompletionBody, AppError> {
        let req = &prepared.request;
        let result = self
            .upstream
            .complete(&prepared.upstream_model, &req.messages, &req.params)
            .await?;

        let usage = result
            .usage
            .unwrap_or_else(|| Usage::estimate(&req.messages, &result.content));
        let id = response_id(prepared.surface);
        let created = Utc::now().timestamp();
        let finish_reason = terminal_reason(Some(&result.finish_reason));

        tracing::debug!(
            id = %id,
            upstream_model = %prepared.upstream_model,
            completion_tokens = usage.completion_tokens,
            "completion finished"
        );

        Ok(match prepared.surface {
            Surface::Chat => CompletionBody::Chat(ChatCompletion {
                id,
                object: "chat.completion".to_string(),
                created,
                model: req.model.clone(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: AssistantMessage {
                        role: Role::Assistant,
                        content: result.content,
                    },
                    finish_reason,
                }],
                usage,
            }),
            Surface::Text => CompletionBody::Text(TextCompletion {
                id,
                object: "text_completion".to_string(),
                created,
                model: req.model.clone(),
                choices: vec![TextChoice {
                    index: 0,
                    text: result.content,
                    logprobs: None,
                    finish_reason: Some(finish_reason),
                }],
                usage: Some(usage),
            }),
            Surface::Response => CompletionBody::Response(ResponseCompletion {
                id,
                object: "response".to_string(),
                created,
                model: req.model.clone(),
                output: vec![ResponseOutput {
                    kind: "message".to_string(),
                    role: Role::Assistant,
                    content: result.content.clone(),
                }],
                choices: vec![ChatChoice {
                    index: 0,
                    message: AssistantMessage {
                        role: Role::Assistant,
                        content: result.content,
                    },
                    finish_reason,
                }],
                usage,
            }),
        })
    }

    /// Opens the upstream stream and reshapes it. Errors before the upstream
    /// answered are returned directly so they can still become an HTTP status.
    pub async fn stream(
        &self,
        prepared: &Prepared,
    ) -> Result<BoxStream<'static, StreamFrame>, AppError> {
        let req = &prepared.request;
        let upstream = self
            .upstream
            .complete_streaming(&prepared.upstream_model, &req.messages, &req.params)
            .await?;

        let shaper = ChunkShaper {
            id: response_id(prepared.surface),
            created: Utc::now().timestamp(),
            model: req.model.clone(),
            surface: prepared.surface,
            sent_role: false,
        };
        Ok(translate_stream(upstream, shaper, self.stream_error_policy))
    }
}

fn response_id(surface: Surface) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", surface.id_prefix(), &hex[..24])
}

/// Maps the upstream's reason onto the public set. Anything unknown, or no
/// reason at all, reads as a natural stop.
fn terminal_reason(upstream: Option<&str>) -> String {
    match upstream {
        Some("length") => "length",
        Some("content_filter") => "content_filter",
        _ => "stop",
    }
    .to_string()
}

/// Builds the chunk objects of one response. Every chunk carries the same
/// `id`, `created` and `model`.
struct ChunkShaper {
    id: String,
    created: i64,
    model: String,
    surface: Surface,
    sent_role: bool,
}

impl ChunkShaper {
    fn chunk(&mut self, content: Option<String>, finish_reason: Option<String>) -> Value {
        let value = match self.surface {
            Surface::Chat => {
                let role = if self.sent_role {
                    None
                } else {
                    self.sent_role = true;
                    Some(Role::Assistant)
                };
                serde_json::to_value(ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.model.clone(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: ChunkDelta { role, content },
                        finish_reason,
                    }],
                })
            }
            Surface::Text => serde_json::to_value(TextCompletion {
                id: self.id.clone(),
                object: "text_completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![TextChoice {
                    index: 0,
                    text: content.unwrap_or_default(),
                    logprobs: None,
                    finish_reason,
                }],
                usage: None,
            }),
            // Content-only deltas; the terminal delta is empty.
            Surface::Response => serde_json::to_value(ChatCompletionChunk {
                id: self.id.clone(),
                object: "response.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        role: None,
                        content,
                    },
                    finish_reason,
                }],
            }),
        };
        value.unwrap_or(Value::Null)
    }
}

struct StreamState {
    upstream: UpstreamEventStream,
    shaper: ChunkShaper,
    policy: StreamErrorPolicy,
    finish: Option<String>,
    pending: VecDeque<StreamFrame>,
    closed: bool,
}

impl StreamState {
    /// Queues the single terminal chunk and the end marker.
    fn close(&mut self, error: Option<AppError>) {
        let reason = match &error {
            Some(_) => "stop".to_string(),
            None => terminal_reason(self.finish.as_deref()),
        };
        let terminal = self.shaper.chunk(None, Some(reason));
        self.pending.push_back(StreamFrame::Chunk(terminal));

        if let Some(e) = error {
            tracing::warn!(id = %self.shaper.id, "stream ended early: {}", e);
            if self.policy == StreamErrorPolicy::ErrorEvent {
                self.pending.push_back(StreamFrame::Error(e.body()));
            }
        }
        self.pending.push_back(StreamFrame::Done);
        self.closed = true;
    }
}

/// Zero or more content chunks, exactly one chunk with a terminal reason,
/// then [`StreamFrame::Done`], whatever the upstream does.
fn translate_stream(
    upstream: UpstreamEventStream,
    shaper: ChunkShaper,
    policy: StreamErrorPolicy,
) -> BoxStream<'static, StreamFrame> {
    let state = StreamState {
        upstream,
        shaper,
        policy,
        finish: None,
        pending: VecDeque::new(),
        closed: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                return Some((frame, st));
            }
            if st.closed {
                return None;
            }
            match st.upstream.next().await {
                Some(UpstreamEvent::Delta(text)) => {
                    let chunk = st.shaper.chunk(Some(text), None);
                    st.pending.push_back(StreamFrame::Chunk(chunk));
                }
                Some(UpstreamEvent::Finish(reason)) => st.finish = Some(reason),
                Some(UpstreamEvent::Usage(_)) => {}
                Some(UpstreamEvent::Failed(e)) => st.close(Some(e)),
                None => st.close(None),
            }
        }
    })
    .boxed()
}
