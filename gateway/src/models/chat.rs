//! Wire types for the public chat surface.
//!
//! Inbound bodies arrive as loose JSON and are validated once, at the boundary,
//! into [`ChatRequest`]. Everything past this module works with typed values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

/// A validated chat request. `model` is still the public alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: SamplingParams,
    pub stream: bool,
}

impl ChatRequest {
    /// Validates a `/v1/chat/completions` body. `input` is accepted as an
    /// alias of `messages`; a missing `model` falls back to `default_model`.
    pub fn from_chat_json(body: &Value, default_model: &str) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| invalid("request body must be a JSON object"))?;

        let raw_messages = match obj.get("messages").filter(|v| !v.is_null()) {
            Some(v) => v,
            None => obj
                .get("input")
                .filter(|v| !v.is_null())
                .ok_or_else(|| invalid("missing required field: messages"))?,
        };
        let messages = parse_messages(raw_messages)?;

        Ok(Self {
            model: parse_model(obj.get("model"), default_model)?,
            messages,
            params: parse_params(obj)?,
            stream: parse_stream(obj.get("stream"))?,
        })
    }

    /// Validates a legacy `/v1/completions` body. The prompt (a string or a
    /// list of strings joined by newlines) becomes a single user message.
    pub fn from_completion_json(body: &Value, default_model: &str) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| invalid("request body must be a JSON object"))?;

        let prompt = match obj.get("prompt") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => {
                let mut lines = Vec::with_capacity(parts.len());
                for part in parts {
                    lines.push(
                        part.as_str()
                            .ok_or_else(|| invalid("prompt array must contain only strings"))?,
                    );
                }
                lines.join("\n")
            }
            Some(_) => return Err(invalid("prompt must be a string or an array of strings")),
            None => return Err(invalid("missing required field: prompt")),
        };
        if prompt.is_empty() {
            return Err(invalid("prompt must not be empty"));
        }

        Ok(Self {
            model: parse_model(obj.get("model"), default_model)?,
            messages: vec![ChatMessage::user(prompt)],
            params: parse_params(obj)?,
            stream: parse_stream(obj.get("stream"))?,
        })
    }

    /// Validates a `/v1/responses` body: the chat shape, or `input` as a bare
    /// string. `instructions`, when present, leads as a system message.
    pub fn from_response_json(body: &Value, default_model: &str) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| invalid("request body must be a JSON object"))?;

        let has_messages = obj.get("messages").map_or(false, |v| !v.is_null());
        let mut request = match obj.get("input") {
            Some(Value::String(text)) if !has_messages => {
                if text.is_empty() {
                    return Err(invalid("input must not be empty"));
                }
                Self {
                    model: parse_model(obj.get("model"), default_model)?,
                    messages: vec![ChatMessage::user(text.clone())],
                    params: parse_params(obj)?,
                    stream: parse_stream(obj.get("stream"))?,
                }
            }
            _ if !has_messages && obj.get("input").map_or(true, Value::is_null) => {
                return Err(invalid("missing required field: messages or input"));
            }
            _ => Self::from_chat_json(body, default_model)?,
        };

        match obj.get("instructions") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request.messages.insert(
                0,
                ChatMessage {
                    role: Role::System,
                    content: text.clone(),
                },
            ),
            Some(_) => return Err(invalid("instructions must be a string")),
        }
        Ok(request)
    }
}

fn invalid(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

fn parse_model(value: Option<&Value>, default_model: &str) -> Result<String, AppError> {
    match value {
        None | Some(Value::Null) => Ok(default_model.to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(invalid("model must be a non-empty string")),
    }
}

fn parse_stream(value: Option<&Value>) -> Result<bool, AppError> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid("stream must be a boolean")),
    }
}

fn parse_messages(value: &Value) -> Result<Vec<ChatMessage>, AppError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid("messages must be an array"))?;
    if items.is_empty() {
        return Err(invalid("messages must not be empty"));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let obj = item
                .as_object()
                .ok_or_else(|| invalid(format!("messages[{}] must be an object", i)))?;
            let role = obj
                .get("role")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("messages[{}].role is required", i)))?;
            let role = Role::parse(role).ok_or_else(|| {
                invalid(format!(
                    "messages[{}].role '{}' is not one of system, user, assistant",
                    i, role
                ))
            })?;
            let content = parse_content(obj.get("content"))
                .ok_or_else(|| {
                    invalid(format!(
                        "messages[{}].content must be a string or an array of text parts",
                        i
                    ))
                })?;
            Ok(ChatMessage { role, content })
        })
        .collect()
}

/// Plain string, or an array of `{"type":"text","text":...}` parts concatenated.
fn parse_content(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if part.get("type").and_then(Value::as_str) != Some("text") {
                    return None;
                }
                out.push_str(part.get("text")?.as_str()?);
            }
            Some(out)
        }
        _ => None,
    }
}

fn parse_params(obj: &serde_json::Map<String, Value>) -> Result<SamplingParams, AppError> {
    let temperature = optional_f64(obj, "temperature")?;
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(invalid("temperature must be between 0 and 2"));
        }
    }

    let top_p = optional_f64(obj, "top_p")?;
    if let Some(p) = top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(invalid("top_p must be between 0 and 1"));
        }
    }

    let max_tokens = match obj.get("max_tokens") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 && n <= u32::MAX as u64 => Some(n as u32),
            _ => return Err(invalid("max_tokens must be a positive integer")),
        },
    };

    let stop = match obj.get("stop") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid("stop must be a string or an array of strings"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(invalid("stop must be a string or an array of strings")),
    };

    Ok(SamplingParams {
        temperature,
        top_p,
        max_tokens,
        stop,
    })
}

fn optional_f64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<f64>, AppError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(format!("{} must be a number", key))),
    }
}

// -- Responses --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Length-based estimate (about four characters per token).
    pub fn estimate(messages: &[ChatMessage], completion: &str) -> Self {
        let prompt_chars = serde_json::to_string(messages)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        let prompt_tokens = (prompt_chars / 4) as u64;
        let completion_tokens = (completion.chars().count() / 4) as u64;
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

/// One entry of a response's `output` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseOutput {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: String,
}

/// `/v1/responses` object: the `output` list agent clients read, next to the
/// usual `choices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub output: Vec<ResponseOutput>,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

/// Legacy completion object, used for both the full response and its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}
