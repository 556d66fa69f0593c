//! Typed model of the agent's `stream-json` output.
//!
//! Each stdout line is one JSON object whose `type` selects the variant.
//! Objects with an unknown `type`, or known types whose shape does not match,
//! are kept as [`AgentMessage::Raw`] rather than dropped. Content blocks follow
//! the same rule via [`ContentBlock::Other`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum AgentMessage {
    /// Session initialization; carries the id used to resume the conversation.
    System(SystemInfo),
    Assistant(Turn),
    /// Tool results fed back to the model.
    User(Turn),
    /// Final message of one agent invocation.
    Result(ResultInfo),
    Raw(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub message: TurnBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Final free-text answer from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    Other(Value),
}

impl AgentMessage {
    /// The `type` tag, or `"raw"` for preserved unknown messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::Raw(_) => "raw",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(info) => info.session_id.as_deref(),
            Self::Assistant(turn) | Self::User(turn) => turn.session_id.as_deref(),
            Self::Result(info) => info.session_id.as_deref(),
            Self::Raw(value) => value.get("session_id").and_then(Value::as_str),
        }
    }

    /// Concatenated text blocks of an assistant turn.
    pub fn text(&self) -> Option<String> {
        let Self::Assistant(turn) = self else {
            return None;
        };
        let parts: Vec<&str> = turn
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }

    /// Names of tools invoked in an assistant turn.
    pub fn tool_names(&self) -> Vec<&str> {
        match self {
            Self::Assistant(turn) => turn
                .message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Parse one line of agent output.
///
/// Blank lines and lines that are not JSON yield `None` (logged at debug).
pub fn parse_line(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(AgentMessage::from(value)),
        Err(err) => {
            tracing::debug!(line = %truncate(trimmed, 100), %err, "skipping non-JSON agent output");
            None
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

impl From<Value> for AgentMessage {
    fn from(value: Value) -> Self {
        let parsed = match value.get("type").and_then(Value::as_str) {
            Some("system") => serde_json::from_value(value.clone()).map(Self::System),
            Some("assistant") => serde_json::from_value(value.clone()).map(Self::Assistant),
            Some("user") => serde_json::from_value(value.clone()).map(Self::User),
            Some("result") => serde_json::from_value(value.clone()).map(Self::Result),
            _ => return Self::Raw(value),
        };
        parsed.unwrap_or(Self::Raw(value))
    }
}

fn tagged(kind: &str, body: impl Serialize) -> Value {
    let mut object = match serde_json::to_value(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    object.insert("type".to_string(), Value::String(kind.to_string()));
    Value::Object(object)
}

impl From<AgentMessage> for Value {
    fn from(message: AgentMessage) -> Self {
        match message {
            AgentMessage::System(info) => tagged("system", info),
            AgentMessage::Assistant(turn) => tagged("assistant", turn),
            AgentMessage::User(turn) => tagged("user", turn),
            AgentMessage::Result(info) => tagged("result", info),
            AgentMessage::Raw(value) => value,
        }
    }
}

impl From<Value> for ContentBlock {
    fn from(value: Value) -> Self {
        let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let block = match value.get("type").and_then(Value::as_str) {
            Some("text") => str_field("text").map(|text| Self::Text { text }),
            Some("tool_use") => match (str_field("id"), str_field("name")) {
                (Some(id), Some(name)) => Some(Self::ToolUse {
                    id,
                    name,
                    input: value.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            },
            Some("tool_result") => str_field("tool_use_id").map(|tool_use_id| Self::ToolResult {
                tool_use_id,
                content: value.get("content").cloned().unwrap_or(Value::Null),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => None,
        };
        block.unwrap_or(Self::Other(value))
    }
}

impl From<ContentBlock> for Value {
    fn from(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            ContentBlock::Other(value) => value,
        }
    }
}
