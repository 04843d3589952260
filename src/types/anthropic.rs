//! Anthropic messages wire types. See `types::openai` for the sibling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
	pub model: String,
	pub messages: Vec<Message>,
	pub max_tokens: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub thinking: Option<Thinking>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	#[serde(flatten)]
	pub extra: std::collections::BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
	pub r#type: String,
	pub text: String,
}

impl SystemPrompt {
	pub fn joined(&self) -> String {
		match self {
			SystemPrompt::Text(t) => t.clone(),
			SystemPrompt::Blocks(blocks) => blocks
				.iter()
				.map(|b| b.text.as_str())
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thinking {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub budget_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	User,
	Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
	pub role: Role,
	pub content: MessageContent,
}

/// Anthropic messages accept either a bare string or a list of content
/// blocks; we normalize to blocks internally and collapse back to a string
/// on serialize only when every block is plain text (§4.2 "Content blocks").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<RequestContentBlock>),
}

impl MessageContent {
	pub fn as_blocks(&self) -> Vec<RequestContentBlock> {
		match self {
			MessageContent::Text(t) => vec![RequestContentBlock::Text { text: t.clone() }],
			MessageContent::Blocks(b) => b.clone(),
		}
	}

	/// Collapse a block list back to a bare string when every block is text,
	/// mirroring how Anthropic clients typically render single-text-block
	/// messages.
	pub fn from_blocks(blocks: Vec<RequestContentBlock>) -> Self {
		if let [RequestContentBlock::Text { text }] = blocks.as_slice() {
			MessageContent::Text(text.clone())
		} else {
			MessageContent::Blocks(blocks)
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestContentBlock {
	Text {
		text: String,
	},
	Image {
		source: ImageSource,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	ToolResult {
		tool_use_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		content: Option<ToolResultContent>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		is_error: Option<bool>,
	},
	Thinking {
		thinking: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	#[serde(other)]
	Other,
}

impl RequestContentBlock {
	pub fn is_text_empty(&self) -> bool {
		matches!(self, RequestContentBlock::Text { text } if text.trim().is_empty())
	}

	pub fn tool_result_id(&self) -> Option<&str> {
		match self {
			RequestContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id),
			_ => None,
		}
	}

	pub fn tool_use_id(&self) -> Option<&str> {
		match self {
			RequestContentBlock::ToolUse { id, .. } => Some(id),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
	Text(String),
	Blocks(Vec<RequestContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub media_type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesResponse {
	pub id: String,
	pub r#type: String,
	pub role: Role,
	pub model: String,
	pub content: Vec<ResponseContentBlock>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<StopReason>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContentBlock {
	Text {
		text: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	Thinking {
		thinking: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	ToolUse,
	StopSequence,
	ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
	pub input_tokens: u64,
	pub output_tokens: u64,
}

/// The six-event SSE lifecycle (§4.3/§6): `message_start`,
/// `content_block_start`, `content_block_delta`, `content_block_stop`,
/// `message_delta`, `message_stop`, plus `ping` and `error`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
	MessageStart {
		message: MessagesResponse,
	},
	ContentBlockStart {
		index: usize,
		content_block: ResponseContentBlock,
	},
	ContentBlockDelta {
		index: usize,
		delta: ContentBlockDelta,
	},
	ContentBlockStop {
		index: usize,
	},
	MessageDelta {
		delta: MessageDelta,
		usage: MessageDeltaUsage,
	},
	MessageStop,
	Ping,
	Error {
		error: ErrorDetail,
	},
}

impl StreamEvent {
	/// The value that belongs in the SSE `event:` field for this frame.
	pub fn event_name(&self) -> &'static str {
		match self {
			StreamEvent::MessageStart { .. } => "message_start",
			StreamEvent::ContentBlockStart { .. } => "content_block_start",
			StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
			StreamEvent::ContentBlockStop { .. } => "content_block_stop",
			StreamEvent::MessageDelta { .. } => "message_delta",
			StreamEvent::MessageStop => "message_stop",
			StreamEvent::Ping => "ping",
			StreamEvent::Error { .. } => "error",
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessageDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<StopReason>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct MessageDeltaUsage {
	#[serde(default)]
	pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorDetail {
	pub r#type: String,
	pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesErrorResponse {
	pub r#type: String,
	pub error: ErrorDetail,
}

impl MessagesErrorResponse {
	pub fn new(message: impl Into<String>, r#type: impl Into<String>) -> Self {
		Self {
			r#type: "error".to_string(),
			error: ErrorDetail {
				r#type: r#type.into(),
				message: message.into(),
			},
		}
	}
}
