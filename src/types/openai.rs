//! OpenAI chat-completions wire types. Hand-rolled rather than pulled from a
//! universal SDK type, since we need to preserve the client's exact wire
//! shape end-to-end (see `SPEC_FULL.md` §4).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
	pub model: String,
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub n: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	/// Carries `metadata.session_id` and similar well-known out-of-band
	/// fields (§3 "extracted from a well-known metadata field"). Any other
	/// provider-specific keys pass through unexamined.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	/// Catch-all for fields we don't model explicitly, so round-tripping a
	/// request we don't mutate never drops client-supplied data.
	#[serde(flatten)]
	pub extra: std::collections::BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
	pub role: Role,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Content>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

impl Message {
	pub fn text(&self) -> Option<String> {
		match &self.content {
			Some(Content::Text(t)) => Some(t.clone()),
			Some(Content::Parts(parts)) => {
				let joined: String = parts
					.iter()
					.filter_map(|p| match p {
						ContentPart::Text { text } => Some(text.as_str()),
						_ => None,
					})
					.collect::<Vec<_>>()
					.join("");
				if joined.is_empty() { None } else { Some(joined) }
			},
			None => None,
		}
	}

	/// True if the message's content (once sanitized) would be empty and
	/// carries no tool calls — i.e. it is safe to drop entirely.
	pub fn is_effectively_empty(&self) -> bool {
		let content_empty = match &self.content {
			None => true,
			Some(Content::Text(t)) => t.trim().is_empty(),
			Some(Content::Parts(parts)) => parts.is_empty(),
		};
		content_empty && self.tool_calls.as_ref().is_none_or(|t| t.is_empty())
	}
}

/// OpenAI content is either a bare string or a list of typed parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
	Text { text: String },
	ImageUrl { image_url: ImageUrl },
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageUrl {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
	pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
	pub name: String,
	/// Raw JSON-arguments string; not guaranteed parseable until the tool
	/// call's content block is complete.
	pub arguments: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
	pub r#type: String,
	pub function: FunctionDef,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten)]
	pub extra: std::collections::BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
	pub index: u32,
	pub message: Message,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
pub struct Usage {
	pub prompt_tokens: u32,
	pub completion_tokens: u32,
	pub total_tokens: u32,
}

/// A single `chat.completion.chunk` SSE frame payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<ChunkChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
	pub index: u32,
	pub delta: Delta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCallDelta {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FunctionCallDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
	pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	pub message: String,
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl ErrorEnvelope {
	pub fn new(message: impl Into<String>, r#type: impl Into<String>) -> Self {
		Self {
			error: ErrorBody {
				message: message.into(),
				r#type: r#type.into(),
				param: None,
				code: None,
			},
		}
	}
}
