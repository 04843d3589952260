pub mod anthropic;
pub mod canonical;
pub mod openai;

use serde::{Deserialize, Serialize};

/// Which wire protocol a client (or upstream) speaks. Sticky for the lifetime
/// of a transaction — the driver never serves a response in a format other
/// than the one the request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
	OpenAi,
	Anthropic,
}

impl WireFormat {
	pub fn as_str(&self) -> &'static str {
		match self {
			WireFormat::OpenAi => "openai",
			WireFormat::Anthropic => "anthropic",
		}
	}

	/// The other of the two supported wire formats — used when the
	/// configured upstream for a client's native format is absent and the
	/// upstream client falls back to the one that is (§4.2).
	pub fn other(self) -> WireFormat {
		match self {
			WireFormat::OpenAi => WireFormat::Anthropic,
			WireFormat::Anthropic => WireFormat::OpenAi,
		}
	}
}

impl std::fmt::Display for WireFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Canonical finish reason, independent of wire format. Conversion tables
/// live in `crate::convert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	MaxTokens,
	ToolUse,
	ContentFilter,
}

/// A format-tagged request/response pair, as parsed off the wire. The driver
/// carries these around; conversion to the upstream's native format (when it
/// differs from the client's) is the upstream client's job, not the driver's.
#[derive(Debug, Clone)]
pub enum WireRequest {
	OpenAi(Box<openai::ChatCompletionRequest>),
	Anthropic(Box<anthropic::MessagesRequest>),
}

impl WireRequest {
	pub fn format(&self) -> WireFormat {
		match self {
			WireRequest::OpenAi(_) => WireFormat::OpenAi,
			WireRequest::Anthropic(_) => WireFormat::Anthropic,
		}
	}

	pub fn is_streaming(&self) -> bool {
		match self {
			WireRequest::OpenAi(r) => r.stream.unwrap_or(false),
			WireRequest::Anthropic(r) => r.stream.unwrap_or(false),
		}
	}

	pub fn model(&self) -> &str {
		match self {
			WireRequest::OpenAi(r) => &r.model,
			WireRequest::Anthropic(r) => &r.model,
		}
	}

	/// Extracts the session id from the format-specific metadata slot (§3,
	/// §4.1 phase 1 "Extract session id from the format-specific metadata
	/// slot"). Both wire formats carry it the same way: `metadata.session_id`.
	pub fn session_id(&self) -> Option<String> {
		let metadata = match self {
			WireRequest::OpenAi(r) => r.metadata.as_ref(),
			WireRequest::Anthropic(r) => r.metadata.as_ref(),
		}?;
		metadata.get("session_id")?.as_str().map(str::to_string)
	}
}

#[derive(Debug, Clone)]
pub enum WireResponse {
	OpenAi(Box<openai::ChatCompletionResponse>),
	Anthropic(Box<anthropic::MessagesResponse>),
}

impl WireResponse {
	pub fn format(&self) -> WireFormat {
		match self {
			WireResponse::OpenAi(_) => WireFormat::OpenAi,
			WireResponse::Anthropic(_) => WireFormat::Anthropic,
		}
	}
}

/// Parses an inbound request body in the given wire format (§4.1 phase 1
/// "parse body"). Shared by the HTTP ingress handlers and by the upstream
/// client's passthrough path, which reparses the untouched original bytes.
pub fn parse_request(format: WireFormat, bytes: &[u8]) -> Result<WireRequest, crate::error::GatewayError> {
	match format {
		WireFormat::OpenAi => serde_json::from_slice(bytes)
			.map(|r| WireRequest::OpenAi(Box::new(r)))
			.map_err(|e| crate::error::GatewayError::PayloadInvalid { format, reason: e.to_string() }),
		WireFormat::Anthropic => serde_json::from_slice(bytes)
			.map(|r| WireRequest::Anthropic(Box::new(r)))
			.map_err(|e| crate::error::GatewayError::PayloadInvalid { format, reason: e.to_string() }),
	}
}
