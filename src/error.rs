//! Error taxonomy (§7). Each variant maps to a wire-format-appropriate
//! response at the HTTP boundary — see `http::handlers`.

use crate::types::WireFormat;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
	#[error("request body is not valid {format}: {reason}")]
	PayloadInvalid { format: WireFormat, reason: String },

	#[error("request body exceeds the maximum of {max_bytes} bytes")]
	PayloadTooLarge { max_bytes: usize },

	#[error("credential is invalid or unrecognized")]
	Unauthenticated,

	#[error("blocked by policy {policy}: {reason}")]
	PolicyBlocked { policy: String, reason: String },

	#[error("upstream unavailable for model {model}: {detail}")]
	UpstreamUnavailable { model: String, detail: String },

	#[error("upstream rejected the request for model {model}: {message}")]
	UpstreamBadRequest { model: String, message: String, raw: String },

	#[error("context window exceeded for model {model}")]
	ContextOverflow { model: String },

	#[error("judge evaluation failed: {0}")]
	JudgeFailure(String),

	#[error("stream error after headers sent: {0}")]
	StreamMidError(String),

	#[error("event store write failed: {0}")]
	EventStoreFailure(String),

	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl GatewayError {
	/// HTTP status this error maps to when it can still be surfaced as a
	/// normal HTTP response (i.e. before SSE headers are sent).
	pub fn status_code(&self) -> http::StatusCode {
		use http::StatusCode;
		match self {
			GatewayError::PayloadInvalid { .. } => StatusCode::BAD_REQUEST,
			GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
			GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
			GatewayError::PolicyBlocked { .. } => StatusCode::OK,
			GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
			GatewayError::UpstreamBadRequest { .. } => StatusCode::BAD_REQUEST,
			GatewayError::ContextOverflow { .. } => StatusCode::BAD_REQUEST,
			GatewayError::JudgeFailure(_) => StatusCode::OK,
			GatewayError::StreamMidError(_) => StatusCode::OK,
			GatewayError::EventStoreFailure(_) => StatusCode::OK,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The human-centered message shown to the client in place of the raw
	/// upstream/transport text (§4.2 "instructing the user to compact or
	/// restart", §4.5 "name the model and suggest remediation", §7). Shared
	/// between the non-streaming wire body and the streaming mid-stream error
	/// frame so the same failure reads identically either way. Grounded on
	/// `examples/original_source/.../llm/anthropic_client.py`'s
	/// `_make_context_overflow_message` / `_make_server_error_message` /
	/// `_make_unknown_400_message`.
	pub fn user_message(&self) -> String {
		match self {
			GatewayError::ContextOverflow { model } => {
				format!("Your conversation has grown too long for {model}. Try /compact to summarize older messages, or start a new conversation.")
			},
			GatewayError::UpstreamUnavailable { model, .. } => {
				format!("{model} is temporarily unavailable. Try again in a moment.")
			},
			GatewayError::UpstreamBadRequest { model, .. } => {
				format!(
					"Luthien couldn't process your request for {model}. Try again, or simplify your request. \
					If this persists, contact your administrator."
				)
			},
			other => other.to_string(),
		}
	}

	/// Renders this error as a wire-format error envelope body.
	pub fn to_wire_body(&self, format: WireFormat) -> serde_json::Value {
		let message = self.user_message();
		match format {
			WireFormat::OpenAi => {
				let envelope = crate::types::openai::ErrorEnvelope::new(message, self.error_type());
				serde_json::to_value(envelope).unwrap_or_default()
			},
			WireFormat::Anthropic => {
				let envelope =
					crate::types::anthropic::MessagesErrorResponse::new(message, self.error_type());
				serde_json::to_value(envelope).unwrap_or_default()
			},
		}
	}

	fn error_type(&self) -> &'static str {
		match self {
			GatewayError::PayloadInvalid { .. } => "invalid_request_error",
			GatewayError::PayloadTooLarge { .. } => "invalid_request_error",
			GatewayError::Unauthenticated => "authentication_error",
			GatewayError::PolicyBlocked { .. } => "policy_blocked",
			GatewayError::UpstreamUnavailable { .. } => "api_error",
			GatewayError::UpstreamBadRequest { .. } => "invalid_request_error",
			GatewayError::ContextOverflow { .. } => "context_length_exceeded",
			GatewayError::JudgeFailure(_) => "policy_blocked",
			GatewayError::StreamMidError(_) => "api_error",
			GatewayError::EventStoreFailure(_) => "internal_error",
			GatewayError::Internal(_) => "internal_error",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn context_overflow_message_names_model_and_suggests_compact() {
		let err = GatewayError::ContextOverflow { model: "gpt-4".to_string() };
		let message = err.user_message();
		assert!(message.contains("gpt-4"));
		assert!(message.contains("/compact"));
	}

	#[test]
	fn upstream_unavailable_message_names_model_and_hides_raw_detail() {
		let err = GatewayError::UpstreamUnavailable {
			model: "claude-3".to_string(),
			detail: "connection reset by peer at 10.0.0.1:443".to_string(),
		};
		let message = err.user_message();
		assert!(message.contains("claude-3"));
		assert!(!message.contains("10.0.0.1"));
	}

	#[test]
	fn unknown_bad_request_message_names_model_and_hides_raw_text() {
		let err = GatewayError::UpstreamBadRequest {
			model: "gpt-4".to_string(),
			message: "something_weird_the_client_should_never_see".to_string(),
			raw: String::new(),
		};
		let message = err.user_message();
		assert!(message.contains("gpt-4"));
		assert!(!message.contains("something_weird_the_client_should_never_see"));
	}
}
