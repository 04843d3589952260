//! Outbound re-serialization: canonical events emitted by a policy, turned
//! back into wire-format SSE frames (§4.3 "Outbound assembler"). For OpenAI
//! this means `chat.completion.chunk` frames with a terminal `[DONE]`; for
//! Anthropic, the full six-event lifecycle with a `message_delta` carrying
//! `stop_reason` before `message_stop` — even when the policy synthesized
//! the content itself, since downstream clients key off that signal.

use crate::convert;
use crate::types::anthropic as a;
use crate::types::canonical::{BlockDelta, CanonicalEvent, ContentBlock};
use crate::types::openai as o;

/// Formats one OpenAI SSE data frame.
pub fn format_openai_chunk(chunk: &o::ChatCompletionChunk) -> String {
	let json = serde_json::to_string(chunk).unwrap_or_default();
	format!("data: {json}\n\n")
}

pub fn format_openai_done() -> &'static str {
	"data: [DONE]\n\n"
}

/// Formats one Anthropic SSE event+data frame pair.
pub fn format_anthropic_event(event: &a::StreamEvent) -> String {
	let json = serde_json::to_string(event).unwrap_or_default();
	format!("event: {}\ndata: {json}\n\n", event.event_name())
}

/// A benign comment frame, used for keepalives (§4.4). SSE comment lines
/// begin with `:` and are ignored by clients and proxies alike.
pub fn keepalive_comment() -> &'static str {
	": keepalive\n\n"
}

pub struct OpenAiEncoder {
	id: String,
	model: String,
	created: i64,
	sent_role: bool,
}

impl OpenAiEncoder {
	pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
		Self {
			id: id.into(),
			model: model.into(),
			created,
			sent_role: false,
		}
	}

	fn chunk(&self, choice: o::ChunkChoice) -> o::ChatCompletionChunk {
		o::ChatCompletionChunk {
			id: self.id.clone(),
			object: "chat.completion.chunk".to_string(),
			created: self.created,
			model: self.model.clone(),
			choices: vec![choice],
			usage: None,
		}
	}

	/// Translates one canonical event into zero or more outbound chunks.
	pub fn encode(&mut self, event: &CanonicalEvent) -> Vec<o::ChatCompletionChunk> {
		match event {
			CanonicalEvent::StreamStarted => vec![],
			CanonicalEvent::BlockStarted { index, initial } => match initial {
				ContentBlock::ToolUse { id, name, .. } => {
					let mut delta = o::Delta::default();
					if !self.sent_role {
						delta.role = Some(o::Role::Assistant);
						self.sent_role = true;
					}
					delta.tool_calls = Some(vec![o::ToolCallDelta {
						index: *index as u32,
						id: Some(id.clone()),
						r#type: Some("function".to_string()),
						function: Some(o::FunctionCallDelta {
							name: Some(name.clone()),
							arguments: Some(String::new()),
						}),
					}]);
					vec![self.chunk(o::ChunkChoice { index: 0, delta, finish_reason: None })]
				},
				ContentBlock::Text { .. } | ContentBlock::Thinking { .. } => {
					if self.sent_role {
						return vec![];
					}
					self.sent_role = true;
					vec![self.chunk(o::ChunkChoice {
						index: 0,
						delta: o::Delta {
							role: Some(o::Role::Assistant),
							..Default::default()
						},
						finish_reason: None,
					})]
				},
			},
			CanonicalEvent::Delta { index, delta } => match delta {
				BlockDelta::Text { text } => vec![self.chunk(o::ChunkChoice {
					index: 0,
					delta: o::Delta {
						content: Some(text.clone()),
						..Default::default()
					},
					finish_reason: None,
				})],
				BlockDelta::ToolUseArguments { partial_json } => vec![self.chunk(o::ChunkChoice {
					index: 0,
					delta: o::Delta {
						tool_calls: Some(vec![o::ToolCallDelta {
							index: *index as u32,
							id: None,
							r#type: None,
							function: Some(o::FunctionCallDelta {
								name: None,
								arguments: Some(partial_json.clone()),
							}),
						}]),
						..Default::default()
					},
					finish_reason: None,
				})],
				BlockDelta::Thinking { .. } | BlockDelta::Signature { .. } => vec![],
			},
			CanonicalEvent::BlockComplete { .. } => vec![],
			CanonicalEvent::FinishReason(reason) => vec![self.chunk(o::ChunkChoice {
				index: 0,
				delta: o::Delta::default(),
				finish_reason: Some(convert::canonical_finish_to_openai(*reason).to_string()),
			})],
			CanonicalEvent::StreamClosed => vec![],
			CanonicalEvent::Error { message } => vec![self.chunk(o::ChunkChoice {
				index: 0,
				delta: o::Delta {
					content: Some(format!("[error: {message}]")),
					..Default::default()
				},
				finish_reason: None,
			})],
		}
	}
}

pub struct AnthropicEncoder {
	message_id: String,
	model: String,
	sent_message_start: bool,
	sent_message_stop: bool,
	pending_stop_reason: Option<a::StopReason>,
}

impl AnthropicEncoder {
	pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
		Self {
			message_id: message_id.into(),
			model: model.into(),
			sent_message_start: false,
			sent_message_stop: false,
			pending_stop_reason: None,
		}
	}

	fn message_start_event(&mut self) -> Option<a::StreamEvent> {
		if self.sent_message_start {
			return None;
		}
		self.sent_message_start = true;
		Some(a::StreamEvent::MessageStart {
			message: a::MessagesResponse {
				id: self.message_id.clone(),
				r#type: "message".to_string(),
				role: a::Role::Assistant,
				model: self.model.clone(),
				content: vec![],
				stop_reason: None,
				stop_sequence: None,
				usage: a::Usage::default(),
			},
		})
	}

	pub fn encode(&mut self, event: &CanonicalEvent) -> Vec<a::StreamEvent> {
		let mut out = Vec::new();
		out.extend(self.message_start_event());
		match event {
			CanonicalEvent::StreamStarted => {},
			CanonicalEvent::BlockStarted { index, initial } => {
				out.push(a::StreamEvent::ContentBlockStart {
					index: *index,
					content_block: initial_response_block(initial),
				});
			},
			CanonicalEvent::Delta { index, delta } => {
				let delta = match delta {
					BlockDelta::Text { text } => a::ContentBlockDelta::TextDelta { text: text.clone() },
					BlockDelta::ToolUseArguments { partial_json } => {
						a::ContentBlockDelta::InputJsonDelta { partial_json: partial_json.clone() }
					},
					BlockDelta::Thinking { text } => a::ContentBlockDelta::ThinkingDelta { thinking: text.clone() },
					BlockDelta::Signature { signature } => a::ContentBlockDelta::SignatureDelta { signature: signature.clone() },
				};
				out.push(a::StreamEvent::ContentBlockDelta { index: *index, delta });
			},
			CanonicalEvent::BlockComplete { index, .. } => {
				out.push(a::StreamEvent::ContentBlockStop { index: *index });
			},
			CanonicalEvent::FinishReason(reason) => {
				self.pending_stop_reason = Some(convert::canonical_finish_to_anthropic(*reason));
			},
			CanonicalEvent::StreamClosed => {
				out.extend(self.finalize());
			},
			CanonicalEvent::Error { message } => {
				out.push(a::StreamEvent::Error {
					error: a::ErrorDetail { r#type: "overloaded_error".to_string(), message: message.clone() },
				});
			},
		}
		out
	}

	/// `message_delta` (carrying `stop_reason`) then `message_stop`, always
	/// emitted before the stream closes — this is the signal downstream
	/// clients key off, per §4.3.
	fn finalize(&mut self) -> Vec<a::StreamEvent> {
		if self.sent_message_stop {
			return vec![];
		}
		self.sent_message_stop = true;
		let stop_reason = self.pending_stop_reason.unwrap_or(a::StopReason::EndTurn);
		vec![
			a::StreamEvent::MessageDelta {
				delta: a::MessageDelta { stop_reason: Some(stop_reason), stop_sequence: None },
				usage: a::MessageDeltaUsage::default(),
			},
			a::StreamEvent::MessageStop,
		]
	}
}

fn initial_response_block(block: &ContentBlock) -> a::ResponseContentBlock {
	match block {
		ContentBlock::Text { .. } => a::ResponseContentBlock::Text { text: String::new() },
		ContentBlock::ToolUse { id, name, .. } => a::ResponseContentBlock::ToolUse {
			id: id.clone(),
			name: name.clone(),
			input: serde_json::Value::Object(Default::default()),
		},
		ContentBlock::Thinking { .. } => a::ResponseContentBlock::Thinking { thinking: String::new(), signature: None },
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::FinishReason;

	#[test]
	fn openai_encoder_emits_done_sequence_for_text() {
		let mut enc = OpenAiEncoder::new("id1", "gpt-4", 0);
		let started = ContentBlock::Text { index: 0, text: String::new(), complete: false };
		let mut chunks = enc.encode(&CanonicalEvent::BlockStarted { index: 0, initial: started });
		chunks.extend(enc.encode(&CanonicalEvent::Delta { index: 0, delta: BlockDelta::Text { text: "hi".into() } }));
		chunks.extend(enc.encode(&CanonicalEvent::FinishReason(FinishReason::Stop)));
		assert_eq!(chunks.last().unwrap().choices[0].finish_reason.as_deref(), Some("stop"));
		let frame = format_openai_chunk(&chunks[0]);
		assert!(frame.starts_with("data: "));
		assert!(frame.ends_with("\n\n"));
	}

	#[test]
	fn anthropic_encoder_always_sends_message_delta_before_stop() {
		let mut enc = AnthropicEncoder::new("msg_1", "claude-3");
		let mut events = enc.encode(&CanonicalEvent::FinishReason(FinishReason::Stop));
		events.extend(enc.encode(&CanonicalEvent::StreamClosed));
		let kinds: Vec<_> = events.iter().map(|e| e.event_name()).collect();
		assert_eq!(kinds, vec!["message_start", "message_delta", "message_stop"]);
	}
}
