//! OpenAI ↔ Anthropic conversion (§4.2, §9). Used by the upstream client
//! when the configured upstream speaks a different wire format than the
//! client (§4.2: "the upstream client is responsible for conversion in both
//! directions and the driver sees only the client-native format").
//!
//! Cross-message block correlation (assistant `tool_calls` ↔ `tool_use` plus
//! a later `tool_result` in a user message) needs no id-to-origin table
//! (§9): both wire formats already carry the matching id inline on the
//! block that answers it, so a single linear pass re-uses it directly. We
//! never model the conversation as a graph.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::anthropic::{self as a, MessageContent, RequestContentBlock, ResponseContentBlock};
use crate::types::openai::{self as o, Content, ContentPart};
use crate::types::FinishReason;

pub fn openai_finish_to_canonical(reason: &str) -> Option<FinishReason> {
	match reason {
		"stop" => Some(FinishReason::Stop),
		"length" => Some(FinishReason::MaxTokens),
		"tool_calls" => Some(FinishReason::ToolUse),
		"content_filter" => Some(FinishReason::ContentFilter),
		_ => None,
	}
}

pub fn canonical_finish_to_openai(reason: FinishReason) -> &'static str {
	match reason {
		FinishReason::Stop => "stop",
		FinishReason::MaxTokens => "length",
		FinishReason::ToolUse => "tool_calls",
		FinishReason::ContentFilter => "content_filter",
	}
}

pub fn anthropic_finish_to_canonical(reason: a::StopReason) -> FinishReason {
	match reason {
		a::StopReason::EndTurn => FinishReason::Stop,
		a::StopReason::MaxTokens => FinishReason::MaxTokens,
		a::StopReason::ToolUse => FinishReason::ToolUse,
		// No custom-stop-sequence concept on the OpenAI side; treat as a
		// natural stop, same as `end_turn`.
		a::StopReason::StopSequence => FinishReason::Stop,
		a::StopReason::ContentFilter => FinishReason::ContentFilter,
	}
}

pub fn canonical_finish_to_anthropic(reason: FinishReason) -> a::StopReason {
	match reason {
		FinishReason::Stop => a::StopReason::EndTurn,
		FinishReason::MaxTokens => a::StopReason::MaxTokens,
		FinishReason::ToolUse => a::StopReason::ToolUse,
		FinishReason::ContentFilter => a::StopReason::ContentFilter,
	}
}

/// Converts an OpenAI chat-completions request into an Anthropic messages
/// request.
pub fn openai_request_to_anthropic(req: &o::ChatCompletionRequest) -> a::MessagesRequest {
	let system_text = req
		.messages
		.iter()
		.filter(|m| m.role == o::Role::System)
		.filter_map(|m| m.text())
		.collect::<Vec<_>>()
		.join("\n");

	let mut messages = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != o::Role::System) {
		match msg.role {
			o::Role::User => messages.push(a::Message {
				role: a::Role::User,
				content: MessageContent::from_blocks(openai_user_content_to_blocks(msg)),
			}),
			o::Role::Assistant => {
				let mut blocks = Vec::new();
				if let Some(text) = msg.text() {
					if !text.is_empty() {
						blocks.push(RequestContentBlock::Text { text });
					}
				}
				for tc in msg.tool_calls.iter().flatten() {
					let input: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
					blocks.push(RequestContentBlock::ToolUse {
						id: tc.id.clone(),
						name: tc.function.name.clone(),
						input,
					});
				}
				messages.push(a::Message {
					role: a::Role::Assistant,
					content: MessageContent::from_blocks(blocks),
				});
			},
			o::Role::Tool => {
				// OpenAI tool-result messages become a `tool_result` block
				// in a *user* message on the Anthropic side (§4.2).
				let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
				let content = msg.text().map(a::ToolResultContent::Text);
				messages.push(a::Message {
					role: a::Role::User,
					content: MessageContent::Blocks(vec![RequestContentBlock::ToolResult {
						tool_use_id,
						content,
						is_error: None,
					}]),
				});
			},
			o::Role::System => unreachable!("filtered above"),
		}
	}

	a::MessagesRequest {
		model: req.model.clone(),
		messages,
		max_tokens: req.max_tokens.or(req.max_completion_tokens).unwrap_or(4096),
		system: (!system_text.is_empty()).then_some(a::SystemPrompt::Text(system_text)),
		tools: req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|t| a::Tool {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					input_schema: t.function.parameters.clone().unwrap_or(Value::Object(Default::default())),
				})
				.collect()
		}),
		tool_choice: req.tool_choice.clone(),
		stream: req.stream,
		temperature: req.temperature,
		top_p: req.top_p,
		thinking: None,
		stop_sequences: None,
		metadata: req.metadata.clone(),
		extra: Default::default(),
	}
}

fn openai_user_content_to_blocks(msg: &o::Message) -> Vec<RequestContentBlock> {
	match &msg.content {
		Some(Content::Text(t)) => vec![RequestContentBlock::Text { text: t.clone() }],
		Some(Content::Parts(parts)) => parts
			.iter()
			.filter_map(|p| match p {
				ContentPart::Text { text } => Some(RequestContentBlock::Text { text: text.clone() }),
				ContentPart::ImageUrl { image_url } => Some(RequestContentBlock::Image {
					source: a::ImageSource {
						r#type: "url".to_string(),
						media_type: None,
						data: None,
						url: Some(image_url.url.clone()),
					},
				}),
				ContentPart::Other => None,
			})
			.collect(),
		None => vec![],
	}
}

/// Converts an Anthropic messages request into an OpenAI chat-completions
/// request. A single pass over `req.messages`: each `tool_result` block
/// already carries the `tool_use_id` it answers inline, so it folds directly
/// into a standalone `tool`-role message with that id as `tool_call_id` —
/// no separate id-table pass is needed to correlate it back to the
/// assistant message that produced it (§9).
pub fn anthropic_request_to_openai(req: &a::MessagesRequest) -> o::ChatCompletionRequest {
	let mut messages = Vec::new();
	if let Some(system) = &req.system {
		let text = system.joined();
		if !text.is_empty() {
			messages.push(o::Message {
				role: o::Role::System,
				content: Some(Content::Text(text)),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			});
		}
	}

	for msg in &req.messages {
		let blocks = msg.content.as_blocks();
		match msg.role {
			a::Role::User => {
				// A user message may carry ordinary content, tool_result
				// blocks (correlated back to the preceding assistant
				// tool_calls), or both.
				let tool_results: Vec<_> = blocks
					.iter()
					.filter_map(|b| match b {
						RequestContentBlock::ToolResult {
							tool_use_id, content, ..
						} => Some((tool_use_id.clone(), tool_result_text(content))),
						_ => None,
					})
					.collect();
				for (tool_use_id, text) in tool_results {
					messages.push(o::Message {
						role: o::Role::Tool,
						content: Some(Content::Text(text)),
						name: None,
						tool_calls: None,
						tool_call_id: Some(tool_use_id),
					});
				}
				let text_parts: Vec<_> = blocks
					.iter()
					.filter_map(|b| match b {
						RequestContentBlock::Text { text } => Some(text.clone()),
						_ => None,
					})
					.collect();
				if !text_parts.is_empty() {
					messages.push(o::Message {
						role: o::Role::User,
						content: Some(Content::Text(text_parts.join(""))),
						name: None,
						tool_calls: None,
						tool_call_id: None,
					});
				}
			},
			a::Role::Assistant => {
				let text_parts: Vec<_> = blocks
					.iter()
					.filter_map(|b| match b {
						RequestContentBlock::Text { text } => Some(text.clone()),
						_ => None,
					})
					.collect();
				let tool_calls: Vec<_> = blocks
					.iter()
					.filter_map(|b| match b {
						RequestContentBlock::ToolUse { id, name, input } => Some(o::ToolCall {
							id: id.clone(),
							r#type: Some("function".to_string()),
							function: o::FunctionCall {
								name: name.clone(),
								arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
							},
						}),
						_ => None,
					})
					.collect();
				messages.push(o::Message {
					role: o::Role::Assistant,
					content: (!text_parts.is_empty()).then(|| Content::Text(text_parts.join(""))),
					name: None,
					tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
					tool_call_id: None,
				});
			},
		}
	}

	o::ChatCompletionRequest {
		model: req.model.clone(),
		messages,
		tools: req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|t| o::Tool {
					r#type: "function".to_string(),
					function: o::FunctionDef {
						name: t.name.clone(),
						description: t.description.clone(),
						parameters: Some(t.input_schema.clone()),
					},
				})
				.collect()
		}),
		tool_choice: req.tool_choice.clone(),
		stream: req.stream,
		stream_options: None,
		temperature: req.temperature,
		top_p: req.top_p,
		max_tokens: Some(req.max_tokens),
		max_completion_tokens: None,
		n: None,
		stop: req.stop_sequences.clone().map(|s| Value::from(s)),
		user: None,
		metadata: req.metadata.clone(),
		extra: Default::default(),
	}
}

fn tool_result_text(content: &Option<a::ToolResultContent>) -> String {
	match content {
		Some(a::ToolResultContent::Text(t)) => t.clone(),
		Some(a::ToolResultContent::Blocks(blocks)) => blocks
			.iter()
			.filter_map(|b| match b {
				RequestContentBlock::Text { text } => Some(text.clone()),
				_ => None,
			})
			.collect::<Vec<_>>()
			.join(""),
		None => String::new(),
	}
}

pub fn anthropic_response_to_openai(resp: &a::MessagesResponse) -> o::ChatCompletionResponse {
	let mut text = String::new();
	let mut tool_calls = Vec::new();
	for block in &resp.content {
		match block {
			ResponseContentBlock::Text { text: t } => text.push_str(t),
			ResponseContentBlock::ToolUse { id, name, input } => tool_calls.push(o::ToolCall {
				id: id.clone(),
				r#type: Some("function".to_string()),
				function: o::FunctionCall {
					name: name.clone(),
					arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
				},
			}),
			ResponseContentBlock::Thinking { .. } | ResponseContentBlock::Other => {},
		}
	}
	let finish_reason = resp
		.stop_reason
		.map(|r| canonical_finish_to_openai(anthropic_finish_to_canonical(r)).to_string());
	o::ChatCompletionResponse {
		id: resp.id.clone(),
		object: "chat.completion".to_string(),
		created: chrono::Utc::now().timestamp(),
		model: resp.model.clone(),
		choices: vec![o::Choice {
			index: 0,
			message: o::Message {
				role: o::Role::Assistant,
				content: (!text.is_empty()).then_some(Content::Text(text)),
				name: None,
				tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
				tool_call_id: None,
			},
			finish_reason,
		}],
		usage: Some(o::Usage {
			prompt_tokens: resp.usage.input_tokens as u32,
			completion_tokens: resp.usage.output_tokens as u32,
			total_tokens: (resp.usage.input_tokens + resp.usage.output_tokens) as u32,
		}),
		extra: BTreeMap::new(),
	}
}

pub fn openai_response_to_anthropic(resp: &o::ChatCompletionResponse) -> a::MessagesResponse {
	let choice = resp.choices.first();
	let mut content = Vec::new();
	if let Some(choice) = choice {
		if let Some(text) = choice.message.text() {
			content.push(ResponseContentBlock::Text { text });
		}
		for tc in choice.message.tool_calls.iter().flatten() {
			let input: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
			content.push(ResponseContentBlock::ToolUse {
				id: tc.id.clone(),
				name: tc.function.name.clone(),
				input,
			});
		}
	}
	let stop_reason = choice
		.and_then(|c| c.finish_reason.as_deref())
		.and_then(openai_finish_to_canonical)
		.map(canonical_finish_to_anthropic);
	let usage = resp.usage.unwrap_or_default();
	a::MessagesResponse {
		id: resp.id.clone(),
		r#type: "message".to_string(),
		role: a::Role::Assistant,
		model: resp.model.clone(),
		content,
		stop_reason,
		stop_sequence: None,
		usage: a::Usage {
			input_tokens: usage.prompt_tokens as u64,
			output_tokens: usage.completion_tokens as u64,
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::openai::{ChatCompletionRequest, Message, Role};

	fn minimal_openai_request(messages: Vec<Message>) -> ChatCompletionRequest {
		ChatCompletionRequest {
			model: "gpt-4".into(),
			messages,
			tools: None,
			tool_choice: None,
			stream: None,
			stream_options: None,
			temperature: None,
			top_p: None,
			max_tokens: None,
			max_completion_tokens: None,
			n: None,
			stop: None,
			user: None,
			metadata: None,
			extra: Default::default(),
		}
	}

	#[test]
	fn finish_reason_round_trips() {
		for r in [FinishReason::Stop, FinishReason::MaxTokens, FinishReason::ToolUse, FinishReason::ContentFilter] {
			let openai = canonical_finish_to_openai(r);
			assert_eq!(openai_finish_to_canonical(openai), Some(r));
		}
	}

	#[test]
	fn system_messages_join_into_anthropic_system_field() {
		let req = minimal_openai_request(vec![
			Message {
				role: Role::System,
				content: Some(Content::Text("be nice".into())),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
			Message {
				role: Role::System,
				content: Some(Content::Text("be brief".into())),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
			Message {
				role: Role::User,
				content: Some(Content::Text("hi".into())),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
		]);
		let anthropic = openai_request_to_anthropic(&req);
		assert_eq!(anthropic.system.unwrap().joined(), "be nice\nbe brief");
		assert_eq!(anthropic.messages.len(), 1);
	}

	#[test]
	fn tool_call_id_correspondence_round_trips() {
		let req = minimal_openai_request(vec![
			Message {
				role: Role::User,
				content: Some(Content::Text("run tool".into())),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
			Message {
				role: Role::Assistant,
				content: None,
				name: None,
				tool_calls: Some(vec![o::ToolCall {
					id: "call_1".into(),
					r#type: Some("function".into()),
					function: o::FunctionCall {
						name: "lookup".into(),
						arguments: "{\"q\":\"x\"}".into(),
					},
				}]),
				tool_call_id: None,
			},
			Message {
				role: Role::Tool,
				content: Some(Content::Text("result".into())),
				name: None,
				tool_calls: None,
				tool_call_id: Some("call_1".into()),
			},
		]);
		let anthropic = openai_request_to_anthropic(&req);
		let back = anthropic_request_to_openai(&anthropic);
		let tool_msg = back.messages.iter().find(|m| m.role == Role::Tool).unwrap();
		assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
		let assistant_msg = back.messages.iter().find(|m| m.role == Role::Assistant).unwrap();
		assert_eq!(
			assistant_msg.tool_calls.as_ref().unwrap()[0].id,
			"call_1"
		);
	}
}
