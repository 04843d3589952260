//! Pre-flight request sanitizers (§4.2). Applied before every upstream call;
//! never changes semantic intent. Each sanitizer is idempotent —
//! `Sanitize(Sanitize(x)) = Sanitize(x)` (§8) — since re-running a fixed-point
//! transform over already-clean input is a no-op.

use std::collections::HashSet;

use crate::types::anthropic::{MessageContent, RequestContentBlock};
use crate::types::openai::Content;
use crate::types::{WireRequest, openai};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sanitizer {
	DropEmptyText,
	PruneOrphanToolResults,
	DedupeTools,
}

impl Sanitizer {
	pub const ALL: [Sanitizer; 3] = [
		Sanitizer::DropEmptyText,
		Sanitizer::PruneOrphanToolResults,
		Sanitizer::DedupeTools,
	];

	/// Stable name for observability payloads (`pipeline.auto_fix`, §3).
	pub fn name(&self) -> &'static str {
		match self {
			Sanitizer::DropEmptyText => "drop_empty_text",
			Sanitizer::PruneOrphanToolResults => "prune_orphan_tool_results",
			Sanitizer::DedupeTools => "dedupe_tools",
		}
	}

	/// Maps a known upstream bad-request error message to the sanitizer that
	/// fixes it (§4.2 "Retry-with-fix"). Context-overflow errors are
	/// deliberately absent — they are never auto-fixed (§4.2, §7).
	pub fn for_error_text(text: &str) -> Option<Sanitizer> {
		let lower = text.to_lowercase();
		if lower.contains("empty text") || lower.contains("text content blocks must be non-empty") {
			Some(Sanitizer::DropEmptyText)
		} else if lower.contains("tool_result") && lower.contains("tool_use") {
			Some(Sanitizer::PruneOrphanToolResults)
		} else if lower.contains("tool") && lower.contains("duplicate") {
			Some(Sanitizer::DedupeTools)
		} else {
			None
		}
	}
}

/// Applies every sanitizer once, in a fixed order, returning which of them
/// actually changed the request (used for the passthrough-fallback
/// `original != final` check, §4.1).
pub fn sanitize_all(req: &mut WireRequest) -> Vec<Sanitizer> {
	Sanitizer::ALL
		.into_iter()
		.filter(|s| apply(req, *s))
		.collect()
}

/// Applies a single named sanitizer (used by the retry-with-fix path, which
/// only wants to re-run the sanitizer matching the upstream's error).
pub fn apply(req: &mut WireRequest, sanitizer: Sanitizer) -> bool {
	match sanitizer {
		Sanitizer::DropEmptyText => drop_empty_text(req),
		Sanitizer::PruneOrphanToolResults => prune_orphan_tool_results(req),
		Sanitizer::DedupeTools => dedupe_tools(req),
	}
}

fn drop_empty_text(req: &mut WireRequest) -> bool {
	let mut changed = false;
	match req {
		WireRequest::OpenAi(r) => {
			r.messages.retain_mut(|m| {
				if let Some(Content::Parts(parts)) = &mut m.content {
					let before = parts.len();
					let tool_calls_present = m.tool_calls.as_ref().is_some_and(|t| !t.is_empty());
					let filtered: Vec<_> = parts
						.drain(..)
						.filter(|p| !matches!(p, openai::ContentPart::Text { text } if text.trim().is_empty()))
						.collect();
					if filtered.is_empty() && !tool_calls_present && before > 0 {
						changed = true;
						return false; // message becomes empty: drop it entirely
					}
					if filtered.len() != before {
						changed = true;
					}
					*parts = filtered;
				}
				if m.is_effectively_empty() {
					changed = true;
					return false;
				}
				true
			});
		},
		WireRequest::Anthropic(r) => {
			r.messages.retain_mut(|m| {
				let blocks = m.content.as_blocks();
				let tool_calls_present = blocks.iter().any(|b| matches!(b, RequestContentBlock::ToolUse { .. }));
				let before = blocks.len();
				let filtered: Vec<_> = blocks.into_iter().filter(|b| !b.is_text_empty()).collect();
				if filtered.is_empty() && !tool_calls_present && before > 0 {
					changed = true;
					return false;
				}
				if filtered.len() != before {
					changed = true;
				}
				m.content = MessageContent::from_blocks(filtered);
				true
			});
		},
	}
	changed
}

fn prune_orphan_tool_results(req: &mut WireRequest) -> bool {
	let mut changed = false;
	match req {
		WireRequest::OpenAi(r) => {
			let known_ids: HashSet<String> = r
				.messages
				.iter()
				.filter_map(|m| m.tool_calls.as_ref())
				.flatten()
				.map(|tc| tc.id.clone())
				.collect();
			r.messages.retain(|m| {
				let keep = match (&m.role, &m.tool_call_id) {
					(openai::Role::Tool, Some(id)) => known_ids.contains(id),
					_ => true,
				};
				if !keep {
					changed = true;
				}
				keep
			});
		},
		WireRequest::Anthropic(r) => {
			let known_ids: HashSet<String> = r
				.messages
				.iter()
				.flat_map(|m| m.content.as_blocks())
				.filter_map(|b| b.tool_use_id().map(str::to_string))
				.collect();
			r.messages.retain_mut(|m| {
				let blocks = m.content.as_blocks();
				let before = blocks.len();
				let tool_use_present = blocks.iter().any(|b| matches!(b, RequestContentBlock::ToolUse { .. }));
				let filtered: Vec<_> = blocks
					.into_iter()
					.filter(|b| match b.tool_result_id() {
						Some(id) => known_ids.contains(id),
						None => true,
					})
					.collect();
				if filtered.is_empty() && !tool_use_present && before > 0 {
					changed = true;
					return false;
				}
				if filtered.len() != before {
					changed = true;
				}
				m.content = MessageContent::from_blocks(filtered);
				true
			});
		},
	}
	changed
}

fn dedupe_tools(req: &mut WireRequest) -> bool {
	let mut changed = false;
	match req {
		WireRequest::OpenAi(r) => {
			if let Some(tools) = &mut r.tools {
				let mut seen = HashSet::new();
				let before = tools.len();
				tools.retain(|t| seen.insert(t.function.name.clone()));
				changed = tools.len() != before;
			}
		},
		WireRequest::Anthropic(r) => {
			if let Some(tools) = &mut r.tools {
				let mut seen = HashSet::new();
				let before = tools.len();
				tools.retain(|t| seen.insert(t.name.clone()));
				changed = tools.len() != before;
			}
		},
	}
	changed
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use test_case::test_case;

	use super::*;
	use crate::types::anthropic::{Message as AMessage, MessagesRequest, Role as ARole, Tool as ATool};
	use crate::types::openai::{ChatCompletionRequest, FunctionDef, Message as OMessage, Role as ORole, Tool as OTool};

	fn openai_req(messages: Vec<OMessage>) -> WireRequest {
		WireRequest::OpenAi(Box::new(ChatCompletionRequest {
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
		}))
	}

	fn anthropic_req(messages: Vec<AMessage>) -> WireRequest {
		WireRequest::Anthropic(Box::new(MessagesRequest {
			model: "claude-3".into(),
			messages,
			max_tokens: 1024,
			system: None,
			tools: None,
			tool_choice: None,
			stream: None,
			temperature: None,
			top_p: None,
			thinking: None,
			stop_sequences: None,
			metadata: None,
			extra: Default::default(),
		}))
	}

	#[test]
	fn drops_empty_text_parts_but_keeps_message_with_other_content() {
		let mut req = openai_req(vec![OMessage {
			role: ORole::User,
			content: Some(Content::Parts(vec![
				openai::ContentPart::Text { text: "  ".into() },
				openai::ContentPart::Text { text: "hi".into() },
			])),
			name: None,
			tool_calls: None,
			tool_call_id: None,
		}]);
		assert!(drop_empty_text(&mut req));
		let WireRequest::OpenAi(r) = &req else { unreachable!() };
		assert_eq!(r.messages.len(), 1);
	}

	#[test]
	fn drops_message_that_becomes_entirely_empty() {
		let mut req = openai_req(vec![OMessage {
			role: ORole::User,
			content: Some(Content::Parts(vec![openai::ContentPart::Text { text: "   ".into() }])),
			name: None,
			tool_calls: None,
			tool_call_id: None,
		}]);
		assert!(drop_empty_text(&mut req));
		let WireRequest::OpenAi(r) = &req else { unreachable!() };
		assert!(r.messages.is_empty());
	}

	#[test]
	fn prunes_orphan_tool_result_in_anthropic() {
		let mut req = anthropic_req(vec![AMessage {
			role: ARole::User,
			content: MessageContent::Blocks(vec![
				RequestContentBlock::ToolResult {
					tool_use_id: "missing".into(),
					content: None,
					is_error: None,
				},
				RequestContentBlock::Text { text: "hello".into() },
			]),
		}]);
		assert!(prune_orphan_tool_results(&mut req));
		let WireRequest::Anthropic(r) = &req else { unreachable!() };
		assert_eq!(r.messages[0].content.as_blocks().len(), 1);
	}

	#[test]
	fn dedupes_tools_by_name_keeping_first() {
		let mut req = openai_req(vec![]);
		let WireRequest::OpenAi(r) = &mut req else { unreachable!() };
		r.tools = Some(vec![
			OTool {
				r#type: "function".into(),
				function: FunctionDef {
					name: "search".into(),
					description: Some("first".into()),
					parameters: Some(json!({})),
				},
			},
			OTool {
				r#type: "function".into(),
				function: FunctionDef {
					name: "search".into(),
					description: Some("second".into()),
					parameters: Some(json!({})),
				},
			},
		]);
		assert!(dedupe_tools(&mut req));
		let WireRequest::OpenAi(r) = &req else { unreachable!() };
		assert_eq!(r.tools.as_ref().unwrap().len(), 1);
		assert_eq!(r.tools.as_ref().unwrap()[0].function.description.as_deref(), Some("first"));
	}

	#[test_case(Sanitizer::DropEmptyText)]
	#[test_case(Sanitizer::PruneOrphanToolResults)]
	#[test_case(Sanitizer::DedupeTools)]
	fn sanitizers_are_idempotent(sanitizer: Sanitizer) {
		let mut req = anthropic_req(vec![AMessage {
			role: ARole::User,
			content: MessageContent::Blocks(vec![
				RequestContentBlock::Text { text: "".into() },
				RequestContentBlock::ToolResult {
					tool_use_id: "orphan".into(),
					content: None,
					is_error: None,
				},
				RequestContentBlock::Text { text: "kept".into() },
			]),
		}]);
		let WireRequest::Anthropic(r) = &mut req else { unreachable!() };
		r.tools = Some(vec![
			ATool { name: "a".into(), description: None, input_schema: json!({}) },
			ATool { name: "a".into(), description: None, input_schema: json!({}) },
		]);
		apply(&mut req, sanitizer);
		let once = format!("{:?}", req_fingerprint(&req));
		apply(&mut req, sanitizer);
		let twice = format!("{:?}", req_fingerprint(&req));
		assert_eq!(once, twice);
	}

	fn req_fingerprint(req: &WireRequest) -> String {
		match req {
			WireRequest::OpenAi(r) => serde_json::to_string(r).unwrap(),
			WireRequest::Anthropic(r) => serde_json::to_string(r).unwrap(),
		}
	}
}
