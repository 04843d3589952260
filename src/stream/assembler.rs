//! The inbound stream assembler (§4.3): folds wire-native deltas into the
//! canonical event sequence and maintains `StreamState` so a policy may query
//! "which block just completed" at any hook. Ordering matches upstream
//! arrival; the assembler never reorders (§4.3 "Ordering").

use std::collections::HashMap;

use crate::convert;
use crate::types::anthropic as a;
use crate::types::canonical::{BlockDelta, CanonicalEvent, ContentBlock, StreamState};
use crate::types::openai as o;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OpenAiLocalKey {
	Text,
	Tool(u32),
}

/// Folds an OpenAI `chat.completion.chunk` delta stream into canonical
/// events. OpenAI chunks carry a flat `delta` with no explicit "this is a new
/// block" marker, so the assembler infers block boundaries from index
/// changes and from `finish_reason` arriving (§4.3).
pub struct OpenAiAssembler {
	state: StreamState,
	started: bool,
	local_to_canonical: HashMap<OpenAiLocalKey, usize>,
	next_index: usize,
	active: Option<usize>,
	closed: bool,
}

impl OpenAiAssembler {
	pub fn new(max_raw_chunks: usize) -> Self {
		Self {
			state: StreamState::new(max_raw_chunks),
			started: false,
			local_to_canonical: HashMap::new(),
			next_index: 0,
			active: None,
			closed: false,
		}
	}

	pub fn state(&self) -> &StreamState {
		&self.state
	}

	fn canonical_index(&mut self, key: OpenAiLocalKey) -> (usize, bool) {
		if let Some(idx) = self.local_to_canonical.get(&key) {
			(*idx, false)
		} else {
			let idx = self.next_index;
			self.next_index += 1;
			self.local_to_canonical.insert(key, idx);
			(idx, true)
		}
	}

	/// Closes out whichever block is currently active, emitting
	/// `BlockComplete` for it, if one is open.
	fn close_active(&mut self, events: &mut Vec<CanonicalEvent>) {
		if let Some(idx) = self.active.take() {
			if let Some(block) = self.state.block(idx).cloned() {
				if !block.is_complete() {
					let mut completed = block.clone();
					completed.mark_complete();
					debug_assert!(completed.is_well_formed(), "tool-use block completed without id/name");
					let event = CanonicalEvent::BlockComplete { index: idx, block };
					self.state.apply(&event);
					events.push(event);
				}
			}
		}
	}

	pub fn feed(&mut self, chunk: &o::ChatCompletionChunk) -> Vec<CanonicalEvent> {
		let mut events = Vec::new();
		self.state.record_raw(serde_json::to_value(chunk).unwrap_or_default());
		if !self.started {
			self.started = true;
			events.push(CanonicalEvent::StreamStarted);
		}

		let Some(choice) = chunk.choices.first() else {
			return events;
		};

		if let Some(content) = &choice.delta.content {
			let (idx, is_new) = self.canonical_index(OpenAiLocalKey::Text);
			if self.active != Some(idx) {
				self.close_active(&mut events);
			}
			if is_new {
				let initial = ContentBlock::Text {
					index: idx,
					text: String::new(),
					complete: false,
				};
				let event = CanonicalEvent::BlockStarted { index: idx, initial };
				self.state.apply(&event);
				events.push(event);
			}
			let event = CanonicalEvent::Delta {
				index: idx,
				delta: BlockDelta::Text { text: content.clone() },
			};
			self.state.apply(&event);
			events.push(event);
			self.active = Some(idx);
		}

		for tc in choice.delta.tool_calls.iter().flatten() {
			let (idx, is_new) = self.canonical_index(OpenAiLocalKey::Tool(tc.index));
			if self.active != Some(idx) {
				self.close_active(&mut events);
			}
			if is_new {
				let initial = ContentBlock::ToolUse {
					index: idx,
					id: tc.id.clone().unwrap_or_default(),
					name: tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default(),
					arguments: String::new(),
					complete: false,
				};
				let event = CanonicalEvent::BlockStarted { index: idx, initial };
				self.state.apply(&event);
				events.push(event);
			}
			if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.clone()) {
				let event = CanonicalEvent::Delta {
					index: idx,
					delta: BlockDelta::ToolUseArguments { partial_json: args },
				};
				self.state.apply(&event);
				events.push(event);
			}
			self.active = Some(idx);
		}

		if let Some(reason) = &choice.finish_reason {
			self.close_active(&mut events);
			if let Some(canonical) = convert::openai_finish_to_canonical(reason) {
				let event = CanonicalEvent::FinishReason(canonical);
				self.state.apply(&event);
				events.push(event);
			}
		}

		events
	}

	/// Emitted once the upstream body ends (the `[DONE]` sentinel, or the
	/// body closing without one). Always produced, even on error or cancel
	/// (§4.3 "`stream_closed` (always emitted...)").
	pub fn close(&mut self) -> Vec<CanonicalEvent> {
		if self.closed {
			return vec![];
		}
		self.closed = true;
		let mut events = Vec::new();
		self.close_active(&mut events);
		events.push(CanonicalEvent::StreamClosed);
		self.state.apply(&CanonicalEvent::StreamClosed);
		events
	}
}

/// Folds Anthropic SSE events into canonical events. This direction is
/// nearly one-to-one (§4.3).
pub struct AnthropicAssembler {
	state: StreamState,
	closed: bool,
}

impl AnthropicAssembler {
	pub fn new(max_raw_chunks: usize) -> Self {
		Self {
			state: StreamState::new(max_raw_chunks),
			closed: false,
		}
	}

	pub fn state(&self) -> &StreamState {
		&self.state
	}

	pub fn feed(&mut self, event: &a::StreamEvent) -> Vec<CanonicalEvent> {
		self.state.record_raw(serde_json::to_value(event).unwrap_or_default());
		let mut out = Vec::new();
		match event {
			a::StreamEvent::MessageStart { .. } => out.push(CanonicalEvent::StreamStarted),
			a::StreamEvent::ContentBlockStart { index, content_block } => {
				let initial = response_block_to_canonical(*index, content_block);
				out.push(CanonicalEvent::BlockStarted { index: *index, initial });
			},
			a::StreamEvent::ContentBlockDelta { index, delta } => {
				let delta = match delta {
					a::ContentBlockDelta::TextDelta { text } => BlockDelta::Text { text: text.clone() },
					a::ContentBlockDelta::InputJsonDelta { partial_json } => {
						BlockDelta::ToolUseArguments { partial_json: partial_json.clone() }
					},
					a::ContentBlockDelta::ThinkingDelta { thinking } => BlockDelta::Thinking { text: thinking.clone() },
					a::ContentBlockDelta::SignatureDelta { signature } => {
						BlockDelta::Signature { signature: signature.clone() }
					},
				};
				out.push(CanonicalEvent::Delta { index: *index, delta });
			},
			a::StreamEvent::ContentBlockStop { index } => {
				if let Some(block) = self.state.block(*index).cloned() {
					out.push(CanonicalEvent::BlockComplete { index: *index, block });
				}
			},
			a::StreamEvent::MessageDelta { delta, .. } => {
				if let Some(reason) = delta.stop_reason {
					out.push(CanonicalEvent::FinishReason(convert::anthropic_finish_to_canonical(reason)));
				}
			},
			a::StreamEvent::MessageStop => {
				if !self.closed {
					self.closed = true;
					out.push(CanonicalEvent::StreamClosed);
				}
			},
			a::StreamEvent::Ping => {},
			a::StreamEvent::Error { error } => out.push(CanonicalEvent::Error { message: error.message.clone() }),
		}
		for event in &out {
			self.state.apply(event);
		}
		out
	}

	pub fn close(&mut self) -> Vec<CanonicalEvent> {
		if self.closed {
			return vec![];
		}
		self.closed = true;
		self.state.apply(&CanonicalEvent::StreamClosed);
		vec![CanonicalEvent::StreamClosed]
	}
}

fn response_block_to_canonical(index: usize, block: &a::ResponseContentBlock) -> ContentBlock {
	match block {
		a::ResponseContentBlock::Text { text } => ContentBlock::Text {
			index,
			text: text.clone(),
			complete: false,
		},
		a::ResponseContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
			index,
			id: id.clone(),
			name: name.clone(),
			arguments: if input.is_null() { String::new() } else { input.to_string() },
			complete: false,
		},
		a::ResponseContentBlock::Thinking { thinking, signature } => ContentBlock::Thinking {
			index,
			text: thinking.clone(),
			signature: signature.clone(),
			complete: false,
		},
		a::ResponseContentBlock::Other => ContentBlock::Text {
			index,
			text: String::new(),
			complete: false,
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::FinishReason;

	#[test]
	fn openai_text_then_finish_produces_dense_blocks() {
		let mut assembler = OpenAiAssembler::new(16);
		let mut events = Vec::new();
		for text in ["a", "b", "c"] {
			events.extend(assembler.feed(&o::ChatCompletionChunk {
				id: "1".into(),
				object: "chat.completion.chunk".into(),
				created: 0,
				model: "m".into(),
				choices: vec![o::ChunkChoice {
					index: 0,
					delta: o::Delta {
						content: Some(text.to_string()),
						..Default::default()
					},
					finish_reason: None,
				}],
				usage: None,
			}));
		}
		events.extend(assembler.feed(&o::ChatCompletionChunk {
			id: "1".into(),
			object: "chat.completion.chunk".into(),
			created: 0,
			model: "m".into(),
			choices: vec![o::ChunkChoice {
				index: 0,
				delta: o::Delta::default(),
				finish_reason: Some("stop".to_string()),
			}],
			usage: None,
		}));
		events.extend(assembler.close());

		assert!(assembler.state().indices_are_dense());
		let block = assembler.state().block(0).unwrap();
		assert_eq!(block, &ContentBlock::Text { index: 0, text: "abc".to_string(), complete: true });
		assert_eq!(assembler.state().finish_reason, Some(FinishReason::Stop));
		assert!(matches!(events.last(), Some(CanonicalEvent::StreamClosed)));
	}

	#[test]
	fn openai_tool_call_buffers_arguments_across_chunks() {
		let mut assembler = OpenAiAssembler::new(16);
		let start = o::ChatCompletionChunk {
			id: "1".into(),
			object: "chat.completion.chunk".into(),
			created: 0,
			model: "m".into(),
			choices: vec![o::ChunkChoice {
				index: 0,
				delta: o::Delta {
					tool_calls: Some(vec![o::ToolCallDelta {
						index: 0,
						id: Some("call_1".into()),
						r#type: Some("function".into()),
						function: Some(o::FunctionCallDelta {
							name: Some("rm_rf".into()),
							arguments: Some(String::new()),
						}),
					}]),
					..Default::default()
				},
				finish_reason: None,
			}],
			usage: None,
		};
		assembler.feed(&start);
		let frag = o::ChatCompletionChunk {
			choices: vec![o::ChunkChoice {
				index: 0,
				delta: o::Delta {
					tool_calls: Some(vec![o::ToolCallDelta {
						index: 0,
						id: None,
						r#type: None,
						function: Some(o::FunctionCallDelta {
							name: None,
							arguments: Some("{\"path\":\"/\"}".into()),
						}),
					}]),
					..Default::default()
				},
				finish_reason: None,
			}],
			..start.clone()
		};
		assembler.feed(&frag);
		let finish = o::ChatCompletionChunk {
			choices: vec![o::ChunkChoice {
				index: 0,
				delta: o::Delta::default(),
				finish_reason: Some("tool_calls".to_string()),
			}],
			..start.clone()
		};
		assembler.feed(&finish);
		assembler.close();

		let block = assembler.state().block(0).unwrap();
		match block {
			ContentBlock::ToolUse { id, name, arguments, complete, .. } => {
				assert_eq!(id, "call_1");
				assert_eq!(name, "rm_rf");
				assert_eq!(arguments, "{\"path\":\"/\"}");
				assert!(*complete);
			},
			other => panic!("expected tool use block, got {other:?}"),
		}
	}

	#[test]
	fn anthropic_lifecycle_maps_one_to_one() {
		let mut assembler = AnthropicAssembler::new(16);
		assembler.feed(&a::StreamEvent::MessageStart {
			message: a::MessagesResponse {
				id: "msg_1".into(),
				r#type: "message".into(),
				role: a::Role::Assistant,
				model: "claude".into(),
				content: vec![],
				stop_reason: None,
				stop_sequence: None,
				usage: a::Usage::default(),
			},
		});
		assembler.feed(&a::StreamEvent::ContentBlockStart {
			index: 0,
			content_block: a::ResponseContentBlock::Text { text: String::new() },
		});
		for ch in ["a", "b", "c"] {
			assembler.feed(&a::StreamEvent::ContentBlockDelta {
				index: 0,
				delta: a::ContentBlockDelta::TextDelta { text: ch.to_string() },
			});
		}
		assembler.feed(&a::StreamEvent::ContentBlockStop { index: 0 });
		assembler.feed(&a::StreamEvent::MessageDelta {
			delta: a::MessageDelta { stop_reason: Some(a::StopReason::EndTurn), stop_sequence: None },
			usage: a::MessageDeltaUsage::default(),
		});
		assembler.feed(&a::StreamEvent::MessageStop);

		let block = assembler.state().block(0).unwrap();
		assert_eq!(block, &ContentBlock::Text { index: 0, text: "abc".to_string(), complete: true });
		assert_eq!(assembler.state().finish_reason, Some(FinishReason::Stop));
	}
}
