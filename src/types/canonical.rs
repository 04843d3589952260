//! The canonical, wire-format-independent content block and stream event
//! taxonomy that policies reason over (§3, §4.3). Tagged variants rather than
//! inheritance, per the design note in `spec.md` §9 ("polymorphic content
//! blocks") — this keeps the block taxonomy open to new kinds (Anthropic has
//! added `thinking`, `redacted_thinking`) without virtual dispatch.

use serde_json::Value;

use crate::types::FinishReason;

/// The semantic unit a policy reasons over. Built up from many deltas; a
/// block is complete once the upstream signals `content_block_stop`
/// (Anthropic) or the run of deltas for its index ends (OpenAI).
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
	Text {
		index: usize,
		text: String,
		complete: bool,
	},
	ToolUse {
		index: usize,
		id: String,
		name: String,
		/// Accumulated JSON-arguments string. Not guaranteed parseable
		/// until `complete` is true (§3 invariant).
		arguments: String,
		complete: bool,
	},
	Thinking {
		index: usize,
		text: String,
		signature: Option<String>,
		complete: bool,
	},
}

impl ContentBlock {
	pub fn index(&self) -> usize {
		match self {
			ContentBlock::Text { index, .. } => *index,
			ContentBlock::ToolUse { index, .. } => *index,
			ContentBlock::Thinking { index, .. } => *index,
		}
	}

	pub fn is_complete(&self) -> bool {
		match self {
			ContentBlock::Text { complete, .. } => *complete,
			ContentBlock::ToolUse { complete, .. } => *complete,
			ContentBlock::Thinking { complete, .. } => *complete,
		}
	}

	pub fn mark_complete(&mut self) {
		match self {
			ContentBlock::Text { complete, .. } => *complete = true,
			ContentBlock::ToolUse { complete, .. } => *complete = true,
			ContentBlock::Thinking { complete, .. } => *complete = true,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ContentBlock::Text { .. } => "text",
			ContentBlock::ToolUse { .. } => "tool_use",
			ContentBlock::Thinking { .. } => "thinking",
		}
	}

	/// Validates the §3 invariant: a complete tool-use block has non-empty
	/// id and name.
	pub fn is_well_formed(&self) -> bool {
		match self {
			ContentBlock::ToolUse {
				complete: true,
				id,
				name,
				..
			} => !id.is_empty() && !name.is_empty(),
			_ => true,
		}
	}
}

/// An incremental update to a content block, prior to folding into the
/// block's accumulated state.
#[derive(Debug, Clone)]
pub enum BlockDelta {
	Text { text: String },
	ToolUseArguments { partial_json: String },
	Thinking { text: String },
	Signature { signature: String },
}

/// The internal normalized streaming-event type consumed and emitted by
/// policies, independent of wire format (§4.3).
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
	StreamStarted,
	BlockStarted {
		index: usize,
		initial: ContentBlock,
	},
	Delta {
		index: usize,
		delta: BlockDelta,
	},
	BlockComplete {
		index: usize,
		block: ContentBlock,
	},
	FinishReason(FinishReason),
	/// Always emitted, even on error or client cancel.
	StreamClosed,
	/// A wire-format error surfaced mid-stream (§7 `StreamMidError`); carries
	/// a human-readable message. Not part of the six-event Anthropic
	/// lifecycle itself, but representable in either wire format's
	/// equivalent error frame.
	Error {
		message: String,
	},
}

impl CanonicalEvent {
	pub fn name(&self) -> &'static str {
		match self {
			CanonicalEvent::StreamStarted => "stream_started",
			CanonicalEvent::BlockStarted { .. } => "block_started",
			CanonicalEvent::Delta { .. } => "delta",
			CanonicalEvent::BlockComplete { .. } => "block_complete",
			CanonicalEvent::FinishReason(_) => "finish_reason",
			CanonicalEvent::StreamClosed => "stream_closed",
			CanonicalEvent::Error { .. } => "error",
		}
	}
}

/// Per-transaction streaming state, owned by the assembler (never mutated by
/// policies directly — §9 "stream state owned by the assembler").
#[derive(Debug, Clone, Default)]
pub struct StreamState {
	pub blocks: Vec<ContentBlock>,
	/// Set exactly at the boundary where a block finishes; cleared once a
	/// new block starts or the stream closes.
	pub just_completed: Option<usize>,
	pub finish_reason: Option<FinishReason>,
	/// Bounded raw-chunk history, for diagnostics only.
	raw_chunks: std::collections::VecDeque<Value>,
	max_raw_chunks: usize,
}

impl StreamState {
	pub fn new(max_raw_chunks: usize) -> Self {
		Self {
			max_raw_chunks,
			..Default::default()
		}
	}

	pub fn record_raw(&mut self, chunk: Value) {
		if self.max_raw_chunks == 0 {
			return;
		}
		if self.raw_chunks.len() >= self.max_raw_chunks {
			self.raw_chunks.pop_front();
		}
		self.raw_chunks.push_back(chunk);
	}

	pub fn raw_chunks(&self) -> impl Iterator<Item = &Value> {
		self.raw_chunks.iter()
	}

	pub fn block_mut(&mut self, index: usize) -> Option<&mut ContentBlock> {
		self.blocks.iter_mut().find(|b| b.index() == index)
	}

	pub fn block(&self, index: usize) -> Option<&ContentBlock> {
		self.blocks.iter().find(|b| b.index() == index)
	}

	/// Applies a canonical event to the stream state, returning the updated
	/// block on a completion boundary. This is the single place stream state
	/// mutates; the assembler calls it for every event it produces.
	pub fn apply(&mut self, event: &CanonicalEvent) {
		match event {
			CanonicalEvent::StreamStarted => {},
			CanonicalEvent::BlockStarted { index, initial } => {
				self.just_completed = None;
				if self.block(*index).is_none() {
					self.blocks.push(initial.clone());
				}
			},
			CanonicalEvent::Delta { index, delta } => {
				if let Some(block) = self.block_mut(*index) {
					apply_delta(block, delta);
				}
			},
			CanonicalEvent::BlockComplete { index, block } => {
				if let Some(existing) = self.block_mut(*index) {
					*existing = block.clone();
					existing.mark_complete();
				} else {
					let mut b = block.clone();
					b.mark_complete();
					self.blocks.push(b);
				}
				self.just_completed = Some(*index);
			},
			CanonicalEvent::FinishReason(reason) => {
				self.finish_reason = Some(*reason);
			},
			CanonicalEvent::StreamClosed | CanonicalEvent::Error { .. } => {},
		}
	}

	/// Dense, monotonic index invariant check (§3).
	pub fn indices_are_dense(&self) -> bool {
		let mut seen: Vec<usize> = self.blocks.iter().map(|b| b.index()).collect();
		seen.sort_unstable();
		seen.iter().enumerate().all(|(i, idx)| i == *idx)
	}
}

fn apply_delta(block: &mut ContentBlock, delta: &BlockDelta) {
	match (block, delta) {
		(ContentBlock::Text { text, .. }, BlockDelta::Text { text: t }) => text.push_str(t),
		(
			ContentBlock::ToolUse { arguments, .. },
			BlockDelta::ToolUseArguments { partial_json },
		) => arguments.push_str(partial_json),
		(ContentBlock::Thinking { text, .. }, BlockDelta::Thinking { text: t }) => text.push_str(t),
		(ContentBlock::Thinking { signature, .. }, BlockDelta::Signature { signature: s }) => {
			*signature = Some(s.clone());
		},
		_ => {},
	}
}
