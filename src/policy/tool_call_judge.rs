//! Reference policy: buffers a single tool call, judges it with a risk-rating
//! LLM call, and blocks it with a templated refusal if the judge's reported
//! probability clears a threshold (§4.6 "Tool-call judge policy"). Grounded
//! on `examples/original_source/.../policies/tool_call_judge_policy.py`: the
//! judge prompt, the `{tool_name}`/`{tool_arguments}`/`{probability:.2f}`/
//! `{explanation}` template placeholders, and fail-secure-on-error are
//! carried over as behavior.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::GatewayError;
use crate::judge::{self, JudgeClient};
use crate::observability::event::{EventType, Severity};
use crate::policy::{Policy, StreamPolicyContext};
use crate::transaction::PolicyContext;
use crate::types::canonical::{BlockDelta, CanonicalEvent, ContentBlock};
use crate::types::openai::{Content as OpenAiContent, Message as OpenAiMessage};
use crate::types::{FinishReason, WireResponse};

pub struct ToolCallJudgeConfig {
	pub probability_threshold: f64,
	pub temperature: f64,
	pub max_tokens: u32,
	pub judge_instructions: String,
	pub blocked_message_template: String,
}

impl Default for ToolCallJudgeConfig {
	fn default() -> Self {
		Self {
			probability_threshold: 0.6,
			temperature: 0.0,
			max_tokens: 256,
			judge_instructions: judge::default_instructions().to_string(),
			blocked_message_template: "BLOCKED: Tool call '{tool_name}' with arguments {tool_arguments} rejected \
				(probability {probability:.2f}). Explanation: {explanation}"
				.to_string(),
		}
	}
}

/// Substitutes the template's named placeholders. `{probability:.2f}` gets
/// two-decimal formatting; a bare `{probability}` falls back to the default
/// float rendering.
fn render_template(template: &str, tool_name: &str, tool_arguments: &str, probability: f64, explanation: &str) -> String {
	template
		.replace("{tool_name}", tool_name)
		.replace("{tool_arguments}", tool_arguments)
		.replace("{probability:.2f}", &format!("{probability:.2}"))
		.replace("{probability}", &probability.to_string())
		.replace("{explanation}", explanation)
}

pub struct ToolCallJudgePolicy {
	config: ToolCallJudgeConfig,
	judge: Arc<JudgeClient>,
}

impl ToolCallJudgePolicy {
	pub fn new(config: ToolCallJudgeConfig, judge: Arc<JudgeClient>) -> Self {
		Self { config, judge }
	}

	/// Calls the judge for one tool call; `None` means allowed, `Some(text)`
	/// is the rendered blocked message. Judge errors fail secure: they count
	/// as a block, using an error-specific rendering of the template.
	async fn judge_tool_call(
		&self,
		tool_name: &str,
		tool_arguments: &str,
		ctx: &PolicyContext,
		keepalive: &crate::policy::Keepalive,
	) -> Option<String> {
		ctx.emitter.publish(
			ctx.txn_id(),
			ctx.session_id().map(str::to_string),
			ctx.transaction.next_sequence(),
			EventType::policy("judge", "evaluation_started"),
			json!({ "tool_name": tool_name }),
		);

		let prompt = judge::tool_call_prompt(tool_name, tool_arguments);
		let verdict = match self
			.judge
			.evaluate(&self.config.judge_instructions, &prompt, self.config.temperature, self.config.max_tokens, keepalive)
			.await
		{
			Ok(v) => v,
			Err(err) => {
				ctx.emitter.publish_with_severity(
					ctx.txn_id(),
					ctx.session_id().map(str::to_string),
					ctx.transaction.next_sequence(),
					EventType::policy("judge", "evaluation_failed"),
					json!({ "tool_name": tool_name, "error": err.to_string() }),
					Severity::Error,
				);
				return Some(format!(
					"SECURITY BLOCK: Tool call '{tool_name}' could not be evaluated by the judge due to an error. \
					For security, this call has been blocked. Error: {err}"
				));
			},
		};

		ctx.emitter.publish(
			ctx.txn_id(),
			ctx.session_id().map(str::to_string),
			ctx.transaction.next_sequence(),
			EventType::policy("judge", "evaluation_complete"),
			json!({
				"tool_name": tool_name,
				"probability": verdict.probability,
				"threshold": self.config.probability_threshold,
				"explanation": verdict.explanation,
			}),
		);

		if verdict.probability >= self.config.probability_threshold {
			ctx.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::policy("judge", "tool_call_blocked"),
				json!({ "tool_name": tool_name, "probability": verdict.probability }),
			);
			Some(render_template(
				&self.config.blocked_message_template,
				tool_name,
				tool_arguments,
				verdict.probability,
				&verdict.explanation,
			))
		} else {
			ctx.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::policy("judge", "tool_call_allowed"),
				json!({ "tool_name": tool_name, "probability": verdict.probability }),
			);
			None
		}
	}
}

#[async_trait]
impl Policy for ToolCallJudgePolicy {
	fn name(&self) -> &str {
		"tool_call_judge"
	}

	async fn on_response(&self, response: WireResponse, ctx: &PolicyContext) -> Result<WireResponse, GatewayError> {
		let keepalive = crate::policy::Keepalive::noop();
		match response {
			WireResponse::OpenAi(resp) => {
				let mut resp = resp;
				let Some(choice) = resp.choices.first().cloned() else {
					return Ok(WireResponse::OpenAi(resp));
				};
				let Some(tool_calls) = &choice.message.tool_calls else {
					return Ok(WireResponse::OpenAi(resp));
				};
				for call in tool_calls {
					if let Some(blocked) = self
						.judge_tool_call(&call.function.name, &call.function.arguments, ctx, &keepalive)
						.await
					{
						resp.choices[0].message = OpenAiMessage {
							role: choice.message.role,
							content: Some(OpenAiContent::Text(blocked)),
							name: None,
							tool_calls: None,
							tool_call_id: None,
						};
						resp.choices[0].finish_reason = Some("stop".to_string());
						return Ok(WireResponse::OpenAi(resp));
					}
				}
				Ok(WireResponse::OpenAi(resp))
			},
			WireResponse::Anthropic(resp) => {
				let mut resp = resp;
				for block in resp.content.clone() {
					if let crate::types::anthropic::ResponseContentBlock::ToolUse { name, input, .. } = block {
						if let Some(blocked) = self.judge_tool_call(&name, &input.to_string(), ctx, &keepalive).await {
							resp.content = vec![crate::types::anthropic::ResponseContentBlock::Text { text: blocked }];
							resp.stop_reason = Some(crate::types::anthropic::StopReason::EndTurn);
							return Ok(WireResponse::Anthropic(resp));
						}
					}
				}
				Ok(WireResponse::Anthropic(resp))
			},
		}
	}

	/// Tool-call blocks are buffered (never forwarded incrementally); text
	/// and thinking blocks pass straight through.
	async fn on_stream_event(&self, event: CanonicalEvent, _ctx: &StreamPolicyContext) -> Vec<CanonicalEvent> {
		match &event {
			CanonicalEvent::BlockStarted { initial: ContentBlock::ToolUse { .. }, .. } => vec![],
			CanonicalEvent::Delta { delta: BlockDelta::ToolUseArguments { .. }, .. } => vec![],
			CanonicalEvent::BlockComplete { block: ContentBlock::ToolUse { .. }, .. } => vec![],
			_ => vec![event],
		}
	}

	async fn on_block_complete(&self, block: &ContentBlock, ctx: &StreamPolicyContext) -> Vec<CanonicalEvent> {
		let ContentBlock::ToolUse { name, arguments, .. } = block else {
			return vec![];
		};
		if ctx.is_output_finished() {
			return vec![];
		}

		let index = block.index();
		match self.judge_tool_call(name, arguments, &ctx.base, &ctx.keepalive).await {
			Some(blocked_text) => {
				ctx.finish_output();
				vec![
					CanonicalEvent::BlockStarted {
						index,
						initial: ContentBlock::Text { index, text: String::new(), complete: false },
					},
					CanonicalEvent::Delta { index, delta: BlockDelta::Text { text: blocked_text.clone() } },
					CanonicalEvent::BlockComplete {
						index,
						block: ContentBlock::Text { index, text: blocked_text, complete: true },
					},
					CanonicalEvent::FinishReason(FinishReason::Stop),
					CanonicalEvent::StreamClosed,
				]
			},
			None => vec![
				CanonicalEvent::BlockStarted { index, initial: block.clone() },
				CanonicalEvent::Delta { index, delta: BlockDelta::ToolUseArguments { partial_json: arguments.clone() } },
				CanonicalEvent::BlockComplete { index, block: block.clone() },
			],
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn template_renders_all_placeholders() {
		let config = ToolCallJudgeConfig::default();
		let rendered = render_template(&config.blocked_message_template, "delete_all", "{\"force\": true}", 0.876, "destructive");
		assert!(rendered.contains("delete_all"));
		assert!(rendered.contains("{\"force\": true}"));
		assert!(rendered.contains("0.88"));
		assert!(rendered.contains("destructive"));
	}

	#[test]
	fn default_threshold_matches_original_policy() {
		assert_eq!(ToolCallJudgeConfig::default().probability_threshold, 0.6);
	}
}
