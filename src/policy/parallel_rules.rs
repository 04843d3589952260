//! Reference policy: evaluate completed content against a configured set of
//! independently-evaluable rules, each rated by a judge LLM in parallel
//! (§4.6 "Parallel-rules policy"). Grounded on
//! `examples/original_source/.../policies/parallel_rules_policy.py`: rule
//! shape, scratchpad-based per-request buffering, and the fail-secure
//! treatment of judge errors are carried over as behavior.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use crate::error::GatewayError;
use crate::judge::{self, JudgeClient};
use crate::observability::event::{EventType, Severity};
use crate::policy::{Policy, StreamPolicyContext};
use crate::transaction::PolicyContext;
use crate::types::canonical::{BlockDelta, CanonicalEvent, ContentBlock};
use crate::types::openai::Message as OpenAiMessage;
use crate::types::{FinishReason, WireResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
	Text,
	ToolCall,
}

#[derive(Debug, Clone)]
pub struct ViolationResponseConfig {
	pub static_message: Option<String>,
	pub include_original: bool,
	pub include_explanation: bool,
}

impl Default for ViolationResponseConfig {
	fn default() -> Self {
		Self {
			static_message: None,
			include_original: false,
			include_explanation: true,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RuleConfig {
	pub name: String,
	pub ruletext: String,
	pub applies_to: HashSet<ContentKind>,
	pub probability_threshold: Option<f64>,
	pub violation_response: ViolationResponseConfig,
}

impl RuleConfig {
	fn threshold(&self, default_threshold: f64) -> f64 {
		self.probability_threshold.unwrap_or(default_threshold)
	}
}

pub struct ParallelRulesConfig {
	pub judge_temperature: f64,
	pub judge_max_tokens: u32,
	pub default_threshold: f64,
	pub rules: Vec<RuleConfig>,
}

struct RuleViolation<'a> {
	rule: &'a RuleConfig,
	probability: f64,
	explanation: String,
}

/// Evaluates a configured set of rules in parallel against completed content
/// blocks and replaces violating output with an aggregated message (§4.6).
pub struct ParallelRulesPolicy {
	config: ParallelRulesConfig,
	judge: Arc<JudgeClient>,
}

impl ParallelRulesPolicy {
	pub fn new(config: ParallelRulesConfig, judge: Arc<JudgeClient>) -> Self {
		Self { config, judge }
	}

	fn applicable_rules(&self, kind: ContentKind) -> Vec<&RuleConfig> {
		self.config.rules.iter().filter(|r| r.applies_to.contains(&kind)).collect()
	}

	/// Runs every applicable rule concurrently, fires `keepalive` before and
	/// after (the original gathers with `asyncio.gather` while holding the
	/// connection open), and returns the rules that fired — including any
	/// that errored, which fail secure as violations.
	async fn evaluate<'a>(
		&'a self,
		content: &str,
		kind: ContentKind,
		ctx: &PolicyContext,
		keepalive: Option<&crate::policy::Keepalive>,
	) -> Vec<RuleViolation<'a>> {
		let applicable = self.applicable_rules(kind);
		if applicable.is_empty() {
			return vec![];
		}
		if let Some(k) = keepalive {
			k.fire();
		}
		let eval_keepalive = keepalive.cloned().unwrap_or_else(crate::policy::Keepalive::noop);

		let evaluations = applicable.iter().map(|rule| {
			let judge = self.judge.clone();
			let prompt = judge::text_rule_prompt(&rule.ruletext, content);
			let temperature = self.config.judge_temperature;
			let max_tokens = self.config.judge_max_tokens;
			let keepalive = eval_keepalive.clone();
			async move {
				judge
					.evaluate(judge::default_instructions(), &prompt, temperature, max_tokens, &keepalive)
					.await
			}
		});
		let results = join_all(evaluations).await;

		if let Some(k) = keepalive {
			k.fire();
		}

		let mut violations = Vec::new();
		for (rule, result) in applicable.into_iter().zip(results) {
			match result {
				Ok(verdict) => {
					let threshold = rule.threshold(self.config.default_threshold);
					if verdict.probability >= threshold {
						self.emit(ctx, "rule_violated", rule, Some(verdict.probability), Some(threshold), &verdict.explanation);
						violations.push(RuleViolation {
							rule,
							probability: verdict.probability,
							explanation: verdict.explanation,
						});
					} else {
						self.emit(ctx, "rule_passed", rule, Some(verdict.probability), Some(threshold), &verdict.explanation);
					}
				},
				Err(err) => {
					self.emit_with_severity(ctx, "rule_error", rule, None, None, &err.to_string(), Some(Severity::Error));
					violations.push(RuleViolation {
						rule,
						probability: 1.0,
						explanation: format!("judge evaluation failed: {err}"),
					});
				},
			}
		}
		violations
	}

	fn emit(
		&self,
		ctx: &PolicyContext,
		subtype: &str,
		rule: &RuleConfig,
		probability: Option<f64>,
		threshold: Option<f64>,
		explanation: &str,
	) {
		self.emit_with_severity(ctx, subtype, rule, probability, threshold, explanation, None);
	}

	#[allow(clippy::too_many_arguments)]
	fn emit_with_severity(
		&self,
		ctx: &PolicyContext,
		subtype: &str,
		rule: &RuleConfig,
		probability: Option<f64>,
		threshold: Option<f64>,
		explanation: &str,
		severity: Option<Severity>,
	) {
		let payload = json!({
			"rule_name": rule.name,
			"probability": probability,
			"threshold": threshold,
			"explanation": explanation,
		});
		match severity {
			Some(severity) => ctx.emitter.publish_with_severity(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::policy("parallel_rules", subtype),
				payload,
				severity,
			),
			None => ctx.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::policy("parallel_rules", subtype),
				payload,
			),
		}
	}
}

/// Aggregates violations into one message, each rule's static message (or its
/// judge explanation, if none was configured) on its own line prefixed by the
/// rule name — the layout `parallel_rules_policy.py`'s formatter uses
/// (§3 "Per-rule violation aggregation formatting").
fn format_violation_message(violations: &[RuleViolation<'_>], original_content: &str) -> String {
	let mut lines = vec!["Response blocked: the following rule(s) were violated:".to_string()];
	for violation in violations {
		let message = violation
			.rule
			.violation_response
			.static_message
			.clone()
			.unwrap_or_else(|| violation.explanation.clone());
		lines.push(format!("- {}: {}", violation.rule.name, message));
		if violation.rule.violation_response.include_explanation && violation.rule.violation_response.static_message.is_some()
		{
			lines.push(format!("  (probability {:.2}: {})", violation.probability, violation.explanation));
		}
	}
	if violations.iter().any(|v| v.rule.violation_response.include_original) {
		lines.push(format!("\nOriginal content:\n{original_content}"));
	}
	lines.join("\n")
}

fn tool_call_content(name: &str, arguments: &str) -> String {
	judge::tool_call_prompt(name, arguments)
}

#[async_trait]
impl Policy for ParallelRulesPolicy {
	fn name(&self) -> &str {
		"parallel_rules"
	}

	async fn on_response(&self, response: WireResponse, ctx: &PolicyContext) -> Result<WireResponse, GatewayError> {
		match response {
			WireResponse::OpenAi(resp) => {
				let mut resp = resp;
				if let Some(choice) = resp.choices.first() {
					if let Some(text) = choice.message.text() {
						if !text.is_empty() {
							let violations = self.evaluate(&text, ContentKind::Text, ctx, None).await;
							if !violations.is_empty() {
								let message = format_violation_message(&violations, &text);
								resp.choices[0].message = OpenAiMessage {
									role: resp.choices[0].message.role,
									content: Some(crate::types::openai::Content::Text(message)),
									name: None,
									tool_calls: None,
									tool_call_id: None,
								};
								resp.choices[0].finish_reason = Some("stop".to_string());
								return Ok(WireResponse::OpenAi(resp));
							}
						}
					}
					if let Some(tool_calls) = &choice.message.tool_calls {
						for call in tool_calls {
							let content = tool_call_content(&call.function.name, &call.function.arguments);
							let violations = self.evaluate(&content, ContentKind::ToolCall, ctx, None).await;
							if !violations.is_empty() {
								let message = format_violation_message(&violations, &content);
								resp.choices[0].message = OpenAiMessage {
									role: resp.choices[0].message.role,
									content: Some(crate::types::openai::Content::Text(message)),
									name: None,
									tool_calls: None,
									tool_call_id: None,
								};
								resp.choices[0].finish_reason = Some("stop".to_string());
								return Ok(WireResponse::OpenAi(resp));
							}
						}
					}
				}
				Ok(WireResponse::OpenAi(resp))
			},
			WireResponse::Anthropic(resp) => {
				let mut resp = resp;
				for block in resp.content.clone() {
					match block {
						crate::types::anthropic::ResponseContentBlock::Text { text } if !text.is_empty() => {
							let violations = self.evaluate(&text, ContentKind::Text, ctx, None).await;
							if !violations.is_empty() {
								let message = format_violation_message(&violations, &text);
								resp.content = vec![crate::types::anthropic::ResponseContentBlock::Text { text: message }];
								resp.stop_reason = Some(crate::types::anthropic::StopReason::EndTurn);
								return Ok(WireResponse::Anthropic(resp));
							}
						},
						crate::types::anthropic::ResponseContentBlock::ToolUse { name, input, .. } => {
							let content = tool_call_content(&name, &input.to_string());
							let violations = self.evaluate(&content, ContentKind::ToolCall, ctx, None).await;
							if !violations.is_empty() {
								let message = format_violation_message(&violations, &content);
								resp.content = vec![crate::types::anthropic::ResponseContentBlock::Text { text: message }];
								resp.stop_reason = Some(crate::types::anthropic::StopReason::EndTurn);
								return Ok(WireResponse::Anthropic(resp));
							}
						},
						_ => {},
					}
				}
				Ok(WireResponse::Anthropic(resp))
			},
		}
	}

	/// Raw block lifecycle is never forwarded incrementally — rule evaluation
	/// needs the complete block. `on_block_complete` below is where content
	/// actually reaches the egress side.
	async fn on_stream_event(&self, event: CanonicalEvent, _ctx: &StreamPolicyContext) -> Vec<CanonicalEvent> {
		match event {
			CanonicalEvent::BlockStarted { .. } | CanonicalEvent::Delta { .. } | CanonicalEvent::BlockComplete { .. } => vec![],
			other => vec![other],
		}
	}

	async fn on_block_complete(&self, block: &ContentBlock, ctx: &StreamPolicyContext) -> Vec<CanonicalEvent> {
		if ctx.is_output_finished() {
			return vec![];
		}
		let (kind, content) = match block {
			ContentBlock::Text { text, .. } if !text.is_empty() => (ContentKind::Text, text.clone()),
			ContentBlock::ToolUse { name, arguments, .. } => (ContentKind::ToolCall, tool_call_content(name, arguments)),
			_ => return vec![],
		};

		let violations = self.evaluate(&content, kind, &ctx.base, Some(&ctx.keepalive)).await;
		let index = block.index();

		if violations.is_empty() {
			return vec![
				CanonicalEvent::BlockStarted { index, initial: block.clone() },
				replay_delta(block),
				CanonicalEvent::BlockComplete { index, block: block.clone() },
			];
		}

		let message = format_violation_message(&violations, &content);
		ctx.finish_output();
		vec![
			CanonicalEvent::BlockStarted {
				index,
				initial: ContentBlock::Text { index, text: String::new(), complete: false },
			},
			CanonicalEvent::Delta { index, delta: BlockDelta::Text { text: message.clone() } },
			CanonicalEvent::BlockComplete {
				index,
				block: ContentBlock::Text { index, text: message, complete: true },
			},
			CanonicalEvent::FinishReason(FinishReason::Stop),
			CanonicalEvent::StreamClosed,
		]
	}
}

fn replay_delta(block: &ContentBlock) -> CanonicalEvent {
	let index = block.index();
	match block {
		ContentBlock::Text { text, .. } => {
			CanonicalEvent::Delta { index, delta: BlockDelta::Text { text: text.clone() } }
		},
		ContentBlock::ToolUse { arguments, .. } => {
			CanonicalEvent::Delta { index, delta: BlockDelta::ToolUseArguments { partial_json: arguments.clone() } }
		},
		ContentBlock::Thinking { text, .. } => {
			CanonicalEvent::Delta { index, delta: BlockDelta::Thinking { text: text.clone() } }
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(name: &str, threshold: f64, static_message: Option<&str>) -> RuleConfig {
		RuleConfig {
			name: name.to_string(),
			ruletext: "test rule".to_string(),
			applies_to: HashSet::from([ContentKind::Text]),
			probability_threshold: Some(threshold),
			violation_response: ViolationResponseConfig {
				static_message: static_message.map(str::to_string),
				include_original: false,
				include_explanation: true,
			},
		}
	}

	#[test]
	fn aggregates_multiple_violations_one_line_each() {
		let rule_a = rule("rule_a", 0.5, Some("Violation A"));
		let rule_b = rule("rule_b", 0.5, Some("Violation B"));
		let violations = vec![
			RuleViolation { rule: &rule_a, probability: 0.9, explanation: "bad a".to_string() },
			RuleViolation { rule: &rule_b, probability: 0.8, explanation: "bad b".to_string() },
		];
		let message = format_violation_message(&violations, "original text");
		assert!(message.contains("rule_a: Violation A"));
		assert!(message.contains("rule_b: Violation B"));
	}

	#[test]
	fn includes_original_content_when_any_rule_requests_it() {
		let mut r = rule("rule_a", 0.5, Some("Violation A"));
		r.violation_response.include_original = true;
		let violations = vec![RuleViolation { rule: &r, probability: 0.9, explanation: "bad".to_string() }];
		let message = format_violation_message(&violations, "the original content");
		assert!(message.contains("the original content"));
	}
}
