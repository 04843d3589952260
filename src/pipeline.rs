//! The transaction driver (§4.1): runs the four phases — ingress, request
//! hook, upstream + response hook, egress — for every inbound request, and
//! owns the passthrough-fallback and cancellation contracts. `http::handlers`
//! is a thin adapter from axum extractors to this module; all the behavior
//! named in §4.1/§4.7/§8 lives here.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use crate::credentials::CredentialCache;
use crate::error::GatewayError;
use crate::observability::emitter::Emitter;
use crate::observability::event::{EventType, PipelineEventKind};
use crate::policy::{ActivePolicy, Keepalive, StreamPolicyContext};
use crate::stream::sse::{AnthropicEncoder, OpenAiEncoder};
use crate::transaction::{PolicyContext, Transaction};
use crate::types::canonical::CanonicalEvent;
use crate::types::{self, FinishReason, WireFormat, WireRequest, WireResponse};
use crate::upstream::UpstreamClient;

/// Everything a transaction needs for the lifetime of one request. Cloned
/// cheaply (every field is an `Arc`) into each request-handling task.
#[derive(Clone)]
pub struct AppState {
	pub upstream: Arc<UpstreamClient>,
	pub credentials: Arc<CredentialCache>,
	pub validator: Arc<dyn crate::credentials::Validator>,
	pub auth_mode: Arc<crate::credentials::ActiveAuthMode>,
	pub admin_token: Option<secrecy::SecretString>,
	pub active_policy: Arc<ActivePolicy>,
	pub judge: Arc<crate::judge::JudgeClient>,
	pub emitter: Arc<Emitter>,
	pub max_body_bytes: usize,
	pub keepalive_interval: Duration,
}

/// The egress-facing result of driving one transaction: either a single
/// wire-format body, or a live stream of pre-framed SSE text the HTTP layer
/// forwards byte-for-byte.
pub enum DriverOutcome {
	Response { status: http::StatusCode, body: serde_json::Value },
	Stream { receiver: mpsc::UnboundedReceiver<String> },
}

/// Runs all four phases for one inbound request (§4.1). `format` and
/// `raw_body` come from the HTTP layer; `used_api_key` is the credential
/// already validated by the caller, forwarded here only so a 401 from
/// upstream can invalidate the right cache entry.
pub async fn drive(state: Arc<AppState>, format: WireFormat, raw_body: Bytes, used_api_key: Option<String>) -> (uuid::Uuid, DriverOutcome) {
	if raw_body.len() > state.max_body_bytes {
		let txn_id = uuid::Uuid::new_v4();
		let err = GatewayError::PayloadTooLarge { max_bytes: state.max_body_bytes };
		return (txn_id, error_outcome(format, &err));
	}

	let request = match types::parse_request(format, &raw_body) {
		Ok(r) => r,
		Err(err) => return (uuid::Uuid::new_v4(), error_outcome(format, &err)),
	};
	let session_id = request.session_id();
	let txn = Arc::new(Transaction::new(format, session_id, raw_body));
	let txn_id = txn.id;

	state.emitter.publish(
		txn_id,
		txn.session_id.clone(),
		txn.next_sequence(),
		EventType::Pipeline(PipelineEventKind::ClientRequest),
		json!({ "format": format.as_str(), "model": request.model(), "streaming": request.is_streaming() }),
	);

	let policy_descriptor = state.active_policy.snapshot();
	let ctx = Arc::new(PolicyContext::new(txn.clone(), state.emitter.clone(), request.clone()));

	let modified = match policy_descriptor.policy.on_request(request.clone(), &ctx).await {
		Ok(modified) => modified,
		Err(err) => {
			let outcome = policy_blocked_or_error(format, &err, policy_descriptor.name.as_str(), &ctx);
			return (txn_id, outcome);
		},
	};

	let mutated = debug_request(&request) != debug_request(&modified);
	let is_streaming = modified.is_streaming();

	if is_streaming {
		let (tx, rx) = mpsc::unbounded_channel();
		let state = state.clone();
		let policy = policy_descriptor.policy.clone();
		tokio::spawn(async move {
			drive_stream(state, ctx, policy, format, modified, mutated, used_api_key, tx).await;
		});
		return (txn_id, DriverOutcome::Stream { receiver: rx });
	}

	let outcome =
		drive_non_streaming(&state, &ctx, policy_descriptor.policy.as_ref(), format, modified, mutated, used_api_key.as_deref()).await;
	(txn_id, outcome)
}

/// Structural equality for §4.1's "original ≠ final" passthrough-fallback
/// test. Requests aren't `PartialEq` (the upstream client regenerates them
/// across formats), so compare their canonical JSON serialization instead.
fn debug_request(r: &WireRequest) -> serde_json::Value {
	match r {
		WireRequest::OpenAi(r) => serde_json::to_value(r.as_ref()).unwrap_or_default(),
		WireRequest::Anthropic(r) => serde_json::to_value(r.as_ref()).unwrap_or_default(),
	}
}

async fn drive_non_streaming(
	state: &AppState,
	ctx: &Arc<PolicyContext>,
	policy: &dyn crate::policy::Policy,
	format: WireFormat,
	modified: WireRequest,
	mutated: bool,
	used_api_key: Option<&str>,
) -> DriverOutcome {
	state.emitter.publish(
		ctx.txn_id(),
		ctx.session_id().map(str::to_string),
		ctx.transaction.next_sequence(),
		EventType::Pipeline(PipelineEventKind::BackendRequest),
		json!({ "model": modified.model() }),
	);

	let result = state.upstream.complete(format, modified, used_api_key).await;
	let result = match result {
		Ok((resp, Some(sanitizer))) => {
			state.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::Pipeline(PipelineEventKind::AutoFix),
				json!({ "sanitizer": sanitizer.name() }),
			);
			Ok(resp)
		},
		Ok((resp, None)) => Ok(resp),
		Err(GatewayError::UpstreamBadRequest { model, message, raw }) if mutated => {
			state.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::Pipeline(PipelineEventKind::PassthroughFallback),
				json!({ "reason": message }),
			);
			match state.upstream.complete_passthrough(format, &ctx.transaction.raw_inbound, used_api_key).await {
				Ok(resp) => Ok(resp),
				Err(_) => Err(GatewayError::UpstreamBadRequest { model, message, raw }),
			}
		},
		Err(err) => Err(err),
	};

	let response = match result {
		Ok(resp) => resp,
		Err(err) => return error_outcome(format, &err),
	};

	let response = match policy.on_response(response, ctx).await {
		Ok(resp) => resp,
		Err(err) => return policy_blocked_or_error(format, &err, policy.name(), ctx),
	};

	state.emitter.publish(
		ctx.txn_id(),
		ctx.session_id().map(str::to_string),
		ctx.transaction.next_sequence(),
		EventType::Pipeline(PipelineEventKind::ClientResponse),
		json!({}),
	);

	let body = match &response {
		WireResponse::OpenAi(r) => serde_json::to_value(r.as_ref()).unwrap_or_default(),
		WireResponse::Anthropic(r) => serde_json::to_value(r.as_ref()).unwrap_or_default(),
	};
	DriverOutcome::Response { status: http::StatusCode::OK, body }
}

/// Streaming path (§4.1 phase 3, §4.3, §4.4). Runs on its own task so the
/// HTTP handler can start forwarding bytes as soon as the channel yields the
/// first frame; `on_stream_closed` is guaranteed via the `defer`-style guard
/// at the bottom regardless of which branch returns.
#[allow(clippy::too_many_arguments)]
async fn drive_stream(
	state: Arc<AppState>,
	ctx: Arc<PolicyContext>,
	policy: Arc<dyn crate::policy::Policy>,
	format: WireFormat,
	modified: WireRequest,
	mutated: bool,
	used_api_key: Option<String>,
	tx: mpsc::UnboundedSender<String>,
) {
	let (keepalive_tx, mut keepalive_rx) = mpsc::unbounded_channel::<()>();
	let keepalive = Keepalive::new(keepalive_tx);
	let stream_ctx = StreamPolicyContext { base: ctx.clone(), keepalive: keepalive.clone() };

	state.emitter.publish(
		ctx.txn_id(),
		ctx.session_id().map(str::to_string),
		ctx.transaction.next_sequence(),
		EventType::Pipeline(PipelineEventKind::BackendRequest),
		json!({ "model": modified.model() }),
	);

	let model = modified.model().to_string();
	let opened = state.upstream.stream(format, modified, used_api_key.as_deref()).await;
	let opened = match opened {
		Ok((s, Some(sanitizer))) => {
			state.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::Pipeline(PipelineEventKind::AutoFix),
				json!({ "sanitizer": sanitizer.name() }),
			);
			Ok(s)
		},
		Ok((s, None)) => Ok(s),
		Err(GatewayError::UpstreamBadRequest { model, message, raw }) if mutated => {
			state.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::Pipeline(PipelineEventKind::PassthroughFallback),
				json!({ "reason": message }),
			);
			match state.upstream.stream_passthrough(format, &ctx.transaction.raw_inbound, used_api_key.as_deref()).await {
				Ok(s) => Ok(s),
				Err(_) => Err(GatewayError::UpstreamBadRequest { model, message, raw }),
			}
		},
		Err(err) => Err(err),
	};

	let mut upstream_events = match opened {
		Ok(s) => s,
		Err(err) => {
			forward_error_frame(format, &model, &err, &tx);
			policy.on_stream_closed(&stream_ctx).await;
			return;
		},
	};

	let mut openai_encoder = (format == WireFormat::OpenAi).then(|| OpenAiEncoder::new(ctx.txn_id().to_string(), model.clone(), stream_start_timestamp()));
	let mut anthropic_encoder = (format == WireFormat::Anthropic).then(|| AnthropicEncoder::new(format!("msg_{}", ctx.txn_id()), model.clone()));

	// Independent of any policy calling `keepalive.fire()`: a plain idle
	// stream still needs a comment frame periodically so proxies don't time
	// it out (§5 "Timeouts", `LUTHIEN_KEEPALIVE_INTERVAL_SECS`).
	let mut ticker = tokio::time::interval(state.keepalive_interval);
	ticker.tick().await;

	loop {
		tokio::select! {
			biased;
			_ = keepalive_rx.recv() => {
				if tx.send(crate::stream::sse::keepalive_comment().to_string()).is_err() {
					break;
				}
			},
			_ = ticker.tick() => {
				if tx.send(crate::stream::sse::keepalive_comment().to_string()).is_err() {
					break;
				}
			},
			next = futures_util::StreamExt::next(&mut upstream_events) => {
				let Some(item) = next else { break };
				let event = match item {
					Ok(event) => event,
					Err(err) => {
						forward_error_frame(format, &model, &err, &tx);
						break;
					},
				};

				let mut outbound = policy.on_stream_event(event.clone(), &stream_ctx).await;
				if let CanonicalEvent::BlockComplete { block, .. } = &event {
					outbound.extend(policy.on_block_complete(block, &stream_ctx).await);
				}

				let mut closed = false;
				for out_event in &outbound {
					if let Some(enc) = openai_encoder.as_mut() {
						for chunk in enc.encode(out_event) {
							if tx.send(crate::stream::sse::format_openai_chunk(&chunk)).is_err() {
								closed = true;
								break;
							}
						}
					}
					if let Some(enc) = anthropic_encoder.as_mut() {
						for ev in enc.encode(out_event) {
							if tx.send(crate::stream::sse::format_anthropic_event(&ev)).is_err() {
								closed = true;
								break;
							}
						}
					}
					if matches!(out_event, CanonicalEvent::StreamClosed) {
						if format == WireFormat::OpenAi {
							let _ = tx.send(crate::stream::sse::format_openai_done().to_string());
						}
					}
				}
				if closed || ctx.is_output_finished() {
					break;
				}
			},
		}
	}

	state.emitter.publish(
		ctx.txn_id(),
		ctx.session_id().map(str::to_string),
		ctx.transaction.next_sequence(),
		EventType::Pipeline(PipelineEventKind::ClientResponse),
		json!({}),
	);
	policy.on_stream_closed(&stream_ctx).await;
}

/// Timestamp shared by every chunk the `OpenAiEncoder` emits in one stream.
fn stream_start_timestamp() -> i64 {
	chrono::Utc::now().timestamp()
}

fn forward_error_frame(format: WireFormat, model: &str, err: &GatewayError, tx: &mpsc::UnboundedSender<String>) {
	let message = err.user_message();
	match format {
		WireFormat::OpenAi => {
			let mut enc = OpenAiEncoder::new("error", model, stream_start_timestamp());
			let started = crate::types::canonical::ContentBlock::Text { index: 0, text: String::new(), complete: false };
			for chunk in enc.encode(&CanonicalEvent::BlockStarted { index: 0, initial: started }) {
				let _ = tx.send(crate::stream::sse::format_openai_chunk(&chunk));
			}
			for chunk in enc.encode(&CanonicalEvent::Error { message }) {
				let _ = tx.send(crate::stream::sse::format_openai_chunk(&chunk));
			}
			for chunk in enc.encode(&CanonicalEvent::FinishReason(FinishReason::Stop)) {
				let _ = tx.send(crate::stream::sse::format_openai_chunk(&chunk));
			}
			let _ = tx.send(crate::stream::sse::format_openai_done().to_string());
		},
		WireFormat::Anthropic => {
			let mut enc = AnthropicEncoder::new("msg_error", model);
			for ev in enc.encode(&CanonicalEvent::Error { message }) {
				let _ = tx.send(crate::stream::sse::format_anthropic_event(&ev));
			}
			for ev in enc.encode(&CanonicalEvent::StreamClosed) {
				let _ = tx.send(crate::stream::sse::format_anthropic_event(&ev));
			}
		},
	}
}

/// Non-streaming error path (§4.1 "Failures", §7). `PolicyBlocked` and
/// `JudgeFailure` never surface as HTTP errors — they render as a normal
/// 200 completion carrying a synthetic refusal in the client's wire format.
fn policy_blocked_or_error(format: WireFormat, err: &GatewayError, policy_name: &str, ctx: &PolicyContext) -> DriverOutcome {
	match err {
		GatewayError::PolicyBlocked { reason, .. } | GatewayError::JudgeFailure(reason) => {
			ctx.emitter.publish(
				ctx.txn_id(),
				ctx.session_id().map(str::to_string),
				ctx.transaction.next_sequence(),
				EventType::policy(policy_name, "blocked"),
				json!({ "reason": reason }),
			);
			DriverOutcome::Response { status: http::StatusCode::OK, body: synthetic_refusal(format, reason) }
		},
		other => error_outcome(format, other),
	}
}

/// A synthetic refusal body in the client's native wire format (§7
/// `PolicyBlocked`): "[blocked: <reason>]" as the sole assistant text.
fn synthetic_refusal(format: WireFormat, reason: &str) -> serde_json::Value {
	let text = format!("[blocked: {reason}]");
	match format {
		WireFormat::OpenAi => json!({
			"id": "blocked",
			"object": "chat.completion",
			"created": chrono::Utc::now().timestamp(),
			"model": "blocked",
			"choices": [{
				"index": 0,
				"message": { "role": "assistant", "content": text },
				"finish_reason": "stop",
			}],
			"usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
		}),
		WireFormat::Anthropic => json!({
			"id": "blocked",
			"type": "message",
			"role": "assistant",
			"model": "blocked",
			"content": [{ "type": "text", "text": text }],
			"stop_reason": "end_turn",
			"stop_sequence": null,
			"usage": { "input_tokens": 0, "output_tokens": 0 },
		}),
	}
}

fn error_outcome(format: WireFormat, err: &GatewayError) -> DriverOutcome {
	DriverOutcome::Response { status: err.status_code(), body: err.to_wire_body(format) }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::openai::{ChatCompletionRequest, Message, Role, Content};

	fn sample_request() -> WireRequest {
		WireRequest::OpenAi(Box::new(ChatCompletionRequest {
			model: "gpt-4".to_string(),
			messages: vec![Message {
				role: Role::User,
				content: Some(Content::Text("hi".to_string())),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			}],
			tools: None,
			tool_choice: None,
			stream: Some(false),
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

	#[test]
	fn identical_requests_compare_equal() {
		let a = sample_request();
		let b = sample_request();
		assert_eq!(debug_request(&a), debug_request(&b));
	}

	#[test]
	fn mutated_request_compares_unequal() {
		let a = sample_request();
		let WireRequest::OpenAi(mut boxed) = sample_request() else { unreachable!() };
		boxed.messages.clear();
		let b = WireRequest::OpenAi(boxed);
		assert_ne!(debug_request(&a), debug_request(&b));
	}

	#[test]
	fn blocked_error_renders_bracketed_reason_in_openai_format() {
		let body = synthetic_refusal(WireFormat::OpenAi, "destructive tool call");
		let text = body["choices"][0]["message"]["content"].as_str().unwrap();
		assert_eq!(text, "[blocked: destructive tool call]");
	}

	#[test]
	fn blocked_error_renders_bracketed_reason_in_anthropic_format() {
		let body = synthetic_refusal(WireFormat::Anthropic, "destructive tool call");
		let text = body["content"][0]["text"].as_str().unwrap();
		assert_eq!(text, "[blocked: destructive tool call]");
	}
}
