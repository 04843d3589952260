//! The upstream client (§4.5): dispatches to the configured OpenAI- and/or
//! Anthropic-native upstream, applies §4.2's pre-flight sanitization and
//! single-retry mechanical repair, and folds streamed deltas into canonical
//! events so callers above this module never see a wire-specific shape on
//! the streaming path. Grounded on `judge::JudgeClient`'s direct-`reqwest`
//! call shape for the HTTP plumbing and on
//! `examples/vishalbelsare-agentgateway/crates/agentgateway/src/parse/sse.rs`
//! for decoding the upstream's SSE body via `tokio_sse_codec`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio_sse_codec::{Frame, SseDecoder};
use tokio_util::codec::Decoder;

use crate::convert;
use crate::credentials::CredentialCache;
use crate::error::GatewayError;
use crate::sanitize::{self, Sanitizer};
use crate::stream::{AnthropicAssembler, OpenAiAssembler};
use crate::types::anthropic as a;
use crate::types::canonical::CanonicalEvent;
use crate::types::openai as o;
use crate::types::{self, WireFormat, WireRequest, WireResponse};

/// Maximum buffered size of one SSE frame before the decoder gives up,
/// matching the limit the teacher's SSE parser uses.
const MAX_SSE_FRAME_BYTES: usize = 2_097_152;

pub type CanonicalEventStream = Pin<Box<dyn Stream<Item = Result<CanonicalEvent, GatewayError>> + Send>>;

#[derive(Clone)]
pub struct Endpoint {
	pub base_url: String,
	pub api_key: Option<SecretString>,
}

impl Endpoint {
	pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Self {
		Self { base_url: base_url.into(), api_key }
	}

	fn path(&self, format: WireFormat) -> String {
		let base = self.base_url.trim_end_matches('/');
		match format {
			WireFormat::OpenAi => format!("{base}/chat/completions"),
			WireFormat::Anthropic => format!("{base}/messages"),
		}
	}
}

pub struct UpstreamClient {
	http: reqwest::Client,
	openai: Option<Endpoint>,
	anthropic: Option<Endpoint>,
	credentials: std::sync::Arc<CredentialCache>,
	timeout: Duration,
	max_raw_chunks: usize,
}

impl UpstreamClient {
	pub fn new(
		openai: Option<Endpoint>,
		anthropic: Option<Endpoint>,
		credentials: std::sync::Arc<CredentialCache>,
		timeout: Duration,
	) -> Self {
		Self {
			http: reqwest::Client::new(),
			openai,
			anthropic,
			credentials,
			timeout,
			max_raw_chunks: 64,
		}
	}

	fn endpoint(&self, format: WireFormat) -> Option<&Endpoint> {
		match format {
			WireFormat::OpenAi => self.openai.as_ref(),
			WireFormat::Anthropic => self.anthropic.as_ref(),
		}
	}

	/// Picks the upstream to call for a client request in `client_format`,
	/// preferring the native upstream and falling back to the other
	/// configured one (in which case the caller must convert, §4.2).
	fn resolve(&self, client_format: WireFormat) -> Result<(&Endpoint, WireFormat), GatewayError> {
		if let Some(endpoint) = self.endpoint(client_format) {
			return Ok((endpoint, client_format));
		}
		let other = client_format.other();
		if let Some(endpoint) = self.endpoint(other) {
			return Ok((endpoint, other));
		}
		Err(GatewayError::UpstreamUnavailable {
			model: "unknown".to_string(),
			detail: "no upstream is configured for either wire format".to_string(),
		})
	}

	/// Non-streaming call (§4.5 `complete`). Applies pre-flight sanitization
	/// and at most one sanitizer-matched retry. The second element of the
	/// returned tuple names the sanitizer that fixed the request if a
	/// retry-with-fix happened (§4.2 "Retry-with-fix"), so the caller can
	/// emit `pipeline.auto_fix` (§3).
	pub async fn complete(
		&self,
		client_format: WireFormat,
		request: WireRequest,
		used_api_key: Option<&str>,
	) -> Result<(WireResponse, Option<Sanitizer>), GatewayError> {
		self.complete_inner(client_format, request, used_api_key, true).await
	}

	/// Bypasses sanitization entirely — the one-shot passthrough-fallback
	/// retry (§4.1, §4.5) re-parses the original untouched inbound bytes and
	/// sends them through unmodified.
	pub async fn complete_passthrough(
		&self,
		client_format: WireFormat,
		raw_body: &[u8],
		used_api_key: Option<&str>,
	) -> Result<WireResponse, GatewayError> {
		let request = types::parse_request(client_format, raw_body)?;
		Ok(self.complete_inner(client_format, request, used_api_key, false).await?.0)
	}

	async fn complete_inner(
		&self,
		client_format: WireFormat,
		request: WireRequest,
		used_api_key: Option<&str>,
		sanitize: bool,
	) -> Result<(WireResponse, Option<Sanitizer>), GatewayError> {
		let (endpoint, target_format) = self.resolve(client_format)?;
		let model = request.model().to_string();
		let mut working = request;
		if sanitize {
			sanitize::sanitize_all(&mut working);
		}

		let body = self.to_target_body(target_format, &working);
		match self.send_once(endpoint, target_format, &body).await {
			Ok(bytes) => Ok((self.from_target_body(target_format, client_format, &bytes, &model)?, None)),
			Err(GatewayError::UpstreamBadRequest { model, message, raw }) if sanitize => {
				match Sanitizer::for_error_text(&message) {
					Some(fix) => {
						let mut retried = working;
						sanitize::apply(&mut retried, fix);
						let retry_body = self.to_target_body(target_format, &retried);
						let bytes = self.send_once(endpoint, target_format, &retry_body).await?;
						Ok((self.from_target_body(target_format, client_format, &bytes, &model)?, Some(fix)))
					},
					None => Err(classify_bad_request(&model, message, raw)),
				}
			},
			Err(err @ GatewayError::Unauthenticated) => {
				if let Some(key) = used_api_key {
					self.credentials.invalidate(key);
				}
				Err(err)
			},
			Err(err) => Err(err),
		}
	}

	fn to_target_body(&self, target_format: WireFormat, request: &WireRequest) -> serde_json::Value {
		match (request, target_format) {
			(WireRequest::OpenAi(r), WireFormat::OpenAi) => serde_json::to_value(r.as_ref()),
			(WireRequest::Anthropic(r), WireFormat::Anthropic) => serde_json::to_value(r.as_ref()),
			(WireRequest::OpenAi(r), WireFormat::Anthropic) => {
				serde_json::to_value(convert::openai_request_to_anthropic(r))
			},
			(WireRequest::Anthropic(r), WireFormat::OpenAi) => {
				serde_json::to_value(convert::anthropic_request_to_openai(r))
			},
		}
		.unwrap_or(serde_json::Value::Null)
	}

	fn from_target_body(
		&self,
		target_format: WireFormat,
		client_format: WireFormat,
		bytes: &Bytes,
		model: &str,
	) -> Result<WireResponse, GatewayError> {
		match target_format {
			WireFormat::OpenAi => {
				let resp: o::ChatCompletionResponse = serde_json::from_slice(bytes).map_err(|e| GatewayError::UpstreamBadRequest {
					model: model.to_string(),
					message: e.to_string(),
					raw: String::new(),
				})?;
				Ok(if client_format == WireFormat::OpenAi {
					WireResponse::OpenAi(Box::new(resp))
				} else {
					WireResponse::Anthropic(Box::new(convert::openai_response_to_anthropic(&resp)))
				})
			},
			WireFormat::Anthropic => {
				let resp: a::MessagesResponse = serde_json::from_slice(bytes).map_err(|e| GatewayError::UpstreamBadRequest {
					model: model.to_string(),
					message: e.to_string(),
					raw: String::new(),
				})?;
				Ok(if client_format == WireFormat::Anthropic {
					WireResponse::Anthropic(Box::new(resp))
				} else {
					WireResponse::OpenAi(Box::new(convert::anthropic_response_to_openai(&resp)))
				})
			},
		}
	}

	/// Sends one non-streaming request and returns the raw response body on
	/// success, translating transport/status failures into `GatewayError`.
	async fn send_once(&self, endpoint: &Endpoint, format: WireFormat, body: &serde_json::Value) -> Result<Bytes, GatewayError> {
		let mut req = self.http.post(endpoint.path(format)).json(body);
		if let Some(key) = &endpoint.api_key {
			req = req.bearer_auth(key.expose_secret());
		}
		let response = tokio::time::timeout(self.timeout, req.send())
			.await
			.map_err(|_| GatewayError::UpstreamUnavailable {
				model: body.get("model").and_then(|m| m.as_str()).unwrap_or("unknown").to_string(),
				detail: "upstream call timed out".to_string(),
			})?
			.map_err(|e| GatewayError::UpstreamUnavailable {
				model: body.get("model").and_then(|m| m.as_str()).unwrap_or("unknown").to_string(),
				detail: e.to_string(),
			})?;

		let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("unknown").to_string();
		let status = response.status();
		if status.is_success() {
			return response
				.bytes()
				.await
				.map_err(|e| GatewayError::UpstreamUnavailable { model, detail: e.to_string() });
		}

		let text = response.text().await.unwrap_or_default();
		if status == reqwest::StatusCode::UNAUTHORIZED {
			return Err(GatewayError::Unauthenticated);
		}
		if status == reqwest::StatusCode::BAD_REQUEST {
			return Err(GatewayError::UpstreamBadRequest { model, message: text.clone(), raw: text });
		}
		Err(GatewayError::UpstreamUnavailable { model, detail: format!("upstream returned {status}: {text}") })
	}

	/// Streaming call (§4.5 `stream`). Returns a canonical event stream —
	/// format-independent regardless of whether the client and the chosen
	/// upstream agree on wire format, since folding into canonical events
	/// happens before this function returns. The second element names the
	/// sanitizer that fixed the request if a retry-with-fix happened.
	pub async fn stream(
		&self,
		client_format: WireFormat,
		request: WireRequest,
		used_api_key: Option<&str>,
	) -> Result<(CanonicalEventStream, Option<Sanitizer>), GatewayError> {
		self.stream_inner(client_format, request, used_api_key, true).await
	}

	pub async fn stream_passthrough(
		&self,
		client_format: WireFormat,
		raw_body: &[u8],
		used_api_key: Option<&str>,
	) -> Result<CanonicalEventStream, GatewayError> {
		let request = types::parse_request(client_format, raw_body)?;
		Ok(self.stream_inner(client_format, request, used_api_key, false).await?.0)
	}

	async fn stream_inner(
		&self,
		client_format: WireFormat,
		request: WireRequest,
		used_api_key: Option<&str>,
		sanitize: bool,
	) -> Result<(CanonicalEventStream, Option<Sanitizer>), GatewayError> {
		let (endpoint, target_format) = self.resolve(client_format)?;
		let model = request.model().to_string();
		let mut working = request;
		if sanitize {
			sanitize::sanitize_all(&mut working);
		}

		let body = self.to_target_body(target_format, &working);
		match self.open_stream(endpoint, target_format, &body).await {
			Ok(byte_stream) => Ok((Box::pin(assemble_stream(byte_stream, target_format, self.max_raw_chunks)), None)),
			Err(GatewayError::UpstreamBadRequest { model, message, raw }) if sanitize => match Sanitizer::for_error_text(&message) {
				Some(fix) => {
					let mut retried = working;
					sanitize::apply(&mut retried, fix);
					let retry_body = self.to_target_body(target_format, &retried);
					let byte_stream = self.open_stream(endpoint, target_format, &retry_body).await?;
					Ok((Box::pin(assemble_stream(byte_stream, target_format, self.max_raw_chunks)), Some(fix)))
				},
				None => Err(classify_bad_request(&model, message, raw)),
			},
			Err(err @ GatewayError::Unauthenticated) => {
				if let Some(key) = used_api_key {
					self.credentials.invalidate(key);
				}
				Err(err)
			},
			Err(err) => Err(err),
		}
	}

	/// Opens the streaming request and validates the initial status/headers
	/// before committing — a bad-request error on open is still retryable,
	/// since no SSE bytes have reached the client yet.
	async fn open_stream(
		&self,
		endpoint: &Endpoint,
		format: WireFormat,
		body: &serde_json::Value,
	) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static, GatewayError> {
		let mut stream_body = body.clone();
		if let Some(obj) = stream_body.as_object_mut() {
			obj.insert("stream".to_string(), serde_json::Value::Bool(true));
		}
		let mut req = self.http.post(endpoint.path(format)).json(&stream_body);
		if let Some(key) = &endpoint.api_key {
			req = req.bearer_auth(key.expose_secret());
		}
		let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("unknown").to_string();
		let response = tokio::time::timeout(self.timeout, req.send())
			.await
			.map_err(|_| GatewayError::UpstreamUnavailable { model: model.clone(), detail: "upstream call timed out".to_string() })?
			.map_err(|e| GatewayError::UpstreamUnavailable { model: model.clone(), detail: e.to_string() })?;

		let status = response.status();
		if status.is_success() {
			return Ok(response.bytes_stream());
		}
		let text = response.text().await.unwrap_or_default();
		if status == reqwest::StatusCode::UNAUTHORIZED {
			return Err(GatewayError::Unauthenticated);
		}
		if status == reqwest::StatusCode::BAD_REQUEST {
			return Err(GatewayError::UpstreamBadRequest { model, message: text.clone(), raw: text });
		}
		Err(GatewayError::UpstreamUnavailable { model, detail: format!("upstream returned {status}: {text}") })
	}
}

/// Distinguishes context-overflow from an ordinary unfixable bad request
/// (§4.2, §7: context-overflow errors are never auto-fixed).
fn classify_bad_request(model: &str, message: String, raw: String) -> GatewayError {
	let lower = message.to_lowercase();
	if lower.contains("context_length_exceeded") || lower.contains("maximum context length") || lower.contains("too many tokens") {
		GatewayError::ContextOverflow { model: model.to_string() }
	} else {
		GatewayError::UpstreamBadRequest { model: model.to_string(), message, raw }
	}
}

/// Reads the upstream's SSE body incrementally, decoding `data:` frames as
/// they arrive and handing them to the assembler matching `target_format`.
/// OpenAI's `[DONE]` sentinel and Anthropic's `message_stop` both end the
/// stream; a body that simply closes is handled identically (§4.3
/// `stream_closed` always emitted).
fn assemble_stream<S>(byte_stream: S, target_format: WireFormat, max_raw_chunks: usize) -> impl Stream<Item = Result<CanonicalEvent, GatewayError>>
where
	S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
	struct State<S> {
		frames: Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>,
		pending: VecDeque<CanonicalEvent>,
		openai: Option<OpenAiAssembler>,
		anthropic: Option<AnthropicAssembler>,
		done: bool,
		_marker: std::marker::PhantomData<S>,
	}

	let frames = Box::pin(decode_sse_data_frames(byte_stream));
	let state = State {
		frames,
		pending: VecDeque::new(),
		openai: (target_format == WireFormat::OpenAi).then(|| OpenAiAssembler::new(max_raw_chunks)),
		anthropic: (target_format == WireFormat::Anthropic).then(|| AnthropicAssembler::new(max_raw_chunks)),
		done: false,
		_marker: std::marker::PhantomData,
	};

	stream::unfold(state, move |mut st| async move {
		loop {
			if let Some(event) = st.pending.pop_front() {
				return Some((Ok(event), st));
			}
			if st.done {
				return None;
			}
			match st.frames.next().await {
				Some(Ok(data)) => {
					if target_format == WireFormat::OpenAi {
						if data.as_ref() == b"[DONE]" {
							if let Some(assembler) = st.openai.as_mut() {
								st.pending.extend(assembler.close());
							}
							st.done = true;
							continue;
						}
						match serde_json::from_slice::<o::ChatCompletionChunk>(&data) {
							Ok(chunk) => {
								if let Some(assembler) = st.openai.as_mut() {
									st.pending.extend(assembler.feed(&chunk));
								}
							},
							Err(e) => return Some((Err(GatewayError::StreamMidError(e.to_string())), st)),
						}
					} else {
						match serde_json::from_slice::<a::StreamEvent>(&data) {
							Ok(event) => {
								let is_stop = matches!(event, a::StreamEvent::MessageStop);
								if let Some(assembler) = st.anthropic.as_mut() {
									st.pending.extend(assembler.feed(&event));
								}
								if is_stop {
									st.done = true;
								}
							},
							Err(e) => return Some((Err(GatewayError::StreamMidError(e.to_string())), st)),
						}
					}
				},
				Some(Err(e)) => {
					st.done = true;
					return Some((Err(e), st));
				},
				None => {
					st.done = true;
					if let Some(assembler) = st.openai.as_mut() {
						st.pending.extend(assembler.close());
					}
					if let Some(assembler) = st.anthropic.as_mut() {
						st.pending.extend(assembler.close());
					}
				},
			}
		}
	})
}

/// Incrementally decodes an SSE byte stream into its `data:` field payloads,
/// discarding comments and other frame kinds. Mirrors the teacher's
/// `json_passthrough` helper, adapted from `http::Body` to `reqwest`'s
/// `bytes_stream`.
fn decode_sse_data_frames<S>(byte_stream: S) -> impl Stream<Item = Result<Bytes, GatewayError>>
where
	S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
	struct State<S> {
		stream: S,
		decoder: SseDecoder<Bytes>,
		buf: BytesMut,
		done: bool,
	}

	let state = State {
		stream: byte_stream,
		decoder: SseDecoder::with_max_size(MAX_SSE_FRAME_BYTES),
		buf: BytesMut::new(),
		done: false,
	};

	stream::unfold(state, |mut st| async move {
		loop {
			if !st.done {
				match st.decoder.decode(&mut st.buf) {
					Ok(Some(frame)) => {
						if let Some(data) = frame_data(frame) {
							return Some((Ok(data), st));
						}
						continue;
					},
					Ok(None) => {},
					Err(e) => {
						st.done = true;
						return Some((Err(GatewayError::StreamMidError(e.to_string())), st));
					},
				}
			}

			match st.stream.next().await {
				Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
				Some(Err(e)) => {
					st.done = true;
					return Some((Err(GatewayError::UpstreamUnavailable { model: "unknown".to_string(), detail: e.to_string() }), st));
				},
				None => {
					st.done = true;
					if let Ok(Some(frame)) = st.decoder.decode_eof(&mut st.buf) {
						if let Some(data) = frame_data(frame) {
							return Some((Ok(data), st));
						}
					}
					return None;
				},
			}
		}
	})
}

fn frame_data(frame: Frame<Bytes>) -> Option<Bytes> {
	match frame {
		Frame::Event(event) => Some(event.data),
		_ => None,
	}
}

/// Validates a credential against the configured upstream's own auth check
/// (§4.7 "validate against a configured upstream"), rather than against a
/// local allow-list — both auth modes share this check, `both` additionally
/// requiring admin allow-list membership that the admin surface manages.
pub struct UpstreamKeyValidator {
	http: reqwest::Client,
	probe: Option<Endpoint>,
}

impl UpstreamKeyValidator {
	pub fn new(openai: Option<Endpoint>, anthropic: Option<Endpoint>) -> Self {
		Self { http: reqwest::Client::new(), probe: openai.or(anthropic) }
	}
}

#[async_trait::async_trait]
impl crate::credentials::Validator for UpstreamKeyValidator {
	async fn validate(&self, api_key: &str) -> anyhow::Result<bool> {
		let Some(endpoint) = &self.probe else {
			anyhow::bail!("no upstream is configured to validate credentials against");
		};
		let base = endpoint.base_url.trim_end_matches('/');
		let response = self.http.get(format!("{base}/models")).bearer_auth(api_key).send().await?;
		Ok(response.status() != reqwest::StatusCode::UNAUTHORIZED)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_context_overflow_distinctly_from_ordinary_bad_request() {
		let err = classify_bad_request("gpt-4", "maximum context length is 8192 tokens".to_string(), String::new());
		assert!(matches!(err, GatewayError::ContextOverflow { .. }));

		let err = classify_bad_request("gpt-4", "missing required field 'model'".to_string(), String::new());
		assert!(matches!(err, GatewayError::UpstreamBadRequest { .. }));
	}

	#[test]
	fn resolve_falls_back_to_the_other_configured_format() {
		let cache = std::sync::Arc::new(CredentialCache::new(Duration::from_secs(60), Duration::from_secs(5)));
		let client = UpstreamClient::new(None, Some(Endpoint::new("http://localhost", None)), cache, Duration::from_secs(5));
		let (_, target) = client.resolve(WireFormat::OpenAi).unwrap();
		assert_eq!(target, WireFormat::Anthropic);
	}
}
