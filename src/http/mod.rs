//! The client-facing HTTP surface (§6): `/v1/chat/completions`, `/v1/messages`,
//! `/health`. Thin adapter over `pipeline::drive` — credential extraction and
//! the `X-Call-Id` header are the only concerns that live here rather than in
//! the driver, since they're HTTP-transport concerns, not transaction ones.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_extra::headers::HeaderMapExt;
use axum_extra::headers::authorization::{Authorization, Bearer};
use futures_util::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::pipeline::{self, AppState, DriverOutcome};
use crate::types::WireFormat;

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/messages", post(messages))
		.route("/health", get(health))
		.with_state(state)
}

async fn health() -> impl IntoResponse {
	StatusCode::OK
}

async fn chat_completions(state: State<Arc<AppState>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
	handle(state, WireFormat::OpenAi, headers, body).await
}

async fn messages(state: State<Arc<AppState>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
	handle(state, WireFormat::Anthropic, headers, body).await
}

async fn handle(State(state): State<Arc<AppState>>, format: WireFormat, headers: HeaderMap, body: axum::body::Bytes) -> Response {
	let api_key = headers.typed_get::<Authorization<Bearer>>().map(|auth| auth.0.token().to_string());

	if let Some(response) = check_auth(&state, format, api_key.as_deref()).await {
		return response;
	}

	let (txn_id, outcome) = pipeline::drive(state, format, body, api_key).await;
	with_call_id(txn_id, render(outcome))
}

/// `§4.7`: lookup-or-validate against the configured auth mode. A missing
/// credential is rejected outright; `passthrough` accepts anything the
/// upstream would; `both` additionally requires admin allow-list membership,
/// which (§6) is managed entirely through `/admin/credentials/cached` —
/// there is no separate allow-list write surface, so membership there *is*
/// the allow-list and both modes share this one check (§9 open question,
/// resolved as implementation-defined).
async fn check_auth(state: &AppState, format: WireFormat, api_key: Option<&str>) -> Option<Response> {
	let Some(key) = api_key else {
		return Some(unauthenticated_response(format));
	};
	match state.credentials.check(key, state.validator.as_ref()).await {
		Ok(true) => None,
		Ok(false) => Some(unauthenticated_response(format)),
		Err(err) => {
			tracing::warn!(error = %err, "credential validation failed");
			Some(unauthenticated_response(format))
		},
	}
}

fn unauthenticated_response(format: WireFormat) -> Response {
	let err = crate::error::GatewayError::Unauthenticated;
	let body = err.to_wire_body(format);
	(err.status_code(), axum::Json(body)).into_response()
}

fn render(outcome: DriverOutcome) -> Response {
	match outcome {
		DriverOutcome::Response { status, body } => (status, axum::Json(body)).into_response(),
		DriverOutcome::Stream { receiver } => {
			let stream =
				UnboundedReceiverStream::new(receiver).map(|frame| Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame)));
			Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "text/event-stream")
				.header(header::CACHE_CONTROL, "no-cache")
				.body(Body::from_stream(stream))
				.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
		},
	}
}

fn with_call_id(txn_id: uuid::Uuid, mut response: Response) -> Response {
	if let Ok(value) = HeaderValue::from_str(&txn_id.to_string()) {
		response.headers_mut().insert("X-Call-Id", value);
	}
	response
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unauthenticated_response_carries_401() {
		let response = unauthenticated_response(WireFormat::OpenAi);
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	}
}
