//! The policy runtime (§4.4): hook dispatch, keepalive, and the termination
//! contract. A policy implements a subset of the hooks below; defaults are
//! supplied for each so a policy need only override what it cares about.

pub mod parallel_rules;
pub mod tool_call_judge;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::transaction::PolicyContext;
use crate::types::canonical::{CanonicalEvent, ContentBlock};
use crate::types::{WireRequest, WireResponse};

/// A cooperative callable a policy invokes during long external I/O (e.g. a
/// judge call) so the runtime can emit a benign frame and hold the
/// connection open (§4.4 "Keepalive"). Backed by a channel over the egress
/// queue rather than a timer.
#[derive(Clone)]
pub struct Keepalive {
	tx: mpsc::UnboundedSender<()>,
}

impl Keepalive {
	pub fn new(tx: mpsc::UnboundedSender<()>) -> Self {
		Self { tx }
	}

	/// Fires a keepalive. Best-effort: if the egress side has already gone
	/// away (client disconnected), this is silently a no-op.
	pub fn fire(&self) {
		let _ = self.tx.send(());
	}

	/// A keepalive with no receiver, for call sites (e.g. non-streaming
	/// responses) that have nothing to hold open.
	pub fn noop() -> Self {
		Self::new(mpsc::unbounded_channel().0)
	}
}

/// Streaming hooks receive this instead of the bare `PolicyContext` so they
/// can call `keepalive()` during long external I/O.
pub struct StreamPolicyContext {
	pub base: Arc<PolicyContext>,
	pub keepalive: Keepalive,
}

impl StreamPolicyContext {
	pub fn is_output_finished(&self) -> bool {
		self.base.is_output_finished()
	}

	pub fn finish_output(&self) {
		self.base.finish_output();
	}
}

/// The hook surface a policy may implement (§4.4). Every method has a
/// passthrough default so a policy need only override what it changes.
#[async_trait]
pub trait Policy: Send + Sync {
	fn name(&self) -> &str;

	/// Non-streaming request hook. May return a modified request, or raise
	/// `GatewayError::PolicyBlocked` to refuse before ever calling upstream.
	async fn on_request(
		&self,
		request: WireRequest,
		_ctx: &PolicyContext,
	) -> Result<WireRequest, GatewayError> {
		Ok(request)
	}

	/// Non-streaming response hook. May return a synthetic refusal.
	async fn on_response(
		&self,
		response: WireResponse,
		_ctx: &PolicyContext,
	) -> Result<WireResponse, GatewayError> {
		Ok(response)
	}

	/// Streaming hook, fired once per canonical inbound event. Returns zero
	/// or more events to forward (which may differ from the input); may call
	/// `ctx.finish_output()` to halt further forwarding (§4.4 "termination
	/// contract").
	async fn on_stream_event(
		&self,
		event: CanonicalEvent,
		_ctx: &StreamPolicyContext,
	) -> Vec<CanonicalEvent> {
		vec![event]
	}

	/// Convenience wrapper fired exactly when a block completes, in addition
	/// to `on_stream_event` having already seen the `BlockComplete` event.
	/// Default does nothing extra — policies that want to act on block
	/// completion override this instead of pattern-matching inside
	/// `on_stream_event`.
	async fn on_block_complete(
		&self,
		_block: &ContentBlock,
		_ctx: &StreamPolicyContext,
	) -> Vec<CanonicalEvent> {
		vec![]
	}

	/// Always invoked on stream exit, even on error or client cancellation.
	/// Cleanup only; no return value.
	async fn on_stream_closed(&self, _ctx: &StreamPolicyContext) {}
}

/// A policy that does nothing: the default when no policy has been
/// configured yet.
pub struct NoopPolicy;

#[async_trait]
impl Policy for NoopPolicy {
	fn name(&self) -> &str {
		"noop"
	}
}

/// Immutable bundle describing the currently active policy (§3, §4.7). The
/// *next* transaction observes a swap; in-flight transactions keep the
/// descriptor they bound to.
pub struct ActivePolicyDescriptor {
	pub name: String,
	pub class_ref: String,
	pub config: serde_json::Value,
	pub enabled_by: String,
	pub enabled_at: DateTime<Utc>,
	pub policy: Arc<dyn Policy>,
}

/// Single-writer-via-admin-endpoint, atomically-swappable pointer to the
/// active policy descriptor (§5 "Shared-resource policy"). Readers take a
/// snapshot once, at transaction start, and need no further locking.
pub struct ActivePolicy {
	current: ArcSwap<ActivePolicyDescriptor>,
}

impl ActivePolicy {
	pub fn new(descriptor: ActivePolicyDescriptor) -> Self {
		Self { current: ArcSwap::from_pointee(descriptor) }
	}

	/// Snapshot taken once per transaction, at phase 1 (§4.1, §4.7 "Swap is
	/// atomic").
	pub fn snapshot(&self) -> Arc<ActivePolicyDescriptor> {
		self.current.load_full()
	}

	pub fn swap(&self, descriptor: ActivePolicyDescriptor) {
		self.current.store(Arc::new(descriptor));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn snapshot_is_stable_across_a_swap() {
		let initial = ActivePolicyDescriptor {
			name: "noop".into(),
			class_ref: "luthien::policy::NoopPolicy".into(),
			config: serde_json::json!({}),
			enabled_by: "test".into(),
			enabled_at: Utc::now(),
			policy: Arc::new(NoopPolicy),
		};
		let active = ActivePolicy::new(initial);
		let bound = active.snapshot();
		assert_eq!(bound.name, "noop");

		active.swap(ActivePolicyDescriptor {
			name: "other".into(),
			class_ref: "luthien::policy::NoopPolicy".into(),
			config: serde_json::json!({}),
			enabled_by: "test".into(),
			enabled_at: Utc::now(),
			policy: Arc::new(NoopPolicy),
		});

		// The transaction that already bound keeps its snapshot.
		assert_eq!(bound.name, "noop");
		assert_eq!(active.snapshot().name, "other");
	}
}
