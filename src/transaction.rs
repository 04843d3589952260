//! Transaction and policy-context state (§3). A transaction is created on
//! request ingress and destroyed when the response finishes or the client
//! disconnects; exactly one transaction exists per in-flight request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::observability::emitter::Emitter;
use crate::types::{WireFormat, WireRequest};

/// Per-transaction mutable key-value store, owned solely by the active
/// policy instance for this transaction (§3, §4.4 "scratchpad").
#[derive(Debug, Default)]
pub struct Scratchpad(Mutex<HashMap<String, Value>>);

impl Scratchpad {
	pub fn get(&self, key: &str) -> Option<Value> {
		self.0.lock().get(key).cloned()
	}

	pub fn set(&self, key: impl Into<String>, value: Value) {
		self.0.lock().insert(key.into(), value);
	}

	pub fn remove(&self, key: &str) -> Option<Value> {
		self.0.lock().remove(key)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.0.lock().contains_key(key)
	}
}

/// One end-to-end request/response cycle through the gateway (§3).
pub struct Transaction {
	pub id: Uuid,
	pub format: WireFormat,
	pub session_id: Option<String>,
	/// The body exactly as it arrived, prior to any policy mutation.
	pub raw_inbound: Bytes,
	next_seq: AtomicI64,
	pub output_finished: AtomicBool,
}

impl Transaction {
	pub fn new(format: WireFormat, session_id: Option<String>, raw_inbound: Bytes) -> Self {
		Self {
			id: Uuid::new_v4(),
			format,
			session_id,
			raw_inbound,
			next_seq: AtomicI64::new(0),
			output_finished: AtomicBool::new(false),
		}
	}

	/// Allocates the next gap-free sequence number for an observability
	/// event on this transaction (§3 invariant).
	pub fn next_sequence(&self) -> i64 {
		self.next_seq.fetch_add(1, Ordering::SeqCst)
	}
}

/// Scoped to one transaction; mutated only by hook implementations (§3).
pub struct PolicyContext {
	pub transaction: Arc<Transaction>,
	pub emitter: Arc<Emitter>,
	pub scratchpad: Arc<Scratchpad>,
	pub original_request: WireRequest,
}

impl PolicyContext {
	pub fn new(transaction: Arc<Transaction>, emitter: Arc<Emitter>, original_request: WireRequest) -> Self {
		Self {
			transaction,
			emitter,
			scratchpad: Arc::new(Scratchpad::default()),
			original_request,
		}
	}

	pub fn txn_id(&self) -> Uuid {
		self.transaction.id
	}

	pub fn session_id(&self) -> Option<&str> {
		self.transaction.session_id.as_deref()
	}

	/// True once a streaming policy has finalized the output mid-stream
	/// (§4.4 "termination contract"). The runtime checks this after every
	/// hook invocation and suppresses further policy-sourced events once set.
	pub fn is_output_finished(&self) -> bool {
		self.transaction.output_finished.load(Ordering::SeqCst)
	}

	pub fn finish_output(&self) {
		self.transaction.output_finished.store(true, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sequence_numbers_are_gap_free() {
		let txn = Transaction::new(WireFormat::OpenAi, None, Bytes::new());
		let seqs: Vec<i64> = (0..5).map(|_| txn.next_sequence()).collect();
		assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn scratchpad_roundtrips_values() {
		let pad = Scratchpad::default();
		pad.set("k", Value::from(42));
		assert_eq!(pad.get("k"), Some(Value::from(42)));
		assert!(pad.remove("k").is_some());
		assert!(!pad.contains("k"));
	}
}
