//! Fire-and-forget observability publish (§5, §9 "Emitter as fire-and-forget").
//! The hot path never awaits durable storage: `Emitter::publish` only takes a
//! lock on an in-process bounded queue; a background task drains it into the
//! configured `EventStore` with at-least-once semantics. Overflow drops the
//! oldest queued event and bumps a counter — we never drop a transaction by
//! blocking it on a full observability queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::observability::event::{EventType, Severity, TransactionEvent};
use crate::observability::store::EventStore;

pub struct Emitter {
	queue: Mutex<VecDeque<TransactionEvent>>,
	capacity: usize,
	notify: Notify,
	dropped: AtomicU64,
	published: AtomicU64,
}

impl Emitter {
	/// Spawns the background drain task and returns a handle the hot path can
	/// clone cheaply (it's an `Arc`).
	pub fn spawn(store: Arc<dyn EventStore>, capacity: usize) -> Arc<Self> {
		let emitter = Arc::new(Self {
			queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
			capacity,
			notify: Notify::new(),
			dropped: AtomicU64::new(0),
			published: AtomicU64::new(0),
		});
		let worker = emitter.clone();
		tokio::spawn(async move { worker.drain_loop(store).await });
		emitter
	}

	/// Never blocks and never returns an error to the caller: a publish
	/// failure is logged and dropped (§5 "Shared-resource policy").
	pub fn publish(
		&self,
		transaction_id: Uuid,
		session_id: Option<String>,
		sequence: i64,
		event_type: EventType,
		payload: serde_json::Value,
	) {
		let event = TransactionEvent::new(transaction_id, session_id, sequence, event_type, payload);
		self.enqueue(event);
	}

	/// Like `publish`, but tags the event with a severity (§3 "optional
	/// severity") — used for events that represent a failure worth
	/// surfacing distinctly in the event stream, e.g. a fail-secure judge
	/// error.
	pub fn publish_with_severity(
		&self,
		transaction_id: Uuid,
		session_id: Option<String>,
		sequence: i64,
		event_type: EventType,
		payload: serde_json::Value,
		severity: Severity,
	) {
		let event = TransactionEvent::new(transaction_id, session_id, sequence, event_type, payload).with_severity(severity);
		self.enqueue(event);
	}

	fn enqueue(&self, event: TransactionEvent) {
		let mut queue = self.queue.lock();
		if queue.len() >= self.capacity {
			queue.pop_front();
			let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
			tracing::warn!(dropped, "observability queue full, dropped oldest event");
		}
		queue.push_back(event);
		drop(queue);
		self.notify.notify_one();
	}

	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	pub fn published_count(&self) -> u64 {
		self.published.load(Ordering::Relaxed)
	}

	async fn drain_loop(self: Arc<Self>, store: Arc<dyn EventStore>) {
		loop {
			let next = self.queue.lock().pop_front();
			let Some(event) = next else {
				self.notify.notified().await;
				continue;
			};
			if let Err(err) = store.append(event).await {
				tracing::warn!(error = %err, "event store append failed");
			} else {
				self.published.fetch_add(1, Ordering::Relaxed);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::json;

	use super::*;
	use crate::observability::event::PipelineEventKind;
	use crate::observability::store::InMemoryEventStore;

	#[tokio::test]
	async fn publish_eventually_reaches_store() {
		let store = Arc::new(InMemoryEventStore::new(64, Duration::from_secs(1)));
		let emitter = Emitter::spawn(store.clone(), 64);
		let txn_id = Uuid::new_v4();
		emitter.publish(
			txn_id,
			None,
			0,
			EventType::Pipeline(PipelineEventKind::ClientRequest),
			json!({"ok": true}),
		);
		for _ in 0..50 {
			if store.len() == 1 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(store.len(), 1);
		assert_eq!(emitter.published_count(), 1);
	}

	#[test]
	fn overflow_drops_oldest_and_counts() {
		let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStoreNoop);
		let emitter = Arc::new(Emitter {
			queue: Mutex::new(VecDeque::new()),
			capacity: 2,
			notify: Notify::new(),
			dropped: AtomicU64::new(0),
			published: AtomicU64::new(0),
		});
		let _ = &store;
		for i in 0..5 {
			emitter.publish(
				Uuid::new_v4(),
				None,
				i,
				EventType::Pipeline(PipelineEventKind::ClientRequest),
				json!({}),
			);
		}
		assert_eq!(emitter.queue.lock().len(), 2);
		assert_eq!(emitter.dropped_count(), 3);
	}

	struct InMemoryEventStoreNoop;
	#[async_trait::async_trait]
	impl EventStore for InMemoryEventStoreNoop {
		async fn append(&self, _event: TransactionEvent) -> anyhow::Result<()> {
			Ok(())
		}
		async fn query_by_session(&self, _session_id: &str) -> anyhow::Result<Vec<TransactionEvent>> {
			Ok(vec![])
		}
		async fn query_by_transaction(&self, _transaction_id: Uuid) -> anyhow::Result<Vec<TransactionEvent>> {
			Ok(vec![])
		}
	}
}
