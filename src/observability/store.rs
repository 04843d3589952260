//! The durable event store. Persistence-layer query optimization and the
//! actual Postgres schema/migration tooling are out of scope (§1); this
//! module only defines the trait boundary plus an in-memory implementation
//! suitable for tests and single-process deployments. A Postgres-backed
//! `EventStore` is an external collaborator that can be slotted in here
//! without touching the emitter or pipeline.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::observability::event::TransactionEvent;

#[async_trait]
pub trait EventStore: Send + Sync {
	async fn append(&self, event: TransactionEvent) -> anyhow::Result<()>;

	/// Read-side used by the history/debug browser (§1, out of scope here
	/// but the interface is retained so that surface can be layered on).
	async fn query_by_session(&self, session_id: &str) -> anyhow::Result<Vec<TransactionEvent>>;

	async fn query_by_transaction(&self, transaction_id: Uuid) -> anyhow::Result<Vec<TransactionEvent>>;
}

/// Bounded in-memory ring buffer. Good enough for tests and for running the
/// gateway without a configured `LUTHIEN_EVENT_STORE_URL`.
pub struct InMemoryEventStore {
	events: Mutex<VecDeque<TransactionEvent>>,
	capacity: usize,
	write_timeout: Duration,
}

impl InMemoryEventStore {
	pub fn new(capacity: usize, write_timeout: Duration) -> Self {
		Self {
			events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
			capacity,
			write_timeout,
		}
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl EventStore for InMemoryEventStore {
	async fn append(&self, event: TransactionEvent) -> anyhow::Result<()> {
		let write = async {
			let mut guard = self.events.lock();
			if guard.len() >= self.capacity {
				guard.pop_front();
			}
			guard.push_back(event);
		};
		// Event-store timeouts are swallowed (§5 "Timeouts").
		if tokio::time::timeout(self.write_timeout, write).await.is_err() {
			tracing::warn!("event store write timed out");
		}
		Ok(())
	}

	async fn query_by_session(&self, session_id: &str) -> anyhow::Result<Vec<TransactionEvent>> {
		Ok(
			self
				.events
				.lock()
				.iter()
				.filter(|e| e.session_id.as_deref() == Some(session_id))
				.cloned()
				.collect(),
		)
	}

	async fn query_by_transaction(&self, transaction_id: Uuid) -> anyhow::Result<Vec<TransactionEvent>> {
		Ok(
			self
				.events
				.lock()
				.iter()
				.filter(|e| e.transaction_id == transaction_id)
				.cloned()
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::observability::event::{EventType, PipelineEventKind};

	#[tokio::test]
	async fn appends_and_queries_by_session() {
		let store = InMemoryEventStore::new(16, Duration::from_secs(1));
		let txn_id = Uuid::new_v4();
		let event = TransactionEvent::new(
			txn_id,
			Some("sess-1".to_string()),
			0,
			EventType::Pipeline(PipelineEventKind::ClientRequest),
			json!({}),
		);
		store.append(event).await.unwrap();
		let found = store.query_by_session("sess-1").await.unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].transaction_id, txn_id);
	}

	#[tokio::test]
	async fn drops_oldest_when_over_capacity() {
		let store = InMemoryEventStore::new(2, Duration::from_secs(1));
		for i in 0..3 {
			let event = TransactionEvent::new(
				Uuid::new_v4(),
				None,
				i,
				EventType::Pipeline(PipelineEventKind::ClientRequest),
				json!({}),
			);
			store.append(event).await.unwrap();
		}
		assert_eq!(store.len(), 2);
	}
}
