//! Transaction event schema (§3). Immutable, append-only; destroyed only by
//! retention. Sequence numbers are gap-free per transaction (§3 invariant).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Debug,
	Info,
	Warning,
	Error,
}

/// The closed set of well-known event types named in §3. Policies emit
/// additional `policy.<name>.<subtype>` values through `EventType::Policy`,
/// which is why this isn't a flat enum of every possible string: the set of
/// policies is user-configured and extensible (§4.7 "live policy swap").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventType {
	Pipeline(PipelineEventKind),
	Policy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
	ClientRequest,
	BackendRequest,
	ClientResponse,
	AutoFix,
	PassthroughFallback,
}

impl EventType {
	pub fn as_str(&self) -> String {
		match self {
			EventType::Pipeline(PipelineEventKind::ClientRequest) => "pipeline.client_request".to_string(),
			EventType::Pipeline(PipelineEventKind::BackendRequest) => "pipeline.backend_request".to_string(),
			EventType::Pipeline(PipelineEventKind::ClientResponse) => "pipeline.client_response".to_string(),
			EventType::Pipeline(PipelineEventKind::AutoFix) => "pipeline.auto_fix".to_string(),
			EventType::Pipeline(PipelineEventKind::PassthroughFallback) => {
				"pipeline.passthrough_fallback".to_string()
			},
			EventType::Policy(name) => name.clone(),
		}
	}

	pub fn policy(policy_name: &str, subtype: &str) -> Self {
		EventType::Policy(format!("policy.{policy_name}.{subtype}"))
	}
}

/// Immutable record of one step in a transaction's lifecycle (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
	pub transaction_id: Uuid,
	pub session_id: Option<String>,
	pub sequence: i64,
	pub event_type: String,
	pub timestamp: DateTime<Utc>,
	pub payload: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub severity: Option<Severity>,
}

impl TransactionEvent {
	pub fn new(
		transaction_id: Uuid,
		session_id: Option<String>,
		sequence: i64,
		event_type: EventType,
		payload: Value,
	) -> Self {
		Self {
			transaction_id,
			session_id,
			sequence,
			event_type: event_type.as_str(),
			timestamp: Utc::now(),
			payload,
			severity: None,
		}
	}

	pub fn with_severity(mut self, severity: Severity) -> Self {
		self.severity = Some(severity);
		self
	}
}
