//! The admin control surface (§4.7, §6): live policy swap and credential
//! cache management, gated behind a bearer admin token. Kept as a separate
//! router merged into the main app in `main.rs` rather than namespaced
//! under the client-facing one, since its auth model (one shared token) is
//! entirely different from per-request upstream credentials.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum_extra::headers::HeaderMapExt;
use axum_extra::headers::authorization::{Authorization, Bearer};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::credentials::AuthMode;
use crate::judge::JudgeClient;
use crate::pipeline::AppState;
use crate::policy::parallel_rules::{ContentKind, ParallelRulesConfig, ParallelRulesPolicy, RuleConfig, ViolationResponseConfig};
use crate::policy::tool_call_judge::{ToolCallJudgeConfig, ToolCallJudgePolicy};
use crate::policy::{ActivePolicyDescriptor, NoopPolicy, Policy};

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/admin/policy/set", post(set_policy))
		.route("/admin/auth/config", get(get_auth_config).patch(patch_auth_config))
		.route("/admin/credentials/cached", get(list_credentials).delete(invalidate_all))
		.route("/admin/credentials/cached/{key_hash}", delete(invalidate_one))
		.layer(middleware::from_fn_with_state(state.clone(), require_admin_token))
		.with_state(state)
}

/// Every admin route requires `Authorization: Bearer <admin_token>`. If no
/// admin token is configured the admin surface is closed entirely — there is
/// no "open admin" mode.
async fn require_admin_token(State(state): State<Arc<AppState>>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> Response {
	let Some(configured) = &state.admin_token else {
		return StatusCode::SERVICE_UNAVAILABLE.into_response();
	};
	let presented = headers.typed_get::<Authorization<Bearer>>();
	match presented {
		Some(auth) if constant_time_eq(auth.0.token(), configured.expose_secret()) => next.run(request).await,
		_ => StatusCode::UNAUTHORIZED.into_response(),
	}
}

fn constant_time_eq(a: &str, b: &str) -> bool {
	let (a, b) = (a.as_bytes(), b.as_bytes());
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
struct SetPolicyRequest {
	policy_class_ref: String,
	#[serde(default)]
	config: Value,
	enabled_by: String,
}

/// `POST /admin/policy/set` (§4.7 "live policy swap"). Validates that the
/// class ref resolves and its config parses before installing, so a bad
/// request never clobbers the currently-active descriptor.
async fn set_policy(State(state): State<Arc<AppState>>, axum::Json(req): axum::Json<SetPolicyRequest>) -> Response {
	let started = Instant::now();
	match build_policy(&req.policy_class_ref, &req.config, state.judge.clone()) {
		Ok(policy) => {
			let descriptor = ActivePolicyDescriptor {
				name: policy.name().to_string(),
				class_ref: req.policy_class_ref.clone(),
				config: req.config.clone(),
				enabled_by: req.enabled_by.clone(),
				enabled_at: Utc::now(),
				policy,
			};
			let name = descriptor.name.clone();
			state.active_policy.swap(descriptor);
			(
				StatusCode::OK,
				axum::Json(json!({
					"success": true,
					"policy": name,
					"restart_duration_ms": started.elapsed().as_millis(),
				})),
			)
				.into_response()
		},
		Err(error) => (
			StatusCode::BAD_REQUEST,
			axum::Json(json!({
				"success": false,
				"error": error,
				"troubleshooting": "check policy_class_ref matches a registered policy and config matches its expected schema",
			})),
		)
			.into_response(),
	}
}

/// The closed set of policy classes a `policy_class_ref` may resolve to
/// (§4.7 "the referenced class can be resolved"). Not a dynamic plugin
/// loader — new policies are added here at compile time, matching how the
/// reference judge policies themselves are fixed, compiled-in types.
fn build_policy(class_ref: &str, config: &Value, judge: Arc<JudgeClient>) -> Result<Arc<dyn Policy>, String> {
	match class_ref {
		"luthien::policy::NoopPolicy" => Ok(Arc::new(NoopPolicy)),
		"luthien::policy::tool_call_judge::ToolCallJudgePolicy" => {
			Ok(Arc::new(ToolCallJudgePolicy::new(parse_tool_call_judge_config(config)?, judge)))
		},
		"luthien::policy::parallel_rules::ParallelRulesPolicy" => {
			Ok(Arc::new(ParallelRulesPolicy::new(parse_parallel_rules_config(config)?, judge)))
		},
		other => Err(format!("unknown policy class_ref: {other}")),
	}
}

fn parse_tool_call_judge_config(config: &Value) -> Result<ToolCallJudgeConfig, String> {
	let default = ToolCallJudgeConfig::default();
	Ok(ToolCallJudgeConfig {
		probability_threshold: config.get("probability_threshold").and_then(Value::as_f64).unwrap_or(default.probability_threshold),
		temperature: config.get("temperature").and_then(Value::as_f64).unwrap_or(default.temperature),
		max_tokens: config.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(default.max_tokens),
		judge_instructions: config
			.get("judge_instructions")
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or(default.judge_instructions),
		blocked_message_template: config
			.get("blocked_message_template")
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or(default.blocked_message_template),
	})
}

fn parse_parallel_rules_config(config: &Value) -> Result<ParallelRulesConfig, String> {
	let default_threshold = config.get("default_threshold").and_then(Value::as_f64).unwrap_or(0.5);
	let rules_value = config.get("rules").and_then(Value::as_array).ok_or("config.rules must be an array")?;
	let rules = rules_value.iter().map(parse_rule_config).collect::<Result<Vec<_>, _>>()?;
	Ok(ParallelRulesConfig {
		judge_temperature: config.get("judge_temperature").and_then(Value::as_f64).unwrap_or(0.0),
		judge_max_tokens: config.get("judge_max_tokens").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(256),
		default_threshold,
		rules,
	})
}

fn parse_rule_config(value: &Value) -> Result<RuleConfig, String> {
	let name = value.get("name").and_then(Value::as_str).ok_or("rule.name is required")?.to_string();
	let ruletext = value.get("ruletext").and_then(Value::as_str).ok_or("rule.ruletext is required")?.to_string();
	let applies_to = value
		.get("applies_to")
		.and_then(Value::as_array)
		.map(|values| {
			values
				.iter()
				.filter_map(Value::as_str)
				.filter_map(|s| match s {
					"text" => Some(ContentKind::Text),
					"tool_call" => Some(ContentKind::ToolCall),
					_ => None,
				})
				.collect::<HashSet<_>>()
		})
		.unwrap_or_else(|| HashSet::from([ContentKind::Text]));
	let violation_response = value
		.get("violation_response")
		.map(|v| ViolationResponseConfig {
			static_message: v.get("static_message").and_then(Value::as_str).map(str::to_string),
			include_original: v.get("include_original").and_then(Value::as_bool).unwrap_or(false),
			include_explanation: v.get("include_explanation").and_then(Value::as_bool).unwrap_or(true),
		})
		.unwrap_or_default();
	Ok(RuleConfig {
		name,
		ruletext,
		applies_to,
		probability_threshold: value.get("probability_threshold").and_then(Value::as_f64),
		violation_response,
	})
}

#[derive(Serialize)]
struct AuthConfigView {
	auth_mode: AuthMode,
	valid_ttl_secs: u64,
	invalid_ttl_secs: u64,
}

async fn get_auth_config(State(state): State<Arc<AppState>>) -> Response {
	(
		StatusCode::OK,
		axum::Json(AuthConfigView {
			auth_mode: state.auth_mode.get(),
			valid_ttl_secs: state.credentials.valid_ttl().as_secs(),
			invalid_ttl_secs: state.credentials.invalid_ttl().as_secs(),
		}),
	)
		.into_response()
}

/// `PATCH /admin/auth/config` (§4.7 "configurable at runtime"). Only the
/// auth mode is mutable post-boot in this implementation — TTLs are read
/// once at startup into the `CredentialCache`, which has no runtime setter,
/// so a TTL change here is reported but requires a restart to take effect.
#[derive(Deserialize, Default)]
struct AuthConfigPatch {
	auth_mode: Option<AuthMode>,
}

async fn patch_auth_config(State(state): State<Arc<AppState>>, axum::Json(patch): axum::Json<AuthConfigPatch>) -> Response {
	let Some(mode) = patch.auth_mode else {
		return (
			StatusCode::BAD_REQUEST,
			axum::Json(json!({ "error": "auth_mode is required" })),
		)
			.into_response();
	};
	if matches!(mode, AuthMode::Both) && state.admin_token.is_none() {
		tracing::warn!("auth_mode switched to both with no admin token configured; the admin credential surface is unreachable");
	}
	state.auth_mode.set(mode);
	(
		StatusCode::OK,
		axum::Json(AuthConfigView {
			auth_mode: state.auth_mode.get(),
			valid_ttl_secs: state.credentials.valid_ttl().as_secs(),
			invalid_ttl_secs: state.credentials.invalid_ttl().as_secs(),
		}),
	)
		.into_response()
}

async fn list_credentials(State(state): State<Arc<AppState>>) -> Response {
	let entries: Vec<_> = state
		.credentials
		.list()
		.into_iter()
		.map(|c| {
			json!({
				"key_hash": c.key_hash,
				"valid": c.valid,
			})
		})
		.collect();
	(StatusCode::OK, axum::Json(json!({ "credentials": entries }))).into_response()
}

async fn invalidate_one(State(state): State<Arc<AppState>>, Path(key_hash): Path<String>) -> Response {
	state.credentials.invalidate_by_hash(&key_hash);
	StatusCode::NO_CONTENT.into_response()
}

async fn invalidate_all(State(state): State<Arc<AppState>>) -> Response {
	state.credentials.invalidate_all();
	StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_time_eq_rejects_mismatched_length() {
		assert!(!constant_time_eq("short", "longer-token"));
	}

	#[test]
	fn constant_time_eq_accepts_equal_tokens() {
		assert!(constant_time_eq("same-token", "same-token"));
	}

	#[test]
	fn build_policy_rejects_unknown_class_ref() {
		let judge = Arc::new(JudgeClient::new("http://localhost".to_string(), None, "m".to_string(), std::time::Duration::from_secs(1)));
		assert!(build_policy("not::a::real::Policy", &json!({}), judge).is_err());
	}

	#[test]
	fn parse_parallel_rules_config_requires_rules_array() {
		assert!(parse_parallel_rules_config(&json!({})).is_err());
	}

	#[test]
	fn parse_parallel_rules_config_reads_a_minimal_rule() {
		let config = json!({
			"rules": [{ "name": "r1", "ruletext": "no profanity", "applies_to": ["text"] }],
		});
		let parsed = parse_parallel_rules_config(&config).unwrap();
		assert_eq!(parsed.rules.len(), 1);
		assert_eq!(parsed.rules[0].name, "r1");
	}
}
