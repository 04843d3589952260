//! Process entrypoint: parse configuration, wire up the shared `AppState`,
//! merge the client-facing and admin routers, and serve.

use std::sync::Arc;

use luthien::config::Config;
use luthien::credentials::{ActiveAuthMode, AuthMode, CredentialCache, Validator};
use luthien::judge::JudgeClient;
use luthien::observability::emitter::Emitter;
use luthien::observability::store::{EventStore, InMemoryEventStore};
use luthien::pipeline::AppState;
use luthien::policy::{ActivePolicy, ActivePolicyDescriptor, NoopPolicy};
use luthien::upstream::{Endpoint, UpstreamClient, UpstreamKeyValidator};
use luthien::{admin, http, telemetry};

#[tokio::main]
async fn main() {
	telemetry::init();

	let config = Config::parse();

	if let Err(err) = run(config).await {
		tracing::error!(error = %err, "fatal startup error");
		std::process::exit(1);
	}
}

async fn run(config: Config) -> anyhow::Result<()> {
	let openai_endpoint = config.openai_upstream_url.clone().map(|url| Endpoint::new(url, config.openai_upstream_key.clone()));
	let anthropic_endpoint =
		config.anthropic_upstream_url.clone().map(|url| Endpoint::new(url, config.anthropic_upstream_key.clone()));

	if openai_endpoint.is_none() && anthropic_endpoint.is_none() {
		anyhow::bail!("at least one of LUTHIEN_OPENAI_UPSTREAM_URL / LUTHIEN_ANTHROPIC_UPSTREAM_URL must be set");
	}

	let credentials = Arc::new(CredentialCache::new(config.valid_ttl(), config.invalid_ttl()));

	let validator: Arc<dyn Validator> = Arc::new(UpstreamKeyValidator::new(openai_endpoint.clone(), anthropic_endpoint.clone()));

	let upstream = Arc::new(UpstreamClient::new(
		openai_endpoint,
		anthropic_endpoint,
		credentials.clone(),
		config.upstream_timeout(),
	));

	let judge = Arc::new(JudgeClient::new(
		config.judge_upstream_url.clone().unwrap_or_default(),
		config.judge_upstream_key.clone(),
		config.judge_model.clone(),
		config.judge_timeout(),
	));

	let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new(8192, config.event_store_timeout()));
	if config.strict_event_store && config.event_store_url.is_some() {
		// A real Postgres-backed store would be probed here; the in-memory
		// fallback is always reachable, so strict mode only matters once an
		// external store is wired in.
		tracing::warn!("LUTHIEN_STRICT_EVENT_STORE set but no durable event store implementation is linked in this build");
	}
	let emitter = Emitter::spawn(event_store, config.event_channel_capacity);

	let active_policy = Arc::new(ActivePolicy::new(ActivePolicyDescriptor {
		name: "noop".to_string(),
		class_ref: "luthien::policy::NoopPolicy".to_string(),
		config: serde_json::json!({}),
		enabled_by: "boot".to_string(),
		enabled_at: chrono::Utc::now(),
		policy: Arc::new(NoopPolicy),
	}));

	let state = Arc::new(AppState {
		upstream,
		credentials,
		validator,
		auth_mode: Arc::new(ActiveAuthMode::new(config.auth_mode)),
		admin_token: config.admin_token.clone(),
		active_policy,
		judge,
		emitter,
		max_body_bytes: config.max_body_bytes,
		keepalive_interval: config.keepalive_interval(),
	});

	if matches!(state.auth_mode.get(), AuthMode::Both) && state.admin_token.is_none() {
		tracing::warn!("LUTHIEN_AUTH_MODE=both but no LUTHIEN_ADMIN_TOKEN is set; the admin credential surface is unreachable");
	}

	let app = http::router(state.clone()).merge(admin::router(state));

	let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
	tracing::info!(addr = %config.bind_addr, "luthien listening");
	axum::serve(listener, app).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn bails_when_no_upstream_is_configured() {
		let config = Config::parse_from(["luthien"]);
		let err = run(config).await.unwrap_err();
		assert!(err.to_string().contains("upstream"));
	}
}
