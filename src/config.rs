//! Runtime configuration, assembled from environment variables via `clap`'s
//! `env` attribute — the same pattern the teacher's CLI entrypoint uses,
//! minus the xDS/config-file distribution machinery that doesn't apply here.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

#[derive(Parser, Debug, Clone)]
#[command(name = "luthien", about = "Interposing LLM gateway")]
pub struct Config {
	/// Address the gateway listens on.
	#[arg(long, env = "LUTHIEN_BIND_ADDR", default_value = "0.0.0.0:4000")]
	pub bind_addr: SocketAddr,

	/// Upstream base URL for the OpenAI wire format.
	#[arg(long, env = "LUTHIEN_OPENAI_UPSTREAM_URL")]
	pub openai_upstream_url: Option<String>,

	/// Upstream API key for the OpenAI wire format.
	#[arg(long, env = "LUTHIEN_OPENAI_UPSTREAM_KEY")]
	pub openai_upstream_key: Option<SecretString>,

	/// Upstream base URL for the Anthropic wire format.
	#[arg(long, env = "LUTHIEN_ANTHROPIC_UPSTREAM_URL")]
	pub anthropic_upstream_url: Option<String>,

	/// Upstream API key for the Anthropic wire format.
	#[arg(long, env = "LUTHIEN_ANTHROPIC_UPSTREAM_KEY")]
	pub anthropic_upstream_key: Option<SecretString>,

	/// Judge LLM base URL (a plain chat-completions endpoint, §1).
	#[arg(long, env = "LUTHIEN_JUDGE_UPSTREAM_URL")]
	pub judge_upstream_url: Option<String>,

	/// Judge LLM API key.
	#[arg(long, env = "LUTHIEN_JUDGE_UPSTREAM_KEY")]
	pub judge_upstream_key: Option<SecretString>,

	/// Judge model identifier.
	#[arg(long, env = "LUTHIEN_JUDGE_MODEL", default_value = "gpt-4o-mini")]
	pub judge_model: String,

	/// Redis URL used for pub/sub event fan-out and the credential cache.
	#[arg(long, env = "LUTHIEN_REDIS_URL")]
	pub redis_url: Option<String>,

	/// Durable event-store URL (Postgres connection string).
	#[arg(long, env = "LUTHIEN_EVENT_STORE_URL")]
	pub event_store_url: Option<String>,

	/// Fail init if the event store is configured but unreachable at boot.
	#[arg(long, env = "LUTHIEN_STRICT_EVENT_STORE", default_value_t = false)]
	pub strict_event_store: bool,

	/// Admin bearer token required on `/admin/*` routes.
	#[arg(long, env = "LUTHIEN_ADMIN_TOKEN")]
	pub admin_token: Option<SecretString>,

	/// Maximum inbound request body size, in bytes.
	#[arg(long, env = "LUTHIEN_MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
	pub max_body_bytes: usize,

	/// TTL for cached-valid credential entries, in seconds.
	#[arg(long, env = "LUTHIEN_CRED_VALID_TTL_SECS", default_value_t = 300)]
	pub cred_valid_ttl_secs: u64,

	/// TTL for cached-invalid credential entries, in seconds.
	#[arg(long, env = "LUTHIEN_CRED_INVALID_TTL_SECS", default_value_t = 30)]
	pub cred_invalid_ttl_secs: u64,

	/// Interval between SSE keepalive comment frames.
	#[arg(long, env = "LUTHIEN_KEEPALIVE_INTERVAL_SECS", default_value_t = 10)]
	pub keepalive_interval_secs: u64,

	/// Upstream call timeout (complete or stream-open), in seconds.
	#[arg(long, env = "LUTHIEN_UPSTREAM_TIMEOUT_SECS", default_value_t = 120)]
	pub upstream_timeout_secs: u64,

	/// Judge call timeout, in seconds.
	#[arg(long, env = "LUTHIEN_JUDGE_TIMEOUT_SECS", default_value_t = 15)]
	pub judge_timeout_secs: u64,

	/// Event-store write timeout, in seconds. Timeouts here are swallowed.
	#[arg(long, env = "LUTHIEN_EVENT_STORE_TIMEOUT_SECS", default_value_t = 5)]
	pub event_store_timeout_secs: u64,

	/// Bounded size of the fire-and-forget observability channel.
	#[arg(long, env = "LUTHIEN_EVENT_CHANNEL_CAPACITY", default_value_t = 4096)]
	pub event_channel_capacity: usize,

	/// Auth mode: `passthrough` or `both` (§4.7).
	#[arg(long, env = "LUTHIEN_AUTH_MODE", default_value = "passthrough")]
	pub auth_mode: crate::credentials::AuthMode,
}

impl Config {
	pub fn upstream_timeout(&self) -> Duration {
		Duration::from_secs(self.upstream_timeout_secs)
	}

	pub fn judge_timeout(&self) -> Duration {
		Duration::from_secs(self.judge_timeout_secs)
	}

	pub fn event_store_timeout(&self) -> Duration {
		Duration::from_secs(self.event_store_timeout_secs)
	}

	pub fn keepalive_interval(&self) -> Duration {
		Duration::from_secs(self.keepalive_interval_secs)
	}

	pub fn valid_ttl(&self) -> Duration {
		Duration::from_secs(self.cred_valid_ttl_secs)
	}

	pub fn invalid_ttl(&self) -> Duration {
		Duration::from_secs(self.cred_invalid_ttl_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_args() {
		let cfg = Config::parse_from(["luthien"]);
		assert_eq!(cfg.bind_addr.port(), 4000);
		assert_eq!(cfg.max_body_bytes, 10 * 1024 * 1024);
	}
}
