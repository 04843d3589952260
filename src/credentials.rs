//! Credential cache and auth-mode configuration (§4.7). TTL-bounded,
//! concurrent readers, single-writer-per-key via per-key single-flight so
//! concurrent misses for the same key validate exactly once (§5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use clap::ValueEnum;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
	/// Accept any key the upstream would accept.
	Passthrough,
	/// Require admin allow-list membership plus upstream validity.
	Both,
}

impl std::str::FromStr for AuthMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"passthrough" => Ok(AuthMode::Passthrough),
			"both" => Ok(AuthMode::Both),
			other => Err(format!("unknown auth mode: {other}")),
		}
	}
}

impl std::fmt::Display for AuthMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			AuthMode::Passthrough => f.write_str("passthrough"),
			AuthMode::Both => f.write_str("both"),
		}
	}
}

/// Runtime-swappable holder for the active `AuthMode` (§4.7 "Configurable at
/// runtime"). Mirrors `policy::ActivePolicy`'s `ArcSwap` pattern: readers see
/// a consistent mode without locking, `PATCH /admin/auth/config` swaps it.
pub struct ActiveAuthMode {
	current: ArcSwap<AuthMode>,
}

impl ActiveAuthMode {
	pub fn new(mode: AuthMode) -> Self {
		Self { current: ArcSwap::from_pointee(mode) }
	}

	pub fn get(&self) -> AuthMode {
		**self.current.load()
	}

	pub fn set(&self, mode: AuthMode) {
		self.current.store(Arc::new(mode));
	}
}

pub fn hash_key(api_key: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(api_key.as_bytes());
	format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CachedCredential {
	pub key_hash: String,
	pub valid: bool,
	pub validated_at: Instant,
	pub last_used_at: Instant,
}

struct Entry {
	credential: CachedCredential,
	ttl: Duration,
}

impl Entry {
	fn is_expired(&self) -> bool {
		self.credential.validated_at.elapsed() >= self.ttl
	}
}

/// Validates a previously-unseen key against the upstream. Implementations
/// are auth-mode dependent (§4.7); the cache itself is mode-agnostic.
#[async_trait::async_trait]
pub trait Validator: Send + Sync {
	async fn validate(&self, api_key: &str) -> anyhow::Result<bool>;
}

pub struct CredentialCache {
	entries: Mutex<HashMap<String, Entry>>,
	/// One semaphore per in-flight validation, so concurrent misses for the
	/// same key hash validate exactly once (single-flight, §5).
	inflight: Mutex<HashMap<String, Arc<Semaphore>>>,
	valid_ttl: Duration,
	invalid_ttl: Duration,
}

impl CredentialCache {
	pub fn new(valid_ttl: Duration, invalid_ttl: Duration) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			inflight: Mutex::new(HashMap::new()),
			valid_ttl,
			invalid_ttl,
		}
	}

	/// Looks up (or validates, single-flight) the given API key. Returns
	/// whether it is currently considered valid.
	pub async fn check(&self, api_key: &str, validator: &dyn Validator) -> anyhow::Result<bool> {
		let key_hash = hash_key(api_key);
		if let Some(valid) = self.fresh_hit(&key_hash) {
			return Ok(valid);
		}

		let permit_holder = {
			let mut inflight = self.inflight.lock();
			inflight
				.entry(key_hash.clone())
				.or_insert_with(|| Arc::new(Semaphore::new(1)))
				.clone()
		};
		let _permit = permit_holder.acquire().await.expect("semaphore not closed");

		// Another task may have validated this key while we waited.
		if let Some(valid) = self.fresh_hit(&key_hash) {
			self.inflight.lock().remove(&key_hash);
			return Ok(valid);
		}

		let valid = validator.validate(api_key).await?;
		let now = Instant::now();
		let ttl = if valid { self.valid_ttl } else { self.invalid_ttl };
		self.entries.lock().insert(
			key_hash.clone(),
			Entry {
				credential: CachedCredential {
					key_hash: key_hash.clone(),
					valid,
					validated_at: now,
					last_used_at: now,
				},
				ttl,
			},
		);
		self.inflight.lock().remove(&key_hash);
		Ok(valid)
	}

	fn fresh_hit(&self, key_hash: &str) -> Option<bool> {
		let mut entries = self.entries.lock();
		let entry = entries.get_mut(key_hash)?;
		if entry.is_expired() {
			return None;
		}
		entry.credential.last_used_at = Instant::now();
		Some(entry.credential.valid)
	}

	/// Called on an upstream 401 for the key that was used (§4.7, §8).
	pub fn invalidate(&self, api_key: &str) {
		let key_hash = hash_key(api_key);
		self.entries.lock().remove(&key_hash);
	}

	pub fn invalidate_by_hash(&self, key_hash: &str) {
		self.entries.lock().remove(key_hash);
	}

	pub fn invalidate_all(&self) {
		self.entries.lock().clear();
	}

	pub fn list(&self) -> Vec<CachedCredential> {
		self
			.entries
			.lock()
			.values()
			.map(|e| e.credential.clone())
			.collect()
	}

	pub fn valid_ttl(&self) -> Duration {
		self.valid_ttl
	}

	pub fn invalid_ttl(&self) -> Duration {
		self.invalid_ttl
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct CountingValidator {
		calls: AtomicUsize,
		answer: bool,
	}

	#[async_trait::async_trait]
	impl Validator for CountingValidator {
		async fn validate(&self, _api_key: &str) -> anyhow::Result<bool> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(self.answer)
		}
	}

	#[tokio::test]
	async fn caches_hit_without_revalidating() {
		let cache = CredentialCache::new(Duration::from_secs(60), Duration::from_secs(5));
		let validator = CountingValidator {
			calls: AtomicUsize::new(0),
			answer: true,
		};
		assert!(cache.check("key-a", &validator).await.unwrap());
		assert!(cache.check("key-a", &validator).await.unwrap());
		assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn concurrent_misses_validate_once() {
		let cache = Arc::new(CredentialCache::new(Duration::from_secs(60), Duration::from_secs(5)));
		let validator = Arc::new(CountingValidator {
			calls: AtomicUsize::new(0),
			answer: true,
		});
		let mut handles = vec![];
		for _ in 0..8 {
			let cache = cache.clone();
			let validator = validator.clone();
			handles.push(tokio::spawn(async move {
				cache.check("shared-key", validator.as_ref()).await.unwrap()
			}));
		}
		for h in handles {
			assert!(h.await.unwrap());
		}
		assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn invalidate_forces_revalidation() {
		let cache = CredentialCache::new(Duration::from_secs(60), Duration::from_secs(5));
		let validator = CountingValidator {
			calls: AtomicUsize::new(0),
			answer: true,
		};
		cache.check("key-b", &validator).await.unwrap();
		cache.invalidate("key-b");
		cache.check("key-b", &validator).await.unwrap();
		assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn active_auth_mode_reflects_the_latest_swap() {
		let active = ActiveAuthMode::new(AuthMode::Passthrough);
		assert_eq!(active.get(), AuthMode::Passthrough);
		active.set(AuthMode::Both);
		assert_eq!(active.get(), AuthMode::Both);
	}
}
