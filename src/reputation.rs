//! IP reputation gate backed by AbuseIPDB.
//!
//! Scores are cached for 24 hours in memory and in a JSON snapshot on disk so
//! the rate-limited provider is queried at most once per address per day.
//! Provider failures are never cached.

use crate::error::ReputationError;
use crate::tenant_config::ReputationGateConfig;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

pub const ABUSEIPDB_ENDPOINT: &str = "https://api.abuseipdb.com";
/// Scores strictly above this block the visitor.
pub const BLOCK_THRESHOLD: i32 = 50;
pub const LOOKBACK_DAYS: u32 = 90;

#[derive(Debug)]
pub enum ReputationOutcome {
    Allow,
    Block(i32),
    ProviderError(ReputationError),
}

impl ReputationOutcome {
    pub fn from_score(score: i32) -> Self {
        if score > BLOCK_THRESHOLD {
            ReputationOutcome::Block(score)
        } else {
            ReputationOutcome::Allow
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub score: i32,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

/// Snapshot contents: address -> entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReputationStore {
    entries: HashMap<String, ReputationEntry>,
}

impl ReputationStore {
    /// A missing or unreadable snapshot is an empty store.
    pub async fn load(path: &Path) -> Self {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No reputation snapshot at {}", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("Failed to read reputation snapshot {}: {e}", path.display());
                return Self::default();
            }
        };

        match serde_json::from_slice::<Self>(&bytes) {
            Ok(store) => {
                log::info!(
                    "Loaded {} reputation entries from {}",
                    store.entries.len(),
                    path.display()
                );
                store
            }
            Err(e) => {
                log::warn!("Ignoring corrupt reputation snapshot {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Replace the snapshot file wholesale via a temporary file and rename.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<&ReputationEntry> {
        self.entries.get(address)
    }

    pub fn fresh(&self, address: &str, now: DateTime<Utc>, ttl: Duration) -> Option<&ReputationEntry> {
        self.entries
            .get(address)
            .filter(|entry| !is_expired(entry, now, ttl))
    }

    pub fn upsert(&mut self, address: &str, score: i32, observed_at: DateTime<Utc>) {
        self.entries.insert(
            address.to_string(),
            ReputationEntry { score, observed_at },
        );
    }

    pub fn prune_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !is_expired(entry, now, ttl));
        before - self.entries.len()
    }
}

fn is_expired(entry: &ReputationEntry, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(entry.observed_at);
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => age > ttl,
        Err(_) => false,
    }
}

/// Source of abuse confidence scores (0-100).
pub trait ReputationProvider: Send + Sync {
    fn lookup<'a>(
        &'a self,
        api_key: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, Result<i32, ReputationError>>;
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    data: CheckData,
}

#[derive(Debug, Deserialize)]
struct CheckData {
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: i32,
}

pub struct AbuseIpDb {
    client: Client,
    endpoint: Url,
}

impl AbuseIpDb {
    pub fn new(endpoint: &str, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(concat!("foff-contact/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let endpoint = Url::parse(endpoint)?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("AbuseIPDB endpoint {endpoint} cannot carry a path");
        }

        Ok(Self { client, endpoint })
    }

    /// `{endpoint}/api/v2/check`, keeping any path prefix on the endpoint.
    fn check_url(&self, address: &str) -> Result<Url, ReputationError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ReputationError::Transport(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(["api", "v2", "check"]);
        url.query_pairs_mut()
            .append_pair("ipAddress", address)
            .append_pair("maxAgeInDays", &LOOKBACK_DAYS.to_string());
        Ok(url)
    }
}

impl ReputationProvider for AbuseIpDb {
    fn lookup<'a>(
        &'a self,
        api_key: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, Result<i32, ReputationError>> {
        Box::pin(async move {
            let url = self.check_url(address)?;
            log::debug!("Querying AbuseIPDB for {address}");

            let response = self
                .client
                .get(url)
                .header("Key", api_key)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| ReputationError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(ReputationError::Status(response.status().as_u16()));
            }

            let body: CheckResponse = response
                .json()
                .await
                .map_err(|e| ReputationError::Decode(e.to_string()))?;
            Ok(body.data.abuse_confidence_score)
        })
    }
}

/// TTL cache of provider scores persisted to one snapshot file.
pub struct ReputationCache {
    path: PathBuf,
    // None until the snapshot has been read
    store: RwLock<Option<ReputationStore>>,
    ttl: Duration,
}

impl ReputationCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store: RwLock::new(None),
            ttl: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    async fn ensure_loaded(&self) {
        if self.store.read().await.is_some() {
            return;
        }

        let mut store = self.store.write().await;
        if store.is_none() {
            *store = Some(ReputationStore::load(&self.path).await);
        }
    }

    pub async fn check(
        &self,
        address: &str,
        api_key: &str,
        provider: &dyn ReputationProvider,
    ) -> ReputationOutcome {
        self.ensure_loaded().await;

        {
            let store = self.store.read().await;
            if let Some(entry) = store
                .as_ref()
                .and_then(|s| s.fresh(address, Utc::now(), self.ttl))
            {
                log::debug!("Using cached reputation for {address}: {}", entry.score);
                return ReputationOutcome::from_score(entry.score);
            }
        }

        // No lock is held across the provider call
        let score = match provider.lookup(api_key, address).await {
            Ok(score) => score,
            Err(e) => {
                log::warn!("Reputation lookup for {address} failed: {e}");
                return ReputationOutcome::ProviderError(e);
            }
        };

        {
            let mut guard = self.store.write().await;
            let store = guard.get_or_insert_with(ReputationStore::default);
            let now = Utc::now();
            store.upsert(address, score, now);
            let pruned = store.prune_expired(now, self.ttl);
            if pruned > 0 {
                log::debug!("Pruned {pruned} expired reputation entries");
            }
            if let Err(e) = store.save(&self.path).await {
                log::error!(
                    "Failed to write reputation snapshot {}: {e}",
                    self.path.display()
                );
            }
        }

        log::info!("Reputation score for {address}: {score}");
        ReputationOutcome::from_score(score)
    }
}

/// One reputation cache per snapshot location, sharing a provider.
pub struct ReputationGate {
    provider: Arc<dyn ReputationProvider>,
    caches: RwLock<HashMap<PathBuf, Arc<ReputationCache>>>,
}

impl ReputationGate {
    pub fn new(provider: Arc<dyn ReputationProvider>) -> Self {
        Self {
            provider,
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub async fn check(&self, config: &ReputationGateConfig, address: &str) -> ReputationOutcome {
        let cache = self.cache_for(&config.cache_location).await;
        cache
            .check(address, &config.api_key, self.provider.as_ref())
            .await
    }

    async fn cache_for(&self, location: &Path) -> Arc<ReputationCache> {
        if let Some(cache) = self.caches.read().await.get(location) {
            return cache.clone();
        }

        self.caches
            .write()
            .await
            .entry(location.to_path_buf())
            .or_insert_with(|| Arc::new(ReputationCache::new(location)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProvider {
        scores: Mutex<HashMap<String, i32>>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn with(address: &str, score: i32) -> Self {
            let provider = Self::default();
            provider.set(address, score);
            provider
        }

        fn set(&self, address: &str, score: i32) {
            self.scores
                .lock()
                .unwrap()
                .insert(address.to_string(), score);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ReputationProvider for FakeProvider {
        fn lookup<'a>(
            &'a self,
            _api_key: &'a str,
            address: &'a str,
        ) -> BoxFuture<'a, Result<i32, ReputationError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .scores
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .ok_or_else(|| ReputationError::Transport("connection refused".to_string()));
            Box::pin(async move { result })
        }
    }

    /// Holds every lookup until `parties` lookups are in flight together.
    struct RendezvousProvider {
        barrier: tokio::sync::Barrier,
        calls: AtomicUsize,
    }

    impl RendezvousProvider {
        fn new(parties: usize) -> Self {
            Self {
                barrier: tokio::sync::Barrier::new(parties),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ReputationProvider for RendezvousProvider {
        fn lookup<'a>(
            &'a self,
            _api_key: &'a str,
            _address: &'a str,
        ) -> BoxFuture<'a, Result<i32, ReputationError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                self.barrier.wait().await;
                Ok(10)
            })
        }
    }

    #[tokio::test]
    async fn test_lookups_for_different_addresses_overlap() {
        let dir = TempDir::new().unwrap();
        let cache = ReputationCache::new(dir.path().join("cache.json"));
        let provider = RendezvousProvider::new(2);

        // Both lookups must reach the provider before either can finish
        let both = async {
            tokio::join!(
                cache.check("1.1.1.1", "key", &provider),
                cache.check("2.2.2.2", "key", &provider)
            )
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("lookups did not run concurrently");

        assert!(matches!(first, ReputationOutcome::Allow));
        assert!(matches!(second, ReputationOutcome::Allow));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_on_one_address_each_call_provider() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ReputationCache::new(&path);
        let provider = RendezvousProvider::new(2);

        let both = async {
            tokio::join!(
                cache.check("1.1.1.1", "key", &provider),
                cache.check("1.1.1.1", "key", &provider)
            )
        };
        tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("lookups did not run concurrently");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // Settled now: the next check is served from the cache
        let idle = FakeProvider::default();
        assert!(matches!(
            cache.check("1.1.1.1", "key", &idle).await,
            ReputationOutcome::Allow
        ));
        assert_eq!(idle.calls(), 0);
        assert_eq!(ReputationStore::load(&path).await.get("1.1.1.1").unwrap().score, 10);
    }

    #[test]
    fn test_block_threshold_is_strict() {
        assert!(matches!(ReputationOutcome::from_score(0), ReputationOutcome::Allow));
        assert!(matches!(ReputationOutcome::from_score(50), ReputationOutcome::Allow));
        assert!(matches!(
            ReputationOutcome::from_score(51),
            ReputationOutcome::Block(51)
        ));
        assert!(matches!(
            ReputationOutcome::from_score(100),
            ReputationOutcome::Block(100)
        ));
    }

    #[tokio::test]
    async fn test_first_lookup_calls_provider_once_then_caches() {
        let dir = TempDir::new().unwrap();
        let cache = ReputationCache::new(dir.path().join("cache.json"));
        let provider = FakeProvider::with("5.6.7.8", 10);

        assert!(matches!(
            cache.check("5.6.7.8", "key", &provider).await,
            ReputationOutcome::Allow
        ));
        assert_eq!(provider.calls(), 1);

        // A changed upstream score is not seen within the TTL
        provider.set("5.6.7.8", 90);
        assert!(matches!(
            cache.check("5.6.7.8", "key", &provider).await,
            ReputationOutcome::Allow
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_hit_needs_no_provider() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let snapshot = serde_json::json!({
            "1.2.3.4": {"score": 80, "observedAt": Utc::now()}
        });
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::default();

        assert!(matches!(
            cache.check("1.2.3.4", "key", &provider).await,
            ReputationOutcome::Block(80)
        ));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_looked_up_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let stale = Utc::now() - chrono::Duration::hours(25);
        let snapshot = serde_json::json!({
            "1.2.3.4": {"score": 80, "observedAt": stale}
        });
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::with("1.2.3.4", 5);

        assert!(matches!(
            cache.check("1.2.3.4", "key", &provider).await,
            ReputationOutcome::Allow
        ));
        assert_eq!(provider.calls(), 1);

        let saved = ReputationStore::load(&path).await;
        assert_eq!(saved.get("1.2.3.4").unwrap().score, 5);
    }

    #[tokio::test]
    async fn test_provider_errors_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::default();

        for _ in 0..2 {
            assert!(matches!(
                cache.check("9.9.9.9", "key", &provider).await,
                ReputationOutcome::ProviderError(ReputationError::Transport(_))
            ));
        }
        assert_eq!(provider.calls(), 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"{ definitely not json").unwrap();

        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::with("1.2.3.4", 77);

        assert!(matches!(
            cache.check("1.2.3.4", "key", &provider).await,
            ReputationOutcome::Block(77)
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_persists_full_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::with("1.1.1.1", 1);
        provider.set("2.2.2.2", 99);

        cache.check("1.1.1.1", "key", &provider).await;
        cache.check("2.2.2.2", "key", &provider).await;

        let saved = ReputationStore::load(&path).await;
        assert_eq!(saved.get("1.1.1.1").unwrap().score, 1);
        assert_eq!(saved.get("2.2.2.2").unwrap().score, 99);

        // A fresh process reads it back without calling out
        let restarted = ReputationCache::new(&path);
        let idle = FakeProvider::default();
        assert!(matches!(
            restarted.check("2.2.2.2", "key", &idle).await,
            ReputationOutcome::Block(99)
        ));
        assert_eq!(idle.calls(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_decides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("cache.json");
        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::with("1.2.3.4", 60);

        assert!(matches!(
            cache.check("1.2.3.4", "key", &provider).await,
            ReputationOutcome::Block(60)
        ));
        // Still cached in memory
        cache.check("1.2.3.4", "key", &provider).await;
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_pruned_on_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let stale = Utc::now() - chrono::Duration::days(3);
        let snapshot = serde_json::json!({
            "3.3.3.3": {"score": 10, "observedAt": stale}
        });
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let cache = ReputationCache::new(&path);
        let provider = FakeProvider::with("4.4.4.4", 10);
        cache.check("4.4.4.4", "key", &provider).await;

        let saved = ReputationStore::load(&path).await;
        assert!(saved.get("3.3.3.3").is_none());
        assert!(saved.get("4.4.4.4").is_some());
    }

    #[tokio::test]
    async fn test_gate_keeps_one_cache_per_location() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::with("1.2.3.4", 20));
        let gate = ReputationGate::new(provider.clone());

        let first = ReputationGateConfig {
            enabled: true,
            api_key: "a".to_string(),
            cache_location: dir.path().join("a.json"),
        };
        let second = ReputationGateConfig {
            cache_location: dir.path().join("b.json"),
            ..first.clone()
        };

        gate.check(&first, "1.2.3.4").await;
        gate.check(&first, "1.2.3.4").await;
        gate.check(&second, "1.2.3.4").await;

        assert_eq!(provider.calls(), 2);
        assert!(dir.path().join("a.json").exists());
        assert!(dir.path().join("b.json").exists());
    }

    #[tokio::test]
    async fn test_abuseipdb_request_shape() {
        use axum::extract::Query;
        use axum::http::HeaderMap;
        use axum::routing::get;
        use axum::{Json, Router};

        async fn check(
            Query(params): Query<HashMap<String, String>>,
            headers: HeaderMap,
        ) -> Json<serde_json::Value> {
            let authorized = headers.get("Key").map(|v| v == "secret").unwrap_or(false);
            let score = if authorized
                && params.get("maxAgeInDays").map(String::as_str) == Some("90")
                && params.get("ipAddress").map(String::as_str) == Some("1.2.3.4")
            {
                73
            } else {
                -1
            };
            Json(serde_json::json!({"data": {"abuseConfidenceScore": score}}))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/api/v2/check", get(check));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = AbuseIpDb::new(&format!("http://{addr}"), 5).unwrap();
        assert_eq!(provider.lookup("secret", "1.2.3.4").await.unwrap(), 73);
    }

    #[test]
    fn test_check_url_keeps_endpoint_prefix() {
        let url = |endpoint: &str| {
            AbuseIpDb::new(endpoint, 5)
                .unwrap()
                .check_url("1.2.3.4")
                .unwrap()
                .to_string()
        };

        assert_eq!(
            url("https://api.abuseipdb.com"),
            "https://api.abuseipdb.com/api/v2/check?ipAddress=1.2.3.4&maxAgeInDays=90"
        );
        assert_eq!(
            url("http://127.0.0.1:9/abuseipdb"),
            "http://127.0.0.1:9/abuseipdb/api/v2/check?ipAddress=1.2.3.4&maxAgeInDays=90"
        );
        assert_eq!(
            url("http://127.0.0.1:9/abuseipdb/"),
            "http://127.0.0.1:9/abuseipdb/api/v2/check?ipAddress=1.2.3.4&maxAgeInDays=90"
        );
        assert!(AbuseIpDb::new("mailto:abuse@example.com", 5).is_err());
    }

    #[tokio::test]
    async fn test_abuseipdb_behind_path_prefix() {
        use axum::routing::get;
        use axum::{Json, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/abuseipdb/api/v2/check",
            get(|| async { Json(serde_json::json!({"data": {"abuseConfidenceScore": 12}})) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = AbuseIpDb::new(&format!("http://{addr}/abuseipdb"), 5).unwrap();
        assert_eq!(provider.lookup("secret", "1.2.3.4").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_abuseipdb_bad_status_is_error() {
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::Router;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/api/v2/check",
            get(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = AbuseIpDb::new(&format!("http://{addr}"), 5).unwrap();
        assert!(matches!(
            provider.lookup("secret", "1.2.3.4").await,
            Err(ReputationError::Status(429))
        ));
    }
}
