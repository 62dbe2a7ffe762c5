//! Volatility-aware result cache.
//!
//! Two tiers: an optional distributed backend tried first, and an in-process
//! map that always holds a copy. Backend failures only ever produce a miss.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::Row;
use crate::query::SqlParam;
use crate::util::Clock;

#[derive(Debug, Error)]
pub enum CacheBackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache backend rejected the operation: {0}")]
    Rejected(String),
}

/// Remote key/value store with per-key TTL.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheBackendError>;
    async fn set(&self, key: &str, value: String, ttl: std::time::Duration) -> Result<(), CacheBackendError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheBackendError>;
}

/// How quickly a table's contents change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Realtime,
    High,
    Medium,
    Low,
    Static,
}

impl Volatility {
    pub fn ttl(&self) -> Duration {
        match self {
            Volatility::Realtime => Duration::seconds(30),
            Volatility::High => Duration::minutes(1),
            Volatility::Medium => Duration::minutes(5),
            Volatility::Low => Duration::minutes(30),
            Volatility::Static => Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub key_prefix: String,
    pub default_volatility: Volatility,
    pub tables: HashMap<String, Volatility>,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let tables = [
            ("activities", Volatility::High),
            ("deals", Volatility::Medium),
            ("contacts", Volatility::Medium),
            ("accounts", Volatility::Low),
            ("sub_accounts", Volatility::Low),
            ("employees", Volatility::Static),
        ]
        .into_iter()
        .map(|(t, v)| (t.to_string(), v))
        .collect();

        Self {
            enabled: true,
            key_prefix: "nlq:".to_string(),
            default_volatility: Volatility::Medium,
            tables,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Vec<Row>,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: i64,
    pub source_sql: String,
    pub tables: Vec<String>,
}

impl CacheEntry {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at < Duration::milliseconds(self.ttl_ms)
    }

    fn matches(&self, pattern: &str) -> bool {
        self.source_sql.to_lowercase().contains(pattern) || self.tables.iter().any(|t| t == pattern)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub backend_errors: u64,
    pub hit_rate: f64,
}

fn table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+"?([A-Za-z_][A-Za-z0-9_.]*)"#).expect("table regex is valid")
    })
}

/// Table names following FROM/JOIN, lowercased, first occurrence order.
pub fn extract_tables(sql: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for caps in table_regex().captures_iter(sql) {
        let name = caps[1].to_lowercase();
        let name = name.rsplit('.').next().unwrap_or(&name).to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// A key written to the distributed tier, kept until it expires or is
/// invalidated.
struct RemoteKey {
    source_sql: String,
    tables: Vec<String>,
    expires_at: DateTime<Utc>,
}

pub struct SmartQueryCache {
    settings: CacheSettings,
    enabled: AtomicBool,
    local: RwLock<HashMap<String, CacheEntry>>,
    remote: Option<Arc<dyn DistributedCache>>,
    // What was written remotely, so invalidation can find it again.
    remote_index: RwLock<HashMap<String, RemoteKey>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    backend_errors: AtomicU64,
}

impl SmartQueryCache {
    pub fn new(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: AtomicBool::new(settings.enabled),
            settings,
            local: RwLock::new(HashMap::new()),
            remote: None,
            remote_index: RwLock::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    pub fn with_distributed(mut self, remote: Arc<dyn DistributedCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        info!("Query cache {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// `prefix + sha256(normalized sql | user | params json)`.
    pub fn cache_key(&self, sql: &str, user_id: &str, params: &[SqlParam]) -> String {
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let params = serde_json::to_string(params).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"|");
        hasher.update(user_id.as_bytes());
        hasher.update(b"|");
        hasher.update(params.as_bytes());
        format!("{}{}", self.settings.key_prefix, hex::encode(hasher.finalize()))
    }

    /// Shortest volatility window over the tables `sql` reads.
    pub fn ttl_for(&self, sql: &str) -> Duration {
        let default = self.settings.default_volatility.ttl();
        extract_tables(sql)
            .iter()
            .map(|t| self.settings.tables.get(t).map_or(default, Volatility::ttl))
            .min()
            .unwrap_or(default)
    }

    pub async fn get(&self, sql: &str, user_id: &str, params: &[SqlParam]) -> Option<Vec<Row>> {
        if !self.is_enabled() {
            return None;
        }
        let key = self.cache_key(sql, user_id, params);
        let now = self.clock.now();

        if let Some(remote) = &self.remote {
            match remote.get(&key).await {
                Ok(Some(payload)) => match serde_json::from_str::<CacheEntry>(&payload) {
                    Ok(entry) if entry.is_valid(now) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!("Distributed cache hit for {}", key);
                        return Some(entry.data);
                    }
                    Ok(_) => debug!("Distributed cache entry {} expired", key),
                    Err(e) => warn!("Discarding undecodable cache payload for {}: {}", key, e),
                },
                Ok(None) => {}
                Err(e) => {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Distributed cache read failed, using in-process tier: {}", e);
                }
            }
        }

        let local = self.local.read().await;
        match local.get(&key) {
            Some(entry) if entry.is_valid(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", key);
                Some(entry.data.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, sql: &str, user_id: &str, params: &[SqlParam], rows: &[Row]) {
        if !self.is_enabled() {
            return;
        }
        let key = self.cache_key(sql, user_id, params);
        let ttl = self.ttl_for(sql);
        let entry = CacheEntry {
            data: rows.to_vec(),
            stored_at: self.clock.now(),
            ttl_ms: ttl.num_milliseconds(),
            source_sql: sql.to_string(),
            tables: extract_tables(sql),
        };

        if let Some(remote) = &self.remote {
            let write = match serde_json::to_string(&entry) {
                Ok(payload) => remote
                    .set(&key, payload, ttl.to_std().unwrap_or_default())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match write {
                Ok(()) => {
                    let indexed = RemoteKey {
                        source_sql: entry.source_sql.clone(),
                        tables: entry.tables.clone(),
                        expires_at: entry.stored_at + ttl,
                    };
                    self.remote_index.write().await.insert(key.clone(), indexed);
                }
                Err(e) => {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Distributed cache write failed, keeping in-process copy only: {}", e);
                }
            }
        }

        debug!("Caching {} rows under {} for {}s", entry.data.len(), key, ttl.num_seconds());
        self.local.write().await.insert(key, entry);
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops entries whose SQL contains `pattern` or which read a table named
    /// `pattern`; `None` drops everything. The distributed tier is cleaned
    /// best-effort: only keys written by this process are known, and delete
    /// failures are logged, not retried.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        let pattern = pattern.map(str::to_lowercase);
        let removed = {
            let mut local = self.local.write().await;
            let before = local.len();
            match &pattern {
                Some(p) => local.retain(|_, entry| !entry.matches(p)),
                None => local.clear(),
            }
            before - local.len()
        };

        if let Some(remote) = &self.remote {
            let keys: Vec<String> = {
                let mut index = self.remote_index.write().await;
                let keys: Vec<String> = index
                    .iter()
                    .filter(|(_, indexed)| match &pattern {
                        Some(p) => {
                            indexed.source_sql.to_lowercase().contains(p.as_str())
                                || indexed.tables.iter().any(|t| t == p)
                        }
                        None => true,
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &keys {
                    index.remove(key);
                }
                keys
            };
            for key in keys {
                if let Err(e) = remote.delete(&key).await {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Distributed cache invalidation of {} failed: {}", key, e);
                }
            }
        }

        info!(
            "Invalidated {} cached result(s) for pattern {:?}",
            removed,
            pattern.as_deref().unwrap_or("*")
        );
        removed
    }

    /// Drops expired in-process entries and forgets distributed keys the
    /// backend has already expired. Returns the in-process count.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let swept = {
            let mut local = self.local.write().await;
            let before = local.len();
            local.retain(|_, entry| entry.is_valid(now));
            before - local.len()
        };
        let forgotten = {
            let mut index = self.remote_index.write().await;
            let before = index.len();
            index.retain(|_, indexed| indexed.expires_at > now);
            before - index.len()
        };
        if swept + forgotten > 0 {
            debug!("Swept {} expired cache entries, forgot {} distributed keys", swept, forgotten);
        }
        swept
    }

    /// Periodic sweep; the task ends once the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = std::time::Duration::from_secs(self.settings.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep_expired().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.local.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.local.read().await.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::testing::ManualClock;
    use serde_json::json;
    use std::sync::Mutex;

    fn rows() -> Vec<Row> {
        let mut row = Row::new();
        row.insert("name".into(), json!("Acme"));
        row.insert("engagement_score".into(), json!(82));
        vec![row]
    }

    fn cache(clock: Arc<ManualClock>) -> SmartQueryCache {
        SmartQueryCache::new(CacheSettings::default(), clock)
    }

    struct FailingBackend;

    #[async_trait]
    impl DistributedCache for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<String>, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: String, _: std::time::Duration) -> Result<(), CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct MapBackend {
        entries: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl DistributedCache for MapBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheBackendError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: String, _: std::time::Duration) -> Result<(), CacheBackendError> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }
        async fn exists(&self, key: &str) -> Result<bool, CacheBackendError> {
            Ok(self.entries.lock().unwrap().contains_key(key))
        }
    }

    #[test]
    fn key_ignores_whitespace_and_case() {
        let c = cache(Arc::new(ManualClock::new()));
        let a = c.cache_key("SELECT *  FROM accounts\nWHERE x = $1", "u1", &[SqlParam::Int(1)]);
        let b = c.cache_key("select * from accounts where x = $1", "u1", &[SqlParam::Int(1)]);
        assert_eq!(a, b);
        assert!(a.starts_with("nlq:"));
        assert_ne!(a, c.cache_key("select * from accounts where x = $1", "u2", &[SqlParam::Int(1)]));
        assert_ne!(a, c.cache_key("select * from accounts where x = $1", "u1", &[SqlParam::Int(2)]));
    }

    #[test]
    fn ttl_is_minimum_over_touched_tables() {
        let c = cache(Arc::new(ManualClock::new()));
        assert_eq!(c.ttl_for("SELECT * FROM accounts"), Duration::minutes(30));
        assert_eq!(
            c.ttl_for("SELECT * FROM accounts INNER JOIN sub_accounts ON x LEFT JOIN activities ON y"),
            Duration::minutes(1)
        );
        assert_eq!(c.ttl_for("SELECT * FROM employees JOIN mystery ON z"), Duration::minutes(5));
        assert_eq!(c.ttl_for("SELECT 1"), Duration::minutes(5));
    }

    #[test]
    fn tables_are_scanned_from_clauses() {
        assert_eq!(
            extract_tables("select a.* from main.accounts a left join \"deals\" d on d.account_id = a.id"),
            vec!["accounts", "deals"]
        );
    }

    #[tokio::test]
    async fn round_trip_then_expiry() {
        let clock = Arc::new(ManualClock::new());
        let c = cache(clock.clone());
        let sql = "SELECT * FROM accounts";

        c.set(sql, "u1", &[], &rows()).await;
        assert_eq!(c.get(sql, "u1", &[]).await, Some(rows()));

        clock.advance(Duration::minutes(31));
        assert_eq!(c.get(sql, "u1", &[]).await, None);
        assert_eq!(c.sweep_expired().await, 1);

        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failing_backend_never_fails_callers() {
        let c = cache(Arc::new(ManualClock::new())).with_distributed(Arc::new(FailingBackend));
        c.set("SELECT * FROM deals", "u1", &[], &rows()).await;
        assert_eq!(c.get("SELECT * FROM deals", "u1", &[]).await, Some(rows()));
        assert_eq!(c.invalidate(Some("deals")).await, 1);
        assert_eq!(c.stats().backend_errors, 2);
    }

    #[tokio::test]
    async fn distributed_tier_is_read_first_and_invalidated() {
        let backend = Arc::new(MapBackend::default());
        let c = cache(Arc::new(ManualClock::new())).with_distributed(backend.clone());
        let sql = "SELECT * FROM contacts";
        c.set(sql, "u1", &[], &rows()).await;

        let key = c.cache_key(sql, "u1", &[]);
        assert!(backend.exists(&key).await.unwrap());

        c.local.write().await.clear();
        assert_eq!(c.get(sql, "u1", &[]).await, Some(rows()));

        c.invalidate(Some("contacts")).await;
        assert!(!backend.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_forgets_expired_distributed_keys() {
        let clock = Arc::new(ManualClock::new());
        let c = cache(clock.clone()).with_distributed(Arc::new(MapBackend::default()));
        for i in 0..50 {
            c.set(&format!("SELECT * FROM accounts LIMIT {}", i + 1), "u1", &[], &rows()).await;
        }
        c.set("SELECT * FROM activities", "u1", &[], &rows()).await;
        assert_eq!(c.remote_index.read().await.len(), 51);

        clock.advance(Duration::minutes(2));
        assert_eq!(c.sweep_expired().await, 1);
        assert_eq!(c.remote_index.read().await.len(), 50);

        clock.advance(Duration::hours(48));
        assert_eq!(c.sweep_expired().await, 50);
        assert!(c.remote_index.read().await.is_empty());
    }

    #[tokio::test]
    async fn invalidate_by_table_keeps_others() {
        let c = cache(Arc::new(ManualClock::new()));
        c.set("SELECT * FROM accounts", "u1", &[], &rows()).await;
        c.set("SELECT * FROM deals", "u1", &[], &rows()).await;

        assert_eq!(c.invalidate(Some("ACCOUNTS")).await, 1);
        assert_eq!(c.len().await, 1);
        assert_eq!(c.invalidate(None).await, 1);
        assert!(c.is_empty().await);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let c = cache(Arc::new(ManualClock::new()));
        c.set_enabled(false);
        c.set("SELECT * FROM accounts", "u1", &[], &rows()).await;
        assert_eq!(c.get("SELECT * FROM accounts", "u1", &[]).await, None);
        assert!(c.is_empty().await);
    }
}
