//! In-memory cache for validated provider responses.
//!
//! Keys are `"{operation}:{sha256}"` fingerprints over the normalized prompt
//! and the generation options, so `Draw  a CAT` and `draw a cat` share an
//! entry. TTL depends on the requested quality tier and the caller's
//! confidence in the result:
//!
//! | Quality | Base TTL |
//! |---------|----------|
//! | draft | 0.5 × default |
//! | standard | 1 × default |
//! | high | 2 × default |
//! | cinematic | 4 × default |
//!
//! The base is scaled by 0.5 below confidence 0.5 and by 1.5 above 0.9. A
//! custom TTL always wins. Reads never extend an entry's lifetime.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::CoreError;
use crate::pipeline::OperationType;
use crate::provider::{GenerationOptions, QualityTier};

/// Defines how a request interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read a live entry if present; otherwise execute and store. (Default)
    #[default]
    Use,
    /// Always execute, then store the fresh result.
    Refresh,
    /// Never read or write.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// Longest lifetime any entry gets.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub max_cache_size: usize,
    pub enable_semantic_similarity: bool,
    /// Token Jaccard similarity needed for a near-duplicate hit.
    pub similarity_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 3_600_000,
            max_cache_size: 1_000,
            enable_semantic_similarity: false,
            similarity_threshold: 0.85,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_cache_size == 0 {
            return Err(CoreError::configuration("cache.max_cache_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(CoreError::configuration(
                "cache.similarity_threshold must be within [0, 1]",
            ));
        }
        if self.default_ttl() > MAX_TTL {
            return Err(CoreError::configuration(format!(
                "cache.default_ttl_ms must not exceed {}",
                MAX_TTL.as_millis()
            )));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// How long a result should live.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TtlPolicy {
    pub quality: QualityTier,
    /// Caller's confidence in the result, `0.0..=1.0`.
    pub confidence: Option<f64>,
    pub custom_ttl: Option<Duration>,
}

impl TtlPolicy {
    pub fn new(quality: QualityTier) -> Self {
        Self {
            quality,
            ..Self::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_custom_ttl(mut self, ttl: Duration) -> Self {
        self.custom_ttl = Some(ttl);
        self
    }

    /// Lifetime for an entry, capped at [`MAX_TTL`].
    pub fn ttl(&self, default_ttl: Duration) -> Duration {
        let ttl = match self.custom_ttl {
            Some(custom) => custom,
            None => {
                let factor = quality_multiplier(self.quality) * confidence_factor(self.confidence);
                Duration::try_from_secs_f64(default_ttl.as_secs_f64() * factor).unwrap_or(MAX_TTL)
            }
        };
        ttl.min(MAX_TTL)
    }
}

pub fn quality_multiplier(quality: QualityTier) -> f64 {
    match quality {
        QualityTier::Draft => 0.5,
        QualityTier::Standard => 1.0,
        QualityTier::High => 2.0,
        QualityTier::Cinematic => 4.0,
    }
}

pub fn confidence_factor(confidence: Option<f64>) -> f64 {
    match confidence {
        Some(value) if value < 0.5 => 0.5,
        Some(value) if value > 0.9 => 1.5,
        _ => 1.0,
    }
}

/// Lower-case and collapse runs of whitespace.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for a request.
pub fn fingerprint(operation: OperationType, prompt: &str, options: &GenerationOptions) -> String {
    // `serde_json::Map` keeps keys sorted, so equal options hash equally.
    let options = serde_json::to_value(options)
        .map(|value| value.to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update(b"\n");
    hasher.update(options.as_bytes());
    format!("{}:{}", operation.as_str(), hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    pub access_count: u64,
    pub quality: QualityTier,
    pub confidence: Option<f64>,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
    pub key: String,
    pub value: Value,
    pub original_prompt: String,
    pub metadata: CacheMetadata,
    pub ttl_ms: u64,
    /// Set when the hit came from a near-duplicate prompt.
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    original_prompt: String,
    tokens: BTreeSet<String>,
    metadata: CacheMetadata,
    ttl: Duration,
    expires_at: Instant,
    last_used: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn touch(&mut self, tick: u64) {
        self.metadata.last_accessed = OffsetDateTime::now_utc();
        self.metadata.access_count += 1;
        self.last_used = tick;
    }

    fn to_response(&self, key: &str, similarity: Option<f64>) -> CachedResponse {
        CachedResponse {
            key: key.to_owned(),
            value: self.value.clone(),
            original_prompt: self.original_prompt.clone(),
            metadata: self.metadata.clone(),
            ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            similarity,
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    config: CacheConfig,
    map: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            map: HashMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let tick = self.next_tick();
        match self.map.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.touch(tick);
                self.hits += 1;
                Some(entry.to_response(key, None))
            }
            Some(_) => {
                self.map.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn most_similar(&mut self, operation: OperationType, prompt: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let prefix = format!("{}:", operation.as_str());
        let tokens = tokenize(prompt);
        let threshold = self.config.similarity_threshold;

        let best = self
            .map
            .iter()
            .filter(|(key, entry)| key.starts_with(&prefix) && entry.is_live(now))
            .map(|(key, entry)| (key, jaccard(&tokens, &entry.tokens)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|left, right| left.1.total_cmp(&right.1))
            .map(|(key, score)| (key.clone(), score));

        let tick = self.next_tick();
        match best.and_then(|(key, score)| self.map.get_mut(&key).map(|entry| (key, entry, score))) {
            Some((key, entry, score)) => {
                entry.touch(tick);
                self.hits += 1;
                Some(entry.to_response(&key, Some(score)))
            }
            None => None,
        }
    }

    fn put(&mut self, key: String, value: Value, prompt: &str, policy: TtlPolicy) {
        let ttl = policy.ttl(self.config.default_ttl());
        let created = Instant::now();
        let expires_at = created
            .checked_add(ttl)
            .or_else(|| created.checked_add(MAX_TTL))
            .unwrap_or(created);
        let now = OffsetDateTime::now_utc();
        let tick = self.next_tick();
        self.map.insert(
            key,
            CacheEntry {
                value,
                original_prompt: prompt.to_owned(),
                tokens: tokenize(prompt),
                metadata: CacheMetadata {
                    created_at: now,
                    last_accessed: now,
                    access_count: 0,
                    quality: policy.quality,
                    confidence: policy.confidence,
                },
                ttl,
                expires_at,
                last_used: tick,
            },
        );
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&mut self) {
        while self.map.len() > self.config.max_cache_size {
            let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            self.map.remove(&oldest);
            self.evictions += 1;
            debug!(key = %oldest, "evicted least recently used cache entry");
        }
    }

    fn clear_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before - self.map.len()
    }

    fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            entries: self.map.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }
}

/// Thread-safe response cache.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Arc<tokio::sync::RwLock<CacheInner>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(CacheInner::new(config))),
        }
    }

    /// Live entry for `key`. Updates access metadata but not the expiry.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let hit = self.inner.write().await.get(key);
        debug!(key, hit = hit.is_some(), "cache lookup");
        hit
    }

    /// Exact fingerprint first, then a near-duplicate prompt when semantic
    /// similarity is enabled.
    pub async fn lookup(
        &self,
        operation: OperationType,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Option<CachedResponse> {
        let key = fingerprint(operation, prompt, options);
        let mut store = self.inner.write().await;
        if let Some(hit) = store.get(&key) {
            debug!(key = %key, "cache hit");
            return Some(hit);
        }
        if !store.config.enable_semantic_similarity {
            return None;
        }
        let similar = store.most_similar(operation, prompt);
        if let Some(hit) = &similar {
            debug!(key = %hit.key, similarity = hit.similarity, "semantic cache hit");
        }
        similar
    }

    pub async fn set(&self, key: impl Into<String>, value: Value, prompt: &str, policy: TtlPolicy) {
        self.inner
            .write()
            .await
            .put(key.into(), value, prompt, policy);
    }

    /// Store under the request fingerprint and return the key used.
    pub async fn store(
        &self,
        operation: OperationType,
        prompt: &str,
        options: &GenerationOptions,
        value: Value,
        policy: TtlPolicy,
    ) -> String {
        let key = fingerprint(operation, prompt, options);
        self.set(key.clone(), value, prompt, policy).await;
        key
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.inner.write().await.map.remove(key).is_some()
    }

    /// Remove every key matching a glob such as `dream:*`. Returns the
    /// number removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize, CoreError> {
        let matcher = Glob::new(pattern)
            .map_err(|error| CoreError::InvalidPattern {
                pattern: pattern.to_owned(),
                message: error.kind().to_string(),
            })?
            .compile_matcher();

        let mut store = self.inner.write().await;
        let before = store.map.len();
        store.map.retain(|key, _| !matcher.is_match(key));
        let removed = before - store.map.len();
        debug!(pattern, removed, "invalidated cache entries");
        Ok(removed)
    }

    pub async fn cleanup_expired(&self) -> usize {
        self.inner.write().await.clear_expired()
    }

    pub async fn clear(&self) {
        self.inner.write().await.map.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.map.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.read().await.stats()
    }
}

fn tokenize(prompt: &str) -> BTreeSet<String> {
    prompt
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3_600);

    #[test]
    fn ttl_scales_with_confidence_and_quality() {
        let standard = TtlPolicy::new(QualityTier::Standard);

        assert_eq!(standard.with_confidence(0.95).ttl(HOUR), HOUR.mul_f64(1.5));
        assert_eq!(standard.with_confidence(0.3).ttl(HOUR), HOUR / 2);
        assert_eq!(standard.with_confidence(0.7).ttl(HOUR), HOUR);
        assert_eq!(TtlPolicy::new(QualityTier::Cinematic).ttl(HOUR), HOUR * 4);
        assert_eq!(
            standard
                .with_confidence(0.95)
                .with_custom_ttl(Duration::from_secs(5))
                .ttl(HOUR),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn ttl_is_capped() {
        let huge = TtlPolicy::default().with_custom_ttl(Duration::MAX);
        let scaled = TtlPolicy::new(QualityTier::Cinematic).with_confidence(0.95);

        assert_eq!(huge.ttl(HOUR), MAX_TTL);
        assert_eq!(scaled.ttl(Duration::MAX), MAX_TTL);
    }

    #[test]
    fn oversized_default_ttl_is_rejected() {
        let config = CacheConfig {
            default_ttl_ms: u64::MAX,
            ..CacheConfig::default()
        };

        let error = config.validate().expect_err("ttl beyond the cap");
        assert!(error.to_string().contains("cache.default_ttl_ms"));
    }

    #[tokio::test]
    async fn unbounded_custom_ttl_is_stored_without_overflow() {
        let cache = ResponseCache::default();
        let policy = TtlPolicy::default().with_custom_ttl(Duration::MAX);

        cache.set("dream:forever", json!({ "id": 1 }), "forever", policy).await;

        let entry = cache.get("dream:forever").await.expect("entry is fresh");
        assert_eq!(u128::from(entry.ttl_ms), MAX_TTL.as_millis());
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let options = GenerationOptions::default();

        assert_eq!(
            fingerprint(OperationType::Dream, "Draw  a\tCAT", &options),
            fingerprint(OperationType::Dream, "draw a cat", &options)
        );
        assert_ne!(
            fingerprint(OperationType::Dream, "draw a cat", &options),
            fingerprint(OperationType::Text, "draw a cat", &options)
        );
        assert_ne!(
            fingerprint(OperationType::Dream, "draw a cat", &options),
            fingerprint(
                OperationType::Dream,
                "draw a cat",
                &options.clone().with_quality(QualityTier::High)
            )
        );
    }

    #[tokio::test]
    async fn hits_track_access_without_extending_ttl() {
        let cache = ResponseCache::default();
        let policy = TtlPolicy::new(QualityTier::Standard).with_custom_ttl(Duration::from_millis(100));
        cache.set("dream:a", json!({ "id": 1 }), "a", policy).await;

        let first = cache.get("dream:a").await.expect("fresh entry");
        let second = cache.get("dream:a").await.expect("fresh entry");
        assert_eq!(first.metadata.access_count, 1);
        assert_eq!(second.metadata.access_count, 2);
        assert_eq!(second.ttl_ms, 100);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cache.get("dream:a").await.is_none());
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let cache = ResponseCache::new(CacheConfig {
            max_cache_size: 2,
            ..CacheConfig::default()
        });
        let policy = TtlPolicy::default();

        cache.set("k1", json!(1), "one", policy).await;
        cache.set("k2", json!(2), "two", policy).await;
        assert!(cache.get("k1").await.is_some());
        cache.set("k3", json!(3), "three", policy).await;

        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k3").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn glob_invalidation_removes_matching_keys() {
        let cache = ResponseCache::default();
        let policy = TtlPolicy::default();
        cache.set("dream:abc", json!(1), "a", policy).await;
        cache.set("dream:def", json!(2), "b", policy).await;
        cache.set("text:abc", json!(3), "c", policy).await;

        assert_eq!(cache.invalidate("dream:*").await.expect("valid glob"), 2);
        assert_eq!(cache.len().await, 1);
        assert!(matches!(
            cache.invalidate("dream:[").await,
            Err(CoreError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn similar_prompts_hit_only_when_enabled() {
        let options = GenerationOptions::default();
        let prompt = "a floating library of glowing books above a quiet ocean at dusk";
        let near = "A floating library of glowing books above a quiet ocean at dusk!";
        let disabled = ResponseCache::default();
        let enabled = ResponseCache::new(CacheConfig {
            enable_semantic_similarity: true,
            ..CacheConfig::default()
        });

        for cache in [&disabled, &enabled] {
            cache
                .store(OperationType::Dream, prompt, &options, json!({ "id": "lib" }), TtlPolicy::default())
                .await;
        }

        assert!(disabled.lookup(OperationType::Dream, "library ocean dusk books", &options).await.is_none());
        let hit = enabled
            .lookup(OperationType::Dream, near, &options)
            .await
            .expect("near duplicate hits");
        assert_eq!(hit.value["id"], "lib");
        assert!(enabled
            .lookup(OperationType::Dream, "a burning desert city", &options)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_entries() {
        let cache = ResponseCache::default();
        cache
            .set("short", json!(1), "s", TtlPolicy::default().with_custom_ttl(Duration::from_millis(50)))
            .await;
        cache.set("long", json!(2), "l", TtlPolicy::default()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.cleanup_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }
}
