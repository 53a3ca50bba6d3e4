//! Address geocoding with a persistent, deduplicating cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rlp_core::{clean_address_for_query, normalize_address, GeocodeEntry, GeocodeStatus, Listing};
use rlp_storage::{read_json, write_json_atomic, FetchErrorKind, PageFetcher, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub const AUSTIN_METRO: BoundingBox = BoundingBox {
        min_lat: 30.0,
        max_lat: 30.6,
        min_lon: -98.2,
        max_lon: -97.4,
    };

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}

/// One entry per normalized address key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeCache {
    entries: BTreeMap<String, GeocodeEntry>,
}

impl GeocodeCache {
    /// Missing file means an empty cache. Claims left behind by an interrupted run become `pending`.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut cache: GeocodeCache = read_json(path).await?.unwrap_or_default();
        let mut reclaimed = 0usize;
        for entry in cache.entries.values_mut() {
            if entry.status == GeocodeStatus::InProgress {
                entry.status = GeocodeStatus::Pending;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            warn!(reclaimed, "reset stale geocode claims to pending");
        }
        Ok(cache)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
            .await
            .with_context(|| format!("saving geocode cache {}", path.display()))
    }

    pub fn lookup(&self, raw_address: &str) -> Option<&GeocodeEntry> {
        self.entries.get(&normalize_address(raw_address))
    }

    pub fn get(&self, key: &str) -> Option<&GeocodeEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, entry: GeocodeEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &GeocodeEntry> {
        self.entries.values()
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut GeocodeEntry> {
        self.entries.get_mut(key)
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder refused service: {0}")]
    Blocked(String),
    #[error("geocode request failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// `Ok(None)` when the provider has no match for the query.
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError>;
}

/// Geocoder reached over HTTP through the shared rate-limited fetcher.
pub struct HttpGeocodeProvider {
    fetcher: Arc<dyn PageFetcher>,
    endpoint: String,
    api_key: Option<String>,
    bounds: Option<BoundingBox>,
}

impl HttpGeocodeProvider {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        bounds: Option<BoundingBox>,
    ) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            api_key,
            bounds,
        }
    }

    /// Substitutes `{query}` and `{key}` inside query parameters, percent-encoding the values.
    pub fn request_url(&self, query: &str) -> Result<String, GeocodeError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| GeocodeError::Failed(format!("bad endpoint {}: {e}", self.endpoint)))?;
        let key = self.api_key.as_deref().unwrap_or_default();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.replace("{query}", query).replace("{key}", key)))
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        Ok(url.to_string())
    }
}

fn json_coord(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts a Nominatim-style array of `{lat, lon}` or a Google-style `{results: [...]}` body.
pub fn parse_coordinates(
    body: &str,
    bounds: Option<&BoundingBox>,
) -> Result<Option<(f64, f64)>, GeocodeError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| GeocodeError::Failed(format!("invalid geocoder json: {e}")))?;

    let found = match &value {
        JsonValue::Array(items) => items
            .first()
            .and_then(|first| Some((json_coord(first.get("lat")?)?, json_coord(first.get("lon")?)?))),
        JsonValue::Object(obj) => {
            match obj.get("status").and_then(JsonValue::as_str) {
                Some("OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" | "REQUEST_DENIED") => {
                    return Err(GeocodeError::Blocked(format!(
                        "provider status {}",
                        obj["status"]
                    )));
                }
                _ => {}
            }
            obj.get("results")
                .and_then(JsonValue::as_array)
                .and_then(|results| results.first())
                .and_then(|first| {
                    let location = first.get("geometry")?.get("location")?;
                    Some((json_coord(location.get("lat")?)?, json_coord(location.get("lng")?)?))
                })
        }
        _ => None,
    };

    Ok(found.filter(|(lat, lon)| match bounds {
        Some(b) if !b.contains(*lat, *lon) => {
            debug!(lat, lon, "discarding geocode match outside bounds");
            false
        }
        _ => true,
    }))
}

#[async_trait]
impl GeocodeProvider for HttpGeocodeProvider {
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        let url = self.request_url(query)?;
        let response = self
            .fetcher
            .fetch(&url, &[("accept", "application/json")])
            .await
            .map_err(|err| match err.kind() {
                FetchErrorKind::Blocked => GeocodeError::Blocked(err.to_string()),
                FetchErrorKind::Transient | FetchErrorKind::Fatal => {
                    GeocodeError::Failed(err.to_string())
                }
            })?;
        parse_coordinates(&response.text(), self.bounds.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub max_attempts: u32,
    pub concurrency: usize,
    pub checkpoint_every: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeSummary {
    pub distinct_keys: usize,
    pub cache_hits: usize,
    pub calls_made: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub pending: usize,
    pub provider_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Resolved,
    Unresolved,
    Deferred,
}

pub struct GeocodeResolver {
    provider: Arc<dyn GeocodeProvider>,
    settings: ResolverSettings,
    cache_path: PathBuf,
}

impl GeocodeResolver {
    pub fn new(
        provider: Arc<dyn GeocodeProvider>,
        settings: ResolverSettings,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            settings,
            cache_path: cache_path.into(),
        }
    }

    pub async fn resolve(&self, listings: &[Listing]) -> Result<GeocodeSummary> {
        let cache = GeocodeCache::load(&self.cache_path).await?;

        let mut wanted: BTreeMap<String, String> = BTreeMap::new();
        for listing in listings {
            let key = normalize_address(&listing.address);
            if key.is_empty() {
                continue;
            }
            wanted
                .entry(key)
                .or_insert_with(|| clean_address_for_query(&listing.address));
        }

        let mut summary = GeocodeSummary {
            distinct_keys: wanted.len(),
            ..GeocodeSummary::default()
        };

        let cache = Arc::new(Mutex::new(cache));
        let claimed = {
            let mut guard = cache.lock().await;
            let mut claimed = Vec::new();
            for (key, query) in &wanted {
                match guard.get(key) {
                    Some(entry) if entry.is_terminal() => summary.cache_hits += 1,
                    existing => {
                        let mut entry = existing
                            .cloned()
                            .unwrap_or_else(|| GeocodeEntry::pending(key.clone(), query.clone()));
                        entry.status = GeocodeStatus::InProgress;
                        guard.insert(entry);
                        claimed.push((key.clone(), query.clone()));
                    }
                }
            }
            claimed
        };
        info!(
            distinct = summary.distinct_keys,
            cache_hits = summary.cache_hits,
            claimed = claimed.len(),
            "geocode work planned"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let blocked = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        for (key, query) in claimed {
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let cache = cache.clone();
            let blocked = blocked.clone();
            let calls = calls.clone();
            let max_attempts = self.settings.max_attempts.max(1);
            let span = info_span!("geocode_key", key = %key);
            workers.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return KeyOutcome::Deferred;
                    };
                    resolve_key(provider, cache, blocked, calls, max_attempts, key, query).await
                }
                .instrument(span),
            );
        }

        let checkpoint_every = self.settings.checkpoint_every.max(1);
        let mut completed = 0usize;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.context("geocode worker panicked")?;
            if outcome != KeyOutcome::Deferred {
                completed += 1;
                if completed % checkpoint_every == 0 {
                    let snapshot = cache.lock().await.clone();
                    snapshot.save(&self.cache_path).await?;
                    debug!(completed, "geocode checkpoint written");
                }
            }
        }

        let mut guard = cache.lock().await;
        for key in wanted.keys() {
            if let Some(entry) = guard.get_mut(key) {
                if entry.status == GeocodeStatus::InProgress {
                    entry.status = GeocodeStatus::Pending;
                }
                match entry.status {
                    GeocodeStatus::Resolved => summary.resolved += 1,
                    GeocodeStatus::Unresolved => summary.unresolved += 1,
                    GeocodeStatus::Pending | GeocodeStatus::InProgress => summary.pending += 1,
                }
            }
        }
        guard.save(&self.cache_path).await?;

        summary.calls_made = calls.load(Ordering::SeqCst);
        summary.provider_blocked = blocked.load(Ordering::SeqCst);
        if summary.provider_blocked {
            warn!(pending = summary.pending, "geocoder blocked; remaining keys left pending");
        }
        Ok(summary)
    }
}

/// One provider call per key per run, so a single outage spends at most one attempt.
async fn resolve_key(
    provider: Arc<dyn GeocodeProvider>,
    cache: Arc<Mutex<GeocodeCache>>,
    blocked: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    max_attempts: u32,
    key: String,
    query: String,
) -> KeyOutcome {
    {
        let mut guard = cache.lock().await;
        let Some(entry) = guard.get_mut(&key) else {
            return KeyOutcome::Deferred;
        };
        if blocked.load(Ordering::SeqCst) {
            entry.status = GeocodeStatus::Pending;
            return KeyOutcome::Deferred;
        }
        if entry.attempts >= max_attempts {
            entry.status = GeocodeStatus::Unresolved;
            return KeyOutcome::Unresolved;
        }
    }

    calls.fetch_add(1, Ordering::SeqCst);
    let result = provider.geocode(&query).await;

    let mut guard = cache.lock().await;
    let Some(entry) = guard.get_mut(&key) else {
        return KeyOutcome::Deferred;
    };
    match result {
        Ok(Some((latitude, longitude))) => {
            entry.attempts += 1;
            entry.last_attempt_at = Some(Utc::now());
            entry.latitude = Some(latitude);
            entry.longitude = Some(longitude);
            entry.status = GeocodeStatus::Resolved;
            KeyOutcome::Resolved
        }
        Ok(None) | Err(GeocodeError::Failed(_)) => {
            entry.attempts += 1;
            entry.last_attempt_at = Some(Utc::now());
            if let Err(err) = &result {
                debug!(attempt = entry.attempts, error = %err, "geocode attempt failed");
            }
            if entry.attempts >= max_attempts {
                entry.status = GeocodeStatus::Unresolved;
                KeyOutcome::Unresolved
            } else {
                entry.status = GeocodeStatus::Pending;
                KeyOutcome::Deferred
            }
        }
        Err(GeocodeError::Blocked(reason)) => {
            if !blocked.swap(true, Ordering::SeqCst) {
                warn!(%reason, "geocoder blocked; stopping workers");
            }
            entry.status = GeocodeStatus::Pending;
            KeyOutcome::Deferred
        }
    }
}
