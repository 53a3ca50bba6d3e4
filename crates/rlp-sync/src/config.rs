//! Pipeline configuration: `rlp.yaml` plus `RLP_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rlp_core::ScoreWeights;
use rlp_storage::{BackoffPolicy, FetcherConfig};
use serde::{Deserialize, Serialize};

use crate::geocode::BoundingBox;
use crate::scoring::{GeoPoint, SafetyBounds};

pub const DEFAULT_CONFIG_PATH: &str = "rlp.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub sources_path: PathBuf,
    pub fetch: FetchSettings,
    pub scrape: ScrapeSettings,
    pub geocode: GeocodeSettings,
    pub scoring: ScoringSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            reference_dir: PathBuf::from("./data/reference"),
            sources_path: PathBuf::from("./sources.yaml"),
            fetch: FetchSettings::default(),
            scrape: ScrapeSettings::default(),
            geocode: GeocodeSettings::default(),
            scoring: ScoringSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            timeout_secs: 15,
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            user_agent: "rlp-bot/0.1".to_string(),
        }
    }
}

impl FetchSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff(),
            ..FetcherConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    /// Empty means "every area in the rent-benchmark table".
    pub areas: Vec<String>,
    pub checkpoint_interval: usize,
    pub force_refresh: bool,
    pub store_raw_pages: bool,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            areas: Vec::new(),
            checkpoint_interval: 10,
            force_refresh: false,
            store_raw_pages: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeSettings {
    /// `{query}` is replaced with the cleaned address, `{key}` with `api_key`.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub concurrency: usize,
    pub checkpoint_every: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub bounds: Option<BoundingBox>,
}

impl Default for GeocodeSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search?format=json&limit=1&q={query}"
                .to_string(),
            api_key: None,
            max_attempts: 3,
            concurrency: 4,
            checkpoint_every: 25,
            min_delay_ms: 1_000,
            max_delay_ms: 1_500,
            bounds: Some(BoundingBox::AUSTIN_METRO),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub weights: ScoreWeights,
    pub budget: f64,
    /// Pinned incident bounds; `None` derives them from this run's crime table.
    pub safety_bounds: Option<SafetyBounds>,
    pub reference_point: GeoPoint,
    pub max_distance_km: f64,
    pub crime_time_window: Option<String>,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            budget: 1_500.0,
            safety_bounds: None,
            reference_point: GeoPoint::DOWNTOWN_AUSTIN,
            max_distance_km: 32.0,
            crime_time_window: None,
        }
    }
}

impl PipelineConfig {
    /// Reads `path` when it exists (defaults otherwise), then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<PipelineConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            PipelineConfig::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("RLP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RLP_REFERENCE_DIR") {
            self.reference_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("RLP_USER_AGENT") {
            self.fetch.user_agent = agent;
        }
        if let Some(secs) = lookup("RLP_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.fetch.timeout_secs = secs;
        }
        if let Some(url) = lookup("RLP_GEOCODER_URL") {
            self.geocode.endpoint = url;
        }
        if let Some(key) = lookup("RLP_GEOCODER_API_KEY") {
            self.geocode.api_key = Some(key);
        }
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }
}

/// Everything the pipeline reads and writes under `data_dir`.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub segments_dir: PathBuf,
    pub scrape_state: PathBuf,
    pub raw_pages_dir: PathBuf,
    pub geocode_cache: PathBuf,
    pub published_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        let raw = data_dir.join("raw");
        Self {
            segments_dir: raw.join("segments"),
            scrape_state: raw.join("scrape_state.json"),
            raw_pages_dir: raw.join("pages"),
            geocode_cache: data_dir.join("geocode").join("cache.json"),
            published_dir: data_dir.join("published"),
            snapshots_dir: data_dir.join("snapshots"),
            reports_dir: data_dir.join("reports"),
        }
    }
}
