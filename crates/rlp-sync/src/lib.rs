//! Pipeline orchestration: scrape, geocode, merge, score and publish.

pub mod config;
pub mod geocode;
pub mod merge;
pub mod publish;
pub mod reference;
pub mod scoring;
pub mod scrape;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rlp_adapters::{build_source, ListingSource, SourceRegistry};
use rlp_storage::{ArtifactStore, HttpFetcher, PageFetcher, SegmentStore};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DataPaths, PipelineConfig};
use crate::geocode::{GeocodeCache, GeocodeResolver, GeocodeSummary, HttpGeocodeProvider, ResolverSettings};
use crate::merge::{MergeSummary, SourceMerger};
use crate::publish::{MasterDatasetWriter, PublishError};
use crate::reference::{benchmark_area_codes, load_rent_benchmarks, ReferenceData, RENT_BENCHMARKS_FILE};
use crate::scoring::{area_scores, SafetyBounds, ScoringEngine};
use crate::scrape::{load_committed_listings, ListingScraper, ScrapeSummary, ScraperSettings};

pub const CRATE_NAME: &str = "rlp-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Scrape { force: bool },
    Geocode,
    Score,
    All { force: bool },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Scrape { .. } => "scrape",
            Command::Geocode => "geocode",
            Command::Score => "score",
            Command::All { .. } => "all",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishOutcome {
    pub succeeded: bool,
    pub properties: usize,
    pub areas: usize,
    pub manifest_path: Option<String>,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scrape: Option<ScrapeSummary>,
    pub geocode: Option<GeocodeSummary>,
    pub merge: Option<MergeSummary>,
    pub publish: Option<PublishOutcome>,
    pub reports_dir: String,
}

impl RunReport {
    /// The line the CLI prints after each command.
    pub fn one_line(&self) -> String {
        let mut parts = vec![format!("{} run {}", self.command, self.run_id)];
        if let Some(s) = &self.scrape {
            parts.push(format!(
                "scrape: {} areas done, {} failed, {} skipped, {} listings",
                s.areas_completed, s.areas_failed, s.areas_skipped, s.listings_fetched
            ));
            if !s.blocked_sources.is_empty() {
                parts.push(format!("blocked: {}", s.blocked_sources.join(",")));
            }
        }
        if let Some(g) = &self.geocode {
            parts.push(format!(
                "geocode: {} resolved, {} unresolved, {} pending, {} calls",
                g.resolved, g.unresolved, g.pending, g.calls_made
            ));
        }
        if let Some(p) = &self.publish {
            parts.push(if p.succeeded {
                format!("published {} properties / {} areas", p.properties, p.areas)
            } else {
                format!("publish FAILED ({} problems)", p.problems.len())
            });
        }
        parts.join(" | ")
    }
}

/// Staged pipeline over one configuration. Fetchers are injectable for tests.
pub struct Pipeline {
    config: PipelineConfig,
    paths: DataPaths,
    listing_fetcher: Arc<dyn PageFetcher>,
    geocode_fetcher: Arc<dyn PageFetcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let listing_fetcher = HttpFetcher::new(config.fetch.fetcher_config())
            .context("building listing fetcher")?;
        let mut geocode_config = config.fetch.fetcher_config();
        geocode_config.min_delay = Duration::from_millis(config.geocode.min_delay_ms);
        geocode_config.max_delay = Duration::from_millis(config.geocode.max_delay_ms);
        geocode_config.global_concurrency = config.geocode.concurrency.max(1);
        let geocode_fetcher = HttpFetcher::new(geocode_config).context("building geocode fetcher")?;
        Ok(Self::with_fetchers(
            config,
            Arc::new(listing_fetcher),
            Arc::new(geocode_fetcher),
        ))
    }

    pub fn with_fetchers(
        config: PipelineConfig,
        listing_fetcher: Arc<dyn PageFetcher>,
        geocode_fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let paths = config.paths();
        Self {
            config,
            paths,
            listing_fetcher,
            geocode_fetcher,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Runs the command, then writes the run report. A publish failure is reported first and then returned.
    pub async fn execute(&self, command: Command) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut report = RunReport {
            run_id,
            command: command.name().to_string(),
            started_at,
            finished_at: started_at,
            scrape: None,
            geocode: None,
            merge: None,
            publish: None,
            reports_dir: String::new(),
        };

        let span = info_span!("pipeline_run", run_id = %run_id, command = command.name());
        let outcome = self
            .run_stages(command, &mut report)
            .instrument(span)
            .await?;

        let mut publish_error = None;
        if let Some(publish) = outcome {
            match publish {
                Ok(outcome) => report.publish = Some(outcome),
                Err(PublishError::Validation(problems)) => {
                    report.publish = Some(PublishOutcome {
                        problems: problems.clone(),
                        ..PublishOutcome::default()
                    });
                    publish_error = Some(PublishError::Validation(problems));
                }
                Err(err) => return Err(err).context("publishing master dataset"),
            }
        }

        report.finished_at = Utc::now();
        let reports_dir = write_reports(&self.paths.reports_dir, &report).await?;
        report.reports_dir = reports_dir.display().to_string();
        info!(summary = %report.one_line(), "run finished");

        match publish_error {
            Some(err) => Err(err).context("publish validation failed; previous dataset kept"),
            None => Ok(report),
        }
    }

    /// `Some` carries the publish result when the command scores.
    async fn run_stages(
        &self,
        command: Command,
        report: &mut RunReport,
    ) -> Result<Option<std::result::Result<PublishOutcome, PublishError>>> {
        if let Command::Scrape { force } | Command::All { force } = command {
            report.scrape = Some(self.scrape(force).await?);
        }
        if matches!(command, Command::Geocode | Command::All { .. }) {
            report.geocode = Some(self.geocode().await?);
        }
        if matches!(command, Command::Score | Command::All { .. }) {
            let (merge, publish) = self.score(report.run_id).await?;
            report.merge = Some(merge);
            return Ok(Some(publish));
        }
        Ok(None)
    }

    fn sources(&self) -> Result<Vec<Box<dyn ListingSource>>> {
        let registry = SourceRegistry::load(&self.config.sources_path)?;
        registry
            .enabled()
            .map(|cfg| {
                build_source(cfg).with_context(|| format!("building source {}", cfg.source_id))
            })
            .collect()
    }

    /// Configured areas, or every area in the rent-benchmark table.
    fn scrape_areas(&self) -> Result<Vec<String>> {
        if !self.config.scrape.areas.is_empty() {
            return Ok(self.config.scrape.areas.clone());
        }
        let benchmarks = load_rent_benchmarks(&self.config.reference_dir.join(RENT_BENCHMARKS_FILE))?;
        Ok(benchmark_area_codes(&benchmarks))
    }

    pub async fn scrape(&self, force: bool) -> Result<ScrapeSummary> {
        let areas = self.scrape_areas()?;
        let sources = self.sources()?;
        info!(areas = areas.len(), sources = sources.len(), force, "scrape starting");

        let mut scraper = ListingScraper::new(
            self.listing_fetcher.clone(),
            sources,
            SegmentStore::new(&self.paths.segments_dir),
            &self.paths.scrape_state,
            ScraperSettings {
                checkpoint_interval: self.config.scrape.checkpoint_interval,
                force_refresh: force || self.config.scrape.force_refresh,
            },
        );
        if self.config.scrape.store_raw_pages {
            scraper = scraper.with_raw_pages(ArtifactStore::new(&self.paths.raw_pages_dir));
        }
        scraper.run(&areas).await
    }

    pub async fn geocode(&self) -> Result<GeocodeSummary> {
        let listings = self.committed_listings().await?;
        let settings = &self.config.geocode;
        let provider = HttpGeocodeProvider::new(
            self.geocode_fetcher.clone(),
            settings.endpoint.clone(),
            settings.api_key.clone(),
            settings.bounds,
        );
        let resolver = GeocodeResolver::new(
            Arc::new(provider),
            ResolverSettings {
                max_attempts: settings.max_attempts,
                concurrency: settings.concurrency,
                checkpoint_every: settings.checkpoint_every,
            },
            &self.paths.geocode_cache,
        );
        resolver.resolve(&listings).await
    }

    /// Merge and score always run; the inner result is the publish outcome.
    pub async fn score(
        &self,
        run_id: Uuid,
    ) -> Result<(MergeSummary, std::result::Result<PublishOutcome, PublishError>)> {
        let reference = ReferenceData::load(&self.config.reference_dir)
            .with_context(|| format!("loading reference data {}", self.config.reference_dir.display()))?;
        let listings = self.committed_listings().await?;
        let cache = GeocodeCache::load(&self.paths.geocode_cache).await?;

        let window = self.config.scoring.crime_time_window.as_deref();
        let merger = SourceMerger::new(&reference, window);
        let (mut properties, merge) = merger.merge(listings, &cache);

        let run_bounds = SafetyBounds::from_totals(merger.district_totals().values());
        let engine = ScoringEngine::new(&self.config.scoring, run_bounds)
            .context("invalid scoring settings")?;
        if engine.safety_bounds().is_none() {
            warn!("no crime totals available; safety scores fall back to neutral");
        }
        engine.score_all(&mut properties);
        let areas = area_scores(&properties);

        let writer = MasterDatasetWriter::new(&self.paths.published_dir, &self.paths.snapshots_dir);
        let outcome = writer
            .publish(run_id, &properties, &areas)
            .await
            .map(|summary| PublishOutcome {
                succeeded: true,
                properties: summary.properties,
                areas: summary.areas,
                manifest_path: Some(summary.manifest_path.display().to_string()),
                problems: Vec::new(),
            });
        Ok((merge, outcome))
    }

    async fn committed_listings(&self) -> Result<Vec<rlp_core::Listing>> {
        load_committed_listings(
            &self.paths.scrape_state,
            &SegmentStore::new(&self.paths.segments_dir),
        )
        .await
    }
}

async fn write_reports(reports_root: &std::path::Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut brief = vec![
        "# RLP Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Command: {}", report.command),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
    ];
    if let Some(s) = &report.scrape {
        brief.push(String::new());
        brief.push("## Scrape".to_string());
        brief.push(format!("- Areas completed: {}", s.areas_completed));
        brief.push(format!("- Areas failed: {}", s.areas_failed));
        brief.push(format!("- Areas skipped: {}", s.areas_skipped));
        brief.push(format!("- Pages fetched: {}", s.pages_fetched));
        brief.push(format!("- Listings fetched: {}", s.listings_fetched));
        if !s.blocked_sources.is_empty() {
            brief.push(format!("- Blocked sources: {}", s.blocked_sources.join(", ")));
        }
    }
    if let Some(g) = &report.geocode {
        brief.push(String::new());
        brief.push("## Geocode".to_string());
        brief.push(format!("- Distinct addresses: {}", g.distinct_keys));
        brief.push(format!("- Cache hits: {}", g.cache_hits));
        brief.push(format!("- Resolved: {}", g.resolved));
        brief.push(format!("- Unresolved: {}", g.unresolved));
        brief.push(format!("- Still pending: {}", g.pending));
        if g.provider_blocked {
            brief.push("- Provider blocked this run".to_string());
        }
    }
    if let Some(m) = &report.merge {
        brief.push(String::new());
        brief.push("## Merge".to_string());
        brief.push(format!("- Listings in: {}", m.input_listings));
        brief.push(format!("- Duplicates collapsed: {}", m.duplicates_collapsed));
        brief.push(format!("- Properties: {}", m.properties));
        brief.push(format!("- Without coordinates: {}", m.without_coordinates));
        brief.push(format!("- Outside boundaries: {}", m.outside_boundaries));
    }
    if let Some(p) = &report.publish {
        brief.push(String::new());
        brief.push("## Publish".to_string());
        if p.succeeded {
            brief.push(format!("- Properties: {}", p.properties));
            brief.push(format!("- Areas: {}", p.areas));
            if let Some(path) = &p.manifest_path {
                brief.push(format!("- Manifest: `{path}`"));
            }
        } else {
            brief.push("- FAILED validation; previous dataset kept".to_string());
            brief.extend(p.problems.iter().map(|problem| format!("  - {problem}")));
        }
    }
    brief.push(String::new());

    fs::write(reports_dir.join("run_brief.md"), brief.join("\n"))
        .await
        .context("writing run_brief.md")?;
    let json = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(reports_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{DatasetManifest, MANIFEST_FILE};
    use crate::reference::tests::write_reference_dir;
    use async_trait::async_trait;
    use rlp_storage::{FetchError, FetchedResponse, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const SOURCES_YAML: &str = r#"
sources:
  - source_id: redfin
    display_name: Redfin
    enabled: true
    max_pages: 3
  - source_id: zillow
    display_name: Zillow
    enabled: false
"#;

    fn fixture(name: &str) -> Vec<u8> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures/redfin/sample")
            .join(name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    struct FixtureFetcher;

    #[async_trait]
    impl PageFetcher for FixtureFetcher {
        async fn fetch(
            &self,
            url: &str,
            _headers: &[(&str, &str)],
        ) -> std::result::Result<FetchedResponse, FetchError> {
            let body = if url.ends_with("page-1") {
                fixture("page.html")
            } else {
                fixture("empty.html")
            };
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body,
            })
        }
    }

    #[derive(Default)]
    struct PointGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for PointGeocoder {
        async fn fetch(
            &self,
            url: &str,
            _headers: &[(&str, &str)],
        ) -> std::result::Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = if url.contains("Manchaca") {
                "[]".to_string()
            } else {
                r#"[{"lat": "30.27", "lon": "-97.75"}]"#.to_string()
            };
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: body.into_bytes(),
            })
        }
    }

    fn config_in(root: &std::path::Path) -> PipelineConfig {
        let reference_dir = root.join("reference");
        std::fs::create_dir_all(&reference_dir).expect("reference dir");
        write_reference_dir(&reference_dir);
        let sources_path = root.join("sources.yaml");
        std::fs::write(&sources_path, SOURCES_YAML).expect("sources");

        let mut config = PipelineConfig {
            data_dir: root.join("data"),
            reference_dir,
            sources_path,
            ..PipelineConfig::default()
        };
        config.scrape.areas = vec!["78701".to_string()];
        config.scrape.checkpoint_interval = 1;
        config.geocode.endpoint = "https://geo.test/search?format=json&q={query}".to_string();
        config.geocode.max_attempts = 1;
        config
    }

    #[tokio::test]
    async fn full_run_publishes_and_reruns_are_idempotent() {
        let dir = tempdir().expect("tempdir");
        let geocoder = Arc::new(PointGeocoder::default());
        let pipeline = Pipeline::with_fetchers(config_in(dir.path()), Arc::new(FixtureFetcher), geocoder.clone());

        let report = pipeline.execute(Command::All { force: false }).await.expect("all");
        let scrape = report.scrape.as_ref().expect("scrape summary");
        assert_eq!(scrape.areas_completed, 1);
        assert_eq!(scrape.listings_fetched, 3);
        let geocode = report.geocode.as_ref().expect("geocode summary");
        assert_eq!(geocode.resolved, 2);
        assert_eq!(geocode.unresolved, 1);
        let merge = report.merge.as_ref().expect("merge summary");
        assert_eq!(merge.properties, 3);
        assert_eq!(merge.without_coordinates, 1);
        let publish = report.publish.as_ref().expect("publish outcome");
        assert!(publish.succeeded);
        assert_eq!(publish.properties, 3);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);

        let reports_dir = PathBuf::from(&report.reports_dir);
        assert!(reports_dir.join("run_summary.json").exists());
        let brief = std::fs::read_to_string(reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("## Publish"));
        assert!(report.one_line().contains("published 3 properties"));

        let rerun = pipeline.execute(Command::All { force: false }).await.expect("rerun");
        let scrape = rerun.scrape.as_ref().expect("scrape summary");
        assert_eq!(scrape.areas_skipped, 1);
        assert_eq!(scrape.listings_fetched, 0);
        assert_eq!(rerun.geocode.as_ref().expect("geocode").cache_hits, 3);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);

        let manifest: DatasetManifest = serde_json::from_slice(
            &std::fs::read(pipeline.paths().published_dir.join(MANIFEST_FILE)).expect("manifest"),
        )
        .expect("manifest json");
        assert_eq!(manifest.run_id, rerun.run_id);
        assert_eq!(manifest.files[0].rows, 3);
    }

    #[tokio::test]
    async fn invalid_weights_abort_scoring() {
        let dir = tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        config.scoring.weights.safety = 0.9;
        let pipeline = Pipeline::with_fetchers(config, Arc::new(FixtureFetcher), Arc::new(PointGeocoder::default()));

        let err = pipeline.execute(Command::Score).await.expect_err("weights must sum to one");
        assert!(format!("{err:#}").contains("weights"));
        assert!(!pipeline.paths().published_dir.join(MANIFEST_FILE).exists());
    }
}
