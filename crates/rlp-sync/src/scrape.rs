//! Resumable listing scraper with checkpointed, append-only raw storage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rlp_adapters::{ListingSource, ParseError};
use rlp_core::Listing;
use rlp_storage::{read_json, write_json_atomic, ArtifactStore, FetchError, PageFetcher, SegmentStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

pub const SEGMENT_PREFIX: &str = "listings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaState {
    pub source_id: String,
    pub area_code: String,
    pub status: AreaStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub listing_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl AreaState {
    fn new(source_id: &str, area_code: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            area_code: area_code.to_string(),
            status: AreaStatus::Pending,
            attempts: 0,
            last_error: None,
            listing_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn needs_work(&self, force_refresh: bool) -> bool {
        force_refresh || self.status != AreaStatus::Completed
    }
}

/// Persisted scraper progress. Rewriting this file is the commit point for a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeState {
    pub areas: BTreeMap<String, AreaState>,
    /// Committed segment files, oldest first. Anything else on disk is ignored.
    pub segments: Vec<String>,
}

impl ScrapeState {
    pub fn key(source_id: &str, area_code: &str) -> String {
        format!("{source_id}|{area_code}")
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let mut state: ScrapeState = read_json(path).await?.unwrap_or_default();
        for area in state.areas.values_mut() {
            if area.status == AreaStatus::InProgress {
                area.status = AreaStatus::Pending;
            }
        }
        Ok(state)
    }

    pub fn area(&self, source_id: &str, area_code: &str) -> Option<&AreaState> {
        self.areas.get(&Self::key(source_id, area_code))
    }

    fn area_mut(&mut self, source_id: &str, area_code: &str) -> &mut AreaState {
        self.areas
            .entry(Self::key(source_id, area_code))
            .or_insert_with(|| AreaState::new(source_id, area_code))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSummary {
    pub areas_completed: usize,
    pub areas_failed: usize,
    pub areas_skipped: usize,
    pub pages_fetched: usize,
    pub listings_fetched: usize,
    pub segments_written: usize,
    pub blocked_sources: Vec<String>,
}

#[derive(Debug)]
enum AreaFailure {
    Blocked(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ScraperSettings {
    pub checkpoint_interval: usize,
    pub force_refresh: bool,
}

pub struct ListingScraper {
    fetcher: Arc<dyn PageFetcher>,
    sources: Vec<Box<dyn ListingSource>>,
    segments: SegmentStore,
    state_path: PathBuf,
    raw_pages: Option<ArtifactStore>,
    settings: ScraperSettings,
}

impl ListingScraper {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        sources: Vec<Box<dyn ListingSource>>,
        segments: SegmentStore,
        state_path: impl Into<PathBuf>,
        settings: ScraperSettings,
    ) -> Self {
        Self {
            fetcher,
            sources,
            segments,
            state_path: state_path.into(),
            raw_pages: None,
            settings,
        }
    }

    pub fn with_raw_pages(mut self, store: ArtifactStore) -> Self {
        self.raw_pages = Some(store);
        self
    }

    pub async fn run(&self, areas: &[String]) -> Result<ScrapeSummary> {
        let mut state = ScrapeState::load(&self.state_path).await?;
        let orphans = self.segments.orphaned_segments(&state.segments).await?;
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "ignoring uncommitted listing segments");
        }

        let mut summary = ScrapeSummary::default();
        let mut buffer: Vec<Listing> = Vec::new();
        let mut since_checkpoint = 0usize;
        let interval = self.settings.checkpoint_interval.max(1);

        for source in &self.sources {
            let source_id = source.source_id().to_string();
            for area_code in areas {
                let entry = state.area_mut(&source_id, area_code);
                if !entry.needs_work(self.settings.force_refresh) {
                    summary.areas_skipped += 1;
                    continue;
                }
                entry.status = AreaStatus::InProgress;
                entry.updated_at = Utc::now();

                let span = info_span!("scrape_area", source = %source_id, area = %area_code);
                let outcome = self
                    .scrape_area(source.as_ref(), area_code, &mut summary)
                    .instrument(span)
                    .await;

                let entry = state.area_mut(&source_id, area_code);
                entry.updated_at = Utc::now();
                match outcome {
                    Ok(listings) => {
                        entry.attempts += 1;
                        entry.status = AreaStatus::Completed;
                        entry.last_error = None;
                        entry.listing_count = listings.len();
                        summary.areas_completed += 1;
                        summary.listings_fetched += listings.len();
                        buffer.extend(listings);
                    }
                    Err(AreaFailure::Failed(reason)) => {
                        entry.attempts += 1;
                        entry.status = AreaStatus::Failed;
                        entry.last_error = Some(reason);
                        summary.areas_failed += 1;
                    }
                    Err(AreaFailure::Blocked(reason)) => {
                        entry.status = AreaStatus::Pending;
                        entry.last_error = Some(reason.clone());
                        warn!(source = %source_id, %reason, "source blocked; disabling it for this run");
                        summary.blocked_sources.push(source_id.clone());
                        break;
                    }
                }

                since_checkpoint += 1;
                if since_checkpoint >= interval {
                    self.commit(&mut state, &mut buffer, &mut summary).await?;
                    since_checkpoint = 0;
                }
            }
        }

        self.commit(&mut state, &mut buffer, &mut summary).await?;
        info!(
            completed = summary.areas_completed,
            failed = summary.areas_failed,
            skipped = summary.areas_skipped,
            listings = summary.listings_fetched,
            "scrape finished"
        );
        Ok(summary)
    }

    /// Segment first, then the state file that names it.
    async fn commit(
        &self,
        state: &mut ScrapeState,
        buffer: &mut Vec<Listing>,
        summary: &mut ScrapeSummary,
    ) -> Result<()> {
        if !buffer.is_empty() {
            let name = self.segments.write_segment(SEGMENT_PREFIX, buffer.as_slice()).await?;
            debug!(segment = %name, listings = buffer.len(), "segment written");
            state.segments.push(name);
            summary.segments_written += 1;
            buffer.clear();
        }
        write_json_atomic(&self.state_path, state).await
    }

    async fn scrape_area(
        &self,
        source: &dyn ListingSource,
        area_code: &str,
        summary: &mut ScrapeSummary,
    ) -> std::result::Result<Vec<Listing>, AreaFailure> {
        let mut listings = Vec::new();
        for page in 1..=source.max_pages().max(1) {
            let response = match source.fetch_page(self.fetcher.as_ref(), area_code, page).await {
                Ok(response) => response,
                Err(err) if err.is_blocked() => return Err(AreaFailure::Blocked(err.to_string())),
                Err(FetchError::HttpStatus { status: 404, .. }) if page > 1 => break,
                Err(err) => return Err(AreaFailure::Failed(format!("page {page}: {err}"))),
            };
            summary.pages_fetched += 1;
            let fetched_at = Utc::now();

            if let Some(store) = &self.raw_pages {
                if let Err(err) = store
                    .store_page(fetched_at, source.source_id(), area_code, "html", &response.body)
                    .await
                {
                    warn!(error = %err, "could not keep raw page");
                }
            }

            match source.parse_page(area_code, &response.text(), fetched_at) {
                Ok(found) if found.is_empty() => break,
                Ok(found) => {
                    debug!(page, count = found.len(), "parsed listing page");
                    listings.extend(found);
                }
                Err(err @ ParseError::AccessDenied { .. }) => {
                    return Err(AreaFailure::Blocked(err.to_string()));
                }
                Err(err) => {
                    warn!(page, error = %err, "listing page failed to parse");
                    return Err(AreaFailure::Failed(format!("page {page}: {err}")));
                }
            }
        }
        Ok(listings)
    }
}

/// Every listing in the committed segments, in commit order.
pub async fn load_committed_listings(
    state_path: &std::path::Path,
    segments: &SegmentStore,
) -> Result<Vec<Listing>> {
    let state = ScrapeState::load(state_path).await?;
    segments.read_segments(&state.segments).await
}
