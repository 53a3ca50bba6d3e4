//! Core domain model for the rental livability pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rlp-core";

/// Neutral value used when a sub-score cannot be computed.
pub const NEUTRAL_SCORE: f64 = 5.0;
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One scraped rental listing. Immutable once written to the raw store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    /// Area the scraper was walking when it found the listing.
    pub area_code: String,
    pub address: String,
    pub rent: f64,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub square_feet: Option<u32>,
    pub listing_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl Listing {
    /// `(source, url)` when a URL exists, `(source, normalized address, rent)` otherwise.
    pub fn identity_key(&self) -> String {
        match self.listing_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => format!("{}|url|{}", self.source_id, url),
            _ => format!(
                "{}|addr|{}|{:.2}",
                self.source_id,
                normalize_address(&self.address),
                self.rent
            ),
        }
    }

    pub fn property_id(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.identity_key().as_bytes())
    }

    pub fn unit_size(&self) -> Option<UnitSize> {
        self.bedrooms.map(UnitSize::from_bedrooms)
    }
}

/// Fair-market-rent unit-size category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitSize {
    #[serde(rename = "studio")]
    Studio,
    #[serde(rename = "1br")]
    OneBedroom,
    #[serde(rename = "2br")]
    TwoBedroom,
    #[serde(rename = "3br")]
    ThreeBedroom,
    #[serde(rename = "4br")]
    FourBedroom,
}

impl UnitSize {
    pub const ALL: [UnitSize; 5] = [
        UnitSize::Studio,
        UnitSize::OneBedroom,
        UnitSize::TwoBedroom,
        UnitSize::ThreeBedroom,
        UnitSize::FourBedroom,
    ];

    pub fn from_bedrooms(bedrooms: u32) -> Self {
        match bedrooms {
            0 => UnitSize::Studio,
            1 => UnitSize::OneBedroom,
            2 => UnitSize::TwoBedroom,
            3 => UnitSize::ThreeBedroom,
            _ => UnitSize::FourBedroom,
        }
    }

    /// Accepts `studio`, `0br`..`4br`, bare digits and the `FMR_n` column names.
    pub fn parse(input: &str) -> Option<Self> {
        let lower = input.trim().to_ascii_lowercase();
        let digits = lower
            .trim_start_matches("fmr_")
            .trim_end_matches("br")
            .trim_end_matches("bedroom")
            .trim_end_matches("bedrooms")
            .trim();
        match (lower.as_str(), digits) {
            ("studio", _) | ("efficiency", _) => Some(UnitSize::Studio),
            (_, "0") => Some(UnitSize::Studio),
            (_, "1") => Some(UnitSize::OneBedroom),
            (_, "2") => Some(UnitSize::TwoBedroom),
            (_, "3") => Some(UnitSize::ThreeBedroom),
            (_, "4") => Some(UnitSize::FourBedroom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitSize::Studio => "studio",
            UnitSize::OneBedroom => "1br",
            UnitSize::TwoBedroom => "2br",
            UnitSize::ThreeBedroom => "3br",
            UnitSize::FourBedroom => "4br",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeStatus {
    Pending,
    /// Claimed by a worker. Only ever observed on disk after an interrupted run.
    InProgress,
    Resolved,
    Unresolved,
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeStatus::Pending => "pending",
            GeocodeStatus::InProgress => "in_progress",
            GeocodeStatus::Resolved => "resolved",
            GeocodeStatus::Unresolved => "unresolved",
        }
    }
}

/// Cache row for one normalized address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub key: String,
    pub query: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: GeocodeStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl GeocodeEntry {
    pub fn pending(key: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            query: query.into(),
            latitude: None,
            longitude: None,
            status: GeocodeStatus::Pending,
            last_attempt_at: None,
            attempts: 0,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.status, self.latitude, self.longitude) {
            (GeocodeStatus::Resolved, Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, GeocodeStatus::Resolved | GeocodeStatus::Unresolved)
    }
}

/// Aggregated incident row from the municipal crime table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrimeRecord {
    pub district: String,
    pub incident_count: u64,
    pub category: String,
    pub time_window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentBenchmark {
    pub area_code: String,
    pub unit_size: UnitSize,
    pub benchmark_rent: f64,
}

/// Optional per-area walkability metrics, each on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkabilityRecord {
    pub area_code: String,
    pub walk_score: f64,
    pub transit_score: f64,
    pub bike_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Affordability,
    Safety,
    Accessibility,
    Neighborhood,
    Environment,
}

impl ScoreKind {
    pub const ALL: [ScoreKind; 5] = [
        ScoreKind::Affordability,
        ScoreKind::Safety,
        ScoreKind::Accessibility,
        ScoreKind::Neighborhood,
        ScoreKind::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreKind::Affordability => "affordability",
            ScoreKind::Safety => "safety",
            ScoreKind::Accessibility => "accessibility",
            ScoreKind::Neighborhood => "neighborhood",
            ScoreKind::Environment => "environment",
        }
    }
}

impl fmt::Display for ScoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single 0-10 sub-score plus the input it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
    pub value: f64,
    pub fallback: bool,
    pub input: String,
    pub explanation: String,
}

impl SubScore {
    pub fn computed(value: f64, input: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            value: clamp_score(value),
            fallback: false,
            input: input.into(),
            explanation: explanation.into(),
        }
    }

    pub fn fallback(explanation: impl Into<String>) -> Self {
        Self {
            value: NEUTRAL_SCORE,
            fallback: true,
            input: "neutral_default".to_string(),
            explanation: explanation.into(),
        }
    }
}

pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return NEUTRAL_SCORE;
    }
    value.clamp(MIN_SCORE, MAX_SCORE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyScores {
    pub affordability: SubScore,
    pub safety: SubScore,
    pub accessibility: SubScore,
    pub neighborhood: SubScore,
    pub environment: SubScore,
    pub composite: f64,
}

impl PropertyScores {
    pub fn get(&self, kind: ScoreKind) -> &SubScore {
        match kind {
            ScoreKind::Affordability => &self.affordability,
            ScoreKind::Safety => &self.safety,
            ScoreKind::Accessibility => &self.accessibility,
            ScoreKind::Neighborhood => &self.neighborhood,
            ScoreKind::Environment => &self.environment,
        }
    }

    pub fn fallback_kinds(&self) -> Vec<ScoreKind> {
        ScoreKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).fallback)
            .collect()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("weight for {kind} must be finite and non-negative, got {value}")]
    InvalidWeight { kind: ScoreKind, value: f64 },
    #[error("weights must sum to 1.0 (+/- {tolerance}), got {total}")]
    BadTotal { total: f64, tolerance: f64 },
}

/// Composite weights. Defaults are 0.30/0.25/0.20/0.15/0.10.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub affordability: f64,
    pub safety: f64,
    pub accessibility: f64,
    pub neighborhood: f64,
    pub environment: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            affordability: 0.30,
            safety: 0.25,
            accessibility: 0.20,
            neighborhood: 0.15,
            environment: 0.10,
        }
    }
}

impl ScoreWeights {
    pub fn weight(&self, kind: ScoreKind) -> f64 {
        match kind {
            ScoreKind::Affordability => self.affordability,
            ScoreKind::Safety => self.safety,
            ScoreKind::Accessibility => self.accessibility,
            ScoreKind::Neighborhood => self.neighborhood,
            ScoreKind::Environment => self.environment,
        }
    }

    pub fn total(&self) -> f64 {
        ScoreKind::ALL.iter().map(|k| self.weight(*k)).sum()
    }

    pub fn validate(&self) -> Result<(), WeightsError> {
        for kind in ScoreKind::ALL {
            let value = self.weight(kind);
            if !value.is_finite() || value < 0.0 {
                return Err(WeightsError::InvalidWeight { kind, value });
            }
        }
        let total = self.total();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(WeightsError::BadTotal {
                total,
                tolerance: WEIGHT_TOLERANCE,
            });
        }
        Ok(())
    }

    /// `10 * sum(w_i * s_i) / 10`, i.e. the convex combination on the 0-10 scale.
    pub fn composite(&self, sub_scores: [&SubScore; 5]) -> f64 {
        let weighted: f64 = ScoreKind::ALL
            .iter()
            .zip(sub_scores)
            .map(|(kind, score)| self.weight(*kind) * score.value)
            .sum();
        clamp_score(MAX_SCORE * weighted / MAX_SCORE)
    }
}

/// Merged unit of work: one listing plus everything joined onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub property_id: Uuid,
    pub identity_key: String,
    pub listing: Listing,
    pub normalized_address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocode_status: GeocodeStatus,
    pub area_code: Option<String>,
    pub district: Option<String>,
    pub district_incidents: Option<u64>,
    pub rent_benchmarks: BTreeMap<UnitSize, f64>,
    pub walkability: Option<WalkabilityRecord>,
    pub scores: Option<PropertyScores>,
}

impl Property {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// Per-area roll-up of property scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaScore {
    pub area_code: String,
    pub property_count: usize,
    pub affordability: f64,
    pub safety: f64,
    pub accessibility: f64,
    pub neighborhood: f64,
    pub environment: f64,
    pub composite: f64,
}

const UNIT_DESIGNATORS: [&str; 6] = ["unit", "apt", "apartment", "suite", "ste", "#"];

const TOKEN_EXPANSIONS: [(&str, &str); 28] = [
    ("st", "street"),
    ("str", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("blvd", "boulevard"),
    ("dr", "drive"),
    ("rd", "road"),
    ("ln", "lane"),
    ("ct", "court"),
    ("cir", "circle"),
    ("pkwy", "parkway"),
    ("hwy", "highway"),
    ("pl", "place"),
    ("trl", "trail"),
    ("ter", "terrace"),
    ("cv", "cove"),
    ("sq", "square"),
    ("xing", "crossing"),
    ("fwy", "freeway"),
    ("expy", "expressway"),
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("ne", "northeast"),
    ("nw", "northwest"),
    ("se", "southeast"),
    ("sw", "southwest"),
];

/// Address as sent to a geocoder: building-name prefix and unit designators removed.
pub fn clean_address_for_query(raw: &str) -> String {
    let without_building = match raw.split_once('|') {
        Some((_, rest)) if !rest.trim().is_empty() => rest,
        _ => raw,
    };

    let mut kept: Vec<String> = Vec::new();
    let mut skip_next = false;
    for word in without_building.split_whitespace() {
        let bare = word
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '#')
            .to_ascii_lowercase();
        let carries_comma = word.ends_with(',');

        let drop_word = if skip_next {
            skip_next = false;
            true
        } else if UNIT_DESIGNATORS.contains(&bare.as_str()) {
            skip_next = true;
            true
        } else {
            bare.starts_with('#')
        };

        if drop_word {
            if carries_comma {
                if let Some(last) = kept.last_mut() {
                    if !last.ends_with(',') {
                        last.push(',');
                    }
                }
            }
            continue;
        }
        kept.push(word.to_string());
    }
    kept.join(" ").trim_end_matches(',').trim().to_string()
}

/// Canonical cache key: cleaned, lowercased, punctuation-free, suffixes expanded.
pub fn normalize_address(raw: &str) -> String {
    clean_address_for_query(raw)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(|token| {
            TOKEN_EXPANSIONS
                .iter()
                .find(|(short, _)| *short == token)
                .map(|(_, long)| *long)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
