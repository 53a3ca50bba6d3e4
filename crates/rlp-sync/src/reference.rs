//! Read-only reference tables: rent benchmarks, crime counts, boundaries, walkability.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use geo::{Centroid, Contains, LineString, Point, Polygon};
use rlp_core::{CrimeRecord, RentBenchmark, UnitSize, WalkabilityRecord};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::info;

pub const RENT_BENCHMARKS_FILE: &str = "rent_benchmarks.csv";
pub const CRIME_FILE: &str = "crime.csv";
pub const BOUNDARIES_FILE: &str = "boundaries.json";
pub const WALKABILITY_FILE: &str = "walkability.csv";

#[derive(Debug, Deserialize)]
struct RentBenchmarkRow {
    area_code: String,
    unit_size: String,
    benchmark_rent: f64,
}

#[derive(Debug, Deserialize)]
struct CrimeRow {
    district: String,
    incident_count: u64,
    #[serde(default)]
    category: String,
    #[serde(default)]
    time_window: String,
}

#[derive(Debug, Deserialize)]
struct BoundaryFile {
    #[serde(default)]
    areas: Vec<AreaPolygon>,
    #[serde(default)]
    districts: Vec<DistrictPolygon>,
}

#[derive(Debug, Deserialize)]
struct AreaPolygon {
    area_code: String,
    polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct DistrictPolygon {
    district: String,
    polygon: Vec<[f64; 2]>,
}

fn ring_to_polygon(ring: &[[f64; 2]]) -> Polygon<f64> {
    let coords: Vec<(f64, f64)> = ring.iter().map(|[lon, lat]| (*lon, *lat)).collect();
    Polygon::new(LineString::from(coords), vec![])
}

/// Area and district polygons, coordinates as `[lon, lat]`.
#[derive(Debug, Clone, Default)]
pub struct Boundaries {
    areas: Vec<(String, Polygon<f64>)>,
    districts: Vec<(String, Polygon<f64>)>,
}

impl Boundaries {
    pub fn from_json(text: &str) -> Result<Self> {
        let file: BoundaryFile = serde_json::from_str(text).context("parsing boundaries json")?;
        Ok(Self {
            areas: file
                .areas
                .iter()
                .map(|a| (a.area_code.clone(), ring_to_polygon(&a.polygon)))
                .collect(),
            districts: file
                .districts
                .iter()
                .map(|d| (d.district.clone(), ring_to_polygon(&d.polygon)))
                .collect(),
        })
    }

    pub fn has_area(&self, area_code: &str) -> bool {
        self.areas.iter().any(|(code, _)| code == area_code)
    }

    /// First area polygon containing the point.
    pub fn area_containing(&self, latitude: f64, longitude: f64) -> Option<&str> {
        let point = Point::new(longitude, latitude);
        self.areas
            .iter()
            .find(|(_, polygon)| polygon.contains(&point))
            .map(|(code, _)| code.as_str())
    }

    pub fn district_containing(&self, latitude: f64, longitude: f64) -> Option<&str> {
        let point = Point::new(longitude, latitude);
        self.districts
            .iter()
            .find(|(_, polygon)| polygon.contains(&point))
            .map(|(district, _)| district.as_str())
    }

    /// District containing the area's centroid.
    pub fn district_for_area(&self, area_code: &str) -> Option<&str> {
        let (_, polygon) = self.areas.iter().find(|(code, _)| code == area_code)?;
        let centroid = polygon.centroid()?;
        self.district_containing(centroid.y(), centroid.x())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub rent_benchmarks: Vec<RentBenchmark>,
    pub crime: Vec<CrimeRecord>,
    pub boundaries: Boundaries,
    pub walkability: Vec<WalkabilityRecord>,
}

impl ReferenceData {
    pub fn load(dir: &Path) -> Result<Self> {
        let rent_benchmarks = load_rent_benchmarks(&dir.join(RENT_BENCHMARKS_FILE))?;
        let crime = load_crime(&dir.join(CRIME_FILE))?;

        let boundaries_path = dir.join(BOUNDARIES_FILE);
        let boundaries_text = std::fs::read_to_string(&boundaries_path)
            .with_context(|| format!("reading {}", boundaries_path.display()))?;
        let boundaries = Boundaries::from_json(&boundaries_text)
            .with_context(|| format!("loading {}", boundaries_path.display()))?;

        let walkability_path = dir.join(WALKABILITY_FILE);
        let walkability = if walkability_path.exists() {
            read_csv::<WalkabilityRecord>(&walkability_path)?
        } else {
            Vec::new()
        };

        info!(
            benchmarks = rent_benchmarks.len(),
            crime_rows = crime.len(),
            areas = boundaries.areas.len(),
            districts = boundaries.districts.len(),
            walkability = walkability.len(),
            "loaded reference data"
        );

        Ok(Self {
            rent_benchmarks,
            crime,
            boundaries,
            walkability,
        })
    }

    pub fn is_known_area(&self, area_code: &str) -> bool {
        self.boundaries.has_area(area_code)
            || self.rent_benchmarks.iter().any(|b| b.area_code == area_code)
    }

    pub fn benchmarks_by_area(&self) -> BTreeMap<String, BTreeMap<UnitSize, f64>> {
        let mut out: BTreeMap<String, BTreeMap<UnitSize, f64>> = BTreeMap::new();
        for row in &self.rent_benchmarks {
            out.entry(row.area_code.clone())
                .or_default()
                .insert(row.unit_size, row.benchmark_rent);
        }
        out
    }

    pub fn walkability_by_area(&self) -> BTreeMap<String, WalkabilityRecord> {
        self.walkability
            .iter()
            .map(|w| (w.area_code.clone(), w.clone()))
            .collect()
    }

    /// Incidents per district, summed over categories. `None` sums every window.
    pub fn district_totals(&self, time_window: Option<&str>) -> BTreeMap<String, u64> {
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for row in &self.crime {
            if time_window.is_some_and(|w| w != row.time_window) {
                continue;
            }
            *totals.entry(row.district.clone()).or_default() += row.incident_count;
        }
        totals
    }
}

fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize::<T>()
        .enumerate()
        .map(|(idx, row)| row.with_context(|| format!("{} row {}", path.display(), idx + 2)))
        .collect()
}

pub fn load_rent_benchmarks(path: &Path) -> Result<Vec<RentBenchmark>> {
    read_csv::<RentBenchmarkRow>(path)?
        .into_iter()
        .map(|row| {
            let unit_size = UnitSize::parse(&row.unit_size).ok_or_else(|| {
                anyhow!(
                    "{}: unknown unit size `{}` for area {}",
                    path.display(),
                    row.unit_size,
                    row.area_code
                )
            })?;
            Ok(RentBenchmark {
                area_code: row.area_code,
                unit_size,
                benchmark_rent: row.benchmark_rent,
            })
        })
        .collect()
}

pub fn load_crime(path: &Path) -> Result<Vec<CrimeRecord>> {
    Ok(read_csv::<CrimeRow>(path)?
        .into_iter()
        .map(|row| CrimeRecord {
            district: row.district,
            incident_count: row.incident_count,
            category: row.category,
            time_window: row.time_window,
        })
        .collect())
}

/// Distinct areas of the rent-benchmark table, used as default scrape targets.
pub fn benchmark_area_codes(benchmarks: &[RentBenchmark]) -> Vec<String> {
    benchmarks
        .iter()
        .map(|b| b.area_code.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
