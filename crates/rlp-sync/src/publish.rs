//! Validated, atomic publication of the master property dataset.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rlp_core::{AreaScore, Property, PropertyScores, ScoreKind, MAX_SCORE, MIN_SCORE};
use rlp_storage::{temp_sibling, write_atomic, ArtifactStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const MASTER_FILE: &str = "master_properties.parquet";
pub const AREA_SCORES_FILE: &str = "area_scores.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCHEMA_VERSION: u32 = 1;

pub const REQUIRED_COLUMNS: [&str; 31] = [
    "property_id",
    "identity_key",
    "source_id",
    "listing_url",
    "address",
    "normalized_address",
    "area_code",
    "district",
    "scraped_area_code",
    "rent",
    "bedrooms",
    "bathrooms",
    "square_feet",
    "latitude",
    "longitude",
    "geocode_status",
    "has_coordinates",
    "affordability_score",
    "safety_score",
    "accessibility_score",
    "neighborhood_score",
    "environment_score",
    "composite_score",
    "affordability_fallback",
    "safety_fallback",
    "accessibility_fallback",
    "neighborhood_fallback",
    "environment_fallback",
    "fallback_scores",
    "last_updated",
    "district_incidents",
];

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("dataset failed validation ({} problems): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub run_id: Uuid,
    pub properties: usize,
    pub areas: usize,
    pub manifest_path: PathBuf,
    pub snapshot_dir: PathBuf,
}

pub struct MasterDatasetWriter {
    published_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl MasterDatasetWriter {
    pub fn new(published_dir: impl Into<PathBuf>, snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            published_dir: published_dir.into(),
            snapshots_dir: snapshots_dir.into(),
        }
    }

    pub fn published_dir(&self) -> &Path {
        &self.published_dir
    }

    /// Nothing is written unless every property passes validation. The run is staged
    /// in full under `snapshots/`, and `published` flips to it with one rename.
    pub async fn publish(
        &self,
        run_id: Uuid,
        properties: &[Property],
        areas: &[AreaScore],
    ) -> Result<PublishSummary, PublishError> {
        let rows = validate(properties)?;
        let generated_at = Utc::now();
        let master = master_batch(&rows, generated_at)?;
        check_columns(&master.schema())?;
        let area_batch = area_scores_batch(areas)?;

        std::fs::create_dir_all(&self.snapshots_dir)
            .with_context(|| format!("creating {}", self.snapshots_dir.display()))?;
        let staging_dir = self.snapshots_dir.join(format!(".{run_id}.staging"));
        let snapshot_dir = self.snapshots_dir.join(run_id.to_string());

        let manifest = DatasetManifest {
            schema_version: SCHEMA_VERSION,
            run_id,
            generated_at,
            files: Vec::new(),
        };
        if let Err(err) = self
            .stage(&staging_dir, manifest, master, rows.len(), area_batch, areas.len())
            .await
        {
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Err(err.into());
        }
        if let Err(err) = std::fs::rename(&staging_dir, &snapshot_dir)
            .with_context(|| format!("moving staged run into {}", snapshot_dir.display()))
        {
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Err(err.into());
        }
        if let Err(err) = self.switch_published(&snapshot_dir) {
            let _ = std::fs::remove_dir_all(&snapshot_dir);
            return Err(err.into());
        }

        info!(
            %run_id,
            properties = rows.len(),
            areas = areas.len(),
            snapshot = %snapshot_dir.display(),
            "published master dataset"
        );
        Ok(PublishSummary {
            run_id,
            properties: rows.len(),
            areas: areas.len(),
            manifest_path: self.published_dir.join(MANIFEST_FILE),
            snapshot_dir,
        })
    }

    /// Both parquet files, then the manifest describing them.
    async fn stage(
        &self,
        staging_dir: &Path,
        mut manifest: DatasetManifest,
        master: RecordBatch,
        master_rows: usize,
        area_batch: RecordBatch,
        area_rows: usize,
    ) -> Result<()> {
        std::fs::create_dir_all(staging_dir)
            .with_context(|| format!("creating {}", staging_dir.display()))?;
        let master_path = staging_dir.join(MASTER_FILE);
        let areas_path = staging_dir.join(AREA_SCORES_FILE);
        write_parquet_synced(&master_path, master)?;
        write_parquet_synced(&areas_path, area_batch)?;

        manifest.files = vec![
            manifest_entry("master_properties", staging_dir, &master_path, master_rows)?,
            manifest_entry("area_scores", staging_dir, &areas_path, area_rows)?,
        ];
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing dataset manifest")?;
        write_atomic(&staging_dir.join(MANIFEST_FILE), &manifest_bytes).await
    }

    /// Points `published` at `snapshot_dir` by renaming a fresh symlink over it.
    fn switch_published(&self, snapshot_dir: &Path) -> Result<()> {
        if let Some(parent) = self.published_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let target = self.link_target(snapshot_dir)?;
        let link = temp_sibling(&self.published_dir);
        symlink_dir(&target, &link)
            .with_context(|| format!("linking {} -> {}", link.display(), target.display()))?;

        // A plain directory left by an older layout cannot be renamed over; move it aside.
        let legacy = match std::fs::symlink_metadata(&self.published_dir) {
            Ok(meta) if meta.is_dir() => {
                let aside = temp_sibling(&self.published_dir);
                if let Err(err) = std::fs::rename(&self.published_dir, &aside) {
                    let _ = std::fs::remove_file(&link);
                    return Err(err)
                        .with_context(|| format!("moving aside {}", self.published_dir.display()));
                }
                Some(aside)
            }
            _ => None,
        };

        if let Err(err) = std::fs::rename(&link, &self.published_dir) {
            let _ = std::fs::remove_file(&link);
            if let Some(aside) = &legacy {
                let _ = std::fs::rename(aside, &self.published_dir);
            }
            return Err(err).with_context(|| format!("switching {}", self.published_dir.display()));
        }
        if let Some(aside) = legacy {
            if let Err(err) = std::fs::remove_dir_all(&aside) {
                warn!(error = %err, path = %aside.display(), "could not remove old published directory");
            }
        }
        Ok(())
    }

    /// Relative when `published` and `snapshots` share a parent, so the data dir can move.
    fn link_target(&self, snapshot_dir: &Path) -> Result<PathBuf> {
        let same_parent = self.published_dir.parent() == self.snapshots_dir.parent();
        match (same_parent, self.snapshots_dir.file_name(), snapshot_dir.file_name()) {
            (true, Some(snapshots), Some(run)) => Ok(Path::new(snapshots).join(run)),
            _ => std::fs::canonicalize(snapshot_dir)
                .with_context(|| format!("resolving {}", snapshot_dir.display())),
        }
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

fn in_range(value: f64) -> bool {
    value.is_finite() && (MIN_SCORE..=MAX_SCORE).contains(&value)
}

/// Every problem is collected before failing.
pub fn validate(properties: &[Property]) -> Result<Vec<(&Property, &PropertyScores)>, PublishError> {
    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();
    let mut rows = Vec::with_capacity(properties.len());

    for property in properties {
        if !seen.insert(property.identity_key.as_str()) {
            problems.push(format!("duplicate identity key {}", property.identity_key));
        }
        let Some(scores) = &property.scores else {
            problems.push(format!("{} has no scores", property.identity_key));
            continue;
        };
        for kind in ScoreKind::ALL {
            let value = scores.get(kind).value;
            if !in_range(value) {
                problems.push(format!(
                    "{} {} score {value} outside [0,10]",
                    property.identity_key,
                    kind.as_str()
                ));
            }
        }
        if !in_range(scores.composite) {
            problems.push(format!(
                "{} composite score {} outside [0,10]",
                property.identity_key, scores.composite
            ));
        }
        rows.push((property, scores));
    }

    if problems.is_empty() {
        Ok(rows)
    } else {
        warn!(problems = problems.len(), "publish validation failed");
        Err(PublishError::Validation(problems))
    }
}

fn check_columns(schema: &SchemaRef) -> Result<(), PublishError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|name| schema.field_with_name(name).is_err())
        .map(|name| format!("missing required column {name}"))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PublishError::Validation(missing))
    }
}

pub fn master_schema() -> SchemaRef {
    let mut fields = vec![
        ArrowField::new("property_id", DataType::Utf8, false),
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("listing_url", DataType::Utf8, true),
        ArrowField::new("address", DataType::Utf8, false),
        ArrowField::new("normalized_address", DataType::Utf8, false),
        ArrowField::new("area_code", DataType::Utf8, true),
        ArrowField::new("district", DataType::Utf8, true),
        ArrowField::new("district_incidents", DataType::UInt64, true),
        ArrowField::new("scraped_area_code", DataType::Utf8, false),
        ArrowField::new("rent", DataType::Float64, false),
        ArrowField::new("bedrooms", DataType::UInt32, true),
        ArrowField::new("bathrooms", DataType::Float64, true),
        ArrowField::new("square_feet", DataType::UInt32, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("geocode_status", DataType::Utf8, false),
        ArrowField::new("has_coordinates", DataType::Boolean, false),
    ];
    for kind in ScoreKind::ALL {
        fields.push(ArrowField::new(format!("{}_score", kind.as_str()), DataType::Float64, false));
    }
    fields.push(ArrowField::new("composite_score", DataType::Float64, false));
    for kind in ScoreKind::ALL {
        fields.push(ArrowField::new(format!("{}_fallback", kind.as_str()), DataType::Boolean, false));
    }
    fields.push(ArrowField::new("fallback_scores", DataType::Utf8, false));
    fields.push(ArrowField::new("last_updated", DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

fn master_batch(
    rows: &[(&Property, &PropertyScores)],
    generated_at: DateTime<Utc>,
) -> Result<RecordBatch> {
    let utf8 = |f: fn(&Property) -> Option<&str>| {
        Arc::new(StringArray::from(rows.iter().map(|(p, _)| f(p)).collect::<Vec<_>>()))
    };
    let float = |f: fn(&Property) -> Option<f64>| {
        Arc::new(Float64Array::from(rows.iter().map(|(p, _)| f(p)).collect::<Vec<_>>()))
    };
    let uint = |f: fn(&Property) -> Option<u32>| {
        Arc::new(UInt32Array::from(rows.iter().map(|(p, _)| f(p)).collect::<Vec<_>>()))
    };

    let property_ids = StringArray::from(
        rows.iter()
            .map(|(p, _)| p.property_id.to_string())
            .collect::<Vec<_>>(),
    );
    let incidents = UInt64Array::from(rows.iter().map(|(p, _)| p.district_incidents).collect::<Vec<_>>());
    let geocode_status = StringArray::from(
        rows.iter()
            .map(|(p, _)| Some(p.geocode_status.as_str()))
            .collect::<Vec<_>>(),
    );
    let has_coordinates = BooleanArray::from(
        rows.iter()
            .map(|(p, _)| p.coordinates().is_some())
            .collect::<Vec<_>>(),
    );

    let mut columns: Vec<arrow_array::ArrayRef> = vec![
        Arc::new(property_ids),
        utf8(|p| Some(p.identity_key.as_str())),
        utf8(|p| Some(p.listing.source_id.as_str())),
        utf8(|p| p.listing.listing_url.as_deref()),
        utf8(|p| Some(p.listing.address.as_str())),
        utf8(|p| Some(p.normalized_address.as_str())),
        utf8(|p| p.area_code.as_deref()),
        utf8(|p| p.district.as_deref()),
        Arc::new(incidents),
        utf8(|p| Some(p.listing.area_code.as_str())),
        float(|p| Some(p.listing.rent)),
        uint(|p| p.listing.bedrooms),
        float(|p| p.listing.bathrooms),
        uint(|p| p.listing.square_feet),
        float(|p| p.latitude),
        float(|p| p.longitude),
        Arc::new(geocode_status),
        Arc::new(has_coordinates),
    ];
    for kind in ScoreKind::ALL {
        columns.push(Arc::new(Float64Array::from(
            rows.iter().map(|(_, s)| s.get(kind).value).collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(Float64Array::from(
        rows.iter().map(|(_, s)| s.composite).collect::<Vec<_>>(),
    )));
    for kind in ScoreKind::ALL {
        columns.push(Arc::new(BooleanArray::from(
            rows.iter().map(|(_, s)| s.get(kind).fallback).collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(StringArray::from(
        rows.iter()
            .map(|(_, s)| {
                s.fallback_kinds()
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>(),
    )));
    let stamp = generated_at.to_rfc3339();
    columns.push(Arc::new(StringArray::from(vec![stamp.as_str(); rows.len()])));

    RecordBatch::try_new(master_schema(), columns).context("building master_properties record batch")
}

fn area_scores_batch(areas: &[AreaScore]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("area_code", DataType::Utf8, false),
        ArrowField::new("property_count", DataType::UInt32, false),
        ArrowField::new("affordability_score", DataType::Float64, false),
        ArrowField::new("safety_score", DataType::Float64, false),
        ArrowField::new("accessibility_score", DataType::Float64, false),
        ArrowField::new("neighborhood_score", DataType::Float64, false),
        ArrowField::new("environment_score", DataType::Float64, false),
        ArrowField::new("composite_score", DataType::Float64, false),
    ]));
    let mean = |f: fn(&AreaScore) -> f64| Arc::new(Float64Array::from(areas.iter().map(f).collect::<Vec<_>>()));

    let area_codes = StringArray::from(
        areas
            .iter()
            .map(|a| Some(a.area_code.as_str()))
            .collect::<Vec<_>>(),
    );
    let counts = UInt32Array::from(
        areas
            .iter()
            .map(|a| u32::try_from(a.property_count).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(area_codes),
            Arc::new(counts),
            mean(|a| a.affordability),
            mean(|a| a.safety),
            mean(|a| a.accessibility),
            mean(|a| a.neighborhood),
            mean(|a| a.environment),
            mean(|a| a.composite),
        ],
    )
    .context("building area_scores record batch")
}

/// Only used inside a private staging directory, so no temp-and-rename here.
fn write_parquet_synced(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("syncing {}", path.display()))
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path, rows: usize) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: ArtifactStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
