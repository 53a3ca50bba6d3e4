use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use rlp_adapters::{build_source, source_for_id, ParseError, SourceRegistry};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
struct SnapshotListing {
    address: String,
    rent: f64,
    bedrooms: Option<u32>,
    bathrooms: Option<f64>,
    square_feet: Option<u32>,
    listing_url: Option<String>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(source_id: &str, name: &str) -> String {
    let path = workspace_root()
        .join("fixtures")
        .join(source_id)
        .join("sample")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn snapshot(source_id: &str) -> Vec<SnapshotListing> {
    serde_json::from_str(&fixture(source_id, "snapshot.json")).expect("parse snapshot")
}

fn parse_to_snapshot(source_id: &str, area: &str) -> Vec<SnapshotListing> {
    let source = source_for_id(source_id).expect("source");
    let scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let listings = source
        .parse_page(area, &fixture(source_id, "page.html"), scraped_at)
        .expect("fixture page parses");
    for listing in &listings {
        assert_eq!(listing.source_id, source_id);
        assert_eq!(listing.area_code, area);
        assert_eq!(listing.scraped_at, scraped_at);
    }
    listings
        .into_iter()
        .map(|l| SnapshotListing {
            address: l.address,
            rent: l.rent,
            bedrooms: l.bedrooms,
            bathrooms: l.bathrooms,
            square_feet: l.square_feet,
            listing_url: l.listing_url,
        })
        .collect()
}

#[test]
fn redfin_fixture_matches_snapshot() {
    assert_eq!(parse_to_snapshot("redfin", "78704"), snapshot("redfin"));
}

#[test]
fn zillow_fixture_matches_snapshot() {
    assert_eq!(parse_to_snapshot("zillow", "78702"), snapshot("zillow"));
}

#[test]
fn redfin_empty_results_page_ends_pagination() {
    let source = source_for_id("redfin").expect("source");
    let listings = source
        .parse_page("78704", &fixture("redfin", "empty.html"), Utc::now())
        .expect("empty page is not an error");
    assert!(listings.is_empty());
}

#[test]
fn zillow_bot_wall_is_a_parse_error() {
    let source = source_for_id("zillow").expect("source");
    let err = source
        .parse_page("78702", &fixture("zillow", "denied.html"), Utc::now())
        .expect_err("denied page");
    assert!(matches!(err, ParseError::AccessDenied { .. }));
}

#[test]
fn workspace_registry_builds_every_enabled_source() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).expect("registry");
    let built: Vec<_> = registry
        .enabled()
        .map(|cfg| build_source(cfg).expect("known source"))
        .collect();
    assert!(!built.is_empty());
    for source in &built {
        assert!(source.page_url("78701", 1).contains("78701"));
    }
}
