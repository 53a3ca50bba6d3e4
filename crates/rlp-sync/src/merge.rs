//! Joins listings, geocodes and reference tables into one `Property` per listing.

use std::collections::BTreeMap;

use rlp_core::{normalize_address, GeocodeStatus, Listing, Property, UnitSize, WalkabilityRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geocode::GeocodeCache;
use crate::reference::ReferenceData;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub input_listings: usize,
    pub duplicates_collapsed: usize,
    pub properties: usize,
    pub without_coordinates: usize,
    pub outside_boundaries: usize,
}

pub struct SourceMerger<'a> {
    reference: &'a ReferenceData,
    district_totals: BTreeMap<String, u64>,
    benchmarks: BTreeMap<String, BTreeMap<UnitSize, f64>>,
    walkability: BTreeMap<String, WalkabilityRecord>,
}

impl<'a> SourceMerger<'a> {
    pub fn new(reference: &'a ReferenceData, crime_time_window: Option<&str>) -> Self {
        Self {
            reference,
            district_totals: reference.district_totals(crime_time_window),
            benchmarks: reference.benchmarks_by_area(),
            walkability: reference.walkability_by_area(),
        }
    }

    pub fn district_totals(&self) -> &BTreeMap<String, u64> {
        &self.district_totals
    }

    /// Latest scrape wins per identity key; equal timestamps keep the first seen.
    pub fn dedup(listings: Vec<Listing>) -> (Vec<Listing>, usize) {
        let input = listings.len();
        let mut kept: BTreeMap<String, Listing> = BTreeMap::new();
        for listing in listings {
            let key = listing.identity_key();
            match kept.get(&key) {
                Some(existing) if existing.scraped_at >= listing.scraped_at => {}
                _ => {
                    kept.insert(key, listing);
                }
            }
        }
        let collapsed = input - kept.len();
        (kept.into_values().collect(), collapsed)
    }

    /// Output is ordered by identity key.
    pub fn merge(&self, listings: Vec<Listing>, cache: &GeocodeCache) -> (Vec<Property>, MergeSummary) {
        let mut summary = MergeSummary {
            input_listings: listings.len(),
            ..MergeSummary::default()
        };
        let (unique, collapsed) = Self::dedup(listings);
        summary.duplicates_collapsed = collapsed;

        let properties: Vec<Property> = unique
            .into_iter()
            .map(|listing| self.build_property(listing, cache, &mut summary))
            .collect();
        summary.properties = properties.len();

        info!(
            input = summary.input_listings,
            duplicates = summary.duplicates_collapsed,
            properties = summary.properties,
            without_coordinates = summary.without_coordinates,
            outside_boundaries = summary.outside_boundaries,
            "merged listings"
        );
        (properties, summary)
    }

    fn build_property(
        &self,
        listing: Listing,
        cache: &GeocodeCache,
        summary: &mut MergeSummary,
    ) -> Property {
        let normalized_address = normalize_address(&listing.address);
        let entry = cache.get(&normalized_address);
        let geocode_status = entry.map(|e| e.status).unwrap_or(GeocodeStatus::Pending);
        let coordinates = entry.and_then(|e| e.coordinates());
        let boundaries = &self.reference.boundaries;

        let (area_code, district) = match coordinates {
            Some((lat, lon)) => {
                let area = boundaries.area_containing(lat, lon).map(str::to_string);
                if area.is_none() {
                    summary.outside_boundaries += 1;
                }
                // District polygons are checked on their own: a point outside every area
                // still carries the district (and safety input) it falls in.
                let district = boundaries
                    .district_containing(lat, lon)
                    .or_else(|| area.as_deref().and_then(|a| boundaries.district_for_area(a)))
                    .map(str::to_string);
                (area, district)
            }
            None => {
                summary.without_coordinates += 1;
                let area = self
                    .reference
                    .is_known_area(&listing.area_code)
                    .then(|| listing.area_code.clone());
                let district = area
                    .as_deref()
                    .and_then(|a| boundaries.district_for_area(a))
                    .map(str::to_string);
                (area, district)
            }
        };

        let district_incidents = district
            .as_ref()
            .and_then(|d| self.district_totals.get(d).copied());
        let rent_benchmarks = area_code
            .as_ref()
            .and_then(|a| self.benchmarks.get(a).cloned())
            .unwrap_or_default();
        let walkability = area_code.as_ref().and_then(|a| self.walkability.get(a).cloned());

        debug!(
            key = %listing.identity_key(),
            area = area_code.as_deref().unwrap_or("-"),
            district = district.as_deref().unwrap_or("-"),
            "property joined"
        );

        Property {
            property_id: listing.property_id(),
            identity_key: listing.identity_key(),
            normalized_address,
            latitude: coordinates.map(|(lat, _)| lat),
            longitude: coordinates.map(|(_, lon)| lon),
            geocode_status,
            area_code,
            district,
            district_incidents,
            rent_benchmarks,
            walkability,
            scores: None,
            listing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::tests::write_reference_dir;
    use crate::reference::Boundaries;
    use chrono::{Duration, TimeZone, Utc};
    use rlp_core::GeocodeEntry;
    use tempfile::tempdir;

    fn reference() -> ReferenceData {
        let dir = tempdir().expect("tempdir");
        write_reference_dir(dir.path());
        ReferenceData::load(dir.path()).expect("reference")
    }

    fn listing(address: &str, area: &str, url: Option<&str>, minutes: i64) -> Listing {
        Listing {
            source_id: "redfin".to_string(),
            area_code: area.to_string(),
            address: address.to_string(),
            rent: 1500.0,
            bedrooms: Some(1),
            bathrooms: Some(1.0),
            square_feet: Some(700),
            listing_url: url.map(str::to_string),
            scraped_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes),
        }
    }

    fn resolved(address: &str, lat: f64, lon: f64) -> GeocodeEntry {
        let mut entry = GeocodeEntry::pending(normalize_address(address), address);
        entry.status = GeocodeStatus::Resolved;
        entry.latitude = Some(lat);
        entry.longitude = Some(lon);
        entry.attempts = 1;
        entry
    }

    #[test]
    fn duplicates_keep_latest_scrape_and_first_on_ties() {
        let mut older = listing("1 Main St", "78701", Some("https://r.test/1"), 0);
        older.rent = 1400.0;
        let newer = listing("1 Main St", "78701", Some("https://r.test/1"), 30);
        let mut tie_a = listing("2 Oak Ave", "78702", Some("https://r.test/2"), 5);
        tie_a.rent = 1100.0;
        let mut tie_b = listing("2 Oak Ave", "78702", Some("https://r.test/2"), 5);
        tie_b.rent = 1200.0;

        let (kept, collapsed) = SourceMerger::dedup(vec![older, tie_a, newer.clone(), tie_b]);
        assert_eq!(collapsed, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], newer);
        assert_eq!(kept[1].rent, 1100.0);
    }

    #[test]
    fn every_distinct_listing_becomes_a_property() {
        let reference = reference();
        let merger = SourceMerger::new(&reference, Some("2025"));
        let mut cache = GeocodeCache::default();
        cache.insert(resolved("10 Congress Ave", 30.27, -97.75));
        cache.insert(resolved("20 Far Away Rd", 30.60, -97.75));

        let listings = vec![
            listing("10 Congress Ave", "78701", Some("https://r.test/a"), 0),
            listing("10 Congress Ave", "78701", Some("https://r.test/a"), 10),
            listing("20 Far Away Rd", "78701", Some("https://r.test/b"), 0),
            listing("30 Unknown Ln", "78702", None, 0),
            listing("40 Nowhere Ct", "99999", None, 0),
        ];
        let (properties, summary) = merger.merge(listings, &cache);

        assert_eq!(summary.input_listings, 5);
        assert_eq!(summary.duplicates_collapsed, 1);
        assert_eq!(properties.len(), 4);
        assert_eq!(summary.properties, 4);
        assert_eq!(summary.without_coordinates, 2);
        assert_eq!(summary.outside_boundaries, 1);

        let keys: Vec<&str> = properties.iter().map(|p| p.identity_key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let by_address = |addr: &str| {
            properties
                .iter()
                .find(|p| p.listing.address == addr)
                .expect("property present")
        };

        let inside = by_address("10 Congress Ave");
        assert_eq!(inside.area_code.as_deref(), Some("78701"));
        assert_eq!(inside.district.as_deref(), Some("9"));
        assert_eq!(inside.district_incidents, Some(10));
        assert_eq!(inside.rent_benchmarks[&UnitSize::OneBedroom], 1400.0);
        assert_eq!(inside.geocode_status, GeocodeStatus::Resolved);

        let outside = by_address("20 Far Away Rd");
        assert!(outside.coordinates().is_some());
        assert_eq!(outside.area_code, None);
        assert_eq!(outside.district, None);
        assert!(outside.rent_benchmarks.is_empty());

        let fallback_area = by_address("30 Unknown Ln");
        assert_eq!(fallback_area.coordinates(), None);
        assert_eq!(fallback_area.geocode_status, GeocodeStatus::Pending);
        assert_eq!(fallback_area.area_code.as_deref(), Some("78702"));
        assert_eq!(fallback_area.district.as_deref(), Some("3"));
        assert_eq!(fallback_area.district_incidents, Some(100));

        let unknown = by_address("40 Nowhere Ct");
        assert_eq!(unknown.area_code, None);
        assert_eq!(unknown.district, None);
    }

    #[test]
    fn unresolved_entries_keep_null_coordinates() {
        let reference = reference();
        let merger = SourceMerger::new(&reference, None);
        let mut cache = GeocodeCache::default();
        let mut entry = GeocodeEntry::pending(normalize_address("5 Lost Pl"), "5 Lost Pl");
        entry.status = GeocodeStatus::Unresolved;
        entry.attempts = 3;
        cache.insert(entry);

        let (properties, _) = merger.merge(vec![listing("5 Lost Pl", "78701", None, 0)], &cache);
        assert_eq!(properties[0].geocode_status, GeocodeStatus::Unresolved);
        assert_eq!(properties[0].coordinates(), None);
        assert_eq!(properties[0].district_incidents, Some(10));
        assert_eq!(merger.district_totals()["3"], 107);
    }

    #[test]
    fn point_outside_areas_keeps_its_enclosing_district() {
        let mut reference = reference();
        reference.boundaries = Boundaries::from_json(
            r#"{
              "areas": [
                {"area_code": "78701", "polygon": [[-97.76, 30.26], [-97.73, 30.26], [-97.73, 30.29], [-97.76, 30.29], [-97.76, 30.26]]}
              ],
              "districts": [
                {"district": "9", "polygon": [[-97.76, 30.26], [-97.73, 30.26], [-97.73, 30.40], [-97.76, 30.40], [-97.76, 30.26]]}
              ]
            }"#,
        )
        .expect("boundaries");
        let merger = SourceMerger::new(&reference, Some("2025"));
        let mut cache = GeocodeCache::default();
        cache.insert(resolved("77 North Loop", 30.35, -97.75));

        let (properties, summary) =
            merger.merge(vec![listing("77 North Loop", "78701", None, 0)], &cache);
        assert_eq!(summary.outside_boundaries, 1);
        let p = &properties[0];
        assert_eq!(p.area_code, None);
        assert!(p.rent_benchmarks.is_empty());
        assert_eq!(p.district.as_deref(), Some("9"));
        assert_eq!(p.district_incidents, Some(10));
    }
}
