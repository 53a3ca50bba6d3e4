//! Livability scoring: five bounded sub-scores and their weighted composite.

use std::collections::BTreeMap;

use geo::{HaversineDistance, Point};
use rlp_core::{
    AreaScore, Property, PropertyScores, ScoreWeights, SubScore, WeightsError, MAX_SCORE,
    NEUTRAL_SCORE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::ScoringSettings;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const DOWNTOWN_AUSTIN: GeoPoint = GeoPoint {
        latitude: 30.2672,
        longitude: -97.7431,
    };

    pub fn distance_km(&self, latitude: f64, longitude: f64) -> f64 {
        let from = Point::new(self.longitude, self.latitude);
        let to = Point::new(longitude, latitude);
        from.haversine_distance(&to) / 1_000.0
    }
}

/// Incident-count range that maps onto the 10..0 safety scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyBounds {
    pub min: f64,
    pub max: f64,
}

impl SafetyBounds {
    /// Min and max over the run's district totals; `None` for an empty table.
    pub fn from_totals<'a>(totals: impl IntoIterator<Item = &'a u64>) -> Option<Self> {
        let mut bounds: Option<Self> = None;
        for total in totals {
            let value = *total as f64;
            bounds = Some(match bounds {
                None => SafetyBounds {
                    min: value,
                    max: value,
                },
                Some(b) => SafetyBounds {
                    min: b.min.min(value),
                    max: b.max.max(value),
                },
            });
        }
        bounds
    }

    pub fn score(&self, incidents: f64) -> f64 {
        let spread = self.max - self.min;
        if spread.abs() < f64::EPSILON {
            return NEUTRAL_SCORE;
        }
        MAX_SCORE * (1.0 - (incidents - self.min) / spread)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScoringConfigError {
    #[error(transparent)]
    Weights(#[from] WeightsError),
    #[error("safety bounds must be finite with min <= max, got min {min} max {max}")]
    InvalidSafetyBounds { min: f64, max: f64 },
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    weights: ScoreWeights,
    budget: f64,
    safety_bounds: Option<SafetyBounds>,
    reference_point: GeoPoint,
    max_distance_km: f64,
}

impl ScoringEngine {
    /// Pinned bounds in `settings` win over `run_bounds` from the crime table.
    pub fn new(
        settings: &ScoringSettings,
        run_bounds: Option<SafetyBounds>,
    ) -> Result<Self, ScoringConfigError> {
        settings.weights.validate()?;
        if let Some(SafetyBounds { min, max }) = settings.safety_bounds {
            if !min.is_finite() || !max.is_finite() || min > max {
                return Err(ScoringConfigError::InvalidSafetyBounds { min, max });
            }
        }
        Ok(Self {
            weights: settings.weights,
            budget: settings.budget,
            safety_bounds: settings.safety_bounds.or(run_bounds),
            reference_point: settings.reference_point,
            max_distance_km: if settings.max_distance_km > 0.0 {
                settings.max_distance_km
            } else {
                ScoringSettings::default().max_distance_km
            },
        })
    }

    pub fn safety_bounds(&self) -> Option<SafetyBounds> {
        self.safety_bounds
    }

    pub fn affordability(&self, property: &Property) -> SubScore {
        let benchmarks = &property.rent_benchmarks;
        if benchmarks.is_empty() {
            return SubScore::fallback("no rent benchmarks for the area");
        }
        let affordable = benchmarks.values().filter(|rent| **rent <= self.budget).count();
        let area_part = MAX_SCORE * affordable as f64 / benchmarks.len() as f64;

        let own_benchmark = property
            .listing
            .unit_size()
            .and_then(|size| benchmarks.get(&size).map(|rent| (size, *rent)))
            .filter(|(_, rent)| *rent > 0.0);

        match own_benchmark {
            Some((size, benchmark)) => {
                let relative = MAX_SCORE * (1.5 - property.listing.rent / benchmark);
                let property_part = relative.clamp(0.0, MAX_SCORE);
                SubScore::computed(
                    (area_part + property_part) / 2.0,
                    "rent_benchmark",
                    format!(
                        "{affordable}/{} benchmarks within ${:.0}; rent ${:.0} vs {} benchmark ${benchmark:.0}",
                        benchmarks.len(),
                        self.budget,
                        property.listing.rent,
                        size.as_str()
                    ),
                )
            }
            None => SubScore::computed(
                area_part,
                "area_benchmarks",
                format!(
                    "{affordable}/{} benchmarks within ${:.0}",
                    benchmarks.len(),
                    self.budget
                ),
            ),
        }
    }

    pub fn safety(&self, property: &Property) -> SubScore {
        let (Some(district), Some(incidents)) = (&property.district, property.district_incidents)
        else {
            return SubScore::fallback("no district crime record");
        };
        let Some(bounds) = self.safety_bounds else {
            return SubScore::fallback("no incident bounds available");
        };
        SubScore::computed(
            bounds.score(incidents as f64),
            "district_incidents",
            format!(
                "district {district}: {incidents} incidents (range {:.0}-{:.0})",
                bounds.min, bounds.max
            ),
        )
    }

    fn distance_km(&self, property: &Property) -> Option<f64> {
        property
            .coordinates()
            .map(|(lat, lon)| self.reference_point.distance_km(lat, lon))
    }

    pub fn accessibility(&self, property: &Property) -> SubScore {
        if let Some(walk) = &property.walkability {
            let blended = 0.6 * walk.walk_score + 0.3 * walk.transit_score + 0.1 * walk.bike_score;
            return SubScore::computed(
                blended / 10.0,
                "walkability",
                format!(
                    "walk {:.0}, transit {:.0}, bike {:.0}",
                    walk.walk_score, walk.transit_score, walk.bike_score
                ),
            );
        }
        match self.distance_km(property) {
            Some(d) => SubScore::computed(
                MAX_SCORE * (1.0 - (d / self.max_distance_km).min(1.0)),
                "linear_distance_decay",
                format!("{d:.1} km from reference point"),
            ),
            None => SubScore::fallback("no walkability data and no coordinates"),
        }
    }

    pub fn neighborhood(&self, property: &Property) -> SubScore {
        if let Some(walk) = &property.walkability {
            return SubScore::computed(
                walk.walk_score / 10.0,
                "walk_score",
                format!("walk score {:.0}", walk.walk_score),
            );
        }
        match self.distance_km(property) {
            Some(d) => SubScore::computed(
                MAX_SCORE * (-d / (self.max_distance_km / 2.0)).exp(),
                "exponential_distance_decay",
                format!("{d:.1} km from reference point"),
            ),
            None => SubScore::fallback("no walkability data and no coordinates"),
        }
    }

    pub fn environment(&self, property: &Property) -> SubScore {
        match self.distance_km(property) {
            Some(d) => SubScore::computed(
                3.0 + 7.0 * (d / self.max_distance_km).min(1.0),
                "distance_gain",
                format!("{d:.1} km from the urban core"),
            ),
            None => SubScore::fallback("no coordinates"),
        }
    }

    pub fn score_property(&self, property: &Property) -> PropertyScores {
        let affordability = self.affordability(property);
        let safety = self.safety(property);
        let accessibility = self.accessibility(property);
        let neighborhood = self.neighborhood(property);
        let environment = self.environment(property);
        let composite = self.weights.composite([
            &affordability,
            &safety,
            &accessibility,
            &neighborhood,
            &environment,
        ]);
        PropertyScores {
            affordability,
            safety,
            accessibility,
            neighborhood,
            environment,
            composite,
        }
    }

    /// Fills `scores` on every property. Nothing else is touched.
    pub fn score_all(&self, properties: &mut [Property]) {
        for property in properties.iter_mut() {
            property.scores = Some(self.score_property(property));
        }
        debug!(count = properties.len(), "scored properties");
    }
}

/// Mean sub-scores per area; properties without an area are left out.
pub fn area_scores(properties: &[Property]) -> Vec<AreaScore> {
    let mut grouped: BTreeMap<&str, Vec<&PropertyScores>> = BTreeMap::new();
    for property in properties {
        if let (Some(area), Some(scores)) = (&property.area_code, &property.scores) {
            grouped.entry(area.as_str()).or_default().push(scores);
        }
    }

    grouped
        .into_iter()
        .map(|(area, scores)| {
            let n = scores.len() as f64;
            let mean = |f: fn(&PropertyScores) -> f64| scores.iter().map(|s| f(s)).sum::<f64>() / n;
            AreaScore {
                area_code: area.to_string(),
                property_count: scores.len(),
                affordability: mean(|s| s.affordability.value),
                safety: mean(|s| s.safety.value),
                accessibility: mean(|s| s.accessibility.value),
                neighborhood: mean(|s| s.neighborhood.value),
                environment: mean(|s| s.environment.value),
                composite: mean(|s| s.composite),
            }
        })
        .collect()
}
