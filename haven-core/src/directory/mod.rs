//! `LocationDirectory`: proximity-ranked safe locations.
//!
//! ## Sources
//!
//! - **Static registry**: verified entries from configuration. Immutable.
//! - **Dynamic set**: police stations and hospitals returned by the
//!   points-of-interest service around the latest position. Replaced on
//!   every refresh, never merged cumulatively, never persisted.
//!
//! ## Query order
//!
//! ```text
//! dynamic set ─┐
//!              ├─► category filter ─► sort by (distance_km, id)   (when a position is known)
//! static set  ─┘   (safe_space entries limited to the search radius)
//! ```

pub mod geo;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::capability::{PoiHit, PoiService};
use crate::error::{HavenError, Result};
use geo::Position;
use registry::{LocationCategory, RankedLocation, SafeLocation};

/// Configuration for `LocationDirectory`.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Search radius for POI queries and static safe spaces. Default: 3 km.
    pub radius_km: f64,
    /// Upper bound on one POI query. Default: 10 s.
    pub poi_timeout: Duration,
    /// Verified static entries. Default: the built-in Nairobi seed.
    pub registry: Vec<SafeLocation>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            radius_km: 3.0,
            poi_timeout: Duration::from_secs(10),
            registry: registry::default_registry(),
        }
    }
}

#[derive(Debug, Default)]
struct DynamicSet {
    generation: u64,
    locations: Vec<SafeLocation>,
}

/// Result of one refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    /// Entries now in the dynamic set.
    pub dynamic_count: usize,
    /// Category queries that failed; their results are simply absent.
    pub failures: Vec<(LocationCategory, String)>,
    /// `false` when a newer refresh finished first and this result was dropped.
    pub applied: bool,
}

pub struct LocationDirectory {
    config: DirectoryConfig,
    poi: Arc<dyn PoiService>,
    dynamic: RwLock<DynamicSet>,
    generation: AtomicU64,
}

impl LocationDirectory {
    pub fn new(config: DirectoryConfig, poi: Arc<dyn PoiService>) -> Self {
        debug!(entries = config.registry.len(), "location directory ready");
        Self {
            config,
            poi,
            dynamic: RwLock::new(DynamicSet::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &[SafeLocation] {
        &self.config.registry
    }

    pub fn radius_km(&self) -> f64 {
        self.config.radius_km
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.read().locations.len()
    }

    /// Re-query the POI service around `position` and replace the dynamic set.
    ///
    /// Police and hospital queries run concurrently. A failed category
    /// contributes nothing, so a fully failed refresh leaves the set empty
    /// rather than holding results from an older position. If a newer
    /// refresh has already been applied, this one is discarded.
    pub async fn refresh(&self, position: Position) -> RefreshReport {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let radius_m = (self.config.radius_km * 1000.0).round() as u32;

        let [first, second] = LocationCategory::DYNAMIC;
        let (first_hits, second_hits) = tokio::join!(
            self.query_category(position, radius_m, first),
            self.query_category(position, radius_m, second),
        );

        let mut locations = Vec::new();
        let mut failures = Vec::new();
        for (category, result) in [(first, first_hits), (second, second_hits)] {
            match result {
                Ok(hits) => locations.extend(
                    hits.into_iter()
                        .enumerate()
                        .map(|(i, hit)| dynamic_location(category, i, hit)),
                ),
                Err(e) => {
                    warn!(%category, "POI query failed: {e}");
                    failures.push((category, e.to_string()));
                }
            }
        }

        let mut dynamic = self.dynamic.write();
        if generation < dynamic.generation {
            debug!(generation, latest = dynamic.generation, "stale POI refresh discarded");
            return RefreshReport {
                dynamic_count: dynamic.locations.len(),
                failures,
                applied: false,
            };
        }
        dynamic.generation = generation;
        dynamic.locations = locations;
        info!(
            generation,
            dynamic = dynamic.locations.len(),
            failed_categories = failures.len(),
            "dynamic locations replaced"
        );
        RefreshReport {
            dynamic_count: dynamic.locations.len(),
            failures,
            applied: true,
        }
    }

    async fn query_category(
        &self,
        position: Position,
        radius_m: u32,
        category: LocationCategory,
    ) -> Result<Vec<PoiHit>> {
        tokio::time::timeout(
            self.config.poi_timeout,
            self.poi.query(position, radius_m, category),
        )
        .await
        .map_err(|_| HavenError::PoiQuery(format!("{category} query timed out")))?
    }

    /// Merged, filtered and (with a position) ranked locations.
    pub fn query(
        &self,
        position: Option<Position>,
        filter: Option<LocationCategory>,
    ) -> Vec<RankedLocation> {
        let dynamic = self.dynamic.read().locations.clone();
        let static_entries = self.config.registry.iter().filter(|loc| match position {
            Some(p) if loc.category == LocationCategory::SafeSpace => {
                p.distance_km(&loc.position()) <= self.config.radius_km
            }
            _ => true,
        });

        let mut ranked: Vec<RankedLocation> = dynamic
            .into_iter()
            .chain(static_entries.cloned())
            .filter(|loc| filter.map_or(true, |c| loc.category == c))
            .map(|loc| RankedLocation::rank(loc, position.as_ref()))
            .collect();

        if position.is_some() {
            sort_by_distance(&mut ranked);
        }
        ranked
    }
}

fn dynamic_location(category: LocationCategory, index: usize, hit: PoiHit) -> SafeLocation {
    SafeLocation {
        id: format!("poi-{category}-{index}"),
        name: hit.name,
        category,
        address: hit.address,
        lat: hit.lat,
        lng: hit.lng,
        phone: None,
        verified: false,
        hours: "unknown".into(),
    }
}

/// Ascending by distance; ties by id so output is deterministic.
pub fn sort_by_distance(ranked: &mut [RankedLocation]) {
    ranked.sort_by(|a, b| {
        let da = a.distance_km.unwrap_or(f64::INFINITY);
        let db = b.distance_km.unwrap_or(f64::INFINITY);
        da.total_cmp(&db)
            .then_with(|| a.location.id.cmp(&b.location.id))
    });
}
