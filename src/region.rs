//! Regional subsetting.
//!
//! Source grids report longitudes either as signed degrees in [-180, 180]
//! or unsigned degrees in [0, 360], and region boxes may use either
//! convention independently of the grid. Every comparison here first maps
//! both sides to signed degrees in [-180, 180).

use crate::error::{EngineError, Result};
use crate::grid::Grid;
use crate::structs::{AnomalySeries, BaselineTable, MonthKey, Observation, RegionBounds, TrendLine};
use crate::transform::{AnomalyGridEngine, GridSource, fit_linear_trend};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Slack on box edges, in degrees, so an edge written in one longitude
/// convention still includes the same meridian written in the other.
const EDGE_TOLERANCE_DEG: f64 = 1e-9;

/// Maps a longitude to signed degrees in [-180, 180).
pub fn normalize_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

impl RegionBounds {
    /// Whether `(lat, lon)` lies in the box, limits inclusive.
    ///
    /// A box spanning 360 degrees or more covers every longitude. A box
    /// whose normalised western limit lies east of its eastern limit wraps
    /// the antimeridian.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if !(self.lat_min..=self.lat_max).contains(&lat) || lon.is_nan() {
            return false;
        }
        if self.lon_max - self.lon_min >= 360.0 {
            return true;
        }
        let lon = normalize_lon(lon);
        let west = normalize_lon(self.lon_min);
        let east = normalize_lon(self.lon_max);
        let after_west = lon >= west - EDGE_TOLERANCE_DEG;
        let before_east = lon <= east + EDGE_TOLERANCE_DEG;
        if west <= east {
            after_west && before_east
        } else {
            after_west || before_east
        }
    }
}

/// Cells of `grid` inside `bounds`, NaN-valued cells included.
///
/// Longitudes are returned as the grid reports them.
pub fn filter_by_region(grid: &Grid, bounds: &RegionBounds) -> Vec<Observation> {
    grid.cells()
        .filter(|cell| bounds.contains(cell.lat, cell.lon))
        .collect()
}

/// Mean of the non-NaN cells inside `bounds`.
pub fn regional_mean(grid: &Grid, bounds: &RegionBounds) -> Option<f64> {
    let (sum, count) = grid
        .cells()
        .filter(|cell| !cell.value_k.is_nan() && bounds.contains(cell.lat, cell.lon))
        .fold((0.0, 0usize), |(sum, count), cell| (sum + cell.value_k, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// A named region as written in region list files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRegion {
    pub name: String,
    #[serde(flatten)]
    pub bounds: RegionBounds,
}

/// Reads a JSON array of `{name, lat_min, lat_max, lon_min, lon_max}`.
pub fn load_regions(path: &Path) -> Result<Vec<NamedRegion>> {
    let text = fs::read_to_string(path)?;
    let regions: Vec<NamedRegion> = serde_json::from_str(&text)?;
    for region in &regions {
        region.bounds.validate().map_err(|e| {
            EngineError::InvalidInput(format!("Region {:?}: {}", region.name, e))
        })?;
    }
    debug!("Loaded {} regions from {}", regions.len(), path.display());
    Ok(regions)
}

/// Everything computed for one region.
#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
    pub name: String,
    pub bounds: RegionBounds,
    pub baseline_bounds: RegionBounds,
    pub baseline: BaselineTable,
    pub series: AnomalySeries,
    /// `None` when the series is too short or flat in time to fit.
    pub trend: Option<TrendLine>,
}

/// Per-region state: bounds and a baseline computed at most once.
#[derive(Debug)]
pub struct RegionContext {
    name: String,
    bounds: RegionBounds,
    baseline_bounds: Option<RegionBounds>,
    baseline: OnceLock<BaselineTable>,
}

impl RegionContext {
    pub fn new(name: impl Into<String>, bounds: RegionBounds) -> Self {
        Self {
            name: name.into(),
            bounds,
            baseline_bounds: None,
            baseline: OnceLock::new(),
        }
    }

    /// Uses a different reference region for the baseline.
    pub fn with_baseline_bounds(mut self, bounds: RegionBounds) -> Self {
        self.baseline_bounds = Some(bounds);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> &RegionBounds {
        &self.bounds
    }

    pub fn baseline_bounds(&self) -> &RegionBounds {
        self.baseline_bounds.as_ref().unwrap_or(&self.bounds)
    }

    /// Baseline over `keys`, computed on first use and reused afterwards.
    pub fn baseline<S: GridSource>(
        &self,
        engine: &AnomalyGridEngine<S>,
        keys: &[MonthKey],
    ) -> &BaselineTable {
        self.baseline.get_or_init(|| {
            debug!("Computing baseline for region {}", self.name);
            engine.compute_baseline(keys, self.baseline_bounds())
        })
    }

    pub fn analyze<S: GridSource>(
        &self,
        engine: &AnomalyGridEngine<S>,
        keys: &[MonthKey],
    ) -> RegionReport {
        let baseline = self.baseline(engine, keys).clone();
        let series = engine.compute_anomaly_series(keys, &self.bounds, &baseline);
        let trend = match fit_linear_trend(&series) {
            Ok(trend) => Some(trend),
            Err(e) => {
                warn!("Region {}: trend undefined: {}", self.name, e);
                None
            }
        };
        RegionReport {
            name: self.name.clone(),
            bounds: self.bounds,
            baseline_bounds: *self.baseline_bounds(),
            baseline,
            series,
            trend,
        }
    }
}

impl From<NamedRegion> for RegionContext {
    fn from(region: NamedRegion) -> Self {
        RegionContext::new(region.name, region.bounds)
    }
}
