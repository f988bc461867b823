use crate::cache::GridCache;
use crate::error::{EngineError, Result};
use crate::extract::read_grid;
use crate::grid::Grid;
use crate::manifest::Manifest;
use crate::region::{filter_by_region, regional_mean};
use crate::structs::{
    AnomalyPoint, AnomalySeries, BaselineTable, EngineConfig, InputUnit, MS_PER_YEAR, MonthKey,
    Observation, RegionBounds, SkippedMonth, TrendLine,
};
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where monthly grids come from.
pub trait GridSource: Sync {
    /// Every month the source can load, ascending.
    fn month_keys(&self) -> Vec<MonthKey>;

    /// Loads one month.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Data` when the month is unknown or unreadable.
    fn load(&self, key: MonthKey) -> Result<Grid>;
}

/// Grids read from the CSV files listed in a manifest.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    manifest: Manifest,
    unit: InputUnit,
}

impl ManifestSource {
    /// A unit declared by the manifest takes precedence over `unit`.
    pub fn new(manifest: Manifest, unit: InputUnit) -> Self {
        let unit = match manifest.unit {
            Some(declared) => {
                if declared != unit {
                    debug!("Manifest declares {:?}, overriding {:?}", declared, unit);
                }
                declared
            }
            None => unit,
        };
        Self { manifest, unit }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn unit(&self) -> InputUnit {
        self.unit
    }
}

impl GridSource for ManifestSource {
    fn month_keys(&self) -> Vec<MonthKey> {
        self.manifest.keys()
    }

    /// Only local files are read; an http(s) locator fails with a data error.
    fn load(&self, key: MonthKey) -> Result<Grid> {
        let entry = self
            .manifest
            .entry(key)
            .ok_or_else(|| EngineError::Data(format!("No file listed for {}", key)))?;
        if entry.is_remote() {
            return Err(EngineError::Data(format!(
                "Remote locator {} is not supported, only local files load",
                entry.locator.display()
            )));
        }
        read_grid(&entry.locator, self.unit)
    }
}

/// Rows already in memory, keyed by month.
impl GridSource for BTreeMap<MonthKey, Vec<Observation>> {
    fn month_keys(&self) -> Vec<MonthKey> {
        self.keys().copied().collect()
    }

    fn load(&self, key: MonthKey) -> Result<Grid> {
        self.get(&key)
            .map(|rows| Grid::from_observations(rows))
            .ok_or_else(|| EngineError::Data(format!("No rows for {}", key)))
    }
}

/// Loads, caches and aggregates monthly grids.
///
/// Month loads run on a dedicated rayon pool sized by
/// `EngineConfig::max_concurrency`. Aggregates are collected in month order,
/// so results do not depend on which load finishes first.
pub struct AnomalyGridEngine<S: GridSource = ManifestSource> {
    source: S,
    cache: GridCache,
    config: EngineConfig,
    pool: rayon::ThreadPool,
}

impl<S: GridSource> AnomalyGridEngine<S> {
    /// # Errors
    ///
    /// Returns `EngineError::ThreadPool` if the worker pool cannot be built.
    pub fn new(source: S, config: EngineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency.unwrap_or(0))
            .build()?;
        debug!(
            "Engine ready with {} workers, {} months available",
            pool.current_num_threads(),
            source.month_keys().len()
        );
        Ok(Self {
            source,
            cache: GridCache::new(),
            config,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &GridCache {
        &self.cache
    }

    pub fn month_keys(&self) -> Vec<MonthKey> {
        self.source.month_keys()
    }

    /// Available months within an inclusive, optionally open-ended range.
    pub fn month_keys_between(
        &self,
        start: Option<MonthKey>,
        end: Option<MonthKey>,
    ) -> Vec<MonthKey> {
        self.month_keys()
            .into_iter()
            .filter(|k| start.is_none_or(|s| *k >= s) && end.is_none_or(|e| *k <= e))
            .collect()
    }

    /// Loads a month through the cache.
    ///
    /// Each month is read from the source at most once; later calls, and
    /// calls racing the first, share the same grid or the same failure.
    ///
    /// # Arguments
    /// * `key` - Month to load
    ///
    /// # Returns
    /// Shared handle to the month's grid
    ///
    /// # Errors
    /// Returns `EngineError::Data` if the month is unknown or its file cannot be read.
    pub fn load_grid(&self, key: MonthKey) -> Result<Arc<Grid>> {
        self.cache.get_or_load(key, || self.source.load(key))
    }

    /// Cells of one month that fall inside a region.
    ///
    /// # Arguments
    /// * `key` - Month to load
    /// * `bounds` - Region box, in either longitude convention
    ///
    /// # Returns
    /// Every cell in the box, missing (NaN) cells included, with longitudes
    /// as the grid reports them
    ///
    /// # Errors
    /// Returns error if the month cannot be loaded.
    pub fn filter_by_region(
        &self,
        key: MonthKey,
        bounds: &RegionBounds,
    ) -> Result<Vec<Observation>> {
        let grid = self.load_grid(key)?;
        Ok(filter_by_region(&grid, bounds))
    }

    /// Month-over-month change ending at `key`.
    ///
    /// # Errors
    ///
    /// Fails if either month cannot be loaded or their axes differ.
    pub fn rate_of_change(&self, key: MonthKey) -> Result<Grid> {
        let previous_key = key
            .pred()
            .ok_or_else(|| EngineError::InvalidInput(format!("No month before {}", key)))?;
        let current = self.load_grid(key)?;
        let previous = self.load_grid(previous_key)?;
        compute_rate_of_change(&current, &previous)
    }

    /// Per-calendar-month mean of per-year regional means.
    ///
    /// Each year counts once per calendar month however many cells it
    /// has. Months that fail to load are skipped and listed in the table.
    ///
    /// # Arguments
    /// * `keys` - Candidate months; `EngineConfig::baseline_years` narrows them further
    /// * `bounds` - Region the means are taken over
    ///
    /// # Returns
    /// Twelve means in Kelvin, NaN for calendar months no year contributed to
    pub fn compute_baseline(&self, keys: &[MonthKey], bounds: &RegionBounds) -> BaselineTable {
        let keys: Vec<MonthKey> = keys
            .iter()
            .copied()
            .filter(|k| {
                self.config
                    .baseline_years
                    .is_none_or(|(first, last)| (first..=last).contains(&k.year()))
            })
            .collect();
        let (means, skipped) = self.regional_means(&keys, bounds);

        let mut per_month: [Vec<f64>; 12] = Default::default();
        for (key, mean) in means {
            if let Some(mean) = mean {
                per_month[key.month() as usize - 1].push(mean);
            }
        }

        let means = per_month.map(|years| {
            if years.is_empty() {
                f64::NAN
            } else {
                years.iter().sum::<f64>() / years.len() as f64
            }
        });
        debug!(
            "Baseline defined for {} of 12 calendar months",
            means.iter().filter(|m| !m.is_nan()).count()
        );
        BaselineTable { means, skipped }
    }

    /// Regional mean and anomaly for each month, ascending.
    ///
    /// Months with no valid cell in the region, or whose calendar month has
    /// no baseline, contribute no point.
    ///
    /// # Arguments
    /// * `keys` - Months to include; duplicates are ignored
    /// * `bounds` - Region the means are taken over
    /// * `baseline` - Reference means, usually from [`Self::compute_baseline`]
    ///
    /// # Returns
    /// Points in ascending month order plus the months that failed to load
    pub fn compute_anomaly_series(
        &self,
        keys: &[MonthKey],
        bounds: &RegionBounds,
        baseline: &BaselineTable,
    ) -> AnomalySeries {
        let (means, skipped) = self.regional_means(keys, bounds);
        let mut points = Vec::with_capacity(means.len());
        for (key, mean) in means {
            let Some(mean_temp_k) = mean else {
                debug!("{}: no valid cells in region", key);
                continue;
            };
            let Some(reference) = baseline.get(key.month()) else {
                debug!("{}: no baseline for calendar month {}", key, key.month());
                continue;
            };
            points.push(AnomalyPoint {
                key,
                date: key.first_day(),
                mean_temp_k,
                anomaly_k: mean_temp_k - reference,
            });
        }
        AnomalySeries { points, skipped }
    }

    /// Regional means for distinct `keys`, in ascending month order.
    fn regional_means(
        &self,
        keys: &[MonthKey],
        bounds: &RegionBounds,
    ) -> (Vec<(MonthKey, Option<f64>)>, Vec<SkippedMonth>) {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let outcomes: Vec<(MonthKey, Result<Option<f64>>)> = self.pool.install(|| {
            keys.par_iter()
                .map(|&key| (key, self.load_grid(key).map(|grid| regional_mean(&grid, bounds))))
                .collect()
        });

        let mut means = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(mean) => means.push((key, mean)),
                Err(e) => {
                    warn!("Skipping {}: {}", key, e);
                    skipped.push(SkippedMonth {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (means, skipped)
    }
}

/// Cell-wise `current - previous`.
///
/// # Errors
///
/// Returns `EngineError::ShapeMismatch` unless both grids share axes.
pub fn compute_rate_of_change(current: &Grid, previous: &Grid) -> Result<Grid> {
    current.rate_of_change(previous)
}

/// Ordinary least squares of anomaly against elapsed milliseconds.
///
/// Time is measured from the first point of the series; the returned line
/// carries that origin so it can be evaluated at any other time.
///
/// # Errors
///
/// Returns `EngineError::InsufficientData` for fewer than two points or
/// when every point shares one timestamp.
pub fn fit_linear_trend(series: &AnomalySeries) -> Result<TrendLine> {
    let samples: Vec<(i64, f64)> = series
        .points
        .iter()
        .filter(|p| p.anomaly_k.is_finite())
        .map(|p| (p.key.timestamp_ms(), p.anomaly_k))
        .collect();

    let Some(&(origin_ms, _)) = samples.first() else {
        return Err(EngineError::InsufficientData("series is empty".into()));
    };
    if samples.len() < 2 {
        return Err(EngineError::InsufficientData(format!(
            "need at least 2 points, got {}",
            samples.len()
        )));
    }

    let n = samples.len() as f64;
    let x_mean = samples.iter().map(|(t, _)| (t - origin_ms) as f64).sum::<f64>() / n;
    let y_mean = samples.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (sxy, sxx) = samples.iter().fold((0.0, 0.0), |(sxy, sxx), (t, y)| {
        let dx = (t - origin_ms) as f64 - x_mean;
        (sxy + dx * (y - y_mean), sxx + dx * dx)
    });
    if sxx == 0.0 {
        return Err(EngineError::InsufficientData(
            "all points share one timestamp".into(),
        ));
    }

    let slope_per_ms = sxy / sxx;
    Ok(TrendLine {
        origin_ms,
        slope_per_ms,
        intercept: y_mean - slope_per_ms * x_mean,
        slope_per_decade: slope_per_ms * MS_PER_YEAR * 10.0,
        points: samples.len(),
    })
}
