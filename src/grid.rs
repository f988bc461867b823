use crate::error::{EngineError, Result};
use crate::structs::Observation;
use std::cmp::Ordering;

/// Dense `n_lat × n_lon` raster for one month.
///
/// Latitudes run north to south, longitudes west to east. Cells with no
/// source row are NaN.
#[derive(Debug, Clone)]
pub struct Grid {
    lats: Vec<f64>,
    lons: Vec<f64>,
    /// Row-major, `values[i * n_lon + j]` is `(lats[i], lons[j])`.
    values: Vec<f64>,
    row_count: usize,
}

/// Missing cells compare equal to each other.
impl PartialEq for Grid {
    fn eq(&self, other: &Self) -> bool {
        self.row_count == other.row_count
            && self.same_axes(other)
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

impl Grid {
    pub fn empty() -> Self {
        Self {
            lats: Vec::new(),
            lons: Vec::new(),
            values: Vec::new(),
            row_count: 0,
        }
    }

    /// Rasterises rows onto the axes they imply.
    ///
    /// Axes are the distinct coordinates present in `rows`, sorted
    /// independently of row order. Rows with a NaN coordinate are counted
    /// but cannot be placed. A later row for the same cell overwrites an
    /// earlier one.
    pub fn from_observations(rows: &[Observation]) -> Self {
        let lats = unique_axis(rows.iter().map(|o| o.lat), |a, b| b.total_cmp(a));
        let lons = unique_axis(rows.iter().map(|o| o.lon), |a, b| a.total_cmp(b));
        let mut values = vec![f64::NAN; lats.len() * lons.len()];

        for row in rows {
            if let (Some(i), Some(j)) = (lat_index(&lats, row.lat), lon_index(&lons, row.lon)) {
                values[i * lons.len() + j] = row.value_k;
            }
        }

        Self {
            lats,
            lons,
            values,
            row_count: rows.len(),
        }
    }

    /// Builds a grid from explicit axes and row-major values.
    pub fn from_parts(lats: Vec<f64>, lons: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if values.len() != lats.len() * lons.len() {
            return Err(EngineError::ShapeMismatch {
                expected: format!("{} values", lats.len() * lons.len()),
                found: format!("{} values", values.len()),
            });
        }
        let descending = lats.windows(2).all(|w| w[0] > w[1]);
        let ascending = lons.windows(2).all(|w| w[0] < w[1]);
        if !descending || !ascending {
            return Err(EngineError::InvalidInput(
                "Latitudes must be strictly descending and longitudes strictly ascending".into(),
            ));
        }
        let row_count = values.len();
        Ok(Self {
            lats,
            lons,
            values,
            row_count,
        })
    }

    pub fn lats(&self) -> &[f64] {
        &self.lats
    }

    pub fn lons(&self) -> &[f64] {
        &self.lons
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn n_lat(&self) -> usize {
        self.lats.len()
    }

    pub fn n_lon(&self) -> usize {
        self.lons.len()
    }

    /// Number of source rows, including unplaceable or valueless ones.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, lat_idx: usize, lon_idx: usize) -> Option<f64> {
        if lat_idx >= self.n_lat() || lon_idx >= self.n_lon() {
            return None;
        }
        Some(self.values[lat_idx * self.n_lon() + lon_idx])
    }

    /// Value at an exact grid coordinate.
    pub fn value_at(&self, lat: f64, lon: f64) -> Option<f64> {
        let i = lat_index(&self.lats, lat)?;
        let j = lon_index(&self.lons, lon)?;
        self.get(i, j)
    }

    pub fn valid_cell_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }

    /// Every cell, NaN or not, as an observation.
    pub fn cells(&self) -> impl Iterator<Item = Observation> + '_ {
        let n_lon = self.lons.len();
        self.lats.iter().enumerate().flat_map(move |(i, &lat)| {
            self.lons
                .iter()
                .enumerate()
                .map(move |(j, &lon)| Observation::new(lat, lon, self.values[i * n_lon + j]))
        })
    }

    /// Minimum and maximum of the non-NaN cells.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn same_axes(&self, other: &Grid) -> bool {
        self.lats == other.lats && self.lons == other.lons
    }

    /// Cell-wise `self - previous`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ShapeMismatch` unless both grids have identical
    /// axes.
    pub fn rate_of_change(&self, previous: &Grid) -> Result<Grid> {
        if !self.same_axes(previous) {
            return Err(EngineError::ShapeMismatch {
                expected: self.describe_shape(),
                found: previous.describe_shape(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(&previous.values)
            .map(|(cur, prev)| cur - prev)
            .collect();
        Ok(Grid {
            lats: self.lats.clone(),
            lons: self.lons.clone(),
            values,
            row_count: self.row_count.min(previous.row_count),
        })
    }

    fn describe_shape(&self) -> String {
        let span = |axis: &[f64]| match (axis.first(), axis.last()) {
            (Some(a), Some(b)) => format!("{}..{}", a, b),
            _ => "empty".to_string(),
        };
        format!(
            "{}x{} grid (lat {}, lon {})",
            self.n_lat(),
            self.n_lon(),
            span(&self.lats),
            span(&self.lons)
        )
    }
}

fn unique_axis(
    coords: impl Iterator<Item = f64>,
    order: impl Fn(&f64, &f64) -> Ordering,
) -> Vec<f64> {
    let mut axis: Vec<f64> = coords.filter(|c| !c.is_nan()).map(canonical).collect();
    axis.sort_by(&order);
    axis.dedup();
    axis
}

/// Folds -0.0 into 0.0 so both land in the same axis slot.
fn canonical(coord: f64) -> f64 {
    coord + 0.0
}

fn lat_index(lats: &[f64], lat: f64) -> Option<usize> {
    if lat.is_nan() {
        return None;
    }
    let lat = canonical(lat);
    lats.binary_search_by(|candidate| lat.total_cmp(candidate)).ok()
}

fn lon_index(lons: &[f64], lon: f64) -> Option<usize> {
    if lon.is_nan() {
        return None;
    }
    let lon = canonical(lon);
    lons.binary_search_by(|candidate| candidate.total_cmp(&lon)).ok()
}
