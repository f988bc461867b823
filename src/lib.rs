pub mod cache;
pub mod error;
pub mod extract;
pub mod grid;
pub mod load;
pub mod manifest;
pub mod region;
pub mod structs;
pub mod transform;

// Re-export public API
pub use cache::GridCache;
pub use error::{EngineError, Result};
pub use extract::{read_grid, read_observations};
pub use grid::Grid;
pub use load::{
    write_grid_csv, write_json, write_reports_json, write_series_csv, write_series_parquet,
};
pub use manifest::{DEFAULT_FILE_TEMPLATE, Manifest, ManifestEntry};
pub use region::{
    NamedRegion, RegionContext, RegionReport, filter_by_region, load_regions, normalize_lon,
    regional_mean,
};
pub use structs::{
    AnomalyPoint, AnomalySeries, BaselineTable, EngineConfig, InputUnit, MonthKey, Observation,
    RegionBounds, SimpleLogger, SkippedMonth, TemperatureUnit, TrendLine,
};
pub use transform::{
    AnomalyGridEngine, GridSource, ManifestSource, compute_rate_of_change, fit_linear_trend,
};
