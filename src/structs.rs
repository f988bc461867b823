use crate::error::{EngineError, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use log::{Level, Log, Metadata, Record as LogRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offset between the Kelvin and Celsius scales.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Values above this are taken as Kelvin by [`InputUnit::Auto`], values at or
/// below it as Celsius. No surface air temperature is above 150 °C or below
/// 150 K, so the two ranges do not overlap.
pub const AUTO_KELVIN_THRESHOLD: f64 = 150.0;

/// Length of a year in milliseconds, using a 365.25-day year.
pub const MS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Logger that prefixes each line with a UTC timestamp and level.
///
/// Warnings and errors go to stderr so that skipped months stay visible when
/// stdout is redirected.
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &LogRecord) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stamp = Utc::now().format("%H:%M:%S%.3f");
        if record.level() <= Level::Warn {
            eprintln!("{} [{}] {}", stamp, record.level(), record.args());
        } else {
            println!("{} [{}] {}", stamp, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Calendar month identifier, ordered by time.
///
/// Stored as the first day of the month so that ordering, hashing and date
/// arithmetic all come from chrono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(NaiveDate);

impl MonthKey {
    /// Builds a key, rejecting months outside 1..=12.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(MonthKey)
            .ok_or_else(|| EngineError::InvalidInput(format!("Invalid month: {}-{}", year, month)))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        MonthKey(date.with_day(1).unwrap_or(date))
    }

    /// Month containing the given epoch-millisecond instant (UTC).
    pub fn from_timestamp_ms(ms: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| Self::from_date(dt.date_naive()))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Calendar month, 1..=12.
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// Milliseconds since the Unix epoch at UTC midnight of the first day.
    pub fn timestamp_ms(&self) -> i64 {
        self.0.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
    }

    pub fn pred(&self) -> Option<Self> {
        self.0.checked_sub_months(Months::new(1)).map(MonthKey)
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.checked_add_months(Months::new(1)).map(MonthKey)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for MonthKey {
    type Err = EngineError;

    /// Accepts `YYYY-MM`, `YYYYMM`, `YYYY-MM-DD` and RFC 3339 timestamps.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::from_date(dt.with_timezone(&Utc).date_naive()));
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return Ok(Self::from_date(dt.date()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            let year = s[..4].parse::<i32>().ok();
            let month = s[4..].parse::<u32>().ok();
            if let (Some(year), Some(month)) = (year, month) {
                return Self::new(year, month);
            }
        }
        Err(EngineError::InvalidInput(format!("Unrecognized month: {:?}", s)))
    }
}

impl TryFrom<String> for MonthKey {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.to_string()
    }
}

/// One grid cell for one month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub lat: f64,
    pub lon: f64,
    /// Absolute temperature in Kelvin, NaN when missing.
    pub value_k: f64,
}

impl Observation {
    pub fn new(lat: f64, lon: f64, value_k: f64) -> Self {
        Self { lat, lon, value_k }
    }
}

/// Inclusive latitude/longitude box.
///
/// Longitudes may use either the signed [-180, 180] or the unsigned
/// [0, 360] convention; see [`crate::region`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl RegionBounds {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Result<Self> {
        let bounds = Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        };
        bounds.validate()?;
        Ok(bounds)
    }

    /// The whole globe.
    pub fn global() -> Self {
        Self {
            lat_min: -90.0,
            lat_max: 90.0,
            lon_min: -180.0,
            lon_max: 180.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all_finite = [self.lat_min, self.lat_max, self.lon_min, self.lon_max]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(EngineError::InvalidInput(format!(
                "Region bounds must be finite: {:?}",
                self
            )));
        }
        if self.lat_min > self.lat_max {
            return Err(EngineError::InvalidInput(format!(
                "lat_min {} exceeds lat_max {}",
                self.lat_min, self.lat_max
            )));
        }
        Ok(())
    }
}

/// A month that could not be loaded while building an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedMonth {
    pub key: MonthKey,
    pub reason: String,
}

/// Mean regional temperature per calendar month, in Kelvin.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineTable {
    /// Index 0 is January. NaN where no year contributed.
    pub means: [f64; 12],
    pub skipped: Vec<SkippedMonth>,
}

impl BaselineTable {
    pub fn new(means: [f64; 12]) -> Self {
        Self {
            means,
            skipped: Vec::new(),
        }
    }

    /// Baseline for a calendar month (1..=12), `None` if undefined.
    pub fn get(&self, month: u32) -> Option<f64> {
        let index = usize::try_from(month).ok()?.checked_sub(1)?;
        self.means.get(index).copied().filter(|v| !v.is_nan())
    }

    /// Number of calendar months with a defined baseline.
    pub fn defined_months(&self) -> usize {
        self.means.iter().filter(|v| !v.is_nan()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyPoint {
    pub key: MonthKey,
    pub date: NaiveDate,
    pub mean_temp_k: f64,
    pub anomaly_k: f64,
}

/// Regional anomalies, ascending by month.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalySeries {
    pub points: Vec<AnomalyPoint>,
    pub skipped: Vec<SkippedMonth>,
}

impl AnomalySeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, key: MonthKey) -> Option<&AnomalyPoint> {
        self.points
            .binary_search_by(|p| p.key.cmp(&key))
            .ok()
            .map(|i| &self.points[i])
    }
}

/// Least-squares line of anomaly against time.
///
/// `slope_per_ms` and `intercept` are measured from `origin_ms`, the
/// timestamp of the first fitted point. Evaluating the line at any other
/// time range reuses the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendLine {
    pub origin_ms: i64,
    pub slope_per_ms: f64,
    pub intercept: f64,
    pub slope_per_decade: f64,
    pub points: usize,
}

impl TrendLine {
    pub fn value_at_ms(&self, timestamp_ms: i64) -> f64 {
        self.intercept + self.slope_per_ms * (timestamp_ms - self.origin_ms) as f64
    }

    pub fn value_at(&self, key: MonthKey) -> f64 {
        self.value_at_ms(key.timestamp_ms())
    }

    /// Line endpoints over an arbitrary month range, e.g. another region's axis.
    pub fn endpoints(&self, start: MonthKey, end: MonthKey) -> ((MonthKey, f64), (MonthKey, f64)) {
        ((start, self.value_at(start)), (end, self.value_at(end)))
    }
}

/// Unit of the temperature column in source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum InputUnit {
    Kelvin,
    Celsius,
    /// Values above [`AUTO_KELVIN_THRESHOLD`] are Kelvin, the rest Celsius.
    Auto,
}

impl InputUnit {
    pub fn to_kelvin(self, value: f64) -> f64 {
        match self {
            InputUnit::Kelvin => value,
            InputUnit::Celsius => value + KELVIN_OFFSET,
            InputUnit::Auto if value > AUTO_KELVIN_THRESHOLD => value,
            InputUnit::Auto => value + KELVIN_OFFSET,
        }
    }

    /// Parses unit labels found in manifests (`K`, `kelvin`, `degC`, ...).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "k" | "kelvin" => Some(InputUnit::Kelvin),
            "c" | "degc" | "°c" | "celsius" => Some(InputUnit::Celsius),
            "auto" => Some(InputUnit::Auto),
            _ => None,
        }
    }
}

/// Temperature unit for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
    Kelvin,
}

impl TemperatureUnit {
    pub fn convert(self, kelvin: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => kelvin - KELVIN_OFFSET,
            TemperatureUnit::Fahrenheit => (kelvin - KELVIN_OFFSET) * 9.0 / 5.0 + 32.0,
            TemperatureUnit::Kelvin => kelvin,
        }
    }

    /// Converts a temperature difference, which has no offset.
    pub fn convert_delta(self, delta: f64) -> f64 {
        match self {
            TemperatureUnit::Fahrenheit => delta * 9.0 / 5.0,
            TemperatureUnit::Celsius | TemperatureUnit::Kelvin => delta,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
            TemperatureUnit::Kelvin => "K",
        }
    }
}

/// Configuration for the aggregation engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub input_unit: InputUnit,
    pub output_unit: TemperatureUnit,
    /// Upper bound on concurrent month loads. `None` uses rayon's default.
    pub max_concurrency: Option<usize>,
    /// Inclusive year range that contributes to baselines.
    pub baseline_years: Option<(i32, i32)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_unit: InputUnit::Auto,
            output_unit: TemperatureUnit::Celsius,
            max_concurrency: None,
            baseline_years: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_key_parsing() {
        let expected = MonthKey::new(1998, 3).unwrap();
        let inputs = [
            "1998-03",
            "199803",
            "1998-03-15",
            "1998-03-01T12:00:00Z",
            "1998-03-31T23:00:00",
        ];
        for input in inputs {
            assert_eq!(input.parse::<MonthKey>().unwrap(), expected, "{}", input);
        }
        assert!("1998-13".parse::<MonthKey>().is_err());
        assert!("march".parse::<MonthKey>().is_err());
        assert!(MonthKey::new(2000, 0).is_err());
    }

    #[test]
    fn test_month_key_order_and_neighbours() {
        let dec = MonthKey::new(1999, 12).unwrap();
        let jan = MonthKey::new(2000, 1).unwrap();
        assert!(dec < jan);
        assert_eq!(dec.succ(), Some(jan));
        assert_eq!(jan.pred(), Some(dec));
        assert_eq!(jan.to_string(), "2000-01");
        assert_eq!(jan.timestamp_ms(), 946_684_800_000);
        assert_eq!(MonthKey::from_timestamp_ms(946_684_800_000), Some(jan));
    }

    #[test]
    fn test_month_key_serde() {
        let key = MonthKey::new(2021, 7).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2021-07\"");
        let back: MonthKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_auto_unit_threshold() {
        assert_eq!(InputUnit::Auto.to_kelvin(150.0), 150.0 + KELVIN_OFFSET);
        assert_eq!(InputUnit::Auto.to_kelvin(150.5), 150.5);
        assert_eq!(InputUnit::Auto.to_kelvin(288.0), 288.0);
        assert_eq!(InputUnit::Auto.to_kelvin(-12.0), -12.0 + KELVIN_OFFSET);
        assert!(InputUnit::Auto.to_kelvin(f64::NAN).is_nan());
        assert_eq!(InputUnit::Kelvin.to_kelvin(20.0), 20.0);
        assert_eq!(InputUnit::Celsius.to_kelvin(200.0), 200.0 + KELVIN_OFFSET);
    }

    #[test]
    fn test_unit_labels() {
        assert_eq!(InputUnit::from_label(" K "), Some(InputUnit::Kelvin));
        assert_eq!(InputUnit::from_label("degC"), Some(InputUnit::Celsius));
        assert_eq!(InputUnit::from_label("furlongs"), None);
    }

    #[test]
    fn test_output_conversion() {
        assert!((TemperatureUnit::Celsius.convert(273.15)).abs() < 1e-12);
        assert!((TemperatureUnit::Fahrenheit.convert(373.15) - 212.0).abs() < 1e-9);
        assert_eq!(TemperatureUnit::Fahrenheit.convert_delta(1.0), 1.8);
        assert_eq!(TemperatureUnit::Kelvin.convert_delta(1.0), 1.0);
    }

    #[test]
    fn test_baseline_lookup() {
        let mut means = [f64::NAN; 12];
        means[0] = 280.0;
        let table = BaselineTable::new(means);
        assert_eq!(table.get(1), Some(280.0));
        assert_eq!(table.get(2), None);
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(13), None);
        assert_eq!(table.defined_months(), 1);
    }

    #[test]
    fn test_region_bounds_validation() {
        assert!(RegionBounds::new(10.0, -10.0, 0.0, 10.0).is_err());
        assert!(RegionBounds::new(-10.0, 10.0, f64::NAN, 10.0).is_err());
        assert!(RegionBounds::new(-10.0, 10.0, 350.0, 10.0).is_ok());
    }
}
