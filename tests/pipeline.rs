//! End-to-end tests: manifest and CSV files on disk through to region reports.

use approx::assert_relative_eq;
use lib::{
    AnomalyGridEngine, DEFAULT_FILE_TEMPLATE, EngineConfig, EngineError, InputUnit, Manifest,
    ManifestSource, MonthKey, RegionBounds, RegionContext, read_grid, write_reports_json,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tempfile::{TempDir, tempdir};

fn key(year: i32, month: u32) -> MonthKey {
    MonthKey::new(year, month).unwrap()
}

/// Writes a 2x2 grid file with every cell at `value`.
fn write_uniform(dir: &Path, name: &str, value: f64) {
    let mut text = String::from("lat,lon,tas_k\n");
    for (lat, lon) in [(45.0, 350.0), (45.0, 10.0), (35.0, 350.0), (35.0, 10.0)] {
        text.push_str(&format!("{},{},{}\n", lat, lon, value));
    }
    fs::write(dir.join(name), text).unwrap();
}

fn engine_for(dir: &TempDir, manifest_json: &str, config: EngineConfig) -> AnomalyGridEngine {
    let manifest_path = dir.path().join("manifest.json");
    fs::write(&manifest_path, manifest_json).unwrap();
    let manifest = Manifest::from_path(&manifest_path, DEFAULT_FILE_TEMPLATE).unwrap();
    let source = ManifestSource::new(manifest, config.input_unit);
    AnomalyGridEngine::new(source, config).unwrap()
}

#[test]
fn test_three_month_anomaly_from_files() {
    let dir = tempdir().unwrap();
    write_uniform(dir.path(), "2020-01.csv", 280.0);
    write_uniform(dir.path(), "2020-02.csv", 282.0);
    write_uniform(dir.path(), "2020-03.csv", 281.0);
    let engine = engine_for(&dir, r#"["2020-01", "2020-02", "2020-03"]"#, EngineConfig::default());

    let bounds = RegionBounds::new(30.0, 50.0, -20.0, 20.0).unwrap();
    let baseline = engine.compute_baseline(&[key(2020, 1)], &bounds);
    let series = engine.compute_anomaly_series(&engine.month_keys(), &bounds, &baseline);

    assert_eq!(series.len(), 1);
    assert_eq!(series.points[0].anomaly_k, 0.0);
    assert_eq!(series.points[0].mean_temp_k, 280.0);

    let change = engine.rate_of_change(key(2020, 2)).unwrap();
    assert_eq!(change.n_lat(), 2);
    assert!(change.values().iter().all(|v| *v == 2.0));
}

#[test]
fn test_grid_axes_match_distinct_coordinates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rows.csv");
    let rows: [(f64, f64, &str); 7] = [
        (12.5, 100.0, "290.1"),
        (-3.0, 7.5, "288"),
        (12.5, 7.5, "bad"),
        (40.0, 100.0, "275.2"),
        (-3.0, 100.0, ""),
        (40.0, 7.5, "270"),
        (40.0, 55.0, "271"),
    ];
    let mut text = String::from("lat,lon,tas\n");
    for (lat, lon, value) in rows {
        text.push_str(&format!("{},{},{}\n", lat, lon, value));
    }
    fs::write(&path, text).unwrap();

    let grid = read_grid(&path, InputUnit::Kelvin).unwrap();
    let distinct_lats: HashSet<_> = rows.iter().map(|r| r.0.to_bits()).collect();
    let distinct_lons: HashSet<_> = rows.iter().map(|r| r.1.to_bits()).collect();
    assert_eq!(grid.n_lat(), distinct_lats.len());
    assert_eq!(grid.n_lon(), distinct_lons.len());
    assert_eq!(grid.lats(), &[40.0, 12.5, -3.0]);
    assert_eq!(grid.lons(), &[7.5, 55.0, 100.0]);
    assert_eq!(grid.row_count(), rows.len());

    let valid_rows = rows.iter().filter(|r| r.2.parse::<f64>().is_ok()).count();
    assert!(grid.valid_cell_count() <= valid_rows);
    assert_eq!(grid.valid_cell_count(), 5);
}

#[test]
fn test_missing_file_skipped_with_warning() {
    let dir = tempdir().unwrap();
    for (year, value) in [(2001, 280.0), (2003, 284.0)] {
        write_uniform(dir.path(), &format!("{}-07.csv", year), value);
    }
    let manifest = r#"{"units": "K", "files": [
        {"date": "2001-07-01", "path": "2001-07.csv"},
        {"date": "2002-07-01", "path": "2002-07.csv"},
        {"date": "2003-07-01", "path": "2003-07.csv"}
    ]}"#;
    let config = EngineConfig {
        max_concurrency: Some(2),
        ..EngineConfig::default()
    };
    let engine = engine_for(&dir, manifest, config);
    assert_eq!(engine.source().unit(), InputUnit::Kelvin);

    let context = RegionContext::new("europe", RegionBounds::new(30.0, 50.0, 340.0, 20.0).unwrap());
    let report = context.analyze(&engine, &engine.month_keys());

    assert_eq!(report.baseline.get(7), Some(282.0));
    assert_eq!(report.series.len(), 2);
    assert_eq!(report.series.skipped.len(), 1);
    assert_eq!(report.series.skipped[0].key, key(2002, 7));
    assert_relative_eq!(report.series.points[0].anomaly_k, -2.0);
    assert_relative_eq!(report.series.points[1].anomaly_k, 2.0);

    let trend = report.trend.unwrap();
    assert!(trend.slope_per_decade > 0.0);
    // Two-year rise of 4 K, about 20 K per decade.
    assert_relative_eq!(trend.slope_per_decade, 20.0, max_relative = 1e-3);

    // Every month was loaded exactly once across baseline and series.
    assert_eq!(engine.cache().load_count(), 3);
}

#[test]
fn test_region_contexts_are_independent() {
    let dir = tempdir().unwrap();
    let mut entries = Vec::new();
    for year in 2010..2014 {
        let name = format!("{}-01.csv", year);
        let warm = 280.0 + (year - 2010) as f64;
        let text = format!(
            "lat,lon,temp\n10,0,{}\n10,180,{}\n-10,0,{}\n-10,180,{}\n",
            warm, 290.0, warm, 290.0
        );
        fs::write(dir.path().join(&name), text).unwrap();
        entries.push(format!(r#"{{"date": "{}-01", "file": "{}"}}"#, year, name));
    }
    let engine = engine_for(&dir, &format!("[{}]", entries.join(",")), EngineConfig::default());
    let keys = engine.month_keys();

    let warming = RegionContext::new("prime", RegionBounds::new(-20.0, 20.0, -10.0, 10.0).unwrap());
    let dateline = RegionBounds::new(-20.0, 20.0, 170.0, 190.0).unwrap();
    let steady = RegionContext::new("dateline", dateline);
    let warming_report = warming.analyze(&engine, &keys);
    let steady_report = steady.analyze(&engine, &keys);

    assert_eq!(warming_report.baseline.get(1), Some(281.5));
    assert_eq!(steady_report.baseline.get(1), Some(290.0));
    assert!(warming_report.trend.unwrap().slope_per_decade > 9.9);
    assert_relative_eq!(steady_report.trend.unwrap().slope_per_decade, 0.0, epsilon = 1e-9);

    // Reusing the cached baseline does not reload any month.
    let loads = engine.cache().load_count();
    warming.analyze(&engine, &keys);
    assert_eq!(engine.cache().load_count(), loads);

    let out = dir.path().join("reports.json");
    write_reports_json(&[warming_report, steady_report], &out).unwrap();
    let text = fs::read_to_string(&out).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value[1]["name"], "dateline");
    assert_eq!(value[0]["series"]["points"].as_array().unwrap().len(), 4);
}

#[test]
fn test_shape_mismatch_between_months() {
    let dir = tempdir().unwrap();
    write_uniform(dir.path(), "1999-12.csv", 270.0);
    fs::write(dir.path().join("2000-01.csv"), "lat,lon,tas_k\n45,350,271\n").unwrap();
    let engine = engine_for(&dir, r#"["1999-12", "2000-01"]"#, EngineConfig::default());
    let err = engine.rate_of_change(key(2000, 1)).unwrap_err();
    assert!(matches!(err, EngineError::ShapeMismatch { .. }));
}

#[test]
fn test_empty_month_file_is_not_an_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("2005-05.csv"), "lat,lon,value\n").unwrap();
    let engine = engine_for(&dir, r#"{"2005-05": "2005-05.csv"}"#, EngineConfig::default());
    let grid = engine.load_grid(key(2005, 5)).unwrap();
    assert!(grid.is_empty());
    let baseline = engine.compute_baseline(&engine.month_keys(), &RegionBounds::global());
    assert!(baseline.skipped.is_empty());
    assert_eq!(baseline.defined_months(), 0);
}
