use clap::Parser;
use lib::{
    AnomalyGridEngine, DEFAULT_FILE_TEMPLATE, EngineConfig, EngineError, InputUnit, Manifest,
    ManifestSource, MonthKey, RegionBounds, RegionContext, SimpleLogger, TemperatureUnit,
    load_regions, write_grid_csv, write_json, write_reports_json, write_series_csv,
    write_series_parquet,
};
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON manifest listing the monthly CSV files
    #[arg(short, long)]
    manifest: PathBuf,

    /// Output base name (will create dir containing .csv, .json, and .parquet files)
    #[arg(short, long, default_value = "output")]
    output: String,

    /// JSON file with an array of {name, lat_min, lat_max, lon_min, lon_max} regions
    #[arg(short, long, conflicts_with = "bbox")]
    regions: Option<PathBuf>,

    /// Region box as lat_min,lat_max,lon_min,lon_max. Defaults to the whole grid.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    bbox: Vec<f64>,

    /// Name for the --bbox region
    #[arg(long, default_value = "region")]
    name: String,

    /// Reference box for baselines, if different from the region itself
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    baseline_bbox: Vec<f64>,

    /// First year (inclusive) contributing to baselines
    #[arg(long)]
    baseline_start: Option<i32>,

    /// Last year (inclusive) contributing to baselines
    #[arg(long)]
    baseline_end: Option<i32>,

    /// First month (inclusive) to process, e.g. 1995-01
    #[arg(long, value_parser = parse_month)]
    start: Option<MonthKey>,

    /// Last month (inclusive) to process
    #[arg(long, value_parser = parse_month)]
    end: Option<MonthKey>,

    /// Temperature unit for output
    #[arg(long, default_value = "celsius")]
    unit: TemperatureUnit,

    /// Unit of the source temperature column; a manifest "unit" field wins
    #[arg(long, default_value = "auto")]
    input_unit: InputUnit,

    /// File name template for manifests that list dates only
    #[arg(long, default_value = DEFAULT_FILE_TEMPLATE)]
    template: String,

    /// Maximum number of months loaded concurrently
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Also write the month-over-month change grid ending at this month
    #[arg(long, value_parser = parse_month)]
    rate_of_change: Option<MonthKey>,

    /// Log level for output
    #[arg(long, default_value = "false")]
    debug: bool,
}

fn parse_month(s: &str) -> Result<MonthKey, String> {
    s.parse().map_err(|e: EngineError| e.to_string())
}

fn bounds_from_arg(values: &[f64], flag: &str) -> Result<RegionBounds, EngineError> {
    match values {
        [lat_min, lat_max, lon_min, lon_max] => {
            RegionBounds::new(*lat_min, *lat_max, *lon_min, *lon_max)
        }
        _ => Err(EngineError::InvalidInput(format!(
            "--{} expects 4 comma-separated values, got {}",
            flag,
            values.len()
        ))),
    }
}

/// Region name reduced to characters safe in file names.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn main() -> Result<(), EngineError> {
    // Initialize timer and logger
    let total_start = Instant::now();
    log::set_logger(&LOGGER).map_err(|e| EngineError::InvalidInput(e.to_string()))?;

    // Acquire CLI args
    let args = Args::parse();
    if args.debug {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Info);
    }

    println!("Anomaly grid engine");
    debug!(
        "Manifest: {} | Output unit: {:?} | Input unit: {:?}",
        args.manifest.display(),
        args.unit,
        args.input_unit
    );

    // Region contexts
    let baseline_bounds = if args.baseline_bbox.is_empty() {
        None
    } else {
        Some(bounds_from_arg(&args.baseline_bbox, "baseline-bbox")?)
    };
    let mut contexts: Vec<RegionContext> = if let Some(path) = &args.regions {
        load_regions(path)?.into_iter().map(RegionContext::from).collect()
    } else if args.bbox.is_empty() {
        vec![RegionContext::new(args.name.clone(), RegionBounds::global())]
    } else {
        vec![RegionContext::new(args.name.clone(), bounds_from_arg(&args.bbox, "bbox")?)]
    };
    if let Some(bounds) = baseline_bounds {
        contexts = contexts
            .into_iter()
            .map(|ctx| ctx.with_baseline_bounds(bounds))
            .collect();
    }
    debug!("{} region(s) to analyze", contexts.len());

    // Engine configuration
    let baseline_years = match (args.baseline_start, args.baseline_end) {
        (None, None) => None,
        (start, end) => Some((start.unwrap_or(i32::MIN), end.unwrap_or(i32::MAX))),
    };
    let config = EngineConfig {
        input_unit: args.input_unit,
        output_unit: args.unit,
        max_concurrency: args.jobs,
        baseline_years,
    };
    debug!(
        "Creating engine configuration | Jobs={:?}, Baseline years={:?}",
        config.max_concurrency, config.baseline_years
    );

    let manifest = Manifest::from_path(&args.manifest, &args.template)?;
    let source = ManifestSource::new(manifest, config.input_unit);
    let engine = AnomalyGridEngine::new(source, config)?;

    let keys = engine.month_keys_between(args.start, args.end);
    let (Some(first), Some(last)) = (keys.first(), keys.last()) else {
        return Err(EngineError::Data("No months selected from manifest".into()));
    };
    println!("Processing {} months ({} to {})", keys.len(), first, last);

    // Aggregate every region
    let processing_start = Instant::now();
    let reports: Vec<_> = contexts.iter().map(|ctx| ctx.analyze(&engine, &keys)).collect();
    let processing_time = processing_start.elapsed();
    println!(
        "Aggregation completed in {:.2?} | {} grids loaded",
        processing_time,
        engine.cache().load_count()
    );

    // Create output directory
    let output_dir = PathBuf::from(format!("./output/{}", args.output));
    fs::create_dir_all(&output_dir)?;
    println!(
        "Created output directory: {} | Writing output files...",
        output_dir.display()
    );
    let io_start = Instant::now();

    let unit = engine.config().output_unit;
    for report in &reports {
        let stem = file_stem(&report.name);
        let csv_path = output_dir.join(format!("{}.csv", stem));
        let json_path = output_dir.join(format!("{}.json", stem));
        let parquet_path = output_dir.join(format!("{}.parquet", stem));

        write_series_csv(&report.series, unit, &csv_path)?;
        write_json(report, &json_path)?;
        write_series_parquet(&report.series, &parquet_path)?;
        debug!("  - {}", csv_path.display());
        debug!("  - {}", json_path.display());
        debug!("  - {}", parquet_path.display());

        match &report.trend {
            Some(trend) => info!(
                "{}: {} points, trend {:+.3} {}/decade",
                report.name,
                report.series.len(),
                unit.convert_delta(trend.slope_per_decade),
                unit.symbol()
            ),
            None => info!("{}: {} points, trend undefined", report.name, report.series.len()),
        }
        if !report.series.skipped.is_empty() {
            warn!(
                "{}: {} month(s) skipped",
                report.name,
                report.series.skipped.len()
            );
        }
    }

    // Extract just the directory name for the file names (remove path separators)
    let output_name = args
        .output
        .split(['/', '\\'])
        .next_back()
        .unwrap_or(&args.output);
    let reports_path = output_dir.join(format!("{}_regions.json", output_name));
    write_reports_json(&reports, &reports_path)?;

    if let Some(key) = args.rate_of_change {
        let change = engine.rate_of_change(key)?;
        let grid_path = output_dir.join(format!("rate_of_change_{}.csv", key));
        write_grid_csv(&change, &grid_path, |delta| unit.convert_delta(delta))?;
        println!(
            "Rate of change for {}: {}x{} grid, {} valid cells",
            key,
            change.n_lat(),
            change.n_lon(),
            change.valid_cell_count()
        );
    }

    let io_time = io_start.elapsed();
    println!("All files took {:.2?}", io_time);
    println!("\nWrote files to directory: {}", output_dir.display());

    let total_time = total_start.elapsed();
    println!("Pipeline completed successfully in {:.2?}", total_time);
    debug!(
        "Performance breakdown: Processing={:.1}%, IO={:.1}%",
        (processing_time.as_secs_f64() / total_time.as_secs_f64()) * 100.0,
        (io_time.as_secs_f64() / total_time.as_secs_f64()) * 100.0
    );
    Ok(())
}
