use crate::error::Result;
use crate::grid::Grid;
use crate::region::RegionReport;
use crate::structs::{AnomalySeries, TemperatureUnit};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use csv::Writer;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::{fs::File, path::Path, sync::Arc};

/// Writes an anomaly series to CSV with formatted numeric values.
///
/// # Arguments
/// * `series` - Regional anomaly series, ascending by month
/// * `unit` - Unit for the mean temperature and anomaly columns
/// * `output_path` - Path where the CSV file will be created
///
/// # Errors
/// Returns error if file cannot be created or written to.
pub fn write_series_csv(
    series: &AnomalySeries,
    unit: TemperatureUnit,
    output_path: &Path,
) -> Result<()> {
    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);

    writer.write_record(["Date", "Year", "Month", "Mean_Temp", "Anomaly", "Unit"])?;

    for point in &series.points {
        writer.write_record(&[
            point.key.to_string(),
            point.key.year().to_string(),
            point.key.month().to_string(),
            format!("{:.2}", unit.convert(point.mean_temp_k)),
            format!("{:.3}", unit.convert_delta(point.anomaly_k)),
            unit.symbol().to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes any serialisable result to a pretty-formatted JSON file.
///
/// NaN values are written as `null`.
///
/// # Errors
/// Returns error if file cannot be created or serialization fails.
pub fn write_json<T: Serialize + ?Sized>(value: &T, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Writes region reports, one JSON document holding all regions.
pub fn write_reports_json(reports: &[RegionReport], output_path: &Path) -> Result<()> {
    write_json(reports, output_path)
}

/// Writes an anomaly series to a columnar Parquet file using Arrow format.
///
/// Temperatures are stored in Kelvin; unit conversion is left to readers.
///
/// # Errors
/// Returns error if file cannot be created, schema is invalid, or Arrow operations fail.
pub fn write_series_parquet(series: &AnomalySeries, output_path: &Path) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("date", DataType::Utf8, false),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::UInt32, false),
        Field::new("mean_temp_k", DataType::Float64, false),
        Field::new("anomaly_k", DataType::Float64, false),
    ]));

    let points = &series.points;
    let dates = StringArray::from_iter_values(points.iter().map(|p| p.key.to_string()));
    let years: Int32Array = points.iter().map(|p| p.key.year()).collect();
    let months: UInt32Array = points.iter().map(|p| p.key.month()).collect();
    let means: Float64Array = points.iter().map(|p| p.mean_temp_k).collect();
    let anomalies: Float64Array = points.iter().map(|p| p.anomaly_k).collect();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(dates),
            Arc::new(years),
            Arc::new(months),
            Arc::new(means),
            Arc::new(anomalies),
        ],
    )?;

    let file = File::create(output_path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

/// Writes a grid in long format, one `lat,lon,value` row per cell.
///
/// Missing cells are written with an empty value field. `convert` maps each
/// stored value before formatting, e.g. Kelvin to Celsius.
pub fn write_grid_csv(grid: &Grid, output_path: &Path, convert: impl Fn(f64) -> f64) -> Result<()> {
    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);

    writer.write_record(["lat", "lon", "value"])?;
    for cell in grid.cells() {
        let value = if cell.value_k.is_nan() {
            String::new()
        } else {
            format!("{:.4}", convert(cell.value_k))
        };
        writer.write_record(&[cell.lat.to_string(), cell.lon.to_string(), value])?;
    }

    writer.flush()?;
    Ok(())
}
