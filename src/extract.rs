use crate::error::{EngineError, Result};
use crate::grid::Grid;
use crate::structs::{InputUnit, Observation};
use csv::{ByteRecord, ReaderBuilder, Trim};
use log::debug;
use std::{fs::File, io::Read, path::Path};

const LAT_COLUMNS: &[&str] = &["lat", "latitude"];
const LON_COLUMNS: &[&str] = &["lon", "lng", "longitude"];
/// Accepted temperature column names, in order of preference.
const VALUE_COLUMNS: &[&str] = &["tas_k", "tas", "temp", "temperature", "value"];
/// Column whose name pins the unit to Kelvin.
const KELVIN_COLUMN: &str = "tas_k";

/// Reads one month's CSV file into a grid.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, is not valid CSV, or is
/// missing a coordinate or temperature column.
pub fn read_grid(path: &Path, unit: InputUnit) -> Result<Grid> {
    debug!("Reading grid file: {}", path.display());
    let file = File::open(path)
        .map_err(|e| EngineError::Data(format!("Cannot open {}: {}", path.display(), e)))?;
    let rows = read_observations(file, unit)?;
    Ok(Grid::from_observations(&rows))
}

/// Parses CSV rows into observations with values in Kelvin.
///
/// Fields that fail to parse become NaN; the row is still returned. An input
/// with no header line yields no rows.
pub fn read_observations<R: Read>(reader: R, unit: InputUnit) -> Result<Vec<Observation>> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Ok(Vec::new());
    }

    let lat_idx = find_column(&headers, LAT_COLUMNS)?;
    let lon_idx = find_column(&headers, LON_COLUMNS)?;
    let value_idx = find_column(&headers, VALUE_COLUMNS)?;
    let unit = if headers[value_idx].eq_ignore_ascii_case(KELVIN_COLUMN) {
        InputUnit::Kelvin
    } else {
        unit
    };

    let mut rows = Vec::new();
    let mut unparsed = 0usize;
    for record in reader.byte_records() {
        let record = record?;
        let lat = parse_field(&record, lat_idx);
        let lon = parse_field(&record, lon_idx);
        let value = parse_field(&record, value_idx);
        if lat.is_nan() || lon.is_nan() || value.is_nan() {
            unparsed += 1;
        }
        rows.push(Observation::new(lat, lon, unit.to_kelvin(value)));
    }

    if unparsed > 0 {
        debug!("{} of {} rows had unparseable fields", unparsed, rows.len());
    }
    Ok(rows)
}

/// Index of the first header matching one of `names`, ignoring case.
///
/// Names earlier in the list win over later ones regardless of column order.
fn find_column(headers: &[String], names: &[&str]) -> Result<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h.eq_ignore_ascii_case(name)))
        .ok_or_else(|| EngineError::Data(format!("Column not found: one of {}", names.join("|"))))
}

/// Bytes that are not UTF-8 parse like any other bad field.
fn parse_field(record: &ByteRecord, idx: usize) -> f64 {
    record
        .get(idx)
        .and_then(|field| std::str::from_utf8(field).ok())
        .and_then(|field| field.trim().parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::KELVIN_OFFSET;

    #[test]
    fn test_reads_aliased_columns() {
        let csv = "Latitude,Longitude,Temperature\n10,20,281.5\n-10,20,279\n";
        let rows = read_observations(csv.as_bytes(), InputUnit::Auto).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Observation::new(10.0, 20.0, 281.5));
        assert_eq!(rows[1].lat, -10.0);
    }

    #[test]
    fn test_value_column_preference() {
        let csv = "value,lat,lon,tas\n1,0,0,290\n";
        let rows = read_observations(csv.as_bytes(), InputUnit::Auto).unwrap();
        assert_eq!(rows[0].value_k, 290.0);
    }

    #[test]
    fn test_malformed_fields_become_nan() {
        let csv = "lat,lon,tas\n0,0,n/a\n1,x,280\n2,2,\n3,3\n";
        let rows = read_observations(csv.as_bytes(), InputUnit::Kelvin).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].value_k.is_nan());
        assert!(rows[1].lon.is_nan());
        assert!(rows[2].value_k.is_nan());
        assert!(rows[3].value_k.is_nan());
    }

    #[test]
    fn test_invalid_utf8_field_becomes_nan() {
        let csv = b"lat,lon,tas\n0,0,280\n0,1,\xff\xfe\n1,0,281\n";
        let rows = read_observations(&csv[..], InputUnit::Kelvin).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value_k, 280.0);
        assert_eq!(rows[1].lon, 1.0);
        assert!(rows[1].value_k.is_nan());
        assert_eq!(rows[2].value_k, 281.0);
    }

    #[test]
    fn test_auto_unit_converts_celsius() {
        let csv = "lat,lon,temp\n0,0,15\n0,1,288.15\n";
        let rows = read_observations(csv.as_bytes(), InputUnit::Auto).unwrap();
        assert!((rows[0].value_k - (15.0 + KELVIN_OFFSET)).abs() < 1e-9);
        assert_eq!(rows[1].value_k, 288.15);
    }

    #[test]
    fn test_tas_k_column_is_always_kelvin() {
        let csv = "lat,lon,tas_k\n0,0,100\n";
        let rows = read_observations(csv.as_bytes(), InputUnit::Celsius).unwrap();
        assert_eq!(rows[0].value_k, 100.0);
    }

    #[test]
    fn test_missing_column_is_data_error() {
        let csv = "lat,lon,pressure\n0,0,1013\n";
        let err = read_observations(csv.as_bytes(), InputUnit::Auto).unwrap_err();
        assert!(matches!(err, EngineError::Data(_)));
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        assert!(read_observations("".as_bytes(), InputUnit::Auto).unwrap().is_empty());
        assert!(read_observations("lat,lon,tas\n".as_bytes(), InputUnit::Auto).unwrap().is_empty());
    }

    #[test]
    fn test_read_grid_missing_file() {
        let err = read_grid(Path::new("/nonexistent/2001-01.csv"), InputUnit::Auto).unwrap_err();
        assert!(matches!(err, EngineError::Data(_)));
    }
}
