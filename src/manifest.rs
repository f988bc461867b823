//! Normalisation of month manifests.
//!
//! Manifests come in several JSON shapes. They are reduced here, once, to a
//! sorted list of [`ManifestEntry`] values so nothing downstream ever looks
//! at the raw document.

use crate::error::{EngineError, Result};
use crate::structs::{InputUnit, MonthKey};
use log::{debug, warn};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

const DATE_KEYS: &[&str] = &["date", "time", "timestamp", "month"];
const LOCATOR_KEYS: &[&str] = &["path", "file", "url"];
const WRAPPER_KEYS: &[&str] = &["months", "files", "entries", "items"];
const UNIT_KEYS: &[&str] = &["unit", "units"];

/// File name used when an entry carries only a date.
pub const DEFAULT_FILE_TEMPLATE: &str = "{date}.csv";

/// Numbers at or above this are epoch milliseconds, below it `YYYYMM`.
const MIN_TIMESTAMP_MS: f64 = 1.0e7;

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub key: MonthKey,
    pub locator: PathBuf,
}

impl ManifestEntry {
    /// Whether the locator is an http(s) URL rather than a file path.
    pub fn is_remote(&self) -> bool {
        self.locator
            .to_str()
            .is_some_and(|s| s.starts_with("http://") || s.starts_with("https://"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    /// Ascending by key, one entry per key.
    pub entries: Vec<ManifestEntry>,
    /// Unit declared by the manifest, if any.
    pub unit: Option<InputUnit>,
}

impl Manifest {
    /// Reads a manifest file and resolves relative locators against its directory.
    pub fn from_path(path: &Path, template: &str) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::Data(format!("Cannot read manifest {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = Self::from_json_str(&text, template)?.resolve_against(base_dir);
        debug!(
            "Manifest {} lists {} months",
            path.display(),
            manifest.entries.len()
        );
        Ok(manifest)
    }

    pub fn from_json_str(json: &str, template: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| EngineError::Data(format!("Manifest is not valid JSON: {}", e)))?;
        Self::from_value(&value, template)
    }

    pub fn from_value(value: &Value, template: &str) -> Result<Self> {
        let (entries, unit) = match value {
            Value::Array(items) => (entries_from_array(items, template), None),
            Value::Object(map) => {
                let unit = declared_unit(map);
                let wrapped = WRAPPER_KEYS.iter().find_map(|k| map.get(*k));
                let entries = match wrapped {
                    Some(Value::Array(items)) => entries_from_array(items, template),
                    Some(Value::Object(inner)) => entries_from_keyed(inner, template),
                    Some(other) => {
                        return Err(EngineError::Data(format!(
                            "Manifest month list has unsupported type: {}",
                            json_type(other)
                        )));
                    }
                    None => entries_from_keyed(map, template),
                };
                (entries, unit)
            }
            other => {
                return Err(EngineError::Data(format!(
                    "Manifest must be an array or object, found {}",
                    json_type(other)
                )));
            }
        };

        let mut entries = entries;
        entries.sort_by_key(|e| e.key);
        entries.dedup_by_key(|e| e.key);
        Ok(Self { entries, unit })
    }

    /// Joins relative file locators onto `base_dir`.
    ///
    /// URLs are left alone. They stay listed, but only local files can be
    /// loaded, so each one is reported here and skipped when its month is read.
    pub fn resolve_against(mut self, base_dir: &Path) -> Self {
        for entry in &mut self.entries {
            if entry.is_remote() {
                warn!(
                    "{}: remote locator {} will not be fetched",
                    entry.key,
                    entry.locator.display()
                );
            } else if entry.locator.is_relative() {
                entry.locator = base_dir.join(&entry.locator);
            }
        }
        self
    }

    pub fn keys(&self) -> Vec<MonthKey> {
        self.entries.iter().map(|e| e.key).collect()
    }

    pub fn entry(&self, key: MonthKey) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.key.cmp(&key))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn locator(&self, key: MonthKey) -> Option<&Path> {
        self.entry(key).map(|e| e.locator.as_path())
    }
}

fn entries_from_array(items: &[Value], template: &str) -> Vec<ManifestEntry> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(obj) => entry_from_object(obj, None, template),
            other => {
                let (key, label) = date_from_value(other)?;
                Some(ManifestEntry {
                    key,
                    locator: render_template(template, key, &label),
                })
            }
        })
        .collect()
}

fn entries_from_keyed(map: &Map<String, Value>, template: &str) -> Vec<ManifestEntry> {
    map.iter()
        .filter(|(name, _)| !UNIT_KEYS.contains(&name.as_str()))
        .filter_map(|(name, value)| match value {
            Value::Object(obj) => entry_from_object(obj, Some(name.as_str()), template),
            Value::String(locator) => match name.parse::<MonthKey>() {
                Ok(key) => Some(ManifestEntry {
                    key,
                    locator: PathBuf::from(locator),
                }),
                Err(_) => {
                    warn!("Skipping manifest key {:?}: not a month", name);
                    None
                }
            },
            _ => {
                let key = name.parse::<MonthKey>().ok()?;
                Some(ManifestEntry {
                    key,
                    locator: render_template(template, key, name),
                })
            }
        })
        .collect()
}

fn entry_from_object(
    obj: &Map<String, Value>,
    fallback_date: Option<&str>,
    template: &str,
) -> Option<ManifestEntry> {
    let dated = DATE_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(date_from_value)
        .or_else(|| {
            let label = fallback_date?;
            label.parse().ok().map(|key| (key, label.to_string()))
        });

    let Some((key, label)) = dated else {
        warn!("Skipping manifest entry without a usable date: {}", Value::Object(obj.clone()));
        return None;
    };

    let locator = LOCATOR_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(PathBuf::from)
        .unwrap_or_else(|| render_template(template, key, &label));
    Some(ManifestEntry { key, locator })
}

/// Month and its textual label from a date string or number.
fn date_from_value(value: &Value) -> Option<(MonthKey, String)> {
    match value {
        Value::String(s) => match s.parse::<MonthKey>() {
            Ok(key) => Some((key, s.trim().to_string())),
            Err(e) => {
                warn!("Skipping manifest date {:?}: {}", s, e);
                None
            }
        },
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let key = if raw >= MIN_TIMESTAMP_MS {
                MonthKey::from_timestamp_ms(raw as i64)
            } else {
                n.to_string().parse().ok()
            };
            key.map(|k| (k, k.to_string()))
        }
        _ => None,
    }
}

fn declared_unit(map: &Map<String, Value>) -> Option<InputUnit> {
    let label = UNIT_KEYS.iter().find_map(|k| map.get(*k).and_then(Value::as_str))?;
    let unit = InputUnit::from_label(label);
    if unit.is_none() {
        warn!("Ignoring unrecognized manifest unit {:?}", label);
    }
    unit
}

fn render_template(template: &str, key: MonthKey, label: &str) -> PathBuf {
    PathBuf::from(
        template
            .replace("{date}", label)
            .replace("{yyyy}", &format!("{:04}", key.year()))
            .replace("{mm}", &format!("{:02}", key.month())),
    )
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
