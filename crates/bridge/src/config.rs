//! TOML config file loading, validation, and database seeding for sources,
//! fields, and sensors.
//!
//! The dashboard's CRUD endpoints live in another service; this bridge is
//! provisioned from the config file at startup, with idempotent upserts.

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::db::{Db, Field, Sensor, SensorKind, Source};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Fixed zone the field devices expect schedule times in, independent
    /// of server or operator locale.
    #[serde(default = "default_device_timezone")]
    pub device_timezone: Tz,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "irrigation-bridge".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub telemetry: String,
    pub command: String,
    pub schedule: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            telemetry: "source1/field/lora".to_string(),
            command: "source1/field/lora/command".to_string(),
            schedule: "source1/field/lora/schedule".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Latest readings untouched longer than this read as "no data".
    pub data_ttl_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_ttl_secs: 1800,
            sweep_interval_secs: 300,
        }
    }
}

fn default_device_timezone() -> Tz {
    chrono_tz::Asia::Thimphu
}

#[derive(Debug, Deserialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FieldEntry {
    pub field_id: String,
    pub name: String,
    pub size_sqkm: f64,
    pub source_id: String,
    pub lora_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub field_id: String,
    pub kind: SensorKind,
    pub topic: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_sources(&mut errors);
        self.validate_fields(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        if self.ingest.data_ttl_secs <= 0 {
            errors.push(format!(
                "ingest.data_ttl_secs must be positive, got {}",
                self.ingest.data_ttl_secs
            ));
        }
        if self.ingest.sweep_interval_secs == 0 {
            errors.push("ingest.sweep_interval_secs must be positive".to_string());
        }
        for (name, topic) in [
            ("topics.telemetry", &self.topics.telemetry),
            ("topics.command", &self.topics.command),
            ("topics.schedule", &self.topics.schedule),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("{name} is empty"));
            }
        }
    }

    fn validate_sources(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, s) in self.sources.iter().enumerate() {
            let ctx = || {
                if s.source_id.is_empty() {
                    format!("sources[{i}]")
                } else {
                    format!("source '{}'", s.source_id)
                }
            };

            if s.source_id.trim().is_empty() {
                errors.push(format!("{}: source_id is empty", ctx()));
            } else if !seen_ids.insert(&s.source_id) {
                errors.push(format!("{}: duplicate source_id", ctx()));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&s.name) {
                errors.push(format!("{}: duplicate source name '{}'", ctx(), s.name));
            }
        }
    }

    fn validate_fields(&self, errors: &mut Vec<String>) {
        let source_ids: HashSet<&str> =
            self.sources.iter().map(|s| s.source_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, f) in self.fields.iter().enumerate() {
            let ctx = || {
                if f.field_id.is_empty() {
                    format!("fields[{i}]")
                } else {
                    format!("field '{}'", f.field_id)
                }
            };

            if f.field_id.trim().is_empty() {
                errors.push(format!("{}: field_id is empty", ctx()));
            } else if !seen_ids.insert(&f.field_id) {
                errors.push(format!("{}: duplicate field_id", ctx()));
            }

            if f.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if f.size_sqkm <= 0.0 {
                errors.push(format!(
                    "{}: size_sqkm must be positive, got {}",
                    ctx(),
                    f.size_sqkm
                ));
            }

            if f.source_id.trim().is_empty() {
                errors.push(format!("{}: source_id is empty", ctx()));
            } else if !source_ids.contains(f.source_id.as_str()) {
                errors.push(format!(
                    "{}: source_id '{}' does not match any defined source",
                    ctx(),
                    f.source_id
                ));
            }

            // Note: lora_id must be present but not unique — two fields
            // sharing a device tag is permitted (resolution picks one).
            if f.lora_id.trim().is_empty() {
                errors.push(format!("{}: lora_id is empty", ctx()));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let field_ids: HashSet<&str> = self.fields.iter().map(|f| f.field_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.field_id.trim().is_empty() {
                errors.push(format!("{}: field_id is empty", ctx()));
            } else if !field_ids.contains(s.field_id.as_str()) {
                errors.push(format!(
                    "{}: field_id '{}' does not match any defined field",
                    ctx(),
                    s.field_id
                ));
            }

            if s.topic.trim().is_empty() {
                errors.push(format!("{}: topic is empty", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all sources, fields, and sensors from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sources {
        db.upsert_source(&Source {
            source_id: s.source_id.clone(),
            name: s.name.clone(),
            location: s.location.clone(),
            description: s.description.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert source '{}'", s.source_id))?;
    }

    for f in &config.fields {
        db.upsert_field(&Field {
            field_id: f.field_id.clone(),
            name: f.name.clone(),
            size_sqkm: f.size_sqkm,
            source_id: f.source_id.clone(),
            lora_id: f.lora_id.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert field '{}'", f.field_id))?;
    }

    for s in &config.sensors {
        db.upsert_sensor(&Sensor {
            sensor_id: s.sensor_id.clone(),
            field_id: s.field_id.clone(),
            kind: s.kind,
            topic: s.topic.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    // Shared device tags are legal but make resolution ambiguous; say so.
    let mut by_tag: HashMap<String, Vec<&str>> = HashMap::new();
    for f in &config.fields {
        by_tag
            .entry(f.lora_id.to_lowercase())
            .or_default()
            .push(f.field_id.as_str());
    }
    for (tag, fields) in by_tag {
        if fields.len() > 1 {
            warn!(
                lora_id = %tag,
                fields = ?fields,
                "multiple fields share a device tag — resolution is ambiguous"
            );
        }
    }

    info!(
        sources = config.sources.len(),
        fields = config.fields.len(),
        sensors = config.sensors.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
