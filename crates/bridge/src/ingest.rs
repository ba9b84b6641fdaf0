//! Per-message ingestion pipeline: envelope decode, device resolution, and
//! latest-value writes.
//!
//! Readings inside one message are processed independently: a kind that
//! fails to resolve never blocks the others, and no failure here may take
//! the listener down.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::db::{now_unix, Db, Field, Sensor};
use crate::payload::{parse_readings, Reading, ReadingKind, TelemetryEnvelope};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid telemetry envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    /// No recognized markers in the body. Expected for status chatter;
    /// dropped without retry.
    #[error("no recognized readings in payload")]
    MalformedPayload,
    #[error("no field registered for device '{0}'")]
    DeviceNotRegistered(String),
    #[error("no {kind} sensor registered for device '{device}'")]
    NoMatchingSensor {
        device: String,
        kind: &'static str,
    },
    #[error("store unavailable: {0}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Store(err)
    }
}

/// Decode and ingest one raw message. Returns the number of sensor updates
/// applied (a message may legitimately update zero, one, or several).
pub async fn handle_message(db: &Db, raw: &[u8]) -> Result<usize, IngestError> {
    let envelope: TelemetryEnvelope = serde_json::from_slice(raw)?;
    handle_envelope(db, &envelope).await
}

/// Ingest an already-decoded envelope.
pub async fn handle_envelope(db: &Db, envelope: &TelemetryEnvelope) -> Result<usize, IngestError> {
    let readings = parse_readings(&envelope.data);
    if readings.is_empty() {
        return Err(IngestError::MalformedPayload);
    }

    // One lookup per message; individual readings below may still fail to
    // resolve against it.
    let field = db.find_field_by_device_id(&envelope.source).await?;
    let ts = now_unix();

    let mut applied = 0;
    let mut device_warned = false;
    for reading in &readings {
        match apply_reading(db, field.as_ref(), &envelope.source, reading, ts).await {
            Ok(n) => applied += n,
            Err(IngestError::DeviceNotRegistered(device)) => {
                // Provisioning race: the device exists, the field row does
                // not yet. Warn once per message.
                if !device_warned {
                    warn!(%device, "no field registered for device — readings dropped");
                    device_warned = true;
                }
            }
            Err(IngestError::NoMatchingSensor { device, kind }) => {
                warn!(%device, kind, "reading dropped — no matching sensor");
            }
            Err(e) => {
                error!(
                    device = %envelope.source,
                    kind = reading.kind.label(),
                    "failed to record reading: {e}"
                );
            }
        }
    }
    Ok(applied)
}

/// Resolve one reading to its target sensors and record it against each.
async fn apply_reading(
    db: &Db,
    field: Option<&Field>,
    source: &str,
    reading: &Reading,
    ts: i64,
) -> Result<usize, IngestError> {
    let targets: Vec<Sensor> = match reading.kind {
        // Level sensors watch a shared reservoir, not a specific field, so
        // they resolve even when the device tag matches no field.
        ReadingKind::Level => db.level_sensors().await?,
        _ => {
            let field = field
                .ok_or_else(|| IngestError::DeviceNotRegistered(source.to_string()))?;
            let want = reading.kind.sensor_kind();
            db.sensors_for_field(&field.field_id)
                .await?
                .into_iter()
                .filter(|s| s.kind == want)
                .collect()
        }
    };

    if targets.is_empty() {
        return Err(IngestError::NoMatchingSensor {
            device: source.to_string(),
            kind: reading.kind.label(),
        });
    }

    for sensor in &targets {
        db.record_reading(&sensor.sensor_id, reading.value, ts).await?;
    }
    Ok(targets.len())
}

/// Listener-facing wrapper: logs per the error taxonomy and never fails.
pub async fn process_message(db: &Db, raw: &[u8]) {
    match handle_message(db, raw).await {
        Ok(applied) if applied > 0 => {
            debug!(applied, "telemetry applied");
        }
        Ok(_) => {}
        Err(IngestError::MalformedPayload) => {
            debug!("telemetry without recognized readings — ignored");
        }
        Err(IngestError::Envelope(e)) => {
            warn!("bad telemetry json: {e}");
        }
        Err(e) => {
            error!("telemetry ingestion failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
