//! Outbound actuation: immediate valve commands and time-boxed irrigation
//! schedules, published through the shared bus link with a durable record
//! per dispatch.
//!
//! Devices expect schedule times in one fixed zone regardless of where the
//! operator or server sits, so operator wall-clock times are converted
//! before they are stored or published.

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bus::{BusError, BusLink};
use crate::db::{CommandKind, CommandRecord, CommandStatus, Db, Field, ScheduleRecord};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("field '{0}' not found")]
    FieldNotFound(String),
    #[error("store unavailable: {0}")]
    Store(anyhow::Error),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CommandPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    command: CommandKind,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SchedulePayload<'a> {
    device_id: &'a str,
    start_time: &'a str,
    end_time: &'a str,
    amount_liters: f64,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    db: Db,
    bus: BusLink,
    command_topic: String,
    schedule_topic: String,
    device_tz: Tz,
}

impl Dispatcher {
    pub fn new(
        db: Db,
        bus: BusLink,
        command_topic: impl Into<String>,
        schedule_topic: impl Into<String>,
        device_tz: Tz,
    ) -> Self {
        Self {
            db,
            bus,
            command_topic: command_topic.into(),
            schedule_topic: schedule_topic.into(),
            device_tz,
        }
    }

    /// Issue an immediate actuation command for a field.
    ///
    /// The returned record is `executed` once the publish has been handed to
    /// the bus client ("attempted", not "device confirmed" — there is no
    /// acknowledgment channel). If the bus is not connected yet, the record
    /// comes back `pending` and a queued publish flips it to `executed` once
    /// the connection is up; the call itself never blocks on the connection.
    pub async fn send_command(
        &self,
        field_id: &str,
        command: CommandKind,
    ) -> Result<CommandRecord, DispatchError> {
        let field = self.require_field(field_id).await?;
        let payload = serde_json::to_vec(&CommandPayload {
            kind: "command",
            device_id: &field.lora_id,
            command,
        })?;

        let mut record = self
            .db
            .create_command(field_id, command)
            .await
            .map_err(DispatchError::Store)?;

        if self.bus.is_ready() {
            match self.bus.publish(&self.command_topic, payload).await {
                Ok(()) => {
                    self.finish_command(record.id, CommandStatus::Executed).await;
                    record.status = CommandStatus::Executed;
                    info!(
                        command = command.as_str(),
                        device = %field.lora_id,
                        "command published"
                    );
                }
                Err(e) => {
                    self.finish_command(record.id, CommandStatus::Failed).await;
                    record.status = CommandStatus::Failed;
                    return Err(e.into());
                }
            }
        } else {
            // Queue for the next ConnAck; the record stays pending until the
            // publish actually fires.
            let bus = self.bus.clone();
            let db = self.db.clone();
            let topic = self.command_topic.clone();
            let device = field.lora_id.clone();
            let id = record.id;
            tokio::spawn(async move {
                match bus.publish_when_connected(&topic, payload).await {
                    Ok(()) => {
                        if let Err(e) = db.set_command_status(id, CommandStatus::Executed).await {
                            error!(command = id, "failed to mark command executed: {e:#}");
                        } else {
                            info!(command = id, %device, "queued command published");
                        }
                    }
                    Err(BusError::Abandoned) => {
                        warn!(command = id, "bus shut down before queued command was published");
                    }
                    Err(e) => {
                        if let Err(e) = db.set_command_status(id, CommandStatus::Failed).await {
                            error!(command = id, "failed to mark command failed: {e:#}");
                        }
                        error!(command = id, "queued command publish failed: {e}");
                    }
                }
            });
        }

        Ok(record)
    }

    /// Create a time-boxed irrigation schedule and publish it to the device.
    ///
    /// Start/end arrive as operator wall-clock times (with their own UTC
    /// offset) and are converted to the fixed device timezone before being
    /// stored and published. The record stays `pending`; completion is
    /// driven elsewhere once the window elapses.
    pub async fn create_schedule(
        &self,
        field_id: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        amount_liters: f64,
    ) -> Result<ScheduleRecord, DispatchError> {
        let field = self.require_field(field_id).await?;
        let start_time = to_device_time(start, self.device_tz);
        let end_time = to_device_time(end, self.device_tz);

        let record = self
            .db
            .create_schedule(field_id, &start_time, &end_time, amount_liters)
            .await
            .map_err(DispatchError::Store)?;

        let payload = serde_json::to_vec(&SchedulePayload {
            device_id: &field.lora_id,
            start_time: &start_time,
            end_time: &end_time,
            amount_liters,
        })?;

        if self.bus.is_ready() {
            self.bus.publish(&self.schedule_topic, payload).await?;
            info!(
                schedule = record.id,
                device = %field.lora_id,
                start = %start_time,
                end = %end_time,
                "schedule published"
            );
        } else {
            let bus = self.bus.clone();
            let topic = self.schedule_topic.clone();
            let id = record.id;
            tokio::spawn(async move {
                match bus.publish_when_connected(&topic, payload).await {
                    Ok(()) => info!(schedule = id, "queued schedule published"),
                    Err(BusError::Abandoned) => {
                        warn!(schedule = id, "bus shut down before queued schedule was published");
                    }
                    Err(e) => error!(schedule = id, "queued schedule publish failed: {e}"),
                }
            });
        }

        Ok(record)
    }

    async fn require_field(&self, field_id: &str) -> Result<Field, DispatchError> {
        self.db
            .get_field(field_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or_else(|| DispatchError::FieldNotFound(field_id.to_string()))
    }

    /// Best-effort status update after a publish attempt; the attempt
    /// outcome is already decided, so a store failure here is only logged.
    async fn finish_command(&self, id: i64, status: CommandStatus) {
        if let Err(e) = self.db.set_command_status(id, status).await {
            error!(command = id, "failed to update command status: {e:#}");
        }
    }
}

/// Render a wall-clock instant in the device timezone, RFC 3339 with the
/// zone's UTC offset (e.g. "2025-05-01T16:00:00+06:00").
pub fn to_device_time(t: DateTime<FixedOffset>, tz: Tz) -> String {
    t.with_timezone(&tz)
        .format("%Y-%m-%dT%H:%M:%S%:z")
        .to_string()
}

// ===========================================================================
// Tests
// ===========================================================================
