use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub source_id: String,
    pub name: String,
    pub location: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Field {
    pub field_id: String,
    pub name: String,
    pub size_sqkm: f64,
    pub source_id: String,
    /// Device tag matched case-insensitively against inbound `source` tags.
    pub lora_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SensorKind {
    Flow,
    Pressure,
    Level,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sensor {
    pub sensor_id: String,
    pub field_id: String,
    pub kind: SensorKind,
    pub topic: String,
}

/// The latest reading for one sensor. A cache row, not a history entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CommandKind {
    Open,
    Close,
    OpenAll,
    CloseAll,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Open => "open",
            CommandKind::Close => "close",
            CommandKind::OpenAll => "openall",
            CommandKind::CloseAll => "closeall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommandRecord {
    pub id: i64,
    pub field_id: String,
    pub command: CommandKind,
    pub status: CommandStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub id: i64,
    pub field_id: String,
    /// Start/end as published to the device: RFC 3339 in the reference zone.
    pub start_time: String,
    pub end_time: String,
    pub amount_liters: f64,
    pub status: ScheduleStatus,
    pub created_at: i64,
}

pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/bridge.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Entity registry (seeded from config)
    // ----------------------------

    pub async fn upsert_source(&self, s: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, name, location, description)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
              name=excluded.name,
              location=excluded.location,
              description=excluded.description
            "#,
        )
        .bind(&s.source_id)
        .bind(&s.name)
        .bind(&s.location)
        .bind(&s.description)
        .execute(&self.pool)
        .await
        .context("upsert_source failed")?;
        Ok(())
    }

    pub async fn upsert_field(&self, f: &Field) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fields (field_id, name, size_sqkm, source_id, lora_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(field_id) DO UPDATE SET
              name=excluded.name,
              size_sqkm=excluded.size_sqkm,
              source_id=excluded.source_id,
              lora_id=excluded.lora_id
            "#,
        )
        .bind(&f.field_id)
        .bind(&f.name)
        .bind(f.size_sqkm)
        .bind(&f.source_id)
        .bind(&f.lora_id)
        .execute(&self.pool)
        .await
        .context("upsert_field failed")?;
        Ok(())
    }

    pub async fn upsert_sensor(&self, s: &Sensor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, field_id, kind, topic)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              field_id=excluded.field_id,
              kind=excluded.kind,
              topic=excluded.topic
            "#,
        )
        .bind(&s.sensor_id)
        .bind(&s.field_id)
        .bind(s.kind)
        .bind(&s.topic)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn get_field(&self, field_id: &str) -> Result<Option<Field>> {
        sqlx::query_as::<_, Field>(
            r#"
            SELECT field_id, name, size_sqkm, source_id, lora_id
            FROM fields
            WHERE field_id = ?
            "#,
        )
        .bind(field_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_field failed")
    }

    /// Resolve an inbound device tag to its registered field. Exact
    /// case-insensitive equality; if two fields share a tag, an arbitrary
    /// one wins (collisions are permitted, not resolved).
    pub async fn find_field_by_device_id(&self, device_id: &str) -> Result<Option<Field>> {
        sqlx::query_as::<_, Field>(
            r#"
            SELECT field_id, name, size_sqkm, source_id, lora_id
            FROM fields
            WHERE lower(lora_id) = lower(?)
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("find_field_by_device_id failed")
    }

    pub async fn sensors_for_field(&self, field_id: &str) -> Result<Vec<Sensor>> {
        sqlx::query_as::<_, Sensor>(
            r#"
            SELECT sensor_id, field_id, kind, topic
            FROM sensors
            WHERE field_id = ?
            ORDER BY sensor_id
            "#,
        )
        .bind(field_id)
        .fetch_all(&self.pool)
        .await
        .context("sensors_for_field failed")
    }

    /// Level sensors sit on a shared reservoir rather than a specific field,
    /// so level readings resolve against all of them.
    pub async fn level_sensors(&self) -> Result<Vec<Sensor>> {
        sqlx::query_as::<_, Sensor>(
            r#"
            SELECT sensor_id, field_id, kind, topic
            FROM sensors
            WHERE kind = 'level'
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("level_sensors failed")
    }

    // ----------------------------
    // Latest-value cache
    // ----------------------------

    /// Upsert the current reading for a sensor. Unconditional overwrite:
    /// last write applied wins, and replaying the same write is a no-op at
    /// the observable level.
    pub async fn record_reading(&self, sensor_id: &str, value: f64, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_data (sensor_id, value, ts)
            VALUES (?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              value=excluded.value,
              ts=excluded.ts
            "#,
        )
        .bind(sensor_id)
        .bind(value)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("record_reading failed")?;
        Ok(())
    }

    /// Current reading for a sensor, or None when absent or older than
    /// `ttl_secs`. An expired row reads the same as a missing one.
    pub async fn latest_reading(
        &self,
        sensor_id: &str,
        ttl_secs: i64,
    ) -> Result<Option<SensorReading>> {
        self.latest_reading_at(sensor_id, ttl_secs, now_unix()).await
    }

    /// Clock-injected form of [`latest_reading`](Self::latest_reading).
    pub async fn latest_reading_at(
        &self,
        sensor_id: &str,
        ttl_secs: i64,
        now: i64,
    ) -> Result<Option<SensorReading>> {
        sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT sensor_id, value, ts
            FROM sensor_data
            WHERE sensor_id = ? AND ts >= ?
            "#,
        )
        .bind(sensor_id)
        .bind(now - ttl_secs)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")
    }

    /// Delete rows untouched for longer than `ttl_secs`. Returns the number
    /// evicted.
    pub async fn sweep_expired(&self, ttl_secs: i64) -> Result<u64> {
        self.sweep_expired_at(ttl_secs, now_unix()).await
    }

    pub async fn sweep_expired_at(&self, ttl_secs: i64, now: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sensor_data WHERE ts < ?")
            .bind(now - ttl_secs)
            .execute(&self.pool)
            .await
            .context("sweep_expired failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Command records
    // ----------------------------

    pub async fn create_command(
        &self,
        field_id: &str,
        command: CommandKind,
    ) -> Result<CommandRecord> {
        let created_at = now_unix();
        let res = sqlx::query(
            r#"
            INSERT INTO commands (field_id, command, status, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(field_id)
        .bind(command)
        .bind(CommandStatus::Pending)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("create_command failed")?;

        Ok(CommandRecord {
            id: res.last_insert_rowid(),
            field_id: field_id.to_string(),
            command,
            status: CommandStatus::Pending,
            created_at,
        })
    }

    pub async fn set_command_status(&self, id: i64, status: CommandStatus) -> Result<()> {
        sqlx::query("UPDATE commands SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("set_command_status failed")?;
        Ok(())
    }

    pub async fn get_command(&self, id: i64) -> Result<Option<CommandRecord>> {
        sqlx::query_as::<_, CommandRecord>(
            r#"
            SELECT id, field_id, command, status, created_at
            FROM commands
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_command failed")
    }

    // ----------------------------
    // Schedule records
    // ----------------------------

    pub async fn create_schedule(
        &self,
        field_id: &str,
        start_time: &str,
        end_time: &str,
        amount_liters: f64,
    ) -> Result<ScheduleRecord> {
        let created_at = now_unix();
        let res = sqlx::query(
            r#"
            INSERT INTO schedules (field_id, start_time, end_time, amount_liters, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(field_id)
        .bind(start_time)
        .bind(end_time)
        .bind(amount_liters)
        .bind(ScheduleStatus::Pending)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("create_schedule failed")?;

        Ok(ScheduleRecord {
            id: res.last_insert_rowid(),
            field_id: field_id.to_string(),
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            amount_liters,
            status: ScheduleStatus::Pending,
            created_at,
        })
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleRecord>> {
        sqlx::query_as::<_, ScheduleRecord>(
            r#"
            SELECT id, field_id, start_time, end_time, amount_liters, status, created_at
            FROM schedules
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_schedule failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// Seed one source, one field tagged "LORA1", and a flow + pressure
    /// sensor pair on it.
    async fn seeded_db() -> Db {
        let db = mem_db().await;
        db.upsert_source(&Source {
            source_id: "src1".into(),
            name: "North canal".into(),
            location: Some("upper gate".into()),
            description: None,
        })
        .await
        .unwrap();
        db.upsert_field(&Field {
            field_id: "f1".into(),
            name: "Field 1".into(),
            size_sqkm: 0.8,
            source_id: "src1".into(),
            lora_id: "LORA1".into(),
        })
        .await
        .unwrap();
        db.upsert_sensor(&Sensor {
            sensor_id: "flow1".into(),
            field_id: "f1".into(),
            kind: SensorKind::Flow,
            topic: "source1/field/lora".into(),
        })
        .await
        .unwrap();
        db.upsert_sensor(&Sensor {
            sensor_id: "pres1".into(),
            field_id: "f1".into(),
            kind: SensorKind::Pressure,
            topic: "source1/field/lora".into(),
        })
        .await
        .unwrap();
        db
    }

    // -- device resolution -------------------------------------------------

    #[tokio::test]
    async fn find_field_is_case_insensitive() {
        let db = seeded_db().await;
        for tag in ["lora1", "LoRa1", "LORA1"] {
            let field = db.find_field_by_device_id(tag).await.unwrap();
            assert_eq!(field.unwrap().field_id, "f1", "tag {tag}");
        }
    }

    #[tokio::test]
    async fn find_field_unknown_tag_returns_none() {
        let db = seeded_db().await;
        assert!(db.find_field_by_device_id("LORA9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_field_requires_exact_equality() {
        let db = seeded_db().await;
        // Prefix/substring tags must not match.
        assert!(db.find_field_by_device_id("LORA").await.unwrap().is_none());
        assert!(db.find_field_by_device_id("LORA11").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sensors_for_field_returns_both_kinds() {
        let db = seeded_db().await;
        let sensors = db.sensors_for_field("f1").await.unwrap();
        assert_eq!(sensors.len(), 2);
        assert!(sensors.iter().any(|s| s.kind == SensorKind::Flow));
        assert!(sensors.iter().any(|s| s.kind == SensorKind::Pressure));
    }

    #[tokio::test]
    async fn level_sensors_ignore_field_boundaries() {
        let db = seeded_db().await;
        db.upsert_sensor(&Sensor {
            sensor_id: "lvl1".into(),
            field_id: "f1".into(),
            kind: SensorKind::Level,
            topic: "source1/field/lora".into(),
        })
        .await
        .unwrap();

        let levels = db.level_sensors().await.unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].sensor_id, "lvl1");
    }

    // -- latest-value cache -------------------------------------------------

    #[tokio::test]
    async fn record_reading_is_idempotent() {
        let db = seeded_db().await;
        db.record_reading("flow1", 12.5, 1000).await.unwrap();
        db.record_reading("flow1", 12.5, 1000).await.unwrap();

        let r = db.latest_reading_at("flow1", 1800, 1000).await.unwrap();
        let r = r.unwrap();
        assert_eq!(r.value, 12.5);
        assert_eq!(r.ts, 1000);
    }

    #[tokio::test]
    async fn record_reading_last_write_wins() {
        let db = seeded_db().await;
        db.record_reading("flow1", 12.5, 1000).await.unwrap();
        db.record_reading("flow1", 99.0, 1010).await.unwrap();

        let r = db.latest_reading_at("flow1", 1800, 1010).await.unwrap();
        assert_eq!(r.unwrap().value, 99.0);
    }

    #[tokio::test]
    async fn latest_reading_absent_sensor_is_none() {
        let db = seeded_db().await;
        assert!(db
            .latest_reading_at("flow1", 1800, 1000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn latest_reading_expires_after_ttl() {
        let db = seeded_db().await;
        db.record_reading("flow1", 12.5, 1000).await.unwrap();

        // Inside the window, including the boundary.
        assert!(db
            .latest_reading_at("flow1", 1800, 2800)
            .await
            .unwrap()
            .is_some());
        // One second past the TTL: reads as no data.
        assert!(db
            .latest_reading_at("flow1", 1800, 2801)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_rows() {
        let db = seeded_db().await;
        db.record_reading("flow1", 12.5, 1000).await.unwrap();
        db.record_reading("pres1", 2.1, 2700).await.unwrap();

        let evicted = db.sweep_expired_at(1800, 2900).await.unwrap();
        assert_eq!(evicted, 1);

        assert!(db
            .latest_reading_at("flow1", 1800, 2900)
            .await
            .unwrap()
            .is_none());
        assert!(db
            .latest_reading_at("pres1", 1800, 2900)
            .await
            .unwrap()
            .is_some());
    }

    // -- command records -----------------------------------------------------

    #[tokio::test]
    async fn command_lifecycle() {
        let db = seeded_db().await;
        let cmd = db.create_command("f1", CommandKind::Open).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.command, CommandKind::Open);

        db.set_command_status(cmd.id, CommandStatus::Executed)
            .await
            .unwrap();
        let got = db.get_command(cmd.id).await.unwrap().unwrap();
        assert_eq!(got.status, CommandStatus::Executed);
        assert_eq!(got.field_id, "f1");
    }

    // -- schedule records ----------------------------------------------------

    #[tokio::test]
    async fn schedule_created_pending_with_device_times() {
        let db = seeded_db().await;
        let sched = db
            .create_schedule(
                "f1",
                "2025-05-01T16:00:00+06:00",
                "2025-05-01T18:00:00+06:00",
                500.0,
            )
            .await
            .unwrap();
        assert_eq!(sched.status, ScheduleStatus::Pending);

        let got = db.get_schedule(sched.id).await.unwrap().unwrap();
        assert_eq!(got.start_time, "2025-05-01T16:00:00+06:00");
        assert_eq!(got.end_time, "2025-05-01T18:00:00+06:00");
        assert_eq!(got.amount_liters, 500.0);
    }
}
