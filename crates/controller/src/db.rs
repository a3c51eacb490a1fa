use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::model::{from_millis, to_millis, CropType, Plot, Sensor, Slot, Status};
use crate::store::{Lease, PlotStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Plot fields an operator (or the seed config) controls. Irrigation and
/// retry state are never written through this.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    pub code: String,
    pub length: f64,
    pub width: f64,
    pub crop_type: Option<CropType>,
    pub water_amount: i64,
}

const PLOT_COLUMNS: &str = "id, code, length, width, crop_type, water_amount, \
     is_irrigated, start_irrigation_time, last_irrigation_time, \
     sensor_call_count, last_sensor_call_time, has_alert";

#[derive(FromRow)]
struct PlotRow {
    id: i64,
    code: String,
    length: f64,
    width: f64,
    crop_type: Option<String>,
    water_amount: i64,
    is_irrigated: bool,
    start_irrigation_time: Option<i64>,
    last_irrigation_time: Option<i64>,
    sensor_call_count: i64,
    last_sensor_call_time: Option<i64>,
    has_alert: bool,
}

#[derive(FromRow)]
struct SensorRow {
    id: i64,
    code: String,
    status: String,
    plot_id: i64,
}

#[derive(FromRow)]
struct SlotRow {
    id: i64,
    status: String,
}

#[derive(FromRow)]
struct LeaseRow {
    plot_id: i64,
    owner: String,
    expires_at: i64,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = anyhow::Error;

    fn try_from(r: SensorRow) -> Result<Self> {
        Ok(Sensor {
            status: Status::from_str(&r.status)
                .with_context(|| format!("sensor {} has a corrupt status", r.id))?,
            id: r.id,
            code: r.code,
            plot_id: r.plot_id,
        })
    }
}

/// True when `err` wraps a UNIQUE constraint failure.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/plots.db"
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
    // Plot catalog
    // ----------------------------

    /// Insert a plot in its default state (idle, no crop, no slots).
    pub async fn insert_plot(&self, code: &str, length: f64, width: f64) -> Result<i64> {
        let res = sqlx::query("INSERT INTO plots (code, length, width) VALUES (?, ?, ?)")
            .bind(code)
            .bind(length)
            .bind(width)
            .execute(&self.pool)
            .await
            .context("insert_plot failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Insert or update a plot by code, leaving irrigation state alone.
    pub async fn upsert_plot(&self, p: &PlotSpec) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO plots (code, length, width, crop_type, water_amount)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
              length=excluded.length,
              width=excluded.width,
              crop_type=excluded.crop_type,
              water_amount=excluded.water_amount
            "#,
        )
        .bind(&p.code)
        .bind(p.length)
        .bind(p.width)
        .bind(p.crop_type.map(CropType::as_str))
        .bind(p.water_amount)
        .execute(&self.pool)
        .await
        .context("upsert_plot failed")?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM plots WHERE code = ?")
            .bind(&p.code)
            .fetch_one(&self.pool)
            .await
            .context("upsert_plot: reading back id failed")?;
        Ok(id)
    }

    pub async fn list_plots(&self) -> Result<Vec<Plot>> {
        self.fetch_plots(&format!("SELECT {PLOT_COLUMNS} FROM plots ORDER BY id"), None)
            .await
            .context("list_plots failed")
    }

    pub async fn plot_id_by_code(&self, code: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT id FROM plots WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("plot_id_by_code failed")
    }

    /// Set crop and water amount and rebuild the slot set. New slots mirror
    /// the plot's current irrigation flag.
    pub async fn configure_plot(
        &self,
        plot_id: i64,
        crop_type: CropType,
        water_amount: i64,
        slots_count: u32,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("configure_plot: begin failed")?;

        let updated = sqlx::query("UPDATE plots SET crop_type = ?, water_amount = ? WHERE id = ?")
            .bind(crop_type.as_str())
            .bind(water_amount)
            .bind(plot_id)
            .execute(&mut *tx)
            .await
            .context("configure_plot: update failed")?
            .rows_affected();
        if updated == 0 {
            return Ok(false);
        }

        let is_irrigated: bool = sqlx::query_scalar("SELECT is_irrigated FROM plots WHERE id = ?")
            .bind(plot_id)
            .fetch_one(&mut *tx)
            .await
            .context("configure_plot: reading irrigation flag failed")?;
        let status = Status::for_irrigated(is_irrigated);

        sqlx::query("DELETE FROM slots WHERE plot_id = ?")
            .bind(plot_id)
            .execute(&mut *tx)
            .await
            .context("configure_plot: clearing slots failed")?;
        for _ in 0..slots_count {
            sqlx::query("INSERT INTO slots (plot_id, status) VALUES (?, ?)")
                .bind(plot_id)
                .bind(status.as_str())
                .execute(&mut *tx)
                .await
                .context("configure_plot: inserting slot failed")?;
        }

        tx.commit().await.context("configure_plot: commit failed")?;
        Ok(true)
    }

    pub async fn delete_plot(&self, plot_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM plots WHERE id = ?")
            .bind(plot_id)
            .execute(&self.pool)
            .await
            .context("delete_plot failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Sensor catalog
    // ----------------------------

    pub async fn insert_sensor(&self, plot_id: i64, code: &str, status: Status) -> Result<i64> {
        let res = sqlx::query("INSERT INTO sensors (code, status, plot_id) VALUES (?, ?, ?)")
            .bind(code)
            .bind(status.as_str())
            .bind(plot_id)
            .execute(&self.pool)
            .await
            .context("insert_sensor failed")?;
        Ok(res.last_insert_rowid())
    }

    /// `status` only seeds a new sensor; an existing one keeps its own.
    pub async fn upsert_sensor(&self, code: &str, plot_id: i64, status: Status) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (code, status, plot_id)
            VALUES (?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
              plot_id=excluded.plot_id
            "#,
        )
        .bind(code)
        .bind(status.as_str())
        .bind(plot_id)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>> {
        let row: Option<SensorRow> =
            sqlx::query_as("SELECT id, code, status, plot_id FROM sensors WHERE id = ?")
                .bind(sensor_id)
                .fetch_optional(&self.pool)
                .await
                .context("get_sensor failed")?;
        row.map(Sensor::try_from).transpose()
    }

    pub async fn set_sensor_status(&self, sensor_id: i64, status: Status) -> Result<bool> {
        let res = sqlx::query("UPDATE sensors SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("set_sensor_status failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn delete_sensor(&self, sensor_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM sensors WHERE id = ?")
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("delete_sensor failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Row hydration
    // ----------------------------

    /// Reads the sensor and slots inside `tx`, so they belong to the same
    /// snapshot as the plot row.
    async fn hydrate(tx: &mut sqlx::Transaction<'_, Sqlite>, r: PlotRow) -> Result<Plot> {
        let sensor: Option<SensorRow> =
            sqlx::query_as("SELECT id, code, status, plot_id FROM sensors WHERE plot_id = ?")
                .bind(r.id)
                .fetch_optional(&mut **tx)
                .await
                .context("loading plot sensor failed")?;

        let slots: Vec<SlotRow> =
            sqlx::query_as("SELECT id, status FROM slots WHERE plot_id = ? ORDER BY id")
                .bind(r.id)
                .fetch_all(&mut **tx)
                .await
                .context("loading plot slots failed")?;

        let crop_type = r
            .crop_type
            .as_deref()
            .map(CropType::from_str)
            .transpose()
            .with_context(|| format!("plot {} has a corrupt crop type", r.id))?;

        let slots = slots
            .into_iter()
            .map(|s| -> Result<Slot> {
                Ok(Slot {
                    id: s.id,
                    status: Status::from_str(&s.status)?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("plot {} has a corrupt slot status", r.id))?;

        Ok(Plot {
            id: r.id,
            code: r.code,
            length: r.length,
            width: r.width,
            crop_type,
            water_amount: r.water_amount,
            is_irrigated: r.is_irrigated,
            start_irrigation_time: r.start_irrigation_time.and_then(from_millis),
            last_irrigation_time: r.last_irrigation_time.and_then(from_millis),
            sensor_call_count: u32::try_from(r.sensor_call_count).unwrap_or(0),
            last_sensor_call_time: r.last_sensor_call_time.and_then(from_millis),
            has_alert: r.has_alert,
            sensor: sensor.map(Sensor::try_from).transpose()?,
            slots,
        })
    }

    /// Runs `sql` and hydrates every row, all in one read transaction.
    async fn fetch_plots(&self, sql: &str, plot_id: Option<i64>) -> Result<Vec<Plot>> {
        let mut tx = self.pool.begin().await.context("begin read failed")?;

        let mut query = sqlx::query_as::<_, PlotRow>(sql);
        if let Some(id) = plot_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&mut *tx).await.context("reading plots failed")?;

        let mut plots = Vec::with_capacity(rows.len());
        for r in rows {
            plots.push(Self::hydrate(&mut tx, r).await?);
        }
        tx.commit().await.context("end read failed")?;
        Ok(plots)
    }

    async fn set_slots(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        plot_id: i64,
        status: Status,
    ) -> Result<()> {
        sqlx::query("UPDATE slots SET status = ? WHERE plot_id = ?")
            .bind(status.as_str())
            .bind(plot_id)
            .execute(&mut **tx)
            .await
            .context("updating slot status failed")?;
        Ok(())
    }
}

#[async_trait]
impl PlotStore for Db {
    async fn load_plot(&self, plot_id: i64) -> Result<Option<Plot>> {
        let plots = self
            .fetch_plots(
                &format!("SELECT {PLOT_COLUMNS} FROM plots WHERE id = ?"),
                Some(plot_id),
            )
            .await
            .context("load_plot failed")?;
        Ok(plots.into_iter().next())
    }

    async fn mark_irrigating(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool> {
        let now_ms = to_millis(now);
        let mut tx = self.pool.begin().await.context("mark_irrigating: begin failed")?;

        let updated = sqlx::query(
            r#"
            UPDATE plots SET
              is_irrigated = 1,
              has_alert = 0,
              sensor_call_count = 0,
              last_sensor_call_time = NULL,
              start_irrigation_time = ?,
              last_irrigation_time = ?
            WHERE id = ? AND is_irrigated = 0
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(plot_id)
        .execute(&mut *tx)
        .await
        .context("mark_irrigating failed")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        Self::set_slots(&mut tx, plot_id, Status::Up).await?;
        tx.commit().await.context("mark_irrigating: commit failed")?;
        Ok(true)
    }

    async fn mark_idle(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("mark_idle: begin failed")?;

        let updated = sqlx::query(
            "UPDATE plots SET is_irrigated = 0, last_irrigation_time = ? \
             WHERE id = ? AND is_irrigated = 1",
        )
        .bind(to_millis(now))
        .bind(plot_id)
        .execute(&mut *tx)
        .await
        .context("mark_idle failed")?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        Self::set_slots(&mut tx, plot_id, Status::Down).await?;
        tx.commit().await.context("mark_idle: commit failed")?;
        Ok(true)
    }

    async fn record_attempt(
        &self,
        plot_id: i64,
        attempt: u32,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE plots SET sensor_call_count = ?, last_sensor_call_time = ? WHERE id = ?",
        )
        .bind(i64::from(attempt))
        .bind(to_millis(now))
        .bind(plot_id)
        .execute(&self.pool)
        .await
        .context("record_attempt failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn raise_alert(&self, plot_id: i64, attempts: u32) -> Result<bool> {
        let res = sqlx::query("UPDATE plots SET has_alert = 1, sensor_call_count = ? WHERE id = ?")
            .bind(i64::from(attempts))
            .bind(plot_id)
            .execute(&self.pool)
            .await
            .context("raise_alert failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_alerted(&self) -> Result<Vec<Plot>> {
        self.fetch_plots(
            &format!("SELECT {PLOT_COLUMNS} FROM plots WHERE has_alert = 1 ORDER BY id"),
            None,
        )
        .await
        .context("list_alerted failed")
    }

    async fn clear_alert(&self, plot_id: i64) -> Result<u64> {
        let res = sqlx::query("UPDATE plots SET has_alert = 0 WHERE id = ? AND has_alert = 1")
            .bind(plot_id)
            .execute(&self.pool)
            .await
            .context("clear_alert failed")?;
        Ok(res.rows_affected())
    }

    async fn acquire_lease(
        &self,
        plot_id: i64,
        owner: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<bool> {
        let now_ms = to_millis(now);
        let res = sqlx::query(
            r#"
            INSERT INTO campaign_leases (plot_id, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plot_id) DO UPDATE SET
              owner=excluded.owner,
              acquired_at=excluded.acquired_at,
              expires_at=excluded.expires_at
            WHERE campaign_leases.expires_at <= ?
            "#,
        )
        .bind(plot_id)
        .bind(owner)
        .bind(now_ms)
        .bind(now_ms.saturating_add(ttl_millis(ttl)))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("acquire_lease failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        plot_id: i64,
        owner: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<bool> {
        let res =
            sqlx::query("UPDATE campaign_leases SET expires_at = ? WHERE plot_id = ? AND owner = ?")
                .bind(to_millis(now).saturating_add(ttl_millis(ttl)))
                .bind(plot_id)
                .bind(owner)
                .execute(&self.pool)
                .await
                .context("renew_lease failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn release_lease(&self, plot_id: i64, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM campaign_leases WHERE plot_id = ? AND owner = ?")
            .bind(plot_id)
            .bind(owner)
            .execute(&self.pool)
            .await
            .context("release_lease failed")?;
        Ok(())
    }

    async fn live_lease(&self, plot_id: i64, now: OffsetDateTime) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT plot_id, owner, expires_at FROM campaign_leases \
             WHERE plot_id = ? AND expires_at > ?",
        )
        .bind(plot_id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .context("live_lease failed")?;

        Ok(row.and_then(|r| {
            from_millis(r.expires_at).map(|expires_at| Lease {
                plot_id: r.plot_id,
                owner: r.owner,
                expires_at,
            })
        }))
    }

    async fn release_foreign_leases(&self, owner_prefix: &str) -> Result<u64> {
        // substr rather than LIKE: owner strings are not escaped
        let res = sqlx::query(
            "DELETE FROM campaign_leases WHERE substr(owner, 1, length(?)) <> ?",
        )
        .bind(owner_prefix)
        .bind(owner_prefix)
        .execute(&self.pool)
        .await
        .context("release_foreign_leases failed")?;
        Ok(res.rows_affected())
    }

    async fn orphaned_campaigns(&self, now: OffsetDateTime) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT p.id
            FROM plots p
            LEFT JOIN campaign_leases l
              ON l.plot_id = p.id AND l.expires_at > ?
            WHERE p.sensor_call_count > 0
              AND p.has_alert = 0
              AND p.is_irrigated = 0
              AND l.plot_id IS NULL
            ORDER BY p.id
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .context("orphaned_campaigns failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
