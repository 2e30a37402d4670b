use super::{RuleFilter, Store, TelemetryQuery};
use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, DeviceState, Room, Rule, RunRecord, RunStats, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const RULE_COLUMNS: &str =
    "id, owner_id, name, description, active, trigger, actions, stats, created_at";

#[derive(sqlx::FromRow)]
struct RoomRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    ip: Option<String>,
    display_order: i32,
    show_on_dashboard: bool,
}

impl From<RoomRow> for Room {
    fn from(row: RoomRow) -> Self {
        Room {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            ip: row.ip,
            display_order: row.display_order,
            show_on_dashboard: row.show_on_dashboard,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: Uuid,
    room_id: Uuid,
    owner_id: Uuid,
    name: String,
    kind: String,
    pin: i32,
    state_on: bool,
    state_value: f64,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            id: row.id,
            room_id: row.room_id,
            owner_id: row.owner_id,
            name: row.name,
            kind: row.kind.parse()?,
            pin: row.pin,
            state: DeviceState {
                on: row.state_on,
                value: row.state_value,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct TelemetryRow {
    id: Uuid,
    device_id: Uuid,
    kind: String,
    value: String,
    unit: String,
    metadata: serde_json::Value,
    ts: DateTime<Utc>,
}

impl TryFrom<TelemetryRow> for TelemetryRecord {
    type Error = Error;

    fn try_from(row: TelemetryRow) -> Result<Self> {
        Ok(TelemetryRecord {
            id: row.id,
            device_id: row.device_id,
            kind: row.kind.parse()?,
            value: row.value,
            unit: row.unit,
            metadata: row.metadata,
            timestamp: row.ts,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    description: String,
    active: bool,
    trigger: serde_json::Value,
    actions: serde_json::Value,
    stats: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = Error;

    fn try_from(row: RuleRow) -> Result<Self> {
        Ok(Rule {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            description: row.description,
            active: row.active,
            trigger: serde_json::from_value(row.trigger)?,
            actions: serde_json::from_value(row.actions)?,
            stats: serde_json::from_value(row.stats).unwrap_or_default(),
            created_at: row.created_at,
        })
    }
}

/// Rows that fail to decode are logged and dropped instead of failing the whole read.
fn decode_rows<R, T>(rows: Vec<R>, what: &str) -> Vec<T>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping undecodable {} row: {}", what, e);
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }

    async fn insert_telemetry_inner(&self, batch: &[TelemetryRecord]) -> Result<()> {
        let ids: Vec<Uuid> = batch.iter().map(|t| t.id).collect();
        let device_ids: Vec<Uuid> = batch.iter().map(|t| t.device_id).collect();
        let kinds: Vec<&str> = batch.iter().map(|t| t.kind.as_str()).collect();
        let values: Vec<&str> = batch.iter().map(|t| t.value.as_str()).collect();
        let units: Vec<&str> = batch.iter().map(|t| t.unit.as_str()).collect();
        let metadata: Vec<String> = batch.iter().map(|t| t.metadata.to_string()).collect();
        let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|t| t.timestamp).collect();

        let query = r#"
            INSERT INTO telemetry (id, device_id, kind, value, unit, metadata, ts)
            SELECT id, device_id, kind, value, unit, metadata::jsonb, ts
            FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[], $6::text[], $7::timestamptz[])
                AS t(id, device_id, kind, value, unit, metadata, ts)
            ON CONFLICT (id) DO NOTHING
            "#;

        sqlx::query(query)
            .bind(&ids)
            .bind(&device_ids)
            .bind(&kinds)
            .bind(&values)
            .bind(&units)
            .bind(&metadata)
            .bind(&timestamps)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn room(&self, id: Uuid) -> Result<Option<Room>> {
        let row = sqlx::query_as::<_, RoomRow>(
            "SELECT id, owner_id, name, ip, display_order, show_on_dashboard FROM rooms WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Room::from))
    }

    async fn insert_room(&self, room: &Room) -> Result<()> {
        sqlx::query(
            "INSERT INTO rooms (id, owner_id, name, ip, display_order, show_on_dashboard)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(room.id)
        .bind(room.owner_id)
        .bind(&room.name)
        .bind(&room.ip)
        .bind(room.display_order)
        .bind(room.show_on_dashboard)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device(&self, id: Uuid) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, room_id, owner_id, name, kind, pin, state_on, state_value
             FROM devices WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn devices_in_room(&self, room_id: Uuid) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, room_id, owner_id, name, kind, pin, state_on, state_value
             FROM devices WHERE room_id = $1 ORDER BY pin, name",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows, "device"))
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (id, room_id, owner_id, name, kind, pin, state_on, state_value)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(device.id)
        .bind(device.room_id)
        .bind(device.owner_id)
        .bind(&device.name)
        .bind(device.kind.as_str())
        .bind(device.pin)
        .bind(device.state.on)
        .bind(device.state.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_device_state(&self, id: Uuid, state: DeviceState) -> Result<()> {
        sqlx::query("UPDATE devices SET state_on = $2, state_value = $3 WHERE id = $1")
            .bind(id)
            .bind(state.on)
            .bind(state.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_device(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_telemetry(&self, batch: &[TelemetryRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.insert_telemetry_inner(batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err)) => {
                    if attempts >= max_attempts || !is_transient_error(&db_err) {
                        error!(
                            "Telemetry insert failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Telemetry insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Telemetry insert failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>> {
        let mut conditions = vec!["device_id = $1".to_string()];
        let mut next_param = 2;

        if query.kind.is_some() {
            conditions.push(format!("kind = ${}", next_param));
            next_param += 1;
        }
        if query.start.is_some() {
            conditions.push(format!("ts >= ${}", next_param));
            next_param += 1;
        }
        if query.end.is_some() {
            conditions.push(format!("ts <= ${}", next_param));
        }

        let order = if query.ascending { "ASC" } else { "DESC" };
        let limit_clause = query
            .limit
            .map(|limit| format!("LIMIT {}", limit))
            .unwrap_or_default();

        let sql = format!(
            "SELECT id, device_id, kind, value, unit, metadata, ts
             FROM telemetry
             WHERE {}
             ORDER BY ts {}
             {}",
            conditions.join(" AND "),
            order,
            limit_clause
        );

        let mut query_builder = sqlx::query_as::<_, TelemetryRow>(&sql).bind(query.device_id);
        if let Some(kind) = query.kind {
            query_builder = query_builder.bind(kind.as_str());
        }
        if let Some(start) = query.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = query.end {
            query_builder = query_builder.bind(end);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(decode_rows(rows, "telemetry"))
    }

    async fn rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let sql = format!("SELECT {} FROM rules WHERE id = $1", RULE_COLUMNS);
        let row = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Rule::try_from).transpose()
    }

    async fn rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>> {
        let mut conditions = Vec::new();
        let mut next_param = 1;

        if filter.owner_id.is_some() {
            conditions.push(format!("owner_id = ${}", next_param));
            next_param += 1;
        }
        if filter.active.is_some() {
            conditions.push(format!("active = ${}", next_param));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM rules {} ORDER BY created_at DESC",
            RULE_COLUMNS, where_clause
        );

        let mut query_builder = sqlx::query_as::<_, RuleRow>(&sql);
        if let Some(owner_id) = filter.owner_id {
            query_builder = query_builder.bind(owner_id);
        }
        if let Some(active) = filter.active {
            query_builder = query_builder.bind(active);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(decode_rows(rows, "rule"))
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        sqlx::query(
            "INSERT INTO rules (id, owner_id, name, description, active, trigger, actions, stats, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(rule.id)
        .bind(rule.owner_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.active)
        .bind(Json(&rule.trigger))
        .bind(Json(&rule.actions))
        .bind(Json(&rule.stats))
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rules
             SET name = $2, description = $3, active = $4, trigger = $5, actions = $6
             WHERE id = $1",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.active)
        .bind(Json(&rule.trigger))
        .bind(Json(&rule.actions))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn toggle_rule(&self, id: Uuid) -> Result<Option<bool>> {
        let row: Option<(bool,)> =
            sqlx::query_as("UPDATE rules SET active = NOT active WHERE id = $1 RETURNING active")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(active,)| active))
    }

    async fn record_run(&self, id: Uuid, record: RunRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT stats FROM rules WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((stats,)) = row else {
            return Ok(());
        };

        let mut stats: RunStats = serde_json::from_value(stats).unwrap_or_default();
        stats.record(record);

        sqlx::query("UPDATE rules SET stats = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(&stats))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
