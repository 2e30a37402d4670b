mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::errors::Result;
use crate::model::{Device, DeviceState, Room, Rule, RunRecord, TelemetryKind, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TelemetryQuery {
    pub device_id: Uuid,
    pub kind: Option<TelemetryKind>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Oldest first when true, newest first otherwise.
    pub ascending: bool,
}

impl TelemetryQuery {
    pub fn for_device(device_id: Uuid) -> Self {
        Self {
            device_id,
            kind: None,
            start: None,
            end: None,
            limit: None,
            ascending: false,
        }
    }

    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        record.device_id == self.device_id
            && self.kind.map_or(true, |kind| record.kind == kind)
            && self.start.map_or(true, |start| record.timestamp >= start)
            && self.end.map_or(true, |end| record.timestamp <= end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub owner_id: Option<Uuid>,
    pub active: Option<bool>,
}

impl RuleFilter {
    pub fn active() -> Self {
        Self {
            owner_id: None,
            active: Some(true),
        }
    }

    pub fn matches(&self, rule: &Rule) -> bool {
        self.owner_id.map_or(true, |owner| rule.owner_id == owner)
            && self.active.map_or(true, |active| rule.active == active)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn room(&self, id: Uuid) -> Result<Option<Room>>;

    async fn insert_room(&self, room: &Room) -> Result<()>;

    async fn device(&self, id: Uuid) -> Result<Option<Device>>;

    async fn devices_in_room(&self, room_id: Uuid) -> Result<Vec<Device>>;

    async fn insert_device(&self, device: &Device) -> Result<()>;

    async fn set_device_state(&self, id: Uuid, state: DeviceState) -> Result<()>;

    /// Removes the device only. Its telemetry is kept.
    async fn delete_device(&self, id: Uuid) -> Result<bool>;

    async fn append_telemetry(&self, batch: &[TelemetryRecord]) -> Result<()>;

    async fn telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>>;

    async fn rule(&self, id: Uuid) -> Result<Option<Rule>>;

    /// Rules matching `filter`. Stored rules that no longer decode are skipped.
    async fn rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>>;

    async fn insert_rule(&self, rule: &Rule) -> Result<()>;

    /// Replaces the editable fields. Run stats are left as stored.
    async fn update_rule(&self, rule: &Rule) -> Result<bool>;

    async fn delete_rule(&self, id: Uuid) -> Result<bool>;

    /// Returns the new `active` flag, or `None` when the rule does not exist.
    async fn toggle_rule(&self, id: Uuid) -> Result<Option<bool>>;

    async fn record_run(&self, id: Uuid, record: RunRecord) -> Result<()>;
}
