use super::{RuleFilter, Store, TelemetryQuery};
use crate::errors::Result;
use crate::model::{Device, DeviceState, Room, Rule, RunRecord, TelemetryRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    rooms: HashMap<Uuid, Room>,
    devices: HashMap<Uuid, Device>,
    telemetry: Vec<TelemetryRecord>,
    rules: HashMap<Uuid, Rule>,
}

/// Process-local store, used for tests and for running without a database.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn room(&self, id: Uuid) -> Result<Option<Room>> {
        Ok(self.tables.read().await.rooms.get(&id).cloned())
    }

    async fn insert_room(&self, room: &Room) -> Result<()> {
        self.tables
            .write()
            .await
            .rooms
            .insert(room.id, room.clone());
        Ok(())
    }

    async fn device(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.tables.read().await.devices.get(&id).cloned())
    }

    async fn devices_in_room(&self, room_id: Uuid) -> Result<Vec<Device>> {
        let tables = self.tables.read().await;
        let mut devices: Vec<Device> = tables
            .devices
            .values()
            .filter(|d| d.room_id == room_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.pin.cmp(&b.pin).then_with(|| a.name.cmp(&b.name)));
        Ok(devices)
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.tables
            .write()
            .await
            .devices
            .insert(device.id, device.clone());
        Ok(())
    }

    async fn set_device_state(&self, id: Uuid, state: DeviceState) -> Result<()> {
        if let Some(device) = self.tables.write().await.devices.get_mut(&id) {
            device.state = state;
        }
        Ok(())
    }

    async fn delete_device(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().await.devices.remove(&id).is_some())
    }

    async fn append_telemetry(&self, batch: &[TelemetryRecord]) -> Result<()> {
        self.tables
            .write()
            .await
            .telemetry
            .extend_from_slice(batch);
        Ok(())
    }

    async fn telemetry(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<TelemetryRecord> = tables
            .telemetry
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();

        records.sort_by_key(|r| r.timestamp);
        if !query.ascending {
            records.reverse();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn rule(&self, id: Uuid) -> Result<Option<Rule>> {
        Ok(self.tables.read().await.rules.get(&id).cloned())
    }

    async fn rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<Rule> = tables
            .rules
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        self.tables
            .write()
            .await
            .rules
            .insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(stored) = tables.rules.get_mut(&rule.id) else {
            return Ok(false);
        };
        let stats = std::mem::take(&mut stored.stats);
        *stored = Rule {
            stats,
            ..rule.clone()
        };
        Ok(true)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().await.rules.remove(&id).is_some())
    }

    async fn toggle_rule(&self, id: Uuid) -> Result<Option<bool>> {
        let mut tables = self.tables.write().await;
        Ok(tables.rules.get_mut(&id).map(|rule| {
            rule.active = !rule.active;
            rule.active
        }))
    }

    async fn record_run(&self, id: Uuid, record: RunRecord) -> Result<()> {
        if let Some(rule) = self.tables.write().await.rules.get_mut(&id) {
            rule.stats.record(record);
        }
        Ok(())
    }
}
