use crate::dispatch::{DeviceCommand, DispatchResult, Dispatcher};
use crate::model::{
    Action, Command, Comparator, Device, DeviceKind, DeviceState, Room, Rule, RunStats,
    ScheduleTrigger, SensorTrigger, Trigger,
};
use crate::store::{MemoryStore, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Records every command and answers with a scripted result per address.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<DeviceCommand>>,
    results: Mutex<HashMap<String, DispatchResult>>,
}

impl RecordingDispatcher {
    pub fn answer(&self, address: &str, result: DispatchResult) {
        self.results
            .lock()
            .unwrap()
            .insert(address.to_string(), result);
    }

    pub fn sent(&self) -> Vec<DeviceCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, command: &DeviceCommand) -> DispatchResult {
        self.sent.lock().unwrap().push(command.clone());
        self.results
            .lock()
            .unwrap()
            .get(&command.address)
            .cloned()
            .unwrap_or(DispatchResult::Ok)
    }
}

/// An in-memory home belonging to a single account.
pub struct Home {
    pub owner: Uuid,
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl Home {
    pub fn new() -> Self {
        Self {
            owner: Uuid::new_v4(),
            store: Arc::new(MemoryStore::new()),
            dispatcher: Arc::new(RecordingDispatcher::default()),
        }
    }

    pub async fn room(&self, name: &str, ip: Option<&str>) -> Room {
        let room = Room {
            id: Uuid::new_v4(),
            owner_id: self.owner,
            name: name.to_string(),
            ip: ip.map(str::to_string),
            display_order: 0,
            show_on_dashboard: true,
        };
        self.store.insert_room(&room).await.unwrap();
        room
    }

    pub async fn device(&self, room: &Room, name: &str, kind: DeviceKind, pin: i32) -> Device {
        let device = Device {
            id: Uuid::new_v4(),
            room_id: room.id,
            owner_id: self.owner,
            name: name.to_string(),
            kind,
            pin,
            state: DeviceState::default(),
        };
        self.store.insert_device(&device).await.unwrap();
        device
    }

    pub async fn rule(&self, trigger: Trigger, actions: Vec<Action>) -> Rule {
        let rule = Rule {
            id: Uuid::new_v4(),
            owner_id: self.owner,
            name: "rule".to_string(),
            description: String::new(),
            active: true,
            trigger,
            actions,
            stats: RunStats::default(),
            created_at: Utc::now(),
        };
        self.store.insert_rule(&rule).await.unwrap();
        rule
    }
}

pub fn schedule(start: &str, end: Option<&str>) -> Trigger {
    Trigger::Schedule(ScheduleTrigger {
        days: vec![],
        start: start.parse().unwrap(),
        end: end.map(|e| e.parse().unwrap()),
    })
}

pub fn sensor(device: &Device, operator: Comparator, value: f64) -> Trigger {
    Trigger::Sensor(SensorTrigger {
        device_id: device.id,
        category: None,
        operator,
        value,
    })
}

pub fn action(device: &Device, command: Command) -> Action {
    Action {
        device_id: device.id,
        command,
        delay_secs: 0,
        duration_secs: None,
    }
}
