use crate::errors::Result;
use crate::model::{ClockTime, Device, DeviceKind, Room, Rule, Trigger};
use crate::store::{RuleFilter, Store};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedConfig {
    pub id: Uuid,
    pub name: String,
    pub ip: Option<String>,
    pub devices: Vec<ProjectedDevice>,
    pub rules: Vec<ProjectedRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedDevice {
    pub id: Uuid,
    pub name: String,
    pub pin: i32,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedRule {
    pub id: Uuid,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ProjectedCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ProjectedSchedule>,
    pub actions: Vec<ProjectedAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedCondition {
    pub device_id: Uuid,
    pub value: f64,
    /// `>`, `<`, `>=`, `<=`, `==` or `!=`
    pub operator: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedSchedule {
    pub start: ClockTime,
    pub days: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedAction {
    pub device_id: Uuid,
    /// `ON`, `OFF` or `TOGGLE`
    pub command: &'static str,
}

pub async fn project(store: &dyn Store, room_id: Uuid) -> Result<Option<ProjectedConfig>> {
    let Some(room) = store.room(room_id).await? else {
        return Ok(None);
    };
    let devices = store.devices_in_room(room_id).await?;
    let rules = store.rules(&RuleFilter::active()).await?;
    Ok(Some(project_room(&room, &devices, &rules)))
}

pub fn project_room(room: &Room, devices: &[Device], rules: &[Rule]) -> ProjectedConfig {
    let in_room: HashSet<Uuid> = devices.iter().map(|d| d.id).collect();

    ProjectedConfig {
        id: room.id,
        name: room.name.clone(),
        ip: room.controller_address().map(str::to_string),
        devices: devices
            .iter()
            .map(|d| ProjectedDevice {
                id: d.id,
                name: d.name.clone(),
                pin: d.pin,
                kind: d.kind,
            })
            .collect(),
        rules: rules
            .iter()
            .filter(|r| r.active && r.references_any(&in_room))
            .filter_map(project_rule)
            .collect(),
    }
}

fn project_rule(rule: &Rule) -> Option<ProjectedRule> {
    let (condition, schedule) = match &rule.trigger {
        Trigger::Manual => return None,
        Trigger::Sensor(sensor) => (
            Some(ProjectedCondition {
                device_id: sensor.device_id,
                value: sensor.value,
                operator: sensor.operator.symbol(),
            }),
            None,
        ),
        Trigger::Schedule(schedule) => (
            None,
            Some(ProjectedSchedule {
                start: schedule.start,
                days: schedule.days.clone(),
                duration_secs: schedule.duration_secs(),
            }),
        ),
    };

    Some(ProjectedRule {
        id: rule.id,
        active: rule.active,
        condition,
        schedule,
        actions: rule
            .actions
            .iter()
            .map(|a| ProjectedAction {
                device_id: a.device_id,
                command: a.command.token(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Comparator};
    use crate::testing::{action, schedule, sensor, Home};
    use serde_json::json;

    #[tokio::test]
    async fn test_projection_of_sensor_rule() {
        let home = Home::new();
        let room = home.room("Office", Some("IP: 192.168.1.30")).await;
        let thermo = home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let fan = home.device(&room, "Fan", DeviceKind::Actuator, 18).await;
        let rule = home
            .rule(
                sensor(&thermo, Comparator::Greater, 30.0),
                vec![action(&fan, Command::On)],
            )
            .await;

        let config = project(home.store.as_ref(), room.id).await.unwrap().unwrap();

        assert_eq!(config.ip.as_deref(), Some("192.168.1.30"));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.rules.len(), 1);
        let json = serde_json::to_value(&config.rules[0]).unwrap();
        assert_eq!(
            json,
            json!({
                "id": rule.id,
                "active": true,
                "condition": {"device_id": thermo.id, "value": 30.0, "operator": ">"},
                "actions": [{"device_id": fan.id, "command": "ON"}],
            })
        );
    }

    #[tokio::test]
    async fn test_projection_excludes_manual_inactive_and_foreign_rules() {
        let home = Home::new();
        let room = home.room("Living", Some("10.0.0.2")).await;
        let other = home.room("Garage", Some("10.0.0.3")).await;
        let lamp = home.device(&room, "Lamp", DeviceKind::Actuator, 4).await;
        let door = home.device(&other, "Door", DeviceKind::Actuator, 5).await;

        home.rule(Trigger::Manual, vec![action(&lamp, Command::Toggle)])
            .await;
        let inactive = home
            .rule(schedule("08:00", None), vec![action(&lamp, Command::Off)])
            .await;
        home.store.toggle_rule(inactive.id).await.unwrap();
        home.rule(schedule("09:00", None), vec![action(&door, Command::On)])
            .await;
        let kept = home
            .rule(
                schedule("22:00", Some("02:00")),
                vec![action(&lamp, Command::On)],
            )
            .await;

        let config = project(home.store.as_ref(), room.id).await.unwrap().unwrap();

        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].id, kept.id);
        let json = serde_json::to_value(&config.rules[0]).unwrap();
        assert_eq!(
            json["schedule"],
            json!({"start": "22:00", "days": [], "duration_secs": 14400})
        );
        assert!(json.get("condition").is_none());
    }

    #[tokio::test]
    async fn test_missing_room_is_none() {
        let home = Home::new();
        assert!(project(home.store.as_ref(), Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_empty_room_projects_empty_lists() {
        let room = Room {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "Empty".to_string(),
            ip: None,
            display_order: 0,
            show_on_dashboard: false,
        };
        let config = project_room(&room, &[], &[]);
        assert!(config.devices.is_empty());
        assert!(config.rules.is_empty());
        assert_eq!(config.ip, None);
    }
}
