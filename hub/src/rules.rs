use crate::dispatch::{DeviceCommand, DispatchResult, Dispatcher};
use crate::errors::Result;
use crate::metrics::RULES_FIRED_TOTAL;
use crate::model::{Action, Device, DeviceState, Rule, RunRecord, SensorCategory, SensorTrigger, Trigger};
use crate::store::{RuleFilter, Store};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type Readings = HashMap<SensorCategory, f64>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    pub fired: Vec<Uuid>,
    pub dispatched: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl EvaluationSummary {
    fn absorb(&mut self, rule_id: Uuid, outcome: &FireOutcome) {
        self.fired.push(rule_id);
        self.dispatched += outcome.sent;
        self.failed += outcome.failed;
        self.skipped += outcome.skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FireOutcome {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub delayed: usize,
}

impl FireOutcome {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    fn message(&self, reason: &str) -> String {
        format!(
            "{}: {} sent, {} failed, {} skipped, {} delayed",
            reason, self.sent, self.failed, self.skipped, self.delayed
        )
    }
}

struct Delivery {
    command: DeviceCommand,
    state: DeviceState,
}

pub struct RuleEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Fires every active sensor rule whose trigger device sits in `room_id`
    /// and whose condition holds for `readings`.
    pub async fn evaluate_report(
        &self,
        room_id: Uuid,
        readings: &Readings,
    ) -> Result<EvaluationSummary> {
        let devices: HashMap<Uuid, Device> = self
            .store
            .devices_in_room(room_id)
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let rules = self.store.rules(&RuleFilter::active()).await?;

        let mut summary = EvaluationSummary::default();
        for rule in &rules {
            let Trigger::Sensor(trigger) = &rule.trigger else {
                continue;
            };
            let Some(device) = devices.get(&trigger.device_id) else {
                continue;
            };

            match sensor_condition(trigger, device, readings) {
                Condition::Unresolvable => {
                    warn!(
                        "Rule {} has no resolvable sensor category for device {}, skipping",
                        rule.id, device.id
                    );
                    summary.skipped += 1;
                }
                Condition::NoReading => {}
                Condition::Evaluated(false) => summary.evaluated += 1,
                Condition::Evaluated(true) => {
                    summary.evaluated += 1;
                    let outcome = self.fire(rule, None, "sensor").await;
                    summary.absorb(rule.id, &outcome);
                }
            }
        }

        debug!("Report for room {} evaluated: {:?}", room_id, summary);
        Ok(summary)
    }

    /// Fires every active schedule rule starting exactly at `minute_of_day`
    /// on `weekday` (0 = Sunday).
    pub async fn evaluate_schedules(
        &self,
        minute_of_day: u16,
        weekday: u8,
    ) -> Result<EvaluationSummary> {
        let rules = self.store.rules(&RuleFilter::active()).await?;

        let mut summary = EvaluationSummary::default();
        for rule in &rules {
            let Trigger::Schedule(schedule) = &rule.trigger else {
                continue;
            };
            summary.evaluated += 1;
            if !schedule.matches(minute_of_day, weekday) {
                continue;
            }

            let outcome = self.fire(rule, schedule.duration_secs(), "schedule").await;
            summary.absorb(rule.id, &outcome);
        }

        if !summary.fired.is_empty() {
            info!(
                "Schedule tick {:02}:{:02} fired {} rule(s)",
                minute_of_day / 60,
                minute_of_day % 60,
                summary.fired.len()
            );
        }
        Ok(summary)
    }

    pub async fn execute(&self, rule: &Rule) -> FireOutcome {
        let duration = match &rule.trigger {
            Trigger::Schedule(schedule) => schedule.duration_secs(),
            Trigger::Sensor(_) | Trigger::Manual => None,
        };
        self.fire(rule, duration, "manual").await
    }

    async fn fire(&self, rule: &Rule, duration: Option<u64>, reason: &str) -> FireOutcome {
        RULES_FIRED_TOTAL.inc();
        let mut outcome = FireOutcome::default();

        for action in &rule.actions {
            let Some(delivery) = self.resolve(rule, action, duration).await else {
                outcome.skipped += 1;
                continue;
            };

            if action.delay_secs > 0 {
                outcome.delayed += 1;
                let store = Arc::clone(&self.store);
                let dispatcher = Arc::clone(&self.dispatcher);
                let delay = Duration::from_secs(action.delay_secs);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver(store.as_ref(), dispatcher.as_ref(), &delivery).await;
                });
                continue;
            }

            if deliver(self.store.as_ref(), self.dispatcher.as_ref(), &delivery)
                .await
                .is_ok()
            {
                outcome.sent += 1;
            } else {
                outcome.failed += 1;
            }
        }

        let record = RunRecord {
            at: Utc::now(),
            success: outcome.success(),
            message: outcome.message(reason),
        };
        info!("Rule {} ({}) fired, {}", rule.id, rule.name, record.message);
        if let Err(e) = self.store.record_run(rule.id, record).await {
            warn!("Failed to record run of rule {}: {}", rule.id, e);
        }

        outcome
    }

    /// Finds the controller that owns the action's target. `None` skips the action.
    async fn resolve(
        &self,
        rule: &Rule,
        action: &Action,
        duration: Option<u64>,
    ) -> Option<Delivery> {
        let device = match self.store.device(action.device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(
                    "Rule {} targets missing device {}, skipping action",
                    rule.id, action.device_id
                );
                return None;
            }
            Err(e) => {
                warn!("Failed to load device {}: {}", action.device_id, e);
                return None;
            }
        };

        if device.owner_id != rule.owner_id {
            warn!(
                "Rule {} targets device {} of another account, skipping action",
                rule.id, device.id
            );
            return None;
        }

        let room = match self.store.room(device.room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                warn!("Device {} belongs to missing room {}", device.id, device.room_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to load room {}: {}", device.room_id, e);
                return None;
            }
        };

        let Some(address) = room.controller_address() else {
            warn!(
                "Room {} has no controller address, cannot reach device {}",
                room.id, device.id
            );
            return None;
        };

        Some(Delivery {
            command: DeviceCommand {
                device_id: device.id,
                address: address.to_string(),
                command: action.command,
                duration_secs: duration.or(action.duration_secs),
            },
            state: device.state,
        })
    }
}

async fn deliver(store: &dyn Store, dispatcher: &dyn Dispatcher, delivery: &Delivery) -> DispatchResult {
    let result = dispatcher.dispatch(&delivery.command).await;

    if let (true, Some(on)) = (result.is_ok(), delivery.command.command.power()) {
        let state = DeviceState {
            on,
            ..delivery.state
        };
        if let Err(e) = store.set_device_state(delivery.command.device_id, state).await {
            warn!(
                "Failed to store state of device {}: {}",
                delivery.command.device_id, e
            );
        }
    }
    result
}

enum Condition {
    Unresolvable,
    NoReading,
    Evaluated(bool),
}

fn sensor_condition(trigger: &SensorTrigger, device: &Device, readings: &Readings) -> Condition {
    let Some(category) = trigger.category.or_else(|| device.kind.sensor_category()) else {
        return Condition::Unresolvable;
    };
    match readings.get(&category) {
        Some(reading) => Condition::Evaluated(trigger.operator.evaluate(*reading, trigger.value)),
        None => Condition::NoReading,
    }
}
