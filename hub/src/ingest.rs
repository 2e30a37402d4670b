use crate::consolidate::{is_falsy, is_truthy};
use crate::errors::{Error, Result};
use crate::metrics::{
    CHANNEL_FULL_TOTAL, READINGS_ACCEPTED_TOTAL, READINGS_SKIPPED_TOTAL, REPORTS_TOTAL,
};
use crate::model::{Device, DeviceState, SensorCategory, TelemetryRecord};
use crate::rules::{Readings, RuleEngine};
use crate::store::Store;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub accepted: usize,
    pub skipped: usize,
}

/// Numeric reading for one report entry, or `None` when it is malformed.
pub fn coerce_reading(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<f64>() {
                return v.is_finite().then_some(v);
            }
            if is_truthy(s) {
                Some(1.0)
            } else if is_falsy(s) {
                Some(0.0)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    engine: Arc<RuleEngine>,
    tx: mpsc::Sender<TelemetryRecord>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<RuleEngine>,
        tx: mpsc::Sender<TelemetryRecord>,
    ) -> Self {
        Self { store, engine, tx }
    }

    pub async fn report(&self, room_id: Uuid, payload: &Value) -> Result<Ack> {
        REPORTS_TOTAL.inc();
        let (ack, readings) = self.ingest(room_id, payload).await?;

        if !readings.is_empty() {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Err(e) = engine.evaluate_report(room_id, &readings).await {
                    error!("Rule evaluation for room {} failed: {}", room_id, e);
                }
            });
        }
        Ok(ack)
    }

    pub async fn ingest(&self, room_id: Uuid, payload: &Value) -> Result<(Ack, Readings)> {
        let Value::Object(entries) = payload else {
            return Err(Error::Validation(
                "Report body must be a JSON object".to_string(),
            ));
        };
        if self.store.room(room_id).await?.is_none() {
            return Err(Error::NotFound(format!("Room {}", room_id)));
        }
        let devices = self.store.devices_in_room(room_id).await?;

        let mut ack = Ack::default();
        let mut readings = Readings::new();
        for (key, raw) in entries {
            let Some(category) = SensorCategory::from_report_key(key) else {
                debug!("Room {} reported unknown key '{}', skipping", room_id, key);
                ack.skipped += 1;
                continue;
            };
            let Some(reading) = coerce_reading(raw) else {
                warn!(
                    "Room {} reported malformed value {} for '{}', skipping",
                    room_id, raw, key
                );
                ack.skipped += 1;
                continue;
            };
            readings.insert(category, reading);

            let Some(device) = devices
                .iter()
                .find(|d| d.kind == category.device_kind())
            else {
                debug!(
                    "Room {} has no {} device for '{}', skipping",
                    room_id,
                    category.device_kind().as_str(),
                    key
                );
                ack.skipped += 1;
                continue;
            };

            if let Err(e) = self.record(device, category, reading).await {
                warn!(
                    "Failed to record '{}' for device {}: {}",
                    key, device.id, e
                );
                ack.skipped += 1;
                continue;
            }
            ack.accepted += 1;
        }

        READINGS_ACCEPTED_TOTAL.inc_by(ack.accepted as f64);
        READINGS_SKIPPED_TOTAL.inc_by(ack.skipped as f64);
        Ok((ack, readings))
    }

    async fn record(&self, device: &Device, category: SensorCategory, reading: f64) -> Result<()> {
        let record = TelemetryRecord::new(
            device.id,
            category.telemetry_kind(),
            reading.to_string(),
            category.unit(),
        );
        self.enqueue(record).await?;

        let on = match category {
            SensorCategory::Motion | SensorCategory::Light => reading != 0.0,
            _ => device.state.on,
        };
        let state = DeviceState { on, value: reading };
        if let Err(e) = self.store.set_device_state(device.id, state).await {
            warn!("Failed to update state of device {}: {}", device.id, e);
        }
        Ok(())
    }

    /// Hands a record to the batching writer, waiting only when the channel is full.
    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<()> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Channel full, using blocking send");
                self.tx.send(record).await.map_err(|_| Error::ChannelSend)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Channel closed, cannot send telemetry");
                Err(Error::ChannelSend)
            }
        }
    }
}
