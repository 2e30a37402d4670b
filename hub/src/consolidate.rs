use crate::model::TelemetryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TRUTHY_TOKENS: [&str; 5] = ["ON", "ENCENDIDO", "1", "TRUE", "ACTIVADA"];
const FALSY_TOKENS: [&str; 5] = ["OFF", "APAGADO", "0", "FALSE", "DESACTIVADA"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn from_raw(raw: &str) -> Self {
        if is_truthy(raw) {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

fn is_token(tokens: &[&str], raw: &str) -> bool {
    let raw = raw.trim();
    tokens.iter().any(|token| token.eq_ignore_ascii_case(raw))
}

pub fn is_truthy(raw: &str) -> bool {
    is_token(&TRUTHY_TOKENS, raw)
}

pub fn is_falsy(raw: &str) -> bool {
    is_token(&FALSY_TOKENS, raw)
}

/// True when every record holds an ON/OFF style token rather than an analog reading.
pub fn is_switch_series(records: &[TelemetryRecord]) -> bool {
    records
        .iter()
        .all(|r| is_truthy(&r.value) || is_falsy(&r.value))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(rename = "timestamp")]
    pub start: DateTime<Utc>,
    #[serde(rename = "timestamp_end")]
    pub end: DateTime<Utc>,
    #[serde(rename = "value")]
    pub state: PowerState,
    pub metadata: serde_json::Value,
}

/// Consolidates records already sorted by ascending timestamp.
///
/// Returns one interval per run of identical state, most recent first.
pub fn consolidate(records: &[TelemetryRecord]) -> Vec<Interval> {
    let mut intervals: Vec<Interval> = Vec::new();
    let mut current: Option<Interval> = None;

    for record in records {
        let state = PowerState::from_raw(&record.value);

        match current.as_mut() {
            Some(run) if run.state == state => {
                run.end = record.timestamp;
                run.metadata = record.metadata.clone();
            }
            _ => {
                if let Some(closed) = current.take() {
                    intervals.push(closed);
                }
                current = Some(Interval {
                    start: record.timestamp,
                    end: record.timestamp,
                    state,
                    metadata: record.metadata.clone(),
                });
            }
        }
    }

    if let Some(open) = current {
        intervals.push(open);
    }

    intervals.reverse();
    intervals
}
