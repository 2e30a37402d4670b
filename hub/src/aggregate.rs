use crate::model::{TelemetryKind, TelemetryRecord};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    /// Hourly buckets for ranges up to a day, daily buckets beyond.
    pub fn for_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if end - start <= Duration::hours(24) {
            Granularity::Hour
        } else {
            Granularity::Day
        }
    }

    fn bucket_start(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        };
        timestamp.duration_trunc(step).unwrap_or(timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub period: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

struct Accumulator {
    first: DateTime<Utc>,
    sum: f64,
    min: f64,
    max: f64,
    count: usize,
}

pub fn coerce(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Groups records into calendar buckets, ascending, skipping values that do not coerce.
pub fn aggregate(records: &[TelemetryRecord], granularity: Granularity) -> Vec<Bucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = BTreeMap::new();

    for record in records {
        if record.kind == TelemetryKind::State {
            continue;
        }
        let Some(value) = coerce(&record.value) else {
            continue;
        };

        let acc = buckets
            .entry(granularity.bucket_start(record.timestamp))
            .or_insert(Accumulator {
                first: record.timestamp,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                count: 0,
            });
        acc.first = acc.first.min(record.timestamp);
        acc.sum += value;
        acc.min = acc.min.min(value);
        acc.max = acc.max.max(value);
        acc.count += 1;
    }

    buckets
        .into_iter()
        .map(|(period, acc)| Bucket {
            period,
            timestamp: acc.first,
            avg: round2(acc.sum / acc.count as f64),
            min: round2(acc.min),
            max: round2(acc.max),
            count: acc.count,
        })
        .collect()
}
