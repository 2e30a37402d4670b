use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const HISTORY_LIMIT: usize = 50;

const MINUTES_PER_DAY: i32 = 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub show_on_dashboard: bool,
}

fn default_true() -> bool {
    true
}

impl Room {
    /// Network address of the room's controller, without the legacy `IP: ` prefix.
    pub fn controller_address(&self) -> Option<&str> {
        let raw = self.ip.as_deref()?.trim();
        let raw = raw.strip_prefix("IP:").map(str::trim).unwrap_or(raw);
        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Actuator,
    Camera,
    Gas,
    Humidity,
    Light,
    Motion,
    Temperature,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Actuator => "actuator",
            DeviceKind::Camera => "camera",
            DeviceKind::Gas => "gas",
            DeviceKind::Humidity => "humidity",
            DeviceKind::Light => "light",
            DeviceKind::Motion => "motion",
            DeviceKind::Temperature => "temperature",
        }
    }

    pub fn sensor_category(self) -> Option<SensorCategory> {
        match self {
            DeviceKind::Temperature => Some(SensorCategory::Temperature),
            DeviceKind::Humidity => Some(SensorCategory::Humidity),
            DeviceKind::Light => Some(SensorCategory::Light),
            DeviceKind::Motion => Some(SensorCategory::Motion),
            DeviceKind::Gas => Some(SensorCategory::Gas),
            DeviceKind::Actuator | DeviceKind::Camera => None,
        }
    }

    pub fn is_switchable(self) -> bool {
        matches!(self, DeviceKind::Light | DeviceKind::Actuator)
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "actuator" => Ok(DeviceKind::Actuator),
            "camera" => Ok(DeviceKind::Camera),
            "gas" => Ok(DeviceKind::Gas),
            "humidity" => Ok(DeviceKind::Humidity),
            "light" => Ok(DeviceKind::Light),
            "motion" => Ok(DeviceKind::Motion),
            "temperature" => Ok(DeviceKind::Temperature),
            other => Err(Error::Validation(format!("Unknown device kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub on: bool,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub room_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub kind: DeviceKind,
    pub pin: i32,
    #[serde(default)]
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorCategory {
    Temperature,
    Humidity,
    Light,
    Motion,
    Gas,
}

impl SensorCategory {
    /// Canonical mapping from the raw keys controllers put in their reports.
    pub fn from_report_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "temp" | "temperature" => Some(SensorCategory::Temperature),
            "hum" | "humidity" => Some(SensorCategory::Humidity),
            "ldr" | "light" => Some(SensorCategory::Light),
            "pir" | "motion" => Some(SensorCategory::Motion),
            "mq2" | "gas" => Some(SensorCategory::Gas),
            _ => None,
        }
    }

    pub fn device_kind(self) -> DeviceKind {
        match self {
            SensorCategory::Temperature => DeviceKind::Temperature,
            SensorCategory::Humidity => DeviceKind::Humidity,
            SensorCategory::Light => DeviceKind::Light,
            SensorCategory::Motion => DeviceKind::Motion,
            SensorCategory::Gas => DeviceKind::Gas,
        }
    }

    pub fn telemetry_kind(self) -> TelemetryKind {
        match self {
            SensorCategory::Temperature => TelemetryKind::Temperature,
            SensorCategory::Humidity => TelemetryKind::Humidity,
            SensorCategory::Light => TelemetryKind::Light,
            SensorCategory::Motion => TelemetryKind::Motion,
            SensorCategory::Gas => TelemetryKind::Gas,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SensorCategory::Temperature => "°C",
            SensorCategory::Humidity => "%",
            SensorCategory::Gas => "ppm",
            SensorCategory::Light | SensorCategory::Motion => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Temperature,
    Humidity,
    Motion,
    Light,
    Gas,
    Energy,
    State,
    Other,
}

impl TelemetryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Temperature => "temperature",
            TelemetryKind::Humidity => "humidity",
            TelemetryKind::Motion => "motion",
            TelemetryKind::Light => "light",
            TelemetryKind::Gas => "gas",
            TelemetryKind::Energy => "energy",
            TelemetryKind::State => "state",
            TelemetryKind::Other => "other",
        }
    }

    pub fn is_event(self) -> bool {
        matches!(
            self,
            TelemetryKind::Motion | TelemetryKind::Light | TelemetryKind::State
        )
    }
}

impl FromStr for TelemetryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(TelemetryKind::Temperature),
            "humidity" => Ok(TelemetryKind::Humidity),
            "motion" => Ok(TelemetryKind::Motion),
            "light" => Ok(TelemetryKind::Light),
            "gas" => Ok(TelemetryKind::Gas),
            "energy" => Ok(TelemetryKind::Energy),
            "state" => Ok(TelemetryKind::State),
            "other" => Ok(TelemetryKind::Other),
            other => Err(Error::Validation(format!(
                "Unknown telemetry kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub kind: TelemetryKind,
    pub value: String,
    pub unit: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(
        device_id: Uuid,
        kind: TelemetryKind,
        value: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            kind,
            value: value.into(),
            unit: unit.into(),
            metadata: serde_json::json!({}),
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
    minute_of_day: u16,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self {
                minute_of_day: hour as u16 * 60 + minute as u16,
            })
        } else {
            None
        }
    }

    pub fn minute_of_day(self) -> u16 {
        self.minute_of_day
    }

    /// Seconds from `self` to `end`, wrapping past midnight when `end` is earlier.
    pub fn seconds_until(self, end: ClockTime) -> u64 {
        let diff = (end.minute_of_day as i32 - self.minute_of_day as i32)
            .rem_euclid(MINUTES_PER_DAY);
        diff as u64 * 60
    }
}

impl FromStr for ClockTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Validation(format!("Invalid time '{}', expected HH:MM", s));
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        ClockTime::new(hour, minute).ok_or_else(invalid)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockTime> for String {
    fn from(time: ClockTime) -> Self {
        time.to_string()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}",
            self.minute_of_day / 60,
            self.minute_of_day % 60
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    #[serde(alias = "==")]
    Equal,
    #[serde(alias = "!=")]
    NotEqual,
    #[serde(alias = ">")]
    Greater,
    #[serde(alias = "<")]
    Less,
    #[serde(alias = ">=")]
    GreaterOrEqual,
    #[serde(alias = "<=")]
    LessOrEqual,
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
            Comparator::Greater => ">",
            Comparator::Less => "<",
            Comparator::GreaterOrEqual => ">=",
            Comparator::LessOrEqual => "<=",
        }
    }

    pub fn evaluate(self, reading: f64, threshold: f64) -> bool {
        match self {
            Comparator::Equal => (reading - threshold).abs() < f64::EPSILON,
            Comparator::NotEqual => (reading - threshold).abs() >= f64::EPSILON,
            Comparator::Greater => reading > threshold,
            Comparator::Less => reading < threshold,
            Comparator::GreaterOrEqual => reading >= threshold,
            Comparator::LessOrEqual => reading <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    On,
    Off,
    Toggle,
}

impl Command {
    pub fn token(self) -> &'static str {
        match self {
            Command::On => "ON",
            Command::Off => "OFF",
            Command::Toggle => "TOGGLE",
        }
    }

    pub fn power(self) -> Option<bool> {
        match self {
            Command::On => Some(true),
            Command::Off => Some(false),
            Command::Toggle => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// 0 = Sunday .. 6 = Saturday; empty means every day.
    #[serde(default)]
    pub days: Vec<u8>,
    pub start: ClockTime,
    #[serde(default)]
    pub end: Option<ClockTime>,
}

impl ScheduleTrigger {
    pub fn runs_on(&self, weekday: u8) -> bool {
        self.days.is_empty() || self.days.contains(&weekday)
    }

    pub fn matches(&self, minute_of_day: u16, weekday: u8) -> bool {
        self.start.minute_of_day() == minute_of_day && self.runs_on(weekday)
    }

    pub fn duration_secs(&self) -> Option<u64> {
        self.end
            .map(|end| self.start.seconds_until(end))
            .filter(|secs| *secs > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorTrigger {
    pub device_id: Uuid,
    #[serde(default)]
    pub category: Option<SensorCategory>,
    pub operator: Comparator,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Schedule(ScheduleTrigger),
    Sensor(SensorTrigger),
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub device_id: Uuid,
    pub command: Command,
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub total_failures: u64,
    pub history: Vec<RunRecord>,
}

impl RunStats {
    pub fn record(&mut self, record: RunRecord) {
        self.last_run = Some(record.at);
        self.total_runs += 1;
        if record.success {
            self.last_success = Some(record.at);
        } else {
            self.total_failures += 1;
        }

        self.history.push(record);
        if self.history.len() > HISTORY_LIMIT {
            let overflow = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub active: bool,
    pub trigger: Trigger,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub stats: RunStats,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn trigger_device(&self) -> Option<Uuid> {
        match &self.trigger {
            Trigger::Sensor(sensor) => Some(sensor.device_id),
            Trigger::Schedule(_) | Trigger::Manual => None,
        }
    }

    pub fn references_any(&self, devices: &HashSet<Uuid>) -> bool {
        self.trigger_device()
            .is_some_and(|device| devices.contains(&device))
            || self
                .actions
                .iter()
                .any(|action| devices.contains(&action.device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: &str, end: Option<&str>) -> ScheduleTrigger {
        ScheduleTrigger {
            days: vec![],
            start: start.parse().unwrap(),
            end: end.map(|e| e.parse().unwrap()),
        }
    }

    #[test]
    fn test_clock_time_parse_and_display() {
        let time: ClockTime = "07:05".parse().unwrap();
        assert_eq!(time.minute_of_day(), 425);
        assert_eq!(time.to_string(), "07:05");

        assert!("24:00".parse::<ClockTime>().is_err());
        assert!("12:60".parse::<ClockTime>().is_err());
        assert!("noon".parse::<ClockTime>().is_err());
    }

    #[test]
    fn test_duration_wraps_midnight() {
        assert_eq!(schedule("22:00", Some("02:00")).duration_secs(), Some(14400));
        assert_eq!(schedule("08:00", Some("08:30")).duration_secs(), Some(1800));
        assert_eq!(schedule("08:00", Some("08:00")).duration_secs(), None);
        assert_eq!(schedule("08:00", None).duration_secs(), None);
    }

    #[test]
    fn test_schedule_days_filter() {
        let mut trigger = schedule("14:00", None);
        assert!(trigger.matches(14 * 60, 0));

        trigger.days = vec![1];
        assert!(trigger.matches(14 * 60, 1));
        assert!(!trigger.matches(14 * 60, 0));
        assert!(!trigger.matches(14 * 60 + 1, 1));
    }

    #[test]
    fn test_comparator_accepts_symbols() {
        let op: Comparator = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(op, Comparator::GreaterOrEqual);
        let op: Comparator = serde_json::from_str("\"not_equal\"").unwrap();
        assert_eq!(op, Comparator::NotEqual);

        assert!(Comparator::Greater.evaluate(31.0, 30.0));
        assert!(!Comparator::Greater.evaluate(29.0, 30.0));
        assert!(Comparator::Equal.evaluate(1.0, 1.0));
        assert!(Comparator::LessOrEqual.evaluate(30.0, 30.0));
    }

    #[test]
    fn test_history_is_capped() {
        let mut stats = RunStats::default();
        for i in 0..(HISTORY_LIMIT + 5) {
            stats.record(RunRecord {
                at: Utc::now(),
                success: i % 2 == 0,
                message: format!("run {}", i),
            });
        }

        assert_eq!(stats.history.len(), HISTORY_LIMIT);
        assert_eq!(stats.history[0].message, "run 5");
        assert_eq!(stats.total_runs, (HISTORY_LIMIT + 5) as u64);
        assert_eq!(stats.total_failures, 27);
    }

    #[test]
    fn test_report_key_mapping() {
        assert_eq!(
            SensorCategory::from_report_key("TEMP"),
            Some(SensorCategory::Temperature)
        );
        assert_eq!(
            SensorCategory::from_report_key("mq2"),
            Some(SensorCategory::Gas)
        );
        assert_eq!(SensorCategory::from_report_key("battery"), None);
    }

    #[test]
    fn test_controller_address_strips_prefix() {
        let mut room = Room {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "Kitchen".to_string(),
            ip: Some("IP: 192.168.1.40".to_string()),
            display_order: 0,
            show_on_dashboard: true,
        };
        assert_eq!(room.controller_address(), Some("192.168.1.40"));

        room.ip = Some("   ".to_string());
        assert_eq!(room.controller_address(), None);
    }

    #[test]
    fn test_trigger_round_trips_tagged() {
        let json = serde_json::json!({
            "type": "sensor",
            "device_id": Uuid::nil(),
            "operator": ">",
            "value": 30.0
        });
        let trigger: Trigger = serde_json::from_value(json).unwrap();
        match trigger {
            Trigger::Sensor(sensor) => {
                assert_eq!(sensor.operator, Comparator::Greater);
                assert_eq!(sensor.category, None);
            }
            other => panic!("unexpected trigger {:?}", other),
        }
    }
}
