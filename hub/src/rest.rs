use crate::aggregate::{aggregate, Bucket, Granularity};
use crate::consolidate::{consolidate, is_switch_series, Interval};
use crate::dispatch::{DeviceCommand, Dispatcher};
use crate::errors::Error;
use crate::ingest::{Ack, Ingestor};
use crate::model::{
    Action, Command, Device, DeviceKind, DeviceState, Room, Rule, RunStats, TelemetryKind,
    TelemetryRecord, Trigger,
};
use crate::projector::{project, ProjectedConfig};
use crate::rules::{FireOutcome, RuleEngine};
use crate::store::{RuleFilter, Store, TelemetryQuery};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<RuleEngine>,
    pub ingestor: Arc<Ingestor>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/esp/report/:room_id", post(report))
        .route("/api/esp-config/:room_id", get(esp_config))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/:id", get(get_room))
        .route("/api/devices", post(create_device))
        .route("/api/devices/:id", delete(delete_device))
        .route("/api/devices/:id/toggle", put(toggle_device))
        .route("/api/devices/:id/data", get(device_data))
        .route("/api/automatize", get(list_rules).post(create_rule))
        .route(
            "/api/automatize/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/automatize/:id/toggle", put(toggle_rule))
        .route("/api/automatize/:id/execute", post(execute_rule))
        .route("/api/automatize/:id/history", get(rule_history))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "time": Utc::now()}))
}

async fn report(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Ack>), AppError> {
    let ack = state.ingestor.report(room_id, &payload).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn esp_config(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<ProjectedConfig>, AppError> {
    let config = project(state.store.as_ref(), room_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Room {}", room_id)))?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
pub struct NewRoom {
    owner_id: Uuid,
    name: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    display_order: i32,
    #[serde(default = "default_true")]
    show_on_dashboard: bool,
}

fn default_true() -> bool {
    true
}

async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<NewRoom>,
) -> Result<(StatusCode, Json<Room>), AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("Room name is required".to_string()).into());
    }

    let room = Room {
        id: Uuid::new_v4(),
        owner_id: body.owner_id,
        name: name.to_string(),
        ip: body.ip,
        display_order: body.display_order,
        show_on_dashboard: body.show_on_dashboard,
    };
    state.store.insert_room(&room).await?;
    info!("Room {} ({}) registered", room.id, room.name);
    Ok((StatusCode::CREATED, Json(room)))
}

async fn get_room(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Room>, AppError> {
    let room = state
        .store
        .room(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Room {}", id)))?;
    Ok(Json(room))
}

#[derive(Debug, Deserialize)]
pub struct NewDevice {
    room_id: Uuid,
    owner_id: Uuid,
    name: String,
    kind: DeviceKind,
    pin: i32,
}

async fn create_device(
    State(state): State<AppState>,
    Json(body): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let room = state
        .store
        .room(body.room_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Room {}", body.room_id)))?;
    if room.owner_id != body.owner_id {
        return Err(Error::Forbidden(format!("Room {} belongs to another account", room.id)).into());
    }

    let device = Device {
        id: Uuid::new_v4(),
        room_id: room.id,
        owner_id: body.owner_id,
        name: body.name,
        kind: body.kind,
        pin: body.pin,
        state: DeviceState::default(),
    };
    state.store.insert_device(&device).await?;
    info!(
        "Device {} ({}) registered in room {}",
        device.id,
        device.kind.as_str(),
        room.id
    );
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    success: bool,
    device: Device,
    /// Outcome label of the controller command, `skipped` without an address.
    dispatch: String,
}

async fn toggle_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ToggleResponse>, AppError> {
    let mut device = state
        .store
        .device(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Device {}", id)))?;
    if !device.kind.is_switchable() {
        return Err(Error::Validation(format!(
            "Device {} of kind {} cannot be toggled",
            id,
            device.kind.as_str()
        ))
        .into());
    }

    device.state.on = !device.state.on;
    state.store.set_device_state(id, device.state).await?;

    let value = if device.state.on { "ENCENDIDO" } else { "APAGADO" };
    state
        .ingestor
        .enqueue(TelemetryRecord::new(id, TelemetryKind::State, value, ""))
        .await?;

    let address = state
        .store
        .room(device.room_id)
        .await?
        .and_then(|room| room.controller_address().map(str::to_string));
    let dispatch = match address {
        Some(address) => {
            let command = DeviceCommand {
                device_id: id,
                address,
                command: if device.state.on { Command::On } else { Command::Off },
                duration_secs: None,
            };
            state.dispatcher.dispatch(&command).await.label().to_string()
        }
        None => {
            warn!("Device {} has no reachable controller, state stored only", id);
            "skipped".to_string()
        }
    };

    Ok(Json(ToggleResponse {
        success: true,
        device,
        dispatch,
    }))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_device(id).await? {
        return Err(Error::NotFound(format!("Device {}", id)).into());
    }
    info!("Device {} deleted", id);
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
pub struct DataParams {
    kind: Option<String>,
    limit: Option<usize>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    aggregate: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DeviceData {
    Raw {
        data: Vec<TelemetryRecord>,
    },
    Intervals {
        window: String,
        data: Vec<Interval>,
    },
    Buckets {
        window: String,
        granularity: Granularity,
        data: Vec<Bucket>,
    },
}

fn window(token: &str) -> Result<Duration, Error> {
    match token {
        "24h" => Ok(Duration::hours(24)),
        "7d" => Ok(Duration::days(7)),
        "30d" => Ok(Duration::days(30)),
        other => Err(Error::Validation(format!(
            "Unknown aggregate window '{}', expected 24h, 7d or 30d",
            other
        ))),
    }
}

async fn device_data(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<DataParams>,
) -> Result<Json<DeviceData>, AppError> {
    let device = state
        .store
        .device(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Device {}", id)))?;
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<TelemetryKind>)
        .transpose()?;

    let mut query = TelemetryQuery::for_device(id);
    query.kind = kind;

    let Some(token) = params.aggregate else {
        query.start = params.from;
        query.end = params.to;
        query.limit = Some(
            params
                .limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .min(MAX_HISTORY_LIMIT),
        );
        let data = state.store.telemetry(&query).await?;
        return Ok(Json(DeviceData::Raw { data }));
    };

    let end = params.to.unwrap_or_else(Utc::now);
    let start = end - window(&token)?;
    query.start = Some(start);
    query.end = Some(end);
    query.ascending = true;
    let records = state.store.telemetry(&query).await?;

    let event_kind = match kind {
        Some(kind) => kind.is_event(),
        None => device.kind == DeviceKind::Actuator || is_event_device(device.kind),
    };
    // Analog readings under an event kind (LDR levels) are charted as numbers.
    let events = event_kind && is_switch_series(&records);
    let data = if events {
        DeviceData::Intervals {
            window: token,
            data: consolidate(&records),
        }
    } else {
        let granularity = Granularity::for_range(start, end);
        DeviceData::Buckets {
            window: token,
            granularity,
            data: aggregate(&records, granularity),
        }
    };
    Ok(Json(data))
}

fn is_event_device(kind: DeviceKind) -> bool {
    kind.sensor_category()
        .is_some_and(|category| category.telemetry_kind().is_event())
}

#[derive(Debug, Deserialize)]
pub struct RuleParams {
    owner_id: Option<Uuid>,
    active: Option<bool>,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(params): Query<RuleParams>,
) -> Result<Json<Vec<Rule>>, AppError> {
    let filter = RuleFilter {
        owner_id: params.owner_id,
        active: params.active,
    };
    Ok(Json(state.store.rules(&filter).await?))
}

#[derive(Debug, Deserialize)]
pub struct NewRule {
    owner_id: Uuid,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    active: bool,
    trigger: Trigger,
    actions: Vec<Action>,
}

impl NewRule {
    fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("Rule name is required".to_string()));
        }
        if self.actions.is_empty() {
            return Err(Error::Validation(
                "A rule needs at least one action".to_string(),
            ));
        }
        Ok(())
    }

    fn into_rule(self, id: Uuid, stats: RunStats, created_at: DateTime<Utc>) -> Rule {
        Rule {
            id,
            owner_id: self.owner_id,
            name: self.name.trim().to_string(),
            description: self.description,
            active: self.active,
            trigger: self.trigger,
            actions: self.actions,
            stats,
            created_at,
        }
    }
}

/// Every device a rule reads or drives must exist and belong to the rule's owner.
async fn check_ownership(store: &dyn Store, rule: &Rule) -> Result<(), Error> {
    let referenced: BTreeSet<Uuid> = rule
        .trigger_device()
        .into_iter()
        .chain(rule.actions.iter().map(|a| a.device_id))
        .collect();
    for device_id in referenced {
        let device = store
            .device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device {}", device_id)))?;
        if device.owner_id != rule.owner_id {
            return Err(Error::Forbidden(format!(
                "Device {} belongs to another account",
                device_id
            )));
        }
    }
    Ok(())
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>), AppError> {
    body.validate()?;
    let rule = body.into_rule(Uuid::new_v4(), RunStats::default(), Utc::now());
    check_ownership(state.store.as_ref(), &rule).await?;

    state.store.insert_rule(&rule).await?;
    info!("Rule {} ({}) created", rule.id, rule.name);
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NewRule>,
) -> Result<Json<Rule>, AppError> {
    body.validate()?;
    let existing = load_rule(state.store.as_ref(), id).await?;
    if body.owner_id != existing.owner_id {
        return Err(Error::Forbidden(format!("Rule {} belongs to another account", id)).into());
    }

    let rule = body.into_rule(id, existing.stats, existing.created_at);
    check_ownership(state.store.as_ref(), &rule).await?;

    if !state.store.update_rule(&rule).await? {
        return Err(Error::NotFound(format!("Rule {}", id)).into());
    }
    info!("Rule {} ({}) updated", rule.id, rule.name);
    Ok(Json(rule))
}

async fn load_rule(store: &dyn Store, id: Uuid) -> Result<Rule, Error> {
    store
        .rule(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Rule {}", id)))
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Rule>, AppError> {
    Ok(Json(load_rule(state.store.as_ref(), id).await?))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_rule(id).await? {
        return Err(Error::NotFound(format!("Rule {}", id)).into());
    }
    info!("Rule {} deleted", id);
    Ok(Json(json!({"success": true})))
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let active = state
        .store
        .toggle_rule(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Rule {}", id)))?;
    Ok(Json(json!({"id": id, "active": active})))
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    success: bool,
    outcome: FireOutcome,
}

async fn execute_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let rule = load_rule(state.store.as_ref(), id).await?;
    let outcome = state.engine.execute(&rule).await;
    Ok(Json(ExecuteResponse {
        success: outcome.success(),
        outcome,
    }))
}

async fn rule_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunStats>, AppError> {
    Ok(Json(load_rule(state.store.as_ref(), id).await?.stats))
}

pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(Error::Forbidden(_)) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        (
            status,
            Json(json!({"success": false, "message": self.0.to_string()})),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Comparator;
    use crate::testing::{action, sensor, Home};
    use tokio::sync::mpsc;

    fn app(home: &Home) -> (AppState, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(32);
        let engine = Arc::new(RuleEngine::new(
            home.store.clone(),
            home.dispatcher.clone(),
        ));
        let ingestor = Arc::new(Ingestor::new(home.store.clone(), engine.clone(), tx));
        let state = AppState {
            store: home.store.clone(),
            engine,
            ingestor,
            dispatcher: home.dispatcher.clone(),
        };
        (state, rx)
    }

    fn status<T>(result: Result<T, AppError>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::OK,
            Err(e) => e.into_response().status(),
        }
    }

    fn new_rule(owner_id: Uuid, trigger: Trigger, actions: Vec<Action>) -> NewRule {
        NewRule {
            owner_id,
            name: "Cool down".to_string(),
            description: String::new(),
            active: true,
            trigger,
            actions,
        }
    }

    #[tokio::test]
    async fn test_report_status_codes() {
        let home = Home::new();
        let room = home.room("Office", Some("10.0.0.8")).await;
        home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let (state, _rx) = app(&home);

        let (code, Json(ack)) = report(
            State(state.clone()),
            Path(room.id),
            Json(json!({"temp": 21.5})),
        )
        .await
        .map_err(|e| e.into_response().status())
        .unwrap();
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(ack.accepted, 1);

        let missing = report(
            State(state.clone()),
            Path(Uuid::new_v4()),
            Json(json!({"temp": 21.5})),
        )
        .await;
        assert_eq!(status(missing), StatusCode::NOT_FOUND);

        let not_object = report(State(state), Path(room.id), Json(json!("temp=21"))).await;
        assert_eq!(status(not_object), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_room_and_device() {
        let home = Home::new();
        let (state, _rx) = app(&home);

        let Ok((code, Json(room))) = create_room(
            State(state.clone()),
            Json(NewRoom {
                owner_id: home.owner,
                name: " Kitchen ".to_string(),
                ip: Some("IP: 192.168.1.50".to_string()),
                display_order: 2,
                show_on_dashboard: true,
            }),
        )
        .await
        else {
            panic!("room creation failed");
        };
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(room.name, "Kitchen");
        assert!(get_room(State(state.clone()), Path(room.id)).await.is_ok());

        let new_device = |owner_id| NewDevice {
            room_id: room.id,
            owner_id,
            name: "Fan".to_string(),
            kind: DeviceKind::Actuator,
            pin: 18,
        };
        let foreign = create_device(State(state.clone()), Json(new_device(Uuid::new_v4()))).await;
        assert_eq!(status(foreign), StatusCode::FORBIDDEN);

        let Ok((_, Json(device))) =
            create_device(State(state.clone()), Json(new_device(home.owner))).await
        else {
            panic!("device creation failed");
        };
        assert_eq!(home.store.devices_in_room(room.id).await.unwrap()[0].id, device.id);

        let Ok(Json(config)) = esp_config(State(state), Path(room.id)).await else {
            panic!("projection failed");
        };
        assert_eq!(config.ip.as_deref(), Some("192.168.1.50"));
    }

    #[tokio::test]
    async fn test_create_rule_enforces_ownership() {
        let home = Home::new();
        let room = home.room("Office", Some("10.0.0.8")).await;
        let thermo = home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let fan = home.device(&room, "Fan", DeviceKind::Actuator, 18).await;
        let (state, _rx) = app(&home);

        let foreign = create_rule(
            State(state.clone()),
            Json(new_rule(
                Uuid::new_v4(),
                sensor(&thermo, Comparator::Greater, 30.0),
                vec![action(&fan, Command::On)],
            )),
        )
        .await;
        assert_eq!(status(foreign), StatusCode::FORBIDDEN);

        let ghost = Action {
            device_id: Uuid::new_v4(),
            command: Command::On,
            delay_secs: 0,
            duration_secs: None,
        };
        let missing = create_rule(
            State(state.clone()),
            Json(new_rule(home.owner, Trigger::Manual, vec![ghost])),
        )
        .await;
        assert_eq!(status(missing), StatusCode::NOT_FOUND);

        let created = create_rule(
            State(state.clone()),
            Json(new_rule(
                home.owner,
                sensor(&thermo, Comparator::Greater, 30.0),
                vec![action(&fan, Command::On)],
            )),
        )
        .await;
        let Ok((code, Json(rule))) = created else {
            panic!("rule creation failed");
        };
        assert_eq!(code, StatusCode::CREATED);
        assert!(home.store.rule(rule.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_toggle_device_records_state_and_dispatches() {
        let home = Home::new();
        let room = home.room("Living", Some("10.0.0.2")).await;
        let lamp = home.device(&room, "Lamp", DeviceKind::Light, 4).await;
        let thermo = home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let (state, mut rx) = app(&home);

        let Ok(Json(toggled)) = toggle_device(State(state.clone()), Path(lamp.id)).await else {
            panic!("toggle failed");
        };
        assert!(toggled.device.state.on);
        assert_eq!(toggled.dispatch, "ok");

        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, TelemetryKind::State);
        assert_eq!(record.value, "ENCENDIDO");
        assert_eq!(home.dispatcher.sent()[0].command, Command::On);

        let sensor_toggle = toggle_device(State(state), Path(thermo.id)).await;
        assert_eq!(status(sensor_toggle), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_device_data_modes() {
        let home = Home::new();
        let room = home.room("Hall", None).await;
        let pir = home.device(&room, "PIR", DeviceKind::Motion, 27).await;
        let thermo = home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let now = Utc::now();
        let mut batch = Vec::new();
        for (i, value) in ["1", "1", "0"].iter().enumerate() {
            batch.push(
                TelemetryRecord::new(pir.id, TelemetryKind::Motion, *value, "")
                    .at(now - Duration::minutes(30 - i as i64)),
            );
        }
        for (i, value) in ["20", "22"].iter().enumerate() {
            batch.push(
                TelemetryRecord::new(thermo.id, TelemetryKind::Temperature, *value, "°C")
                    .at(now - Duration::minutes(10 - i as i64)),
            );
        }
        home.store.append_telemetry(&batch).await.unwrap();
        let (state, _rx) = app(&home);

        let params = |aggregate: Option<&str>| DataParams {
            kind: None,
            limit: None,
            from: None,
            to: None,
            aggregate: aggregate.map(str::to_string),
        };

        let Ok(Json(DeviceData::Intervals { data, .. })) =
            device_data(State(state.clone()), Path(pir.id), Query(params(Some("24h")))).await
        else {
            panic!("expected intervals");
        };
        assert_eq!(data.len(), 2);

        let Ok(Json(DeviceData::Buckets { data, .. })) =
            device_data(State(state.clone()), Path(thermo.id), Query(params(Some("24h")))).await
        else {
            panic!("expected buckets");
        };
        let count: usize = data.iter().map(|b| b.count).sum();
        assert_eq!(count, 2);

        let Ok(Json(DeviceData::Raw { data })) =
            device_data(State(state.clone()), Path(pir.id), Query(params(None))).await
        else {
            panic!("expected raw history");
        };
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].value, "0");

        let bad = device_data(State(state), Path(pir.id), Query(params(Some("1y")))).await;
        assert_eq!(status(bad), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analog_light_readings_chart_as_buckets() {
        let home = Home::new();
        let room = home.room("Study", Some("10.0.0.11")).await;
        let ldr = home.device(&room, "LDR", DeviceKind::Light, 32).await;
        let (state, mut rx) = app(&home);

        let ack = state
            .ingestor
            .ingest(room.id, &json!({"ldr": 2300}))
            .await
            .unwrap()
            .0;
        assert_eq!(ack.accepted, 1);
        let record = rx.recv().await.unwrap();
        home.store.append_telemetry(&[record]).await.unwrap();
        assert!(home.store.device(ldr.id).await.unwrap().unwrap().state.on);

        let params = DataParams {
            kind: None,
            limit: None,
            from: None,
            to: None,
            aggregate: Some("24h".to_string()),
        };
        let Ok(Json(DeviceData::Buckets { data, .. })) =
            device_data(State(state), Path(ldr.id), Query(params)).await
        else {
            panic!("expected numeric buckets for analog light readings");
        };
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].max, 2300.0);
    }

    #[tokio::test]
    async fn test_rule_lifecycle() {
        let home = Home::new();
        let room = home.room("Study", Some("10.0.0.11")).await;
        let lamp = home.device(&room, "Lamp", DeviceKind::Actuator, 23).await;
        let rule = home
            .rule(Trigger::Manual, vec![action(&lamp, Command::On)])
            .await;
        let (state, _rx) = app(&home);

        let Ok(Json(toggled)) = toggle_rule(State(state.clone()), Path(rule.id)).await else {
            panic!("toggle failed");
        };
        assert_eq!(toggled["active"], json!(false));

        let Ok(Json(executed)) = execute_rule(State(state.clone()), Path(rule.id)).await else {
            panic!("execute failed");
        };
        assert!(executed.success);

        let Ok(Json(stats)) = rule_history(State(state.clone()), Path(rule.id)).await else {
            panic!("history failed");
        };
        assert_eq!(stats.total_runs, 1);

        assert!(delete_rule(State(state.clone()), Path(rule.id)).await.is_ok());
        let gone = get_rule(State(state), Path(rule.id)).await;
        assert_eq!(status(gone), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_rule_keeps_stats_and_rechecks_ownership() {
        let home = Home::new();
        let room = home.room("Office", Some("10.0.0.8")).await;
        let thermo = home.device(&room, "DHT22", DeviceKind::Temperature, 15).await;
        let fan = home.device(&room, "Fan", DeviceKind::Actuator, 18).await;
        let lamp = home.device(&room, "Lamp", DeviceKind::Actuator, 23).await;
        let rule = home
            .rule(Trigger::Manual, vec![action(&fan, Command::On)])
            .await;
        let (state, _rx) = app(&home);
        assert!(state.engine.execute(&rule).await.success());

        let mut edit = new_rule(
            home.owner,
            sensor(&thermo, Comparator::Greater, 28.0),
            vec![action(&lamp, Command::Off)],
        );
        edit.name = " Evening ".to_string();
        let Ok(Json(updated)) =
            update_rule(State(state.clone()), Path(rule.id), Json(edit)).await
        else {
            panic!("update failed");
        };
        assert_eq!(updated.name, "Evening");
        assert_eq!(updated.created_at, rule.created_at);

        let stored = home.store.rule(rule.id).await.unwrap().unwrap();
        assert_eq!(stored.actions, vec![action(&lamp, Command::Off)]);
        assert_eq!(stored.trigger_device(), Some(thermo.id));
        assert_eq!(stored.stats.total_runs, 1);

        let missing_device = Device {
            id: Uuid::new_v4(),
            ..lamp.clone()
        };
        let missing = update_rule(
            State(state.clone()),
            Path(rule.id),
            Json(new_rule(
                home.owner,
                Trigger::Manual,
                vec![action(&missing_device, Command::On)],
            )),
        )
        .await;
        assert_eq!(status(missing), StatusCode::NOT_FOUND);

        let foreign = update_rule(
            State(state.clone()),
            Path(rule.id),
            Json(new_rule(Uuid::new_v4(), Trigger::Manual, vec![action(&fan, Command::On)])),
        )
        .await;
        assert_eq!(status(foreign), StatusCode::FORBIDDEN);

        let unknown = update_rule(
            State(state),
            Path(Uuid::new_v4()),
            Json(new_rule(home.owner, Trigger::Manual, vec![action(&fan, Command::On)])),
        )
        .await;
        assert_eq!(status(unknown), StatusCode::NOT_FOUND);

        let stored = home.store.rule(rule.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Evening");
    }

    #[tokio::test]
    async fn test_delete_device_keeps_telemetry_and_skips_rule_actions() {
        let home = Home::new();
        let room = home.room("Hall", Some("10.0.0.12")).await;
        let lamp = home.device(&room, "Lamp", DeviceKind::Actuator, 23).await;
        let rule = home
            .rule(Trigger::Manual, vec![action(&lamp, Command::On)])
            .await;
        home.store
            .append_telemetry(&[TelemetryRecord::new(
                lamp.id,
                TelemetryKind::State,
                "ENCENDIDO",
                "",
            )])
            .await
            .unwrap();
        let (state, _rx) = app(&home);

        let Ok(Json(body)) = delete_device(State(state.clone()), Path(lamp.id)).await else {
            panic!("delete failed");
        };
        assert_eq!(body["success"], json!(true));
        assert!(home.store.device(lamp.id).await.unwrap().is_none());

        let again = delete_device(State(state.clone()), Path(lamp.id)).await;
        assert_eq!(status(again), StatusCode::NOT_FOUND);

        let history = home
            .store
            .telemetry(&TelemetryQuery::for_device(lamp.id))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);

        let outcome = state.engine.execute(&rule).await;
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.sent, 0);
        assert!(home.dispatcher.sent().is_empty());
    }
}
