mod report;

use clap::Parser;
use report::RoomSensors;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Publishes periodic room reports the way ESP32 controllers do.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Room ids to report for. Random ids are generated when omitted.
    #[arg(long, env = "ROOMS", value_delimiter = ',')]
    rooms: Vec<Uuid>,

    /// Number of random rooms when no ids are given.
    #[arg(long, env = "ROOM_COUNT", default_value_t = 3)]
    room_count: usize,

    /// Seconds between two reports of the same room.
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let rooms: Vec<Uuid> = if args.rooms.is_empty() {
        (0..args.room_count).map(|_| Uuid::new_v4()).collect()
    } else {
        args.rooms.clone()
    };

    info!("Starting ESP32 simulator");
    info!(
        "Broker: {}:{}, Rooms: {}, Interval: {}s",
        args.broker,
        args.port,
        rooms.len(),
        args.interval_secs
    );

    let client_id = format!("sim-{}", Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish reports");

    let mut rng = rand::thread_rng();
    let mut sensors: Vec<(Uuid, RoomSensors)> = rooms
        .into_iter()
        .map(|room| (room, RoomSensors::new(&mut rng)))
        .collect();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut published = 0u64;

    loop {
        ticker.tick().await;

        for (room, room_sensors) in sensors.iter_mut() {
            let report = room_sensors.sample(&mut rng);
            let payload = match serde_json::to_string(&report) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize report: {}", e);
                    continue;
                }
            };

            let topic = format!("esp/{}/report", room);
            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => published += 1,
                Err(e) => warn!("Failed to publish to {}: {}", topic, e),
            }
        }

        if published % 100 == 0 {
            info!("Published {} reports", published);
        }
    }
}
