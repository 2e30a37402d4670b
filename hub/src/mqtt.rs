use crate::errors::{Error, Result};
use crate::ingest::{Ack, Ingestor};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REPORT_TOPIC: &str = "esp/+/report";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    ingestor: Arc<Ingestor>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(REPORT_TOPIC, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", REPORT_TOPIC);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received report on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                match process_message_with_retry(&publish.topic, &publish.payload, &ingestor).await
                {
                    Ok(ack) => debug!(
                        "Report on {} accepted={} skipped={}",
                        publish.topic, ack.accepted, ack.skipped
                    ),
                    Err(e) => error!("Failed to process report on {}: {}", publish.topic, e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Room id carried in the middle segment of `esp/{room_id}/report`.
fn room_from_topic(topic: &str) -> Result<Uuid> {
    let mut segments = topic.split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("esp"), Some(room), Some("report"), None) => Uuid::parse_str(room)
            .map_err(|e| Error::Validation(format!("Bad room id '{}' in topic: {}", room, e))),
        _ => Err(Error::Validation(format!("Unexpected topic '{}'", topic))),
    }
}

async fn process_message_with_retry(
    topic: &str,
    payload: &[u8],
    ingestor: &Ingestor,
) -> Result<Ack> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(topic, payload, ingestor).await {
            Ok(ack) => {
                if attempt > 1 {
                    info!("Report processed on attempt {}", attempt);
                }
                return Ok(ack);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }
                if !is_retryable_error(&e) {
                    warn!("Non-retryable error: {}", e);
                    return Err(e);
                }

                warn!(
                    "Report processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

async fn process_message(topic: &str, payload: &[u8], ingestor: &Ingestor) -> Result<Ack> {
    let room_id = room_from_topic(topic)?;
    let report: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
    ingestor.report(room_id, &report).await
}

fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::ChannelSend | Error::Database(_) => true,
        Error::Validation(_)
        | Error::NotFound(_)
        | Error::Forbidden(_)
        | Error::Mqtt(_)
        | Error::Json(_)
        | Error::Migration(_)
        | Error::HttpClient(_) => false,
    }
}
