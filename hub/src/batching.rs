use crate::metrics::{BATCH_SIZE, INGEST_LATENCY_SECONDS};
use crate::model::TelemetryRecord;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

const MAX_RETRIES: u32 = 3;

/// Drains the telemetry channel into the store, flushing on size or interval.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<TelemetryRecord>,
    store: Arc<dyn Store>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<TelemetryRecord> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(store: &dyn Store, buffer: &mut Vec<TelemetryRecord>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} records", batch_len);
    BATCH_SIZE.set(batch_len as f64);
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.append_telemetry(buffer).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!(
                        "Batch written after {} attempts in {:.3}s",
                        attempt, elapsed
                    );
                } else {
                    debug!("Batch written in {:.3}s", elapsed);
                }
                break;
            }
            Err(e) if attempt >= MAX_RETRIES => {
                error!(
                    "Failed to write batch after {} attempts, dropping {} records: {}",
                    MAX_RETRIES, batch_len, e
                );
                break;
            }
            Err(e) => {
                // 100ms, 200ms, 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to write batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }

    buffer.clear();
    BATCH_SIZE.set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TelemetryKind;
    use crate::store::{MemoryStore, TelemetryQuery};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_batcher_flushes_on_size_and_close() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_batcher(rx, store.clone(), 2, 60_000));
        let device = Uuid::new_v4();

        for i in 0..3 {
            tx.send(TelemetryRecord::new(
                device,
                TelemetryKind::Temperature,
                format!("2{}", i),
                "°C",
            ))
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let stored = store
            .telemetry(&TelemetryQuery::for_device(device))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_batcher_flushes_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_batcher(rx, store.clone(), 100, 20));
        let device = Uuid::new_v4();

        tx.send(TelemetryRecord::new(device, TelemetryKind::Light, "1", ""))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = store
            .telemetry(&TelemetryQuery::for_device(device))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}
