mod channel;
mod dispatch;
mod kafka;
#[cfg(test)]
mod memory;
mod resize;

use dispatch::LatestSlot;
use futures_util::StreamExt;
use image_resize_common::config::Config;
use image_resize_common::frame::ImageFrame;
use image_resize_common::topics;
use kafka::KafkaAdvertiser;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::Message;
use resize::ResizeNode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load_or_default(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let input = topics::input_channel();
    info!(
        brokers = config.kafka.brokers,
        group_id = config.kafka.group_id,
        input,
        output = topics::qualify(topics::ROOT_NAMESPACE, topics::OUTPUT_CHANNEL),
        "starting image-resize node"
    );

    let consumer = match kafka::create_consumer(&config.kafka, &input) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, topic = topics::kafka_topic(&input), "failed to subscribe to input");
            std::process::exit(1);
        }
    };

    let advertiser = match KafkaAdvertiser::new(&config.kafka) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "failed to create Kafka admin client");
            std::process::exit(1);
        }
    };
    let node = Arc::new(ResizeNode::new(advertiser));
    let slot = Arc::new(LatestSlot::new());

    let mut worker = tokio::spawn({
        let slot = Arc::clone(&slot);
        let node = Arc::clone(&node);
        async move { dispatch::run_worker(&slot, &node).await }
    });

    info!("ready");

    tokio::select! {
        _ = run_consumer_loop(consumer, &slot) => {
            warn!("input stream ended");
        }
        result = &mut worker => {
            match result {
                Ok(Err(e)) => error!(error = %e, "output channel unavailable, shutting down"),
                Ok(Ok(processed)) => info!(processed, "worker finished"),
                Err(e) => error!(error = %e, "worker task failed"),
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // Let the frame in flight (and any pending one) finish before flushing.
    slot.close();
    match worker.await {
        Ok(Ok(processed)) => info!(processed, "worker drained"),
        Ok(Err(e)) => error!(error = %e, "worker stopped with error"),
        Err(e) => error!(error = %e, "worker task failed"),
    }

    if node.channels().is_empty() {
        warn!("no frame was published before shutdown");
        return;
    }

    let flushed = tokio::task::spawn_blocking({
        let node = Arc::clone(&node);
        move || node.channels().flush_all(FLUSH_TIMEOUT)
    })
    .await;
    match flushed {
        Ok(Ok(())) => info!(channels = node.channels().len(), "stopped"),
        Ok(Err(e)) => warn!(error = %e, "stopped with undelivered frames"),
        Err(e) => error!(error = %e, "flush task failed"),
    }
}

/// Move frames from Kafka into the depth-1 slot. Undecodable payloads are
/// dropped here and never reach the transform.
async fn run_consumer_loop(consumer: StreamConsumer, slot: &LatestSlot<ImageFrame>) {
    let mut stream = consumer.stream();
    let mut total: u64 = 0;
    let mut replaced: u64 = 0;

    while let Some(result) = stream.next().await {
        match result {
            Ok(msg) => {
                let payload = match msg.payload() {
                    Some(p) => p,
                    None => {
                        debug!("empty Kafka message, skipping");
                        continue;
                    }
                };

                let frame = match ImageFrame::deserialize(payload) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "failed to deserialize frame, skipping");
                        continue;
                    }
                };

                total += 1;
                if slot.put(frame).is_some() {
                    replaced += 1;
                }
                if total % 100 == 0 {
                    debug!(total, replaced, "frames received");
                }
            }
            Err(e) => {
                warn!(error = %e, "Kafka consume error");
            }
        }
    }
}
