use std::time::Duration;

use image_resize_common::config::KafkaConfig;
use image_resize_common::frame::ImageFrame;
use image_resize_common::topics;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::channel::{Advertise, ChannelCreationError, PublishError, Publisher};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Registers output channels as Kafka topics, one producer per channel.
pub struct KafkaAdvertiser {
    brokers: String,
    compression: String,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaAdvertiser {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .create()?;
        Ok(Self {
            brokers: config.brokers.clone(),
            compression: config.compression.clone(),
            admin,
        })
    }

    /// Create the topic backing a channel. An existing topic is accepted as
    /// is. Blocks on the admin request, so it must run off the async
    /// executor (e.g. inside `spawn_blocking`).
    fn ensure_topic(&self, topic: &str, latched: bool) -> Result<(), String> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| e.to_string())?;
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));
        let topic_config = new_topic(topic, latched);

        let results = runtime
            .block_on(self.admin.create_topics(&[topic_config], &options))
            .map_err(|e| e.to_string())?;

        for result in results {
            match result {
                Ok(name) => info!(topic = name, latched, "created kafka topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = name, "kafka topic already exists");
                }
                Err((name, code)) => return Err(format!("{name}: {code}")),
            }
        }
        Ok(())
    }

    fn publisher(&self, channel: &str, latched: bool) -> Result<KafkaPublisher, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.max.bytes", "10485760")
            .set("compression.type", &self.compression)
            .set("linger.ms", "5")
            .set("queue.buffering.max.messages", "1000")
            .set("request.timeout.ms", "5000")
            .create()?;

        Ok(KafkaPublisher {
            producer,
            channel: channel.to_string(),
            topic: topics::kafka_topic(channel),
            // With compaction a single key keeps exactly the latest frame.
            key: latched.then(|| channel.to_string()),
        })
    }
}

/// Single partition; replication left to the broker default. Latched
/// channels are compacted so the newest frame outlives retention.
fn new_topic(topic: &str, latched: bool) -> NewTopic<'_> {
    let topic_config = NewTopic::new(topic, 1, TopicReplication::Fixed(-1));
    if latched {
        topic_config.set("cleanup.policy", "compact")
    } else {
        topic_config
    }
}

impl Advertise<ImageFrame> for KafkaAdvertiser {
    type Handle = KafkaPublisher;

    fn advertise(
        &self,
        channel: &str,
        latched: bool,
    ) -> Result<KafkaPublisher, ChannelCreationError> {
        let creation_error = |reason: String| ChannelCreationError {
            channel: channel.to_string(),
            reason,
        };

        let publisher = self
            .publisher(channel, latched)
            .map_err(|e| creation_error(e.to_string()))?;
        self.ensure_topic(&publisher.topic, latched)
            .map_err(creation_error)?;

        debug!(channel, topic = publisher.topic, latched, "kafka channel ready");
        Ok(publisher)
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    channel: String,
    topic: String,
    key: Option<String>,
}

impl Publisher<ImageFrame> for KafkaPublisher {
    /// Enqueue the frame; delivery is confirmed in the background.
    /// Must be called from within a Tokio runtime.
    fn publish(&self, msg: &ImageFrame) -> Result<(), PublishError> {
        let payload = msg.serialize().map_err(|source| PublishError::Encode {
            channel: self.channel.clone(),
            source,
        })?;
        let mut record = FutureRecord::<str, [u8]>::to(&self.topic).payload(payload.as_slice());
        if let Some(key) = &self.key {
            record = record.key(key.as_str());
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| PublishError::Enqueue {
                channel: self.channel.clone(),
                reason: e.to_string(),
            })?;

        let topic = self.topic.clone();
        let seq = msg.seq;
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => {
                    warn!(error = %e, topic, seq, "failed to deliver resized frame");
                }
                Err(_) => {
                    warn!(topic, seq, "delivery of resized frame was canceled");
                }
            }
        });
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer
            .flush(timeout)
            .map_err(|e| PublishError::Flush {
                channel: self.channel.clone(),
                reason: e.to_string(),
            })
    }
}

/// Create a consumer subscribed to the Kafka topic backing `channel`.
pub fn create_consumer(config: &KafkaConfig, channel: &str) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .set("max.partition.fetch.bytes", "10485760")
        .create()?;

    let topic = topics::kafka_topic(channel);
    consumer.subscribe(&[topic.as_str()])?;
    Ok(consumer)
}
