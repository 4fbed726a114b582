//! In-process pub/sub bus used by tests in place of Kafka.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use image_resize_common::frame::ImageFrame;

use crate::channel::{Advertise, ChannelCreationError, PublishError, Publisher};

#[derive(Default)]
struct Topic {
    advertised: bool,
    latched: bool,
    last: Option<ImageFrame>,
    published: usize,
    publisher_threads: Vec<ThreadId>,
    subscribers: Vec<Sender<ImageFrame>>,
}

/// Cloning shares the same underlying bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    advertisements: Arc<Mutex<usize>>,
    refuse_advertise: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that rejects every advertisement.
    pub fn refusing() -> Self {
        Self {
            refuse_advertise: true,
            ..Self::default()
        }
    }

    /// Subscribe to `channel`. A latched channel immediately redelivers its
    /// most recent message.
    pub fn subscribe(&self, channel: &str) -> Receiver<ImageFrame> {
        let (tx, rx) = mpsc::channel();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let topic = topics.entry(channel.to_string()).or_default();
        if topic.latched {
            if let Some(last) = &topic.last {
                let _ = tx.send(last.clone());
            }
        }
        topic.subscribers.push(tx);
        rx
    }

    pub fn advertisements(&self) -> usize {
        *self
            .advertisements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn published(&self, channel: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, |t| t.published)
    }

    /// Threads each publish on `channel` ran on, in order.
    pub fn publisher_threads(&self, channel: &str) -> Vec<ThreadId> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or_else(Vec::new, |t| t.publisher_threads.clone())
    }

    fn deliver(&self, channel: &str, frame: &ImageFrame) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let topic = topics.entry(channel.to_string()).or_default();
        topic.published += 1;
        topic.publisher_threads.push(thread::current().id());
        topic.subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        if topic.latched {
            topic.last = Some(frame.clone());
        }
    }
}

pub struct MemoryPublisher {
    bus: MemoryBus,
    channel: String,
}

impl Publisher<ImageFrame> for MemoryPublisher {
    fn publish(&self, msg: &ImageFrame) -> Result<(), PublishError> {
        self.bus.deliver(&self.channel, msg);
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

impl Advertise<ImageFrame> for MemoryBus {
    type Handle = MemoryPublisher;

    fn advertise(
        &self,
        channel: &str,
        latched: bool,
    ) -> Result<MemoryPublisher, ChannelCreationError> {
        if self.refuse_advertise {
            return Err(ChannelCreationError {
                channel: channel.to_string(),
                reason: "bus refused advertisement".into(),
            });
        }

        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let topic = topics.entry(channel.to_string()).or_default();
        if topic.advertised {
            return Err(ChannelCreationError {
                channel: channel.to_string(),
                reason: "channel already advertised".into(),
            });
        }
        topic.advertised = true;
        topic.latched = latched;
        *self
            .advertisements
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;

        Ok(MemoryPublisher {
            bus: self.clone(),
            channel: channel.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_resize_common::frame::Encoding;

    fn frame(seq: u64) -> ImageFrame {
        let mut f = ImageFrame::packed(Encoding::Mono8, 1, 1, vec![7]);
        f.seq = seq;
        f
    }

    #[test]
    fn latched_channel_redelivers_last_message() {
        let bus = MemoryBus::new();
        let publisher = bus.advertise("/ns/out", true).unwrap();
        publisher.publish(&frame(1)).unwrap();
        publisher.publish(&frame(2)).unwrap();

        let late = bus.subscribe("/ns/out");
        assert_eq!(late.try_recv().unwrap().seq, 2);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn unlatched_channel_does_not_redeliver() {
        let bus = MemoryBus::new();
        let publisher = bus.advertise("/ns/out", false).unwrap();
        publisher.publish(&frame(1)).unwrap();
        assert!(bus.subscribe("/ns/out").try_recv().is_err());
    }

    #[test]
    fn duplicate_advertise_is_rejected() {
        let bus = MemoryBus::new();
        bus.advertise("/ns/out", true).unwrap();
        assert!(bus.advertise("/ns/out", true).is_err());
        assert_eq!(bus.advertisements(), 1);
    }
}
