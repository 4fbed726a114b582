use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use image_resize_common::frame::FrameError;
use image_resize_common::topics;
use tracing::{debug, info, warn};

/// Something a message of type `M` can be published to.
pub trait Publisher<M>: Send + Sync {
    /// Hand `msg` to the transport. Does not wait for delivery.
    fn publish(&self, msg: &M) -> Result<(), PublishError>;

    /// Fully-qualified channel this handle is bound to.
    fn channel(&self) -> &str;

    /// Block until queued messages are delivered or `timeout` passes.
    fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Transport-side registration of new output channels.
pub trait Advertise<M>: Send + Sync {
    type Handle: Publisher<M>;

    /// Register `channel` with the transport. A latched channel redelivers its
    /// most recent message to subscribers that join later.
    fn advertise(&self, channel: &str, latched: bool)
        -> Result<Self::Handle, ChannelCreationError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create output channel {channel}: {reason}")]
pub struct ChannelCreationError {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode message for {channel}: {source}")]
    Encode {
        channel: String,
        #[source]
        source: FrameError,
    },
    #[error("failed to enqueue message on {channel}: {reason}")]
    Enqueue { channel: String, reason: String },
    #[error("failed to flush {channel}: {reason}")]
    Flush { channel: String, reason: String },
}

/// Lazily created output channels, one per logical name.
///
/// Owned by the node; handles live as long as the cache does. Each name maps
/// to exactly one handle, even when several threads resolve a new name at the
/// same time.
pub struct ChannelCache<A, M>
where
    A: Advertise<M>,
{
    namespace: String,
    advertiser: A,
    channels: Mutex<HashMap<String, Arc<A::Handle>>>,
    _marker: PhantomData<fn(&M)>,
}

impl<A, M> ChannelCache<A, M>
where
    A: Advertise<M>,
{
    pub fn new(namespace: impl Into<String>, advertiser: A) -> Self {
        Self {
            namespace: namespace.into(),
            advertiser,
            channels: Mutex::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    /// Return the handle for `name`, advertising `/<namespace>/<name>` on
    /// first use. A failed advertisement leaves the cache unchanged.
    pub fn resolve(&self, name: &str) -> Result<Arc<A::Handle>, ChannelCreationError> {
        debug_assert!(!name.is_empty(), "channel name must not be empty");

        // The lock spans lookup and creation so a name is advertised once.
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = channels.get(name) {
            return Ok(Arc::clone(handle));
        }

        let channel = topics::qualify(&self.namespace, name);
        let handle = Arc::new(self.advertiser.advertise(&channel, true)?);
        info!(name, channel, "advertised output channel");
        channels.insert(name.to_string(), Arc::clone(&handle));
        debug!(cached = channels.len(), "channel cache updated");
        Ok(handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Flush every cached handle. All handles are attempted; the first
    /// failure is returned.
    pub fn flush_all(&self, timeout: Duration) -> Result<(), PublishError> {
        let handles: Vec<Arc<A::Handle>> = self.lock().values().cloned().collect();
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = handle.flush(timeout) {
                warn!(error = %e, channel = handle.channel(), "flush failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<A::Handle>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
