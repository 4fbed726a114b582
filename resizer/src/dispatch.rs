use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use image_resize_common::frame::ImageFrame;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::channel::Advertise;
use crate::resize::{ResizeNode, TransformError};

/// A queue of depth one: a newer value replaces one that was not taken yet.
pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the pending value it displaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        let displaced = self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value);
        self.notify.notify_one();
        displaced
    }

    /// No more values will be put. Pending values can still be taken.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait for the next value. Returns `None` once closed and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(v) = value.take() {
                    return Some(v);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Feed frames from `slot` through `node` one at a time.
///
/// The transform is CPU-bound and runs on the blocking pool. Per-frame errors
/// are logged and skipped. Returns the number of published frames once the
/// slot is closed, or the first fatal error.
pub async fn run_worker<A>(
    slot: &LatestSlot<ImageFrame>,
    node: &Arc<ResizeNode<A>>,
) -> Result<u64, TransformError>
where
    A: Advertise<ImageFrame> + 'static,
{
    let mut processed: u64 = 0;

    while let Some(frame) = slot.take().await {
        let node = Arc::clone(node);
        let joined = tokio::task::spawn_blocking(move || {
            let result = node.on_frame(&frame);
            (frame, result)
        })
        .await;

        let (frame, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "resize task failed");
                continue;
            }
        };

        match result {
            Ok(()) => {
                processed += 1;
                if processed % 100 == 0 {
                    let lag_ms = Utc::now().timestamp_millis() - frame.stamp_ms;
                    debug!(processed, lag_ms, "frames resized");
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, seq = frame.seq, encoding = frame.encoding, "skipping frame");
            }
        }
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use image_resize_common::frame::Encoding;

    fn frame(seq: u64) -> ImageFrame {
        let mut f = ImageFrame::packed(Encoding::Mono8, 4, 4, vec![9; 16]);
        f.seq = seq;
        f
    }

    #[test]
    fn put_displaces_pending_value() {
        let slot = LatestSlot::new();
        assert!(slot.put(1).is_none());
        assert_eq!(slot.put(2), Some(1));
    }

    #[tokio::test]
    async fn take_returns_newest_then_none_after_close() {
        let slot = LatestSlot::new();
        slot.put("old");
        slot.put("new");
        slot.close();
        assert_eq!(slot.take().await, Some("new"));
        assert_eq!(slot.take().await, None);
    }

    #[tokio::test]
    async fn take_wakes_on_put_from_another_task() {
        let slot = Arc::new(LatestSlot::new());
        let producer = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.put(5u32);
        });
        assert_eq!(slot.take().await, Some(5));
    }

    #[tokio::test]
    async fn worker_only_sees_latest_pending_frame() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("/wide_stereo/resize");
        let node = Arc::new(ResizeNode::new(bus.clone()));
        let slot = LatestSlot::new();

        slot.put(frame(1));
        slot.put(frame(2));
        slot.put(frame(3));
        slot.close();

        let processed = run_worker(&slot, &node).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 3);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn worker_skips_bad_frames_and_continues() {
        let bus = MemoryBus::new();
        let node = Arc::new(ResizeNode::new(bus.clone()));
        let slot = LatestSlot::new();

        let mut bad = frame(1);
        bad.encoding = "yuv422".into();
        slot.put(bad);
        let worker = run_worker(&slot, &node);

        tokio::pin!(worker);
        tokio::select! {
            _ = &mut worker => panic!("worker exited early"),
            _ = tokio::task::yield_now() => {}
        }
        slot.put(frame(2));
        slot.close();

        assert_eq!(worker.await.unwrap(), 1);
        assert_eq!(bus.published("/wide_stereo/resize"), 1);
    }

    #[tokio::test]
    async fn worker_stops_on_fatal_error() {
        let node = Arc::new(ResizeNode::new(MemoryBus::refusing()));
        let slot = LatestSlot::new();
        slot.put(frame(1));
        // not closed: only a fatal error can end the worker here
        let err = run_worker(&slot, &node).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn transform_runs_off_the_async_worker() {
        let bus = MemoryBus::new();
        let node = Arc::new(ResizeNode::new(bus.clone()));
        let slot = LatestSlot::new();

        slot.put(frame(1));
        slot.close();
        run_worker(&slot, &node).await.unwrap();

        let threads = bus.publisher_threads("/wide_stereo/resize");
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }
}
