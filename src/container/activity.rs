//! Idle deadline and open-stream accounting.
//!
//! Every request that reaches the worker process renews the idle deadline.
//! Bodies that stay attached to the process hold a [`StreamGuard`]; while any
//! guard is alive idle shutdown is vetoed, and releasing the last one
//! restarts the idle clock.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;

/// Smallest step a renewal moves the deadline forward.
const MIN_RENEW_STEP: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct ActivityTracker {
    sleep_after: Mutex<Duration>,
    deadline: Mutex<Instant>,
    open_streams: AtomicUsize,
}

impl ActivityTracker {
    pub fn new(sleep_after: Duration) -> Self {
        Self {
            sleep_after: Mutex::new(sleep_after),
            deadline: Mutex::new(Instant::now() + sleep_after),
            open_streams: AtomicUsize::new(0),
        }
    }

    pub fn sleep_after(&self) -> Duration {
        *self.sleep_after.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a new idle timeout and renew the deadline against it.
    pub fn set_sleep_after(&self, sleep_after: Duration) -> Instant {
        *self.sleep_after.lock().unwrap_or_else(|e| e.into_inner()) = sleep_after;
        self.renew()
    }

    /// Push the idle deadline out to `now + sleep_after`. The deadline always
    /// moves strictly forward, even when called twice within the same instant.
    pub fn renew(&self) -> Instant {
        let sleep_after = self.sleep_after();
        let mut deadline = self.deadline.lock().unwrap_or_else(|e| e.into_inner());
        let candidate = Instant::now() + sleep_after;
        *deadline = candidate.max(*deadline + MIN_RENEW_STEP);
        *deadline
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Register a stream attached to the process.
    pub fn open_stream(self: &Arc<Self>) -> StreamGuard {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        self.renew();
        StreamGuard {
            tracker: Arc::clone(self),
        }
    }

    fn close_stream(&self) {
        // Saturating: the counter never goes below zero.
        let _ = self
            .open_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.renew();
    }
}

/// Keeps one stream counted as open until dropped.
#[derive(Debug)]
pub struct StreamGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.tracker.close_stream();
    }
}

/// A body stream that holds a [`StreamGuard`] until it finishes, errors or
/// is dropped (cancelled).
pub struct TrackedStream<S> {
    inner: S,
    guard: Option<StreamGuard>,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, guard: StreamGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<S, T, E> Stream for TrackedStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => {
                self.guard.take();
            }
            _ => {}
        }
        polled
    }
}
