//! Per-session event channels.
//!
//! Each session gets one broadcast channel; every subscriber holds its own
//! receiver, so delivery is per-subscription in publication order with no
//! replay of earlier events. A subscriber that lags past the channel
//! capacity loses its oldest events; the loss is counted, never hidden
//! behind a closed stream. Dropping a session's sender ends every
//! subscriber stream, which is how terminal session transitions cancel
//! subscriptions.

use crate::{constants::EVENT_CHANNEL_CAPACITY, models::CollaborationEvent};
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, Stream};
use tracing::{debug, warn};

struct SessionChannel {
    tx: broadcast::Sender<CollaborationEvent>,
    dropped: Arc<AtomicU64>,
}

pub struct EventBus {
    channels: Mutex<HashMap<String, SessionChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the channel for a session if it does not exist yet.
    pub async fn open_channel(&self, session_id: &str) {
        let mut channels = self.channels.lock().await;
        channels.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            SessionChannel {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            }
        });
    }

    /// Publishes an event to the session's subscribers. Events for sessions
    /// without an open channel (terminated, or never started) are dropped
    /// silently; a send with no live receivers is not an error.
    pub async fn publish(&self, event: CollaborationEvent) {
        let channels = self.channels.lock().await;
        if let Some(channel) = channels.get(event.session_id()) {
            let _ = channel.tx.send(event);
        }
    }

    /// New subscription for a session, or `None` when the session has no
    /// open channel (it terminated before the subscribe).
    pub async fn subscribe(&self, session_id: &str) -> Option<EventStream> {
        let channels = self.channels.lock().await;
        channels.get(session_id).map(|channel| EventStream {
            inner: BroadcastStream::new(channel.tx.subscribe()),
            dropped: channel.dropped.clone(),
        })
    }

    /// Closes the session's channel, ending every subscriber stream.
    pub async fn close_channel(&self, session_id: &str) {
        let mut channels = self.channels.lock().await;
        if channels.remove(session_id).is_some() {
            debug!(session_id = %session_id, "event channel closed");
        }
    }

    /// Closes every channel; used at container shutdown.
    pub async fn close_all(&self) {
        let mut channels = self.channels.lock().await;
        channels.clear();
    }

    /// Total events dropped across all sessions due to lagging subscribers.
    pub async fn dropped_events(&self) -> u64 {
        let channels = self.channels.lock().await;
        channels
            .values()
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A finite, non-restartable sequence of session events.
///
/// Ends when the session's channel closes or the subscriber drops the
/// stream. Lag is absorbed by skipping the lost events and counting them.
pub struct EventStream {
    inner: BroadcastStream<CollaborationEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// A stream that is already finished, for subscriptions arriving after
    /// the session terminated.
    pub fn ended() -> Self {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Self {
            inner: BroadcastStream::new(rx),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Stream for EventStream {
    type Item = CollaborationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped, "subscriber lagged; oldest events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
