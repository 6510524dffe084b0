use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_stream::try_stream;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::error::WsError;
use super::types::{InboundMessage, MessageKind, Topic};
use crate::Result;

/// Broadcast channel capacity for message streams.
const BROADCAST_CAPACITY: usize = 1024;

pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// What the connection must do with a frame before (or instead of) delivering it.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Server ping: answer with `pong`, do not forward
    ReplyPong,
    /// Server pong: liveness signal, do not forward
    Heartbeat,
    /// Domain message: hand to subscribers (unless it answers a pending request)
    Deliver,
}

/// Typed publish/subscribe over inbound messages.
///
/// Handlers for a topic run in subscription order; handlers for the exact kind run
/// before [`Topic::All`] handlers.
pub struct Dispatcher {
    handlers: DashMap<Topic, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<InboundMessage>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.handlers.len())
            .field("streams", &self.broadcast_tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    /// Register `handler` for `topic`.
    ///
    /// The subscription stays active until [`SubscriptionHandle::unsubscribe`] is
    /// called; dropping the handle does not remove it.
    pub fn subscribe<T, F>(self: &Arc<Self>, topic: T, handler: F) -> SubscriptionHandle
    where
        T: Into<Topic>,
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.handlers
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        #[cfg(feature = "tracing")]
        tracing::debug!(?topic, id, "Registered message handler");

        SubscriptionHandle {
            dispatcher: Arc::downgrade(self),
            topic,
            id,
        }
    }

    /// Stream of messages matching `topic`.
    ///
    /// Each call returns an independent stream. A stream that falls more than
    /// the channel capacity behind yields [`WsError::Lagged`] and continues.
    pub fn stream(&self, topic: Topic) -> impl Stream<Item = Result<InboundMessage>> + use<> {
        let mut rx = self.broadcast_tx.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if topic.matches(&message.kind) {
                            yield message;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message stream lagged, missed {n} messages");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    /// Decide how a frame is handled. Protocol kinds never reach subscribers.
    #[must_use]
    pub fn route(message: &InboundMessage) -> Route {
        match message.kind {
            MessageKind::Ping => Route::ReplyPong,
            MessageKind::Pong => Route::Heartbeat,
            _ => Route::Deliver,
        }
    }

    /// Hand `message` to its subscribers and return how many handlers ran.
    pub fn deliver(&self, message: InboundMessage) -> usize {
        // Snapshot the handler lists so a handler may (un)subscribe without deadlocking.
        let exact = self.snapshot(&Topic::Kind(message.kind.clone()));
        let wildcard = self.snapshot(&Topic::All);

        for handler in exact.iter().chain(wildcard.iter()) {
            handler(&message);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            kind = %message.kind,
            handlers = exact.len() + wildcard.len(),
            "Delivered message"
        );

        // No open streams is not an error
        _ = self.broadcast_tx.send(message);

        exact.len() + wildcard.len()
    }

    /// Number of handlers registered for `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.handlers.get(topic).map_or(0, |entry| entry.len())
    }

    fn snapshot(&self, topic: &Topic) -> Vec<Handler> {
        self.handlers
            .get(topic)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let removed = self
            .handlers
            .get_mut(topic)
            .map(|mut entry| {
                let before = entry.len();
                entry.retain(|(handler_id, _)| *handler_id != id);
                before != entry.len()
            })
            .unwrap_or(false);

        self.handlers.remove_if(topic, |_, handlers| handlers.is_empty());
        removed
    }
}

/// Returned by [`Dispatcher::subscribe`]; removes the handler on request.
#[derive(Debug)]
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct SubscriptionHandle {
    dispatcher: Weak<Dispatcher>,
    topic: Topic,
    id: u64,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|dispatcher| dispatcher.remove(&self.topic, self.id))
    }
}
