//! In-process event channel for upload notifications
//!
//! Publishing pushes onto an unbounded queue and returns immediately; a
//! dedicated delivery task pops events in publication order and hands each
//! one to the subscribers that were registered when it was published.
//!
//! ```text
//!  publish(E1) ──┐                              ┌─> subscriber A
//!  publish(E2) ──┼─> [ E1 | E2 | ... ] ─> loop ─┤
//!                │     unbounded queue          └─> subscriber B
//! ```
//!
//! Each queued event carries a snapshot of the subscriber list taken at
//! publish time, so a subscriber added later never sees earlier events.
//! A handler that returns an error or panics is logged and skipped; other
//! subscribers and later events are unaffected.
//!
//! Events live only in memory. Anything still queued when the process exits
//! is lost; the artifact on disk is the durable part.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::UploadEvent;

/// Errors returned to publishers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Event channel is closed")]
    Closed,
}

/// Receives every event published after registration
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &UploadEvent) -> anyhow::Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &UploadEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Subscriber {
    id: usize,
    handler: Arc<dyn EventHandler>,
}

type SubscriberList = Arc<Vec<Arc<Subscriber>>>;

struct Envelope {
    event: UploadEvent,
    subscribers: SubscriberList,
}

/// Unbounded, FIFO, multi-subscriber event channel
///
/// Must be created inside a Tokio runtime: construction spawns the delivery
/// task.
pub struct EventChannel {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    subscribers: RwLock<SubscriberList>,
    next_id: AtomicUsize,
    delivery: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    /// Create the channel and start its delivery task
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let delivery = tokio::spawn(deliver(receiver));

        info!("EventChannel initialized and listening for events");

        Self {
            sender: Mutex::new(Some(sender)),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicUsize::new(1),
            delivery: tokio::sync::Mutex::new(Some(delivery)),
        }
    }

    /// Register a handler for all events published from now on
    ///
    /// Returns the subscriber id used in log lines.
    pub fn subscribe<H: EventHandler>(&self, handler: H) -> usize {
        self.subscribe_arc(Arc::new(handler))
    }

    /// Register a shared handler
    pub fn subscribe_arc(&self, handler: Arc<dyn EventHandler>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = handler.name().to_string();

        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut updated = Vec::with_capacity(subscribers.len() + 1);
        updated.extend(subscribers.iter().cloned());
        updated.push(Arc::new(Subscriber { id, handler }));
        *subscribers = Arc::new(updated);

        info!(
            subscriber_id = id,
            subscriber = %name,
            total = subscribers.len(),
            "Subscriber registered"
        );
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.current_subscribers().len()
    }

    /// Queue `event` for delivery
    ///
    /// Never waits on subscribers. Fails only once the channel is closed.
    pub fn publish(&self, event: UploadEvent) -> Result<(), ChannelError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            warn!(path = %event.location.display(), "Publish rejected: event channel is closed");
            return Err(ChannelError::Closed);
        };

        info!(path = %event.location.display(), "Publishing event for file");

        let envelope = Envelope {
            event,
            subscribers: self.current_subscribers(),
        };
        sender.send(envelope).map_err(|_| ChannelError::Closed)
    }

    /// Stop accepting events and wait for the queue to drain
    ///
    /// Events published before the call are still delivered. Calling close
    /// more than once is harmless.
    pub async fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handle = self.delivery.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Event delivery task ended abnormally");
            }
        }
    }

    fn current_subscribers(&self) -> SubscriberList {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn deliver(mut receiver: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(Envelope { event, subscribers }) = receiver.recv().await {
        info!(
            path = %event.location.display(),
            subscribers = subscribers.len(),
            "Event received"
        );

        for subscriber in subscribers.iter() {
            dispatch(subscriber, &event).await;
        }
    }

    info!("Event channel closed, delivery loop stopped");
}

async fn dispatch(subscriber: &Subscriber, event: &UploadEvent) {
    let outcome = AssertUnwindSafe(subscriber.handler.handle(event))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            debug!(
                subscriber_id = subscriber.id,
                path = %event.location.display(),
                "Event handled"
            );
        },
        Ok(Err(e)) => {
            error!(
                subscriber_id = subscriber.id,
                subscriber = %subscriber.handler.name(),
                path = %event.location.display(),
                error = %format!("{e:#}"),
                "Error in subscriber"
            );
        },
        Err(panic) => {
            error!(
                subscriber_id = subscriber.id,
                subscriber = %subscriber.handler.name(),
                path = %event.location.display(),
                panic = %panic_message(panic.as_ref()),
                "Subscriber panicked"
            );
        },
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
