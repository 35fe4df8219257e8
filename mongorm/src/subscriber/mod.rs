//! Background tailing of capped collections.
//!
//! A [`Subscriber`] owns one worker thread that tails a collection and calls
//! its handler for every record appended after the subscriber's position,
//! exactly once and in append order. Handler failures (an `Err` or a panic)
//! are logged and the record is skipped. Records evicted from the capped
//! collection before the worker reaches them are lost.

use crate::document::Document;
use crate::error::{MongormError, Result};
use crate::storage::Position;
use crate::store::Store;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;
/// Callback invoked on the worker thread for each delivered event.
pub type Handler = Box<dyn FnMut(Document) -> HandlerResult + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Created,
    Running,
    Stopped,
}

/// Where a subscriber starts reading on its first `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberOptions {
    start_after: Option<Position>,
}

impl SubscriberOptions {
    /// Only records appended after `start` (the default).
    pub fn new() -> Self {
        SubscriberOptions::default()
    }

    /// Replay every record still held by the collection.
    pub fn from_beginning() -> Self {
        Self::after(Position::START)
    }

    /// Deliver records appended after `position`.
    pub fn after(position: Position) -> Self {
        SubscriberOptions {
            start_after: Some(position),
        }
    }
}

pub struct Subscriber {
    store: Store,
    collection: String,
    options: SubscriberOptions,
    state: SubscriberState,
    handler: Option<Handler>,
    position: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Handler>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("collection", &self.collection)
            .field("state", &self.state)
            .field("position", &self.position())
            .finish()
    }
}

impl Subscriber {
    pub fn new<F>(store: &Store, collection: &str, options: SubscriberOptions, handler: F) -> Self
    where
        F: FnMut(Document) -> HandlerResult + Send + 'static,
    {
        Subscriber {
            store: store.clone(),
            collection: collection.to_string(),
            options,
            state: SubscriberState::Created,
            handler: Some(Box::new(handler)),
            position: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    /// Position of the last record handled (or the starting position).
    pub fn position(&self) -> Position {
        Position(self.position.load(Ordering::Acquire))
    }

    /// Start the worker thread. Only valid on a `Created` subscriber.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SubscriberState::Created {
            return Err(MongormError::InvalidState(format!(
                "subscriber on '{}' cannot start from {:?}",
                self.collection, self.state
            )));
        }
        let mut handler = self.handler.take().ok_or_else(|| {
            MongormError::InvalidState(format!("subscriber on '{}' has no handler", self.collection))
        })?;

        // Fix the starting point before returning, so anything appended after
        // `start` is delivered and nothing before it is.
        let start = match self.options.start_after {
            Some(position) => position,
            None => match self.store.storage().last_position(&self.collection) {
                Ok(position) => position,
                Err(e) => {
                    self.handler = Some(handler);
                    return Err(e);
                }
            },
        };
        self.position.store(start.0, Ordering::Release);
        self.stop.store(false, Ordering::Release);

        let store = self.store.clone();
        let collection = self.collection.clone();
        let position = self.position.clone();
        let stop = self.stop.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("mongorm-subscriber-{collection}"))
            .spawn(move || {
                run(&store, &collection, &position, &stop, &mut handler);
                handler
            });

        match spawned {
            Ok(worker) => {
                log::info!(
                    "Subscriber on '{}' started after position {start}",
                    self.collection
                );
                self.worker = Some(worker);
                self.state = SubscriberState::Running;
                Ok(())
            }
            Err(e) => Err(MongormError::Io(e)),
        }
    }

    /// Signal the worker and wait for it to exit. No handler call begins
    /// after this returns. Stopping a stopped subscriber is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SubscriberState::Stopped => return Ok(()),
            SubscriberState::Created => {
                return Err(MongormError::InvalidState(format!(
                    "subscriber on '{}' was never started",
                    self.collection
                )))
            }
            SubscriberState::Running => {}
        }

        self.stop.store(true, Ordering::Release);
        self.state = SubscriberState::Stopped;
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(handler) => self.handler = Some(handler),
                Err(_) => {
                    return Err(MongormError::InvalidState(format!(
                        "subscriber worker for '{}' panicked",
                        self.collection
                    )))
                }
            }
        }
        log::info!(
            "Subscriber on '{}' stopped at position {}",
            self.collection,
            self.position()
        );
        Ok(())
    }

    /// A new `Created` subscriber with the same handler that continues after
    /// the last handled position.
    pub fn resume(mut self) -> Result<Subscriber> {
        if self.state != SubscriberState::Stopped {
            return Err(MongormError::InvalidState(format!(
                "only a stopped subscriber can be resumed; '{}' is {:?}",
                self.collection, self.state
            )));
        }
        let handler = self.handler.take().ok_or_else(|| {
            MongormError::InvalidState(format!(
                "subscriber on '{}' lost its handler",
                self.collection
            ))
        })?;
        Ok(Subscriber {
            store: self.store.clone(),
            collection: self.collection.clone(),
            options: SubscriberOptions::after(self.position()),
            state: SubscriberState::Created,
            handler: Some(handler),
            position: Arc::new(AtomicU64::new(self.position.load(Ordering::Acquire))),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.state == SubscriberState::Running {
            if let Err(e) = self.stop() {
                log::warn!("Stopping subscriber on '{}' failed: {e}", self.collection);
            }
        }
    }
}

fn run(
    store: &Store,
    collection: &str,
    position: &AtomicU64,
    stop: &AtomicBool,
    handler: &mut Handler,
) {
    let wait = store.config().tail_poll_interval();
    while !stop.load(Ordering::Acquire) {
        let after = Position(position.load(Ordering::Acquire));
        let batch = match store.storage().tail(collection, after, wait) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("Tailing '{collection}' failed: {e}");
                std::thread::sleep(wait);
                continue;
            }
        };

        for (record_position, record) in batch {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match store.decode_tailed(collection, &record) {
                Ok(doc) => deliver(collection, record_position, doc, handler),
                Err(e) => log::warn!(
                    "Skipping undecodable record at {collection}:{record_position}: {e}"
                ),
            }
            position.store(record_position.0, Ordering::Release);
        }
    }
}

fn deliver(collection: &str, at: Position, doc: Document, handler: &mut Handler) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(doc))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Handler failed on {collection}:{at}: {e}"),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Handler panicked on {collection}:{at}: {message}");
        }
    }
}

impl Store {
    /// A `Created` subscriber on `collection` that will deliver events
    /// appended after it is started.
    pub fn subscriber<F>(&self, collection: &str, handler: F) -> Subscriber
    where
        F: FnMut(Document) -> HandlerResult + Send + 'static,
    {
        Subscriber::new(self, collection, SubscriberOptions::new(), handler)
    }

    pub fn subscriber_with<F>(&self, collection: &str, options: SubscriberOptions, handler: F) -> Subscriber
    where
        F: FnMut(Document) -> HandlerResult + Send + 'static,
    {
        Subscriber::new(self, collection, options, handler)
    }

    /// A subscriber on the collection backing an event schema. The capped
    /// collection is created if needed.
    pub fn subscriber_for<F>(&self, schema: &str, handler: F) -> Result<Subscriber>
    where
        F: FnMut(Document) -> HandlerResult + Send + 'static,
    {
        let definition = self.event_schema(schema)?;
        self.ensure_capped(schema)?;
        Ok(self.subscriber(definition.collection_name(), handler))
    }
}
