//! Async actor around [`TripEngine`].
//!
//! The engine itself is synchronous and run-to-completion. This module gives
//! it a home on a tokio runtime: one task owns the engine and drains an
//! unbounded queue, so every inbound event (location batches, geofence
//! crossings, classifier completions) is processed strictly one at a time.
//! Notifications fan out on a broadcast channel.
//!
//! Classifiers that do real work implement [`AsyncClassifier`];
//! [`SpawningClassificationService`] runs each query on its own task with a
//! timeout and posts the completion back onto the engine's queue.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::classification::{ClassificationOutcome, ClassificationQuery, Stamped};
use crate::engine::{EngineSnapshot, TripEngine};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EngineNotification, TripObserver};
use crate::platform::ClassificationService;
use crate::types::{ActivityType, ClassificationResult, SpeedStats};

/// Notifications buffered per subscriber before it starts lagging.
const NOTIFICATION_CAPACITY: usize = 256;

/// Message type for the engine actor
enum Message {
    Event(EngineEvent),
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown,
}

/// Cloneable sender side of the engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Message>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl EngineHandle {
    /// Queue an event. Fails only once the actor has stopped.
    pub fn send(&self, event: EngineEvent) -> Result<()> {
        self.tx
            .send(Message::Event(event))
            .map_err(|_| Error::EngineStopped)
    }

    /// Snapshot taken after every event queued before this call.
    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Message::Snapshot(reply))
            .map_err(|_| Error::EngineStopped)?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(Message::Shutdown).map_err(|_| Error::EngineStopped)
    }
}

struct BroadcastObserver(broadcast::Sender<EngineNotification>);

impl TripObserver for BroadcastObserver {
    fn on_notification(&mut self, notification: &EngineNotification) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.0.send(notification.clone());
    }
}

/// Queue plus handle, created before the engine so collaborators that post
/// back (like [`SpawningClassificationService`]) can hold a handle.
pub struct EngineRuntime {
    handle: EngineHandle,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl EngineRuntime {
    pub fn new() -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            handle: EngineHandle { tx, notifications },
            inbox,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Start the engine on its own task. The task returns the engine after
    /// [`EngineHandle::shutdown`].
    pub fn spawn(self, mut engine: TripEngine) -> JoinHandle<TripEngine> {
        let Self { handle, mut inbox } = self;
        engine.subscribe(Box::new(BroadcastObserver(handle.notifications.clone())));

        tokio::spawn(async move {
            engine.start();
            while let Some(message) = inbox.recv().await {
                match message {
                    Message::Event(event) => engine.handle_event(event),
                    Message::Snapshot(reply) => {
                        let _ = reply.send(engine.snapshot());
                    }
                    Message::Shutdown => break,
                }
            }
            info!("Engine actor stopped");
            engine
        })
    }
}

impl Default for EngineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A classifier that answers asynchronously.
pub trait AsyncClassifier: Send + Sync + 'static {
    fn classify(&self, query: ClassificationQuery) -> BoxFuture<'static, ClassificationOutcome>;
}

/// Runs each query on its own task and posts the completion to the engine.
pub struct SpawningClassificationService<C: AsyncClassifier> {
    classifier: Arc<C>,
    engine: EngineHandle,
    timeout: std::time::Duration,
    runtime: tokio::runtime::Handle,
}

impl<C: AsyncClassifier> SpawningClassificationService<C> {
    /// Must be called from within a tokio runtime.
    pub fn new(classifier: C, engine: EngineHandle, timeout: std::time::Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Classification(format!("no async runtime: {}", e)))?;
        Ok(Self {
            classifier: Arc::new(classifier),
            engine,
            timeout,
            runtime,
        })
    }
}

impl<C: AsyncClassifier> ClassificationService for SpawningClassificationService<C> {
    fn issue_query(&mut self, query: ClassificationQuery) -> Result<()> {
        let token = query.token;
        let work = self.classifier.classify(query);
        let engine = self.engine.clone();
        let limit = self.timeout;

        self.runtime.spawn(async move {
            let outcome = match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
            };
            if engine
                .send(EngineEvent::ClassificationCompleted(Stamped::new(token, outcome)))
                .is_err()
            {
                debug!("Engine stopped before query {} completed", token.query_id);
            }
        });
        Ok(())
    }
}

/// Speed-only stand-in for a motion model: classifies from the location
/// samples attached to the query.
#[derive(Debug, Clone, Copy)]
pub struct SpeedHeuristicClassifier {
    pub moving_speed_floor: f64,
}

impl Default for SpeedHeuristicClassifier {
    fn default() -> Self {
        Self {
            moving_speed_floor: 0.2,
        }
    }
}

impl SpeedHeuristicClassifier {
    pub fn classify_now(&self, query: &ClassificationQuery) -> ClassificationOutcome {
        let stats = SpeedStats::from_samples(&query.samples, self.moving_speed_floor);
        if stats.sample_count == 0 {
            warn!("Query {} has no samples with a known speed", query.token.query_id);
            return Ok(ClassificationResult::new(ActivityType::Unknown, 0.1, 0.0, 0.0));
        }

        let (activity, confidence) = match stats.average_moving_speed {
            s if s >= 8.0 => (ActivityType::Automotive, 0.9),
            s if s >= 2.5 => (ActivityType::Cycling, 0.85),
            s if s >= 0.8 => (ActivityType::Walking, 0.7),
            _ => (ActivityType::Stationary, 0.9),
        };
        Ok(ClassificationResult::new(
            activity,
            confidence,
            stats.average_speed,
            stats.average_moving_speed,
        ))
    }
}

impl AsyncClassifier for SpeedHeuristicClassifier {
    fn classify(&self, query: ClassificationQuery) -> BoxFuture<'static, ClassificationOutcome> {
        futures::future::ready(self.classify_now(&query)).boxed()
    }
}
