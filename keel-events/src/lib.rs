//! In-process typed event bus.
//!
//! Events are dispatched by `TypeId` plus an optional topic string. Each
//! subscription owns a bounded queue and one consumer task: publishing
//! blocks when a subscriber's buffer is full (backpressure), delivery is
//! FIFO per subscriber, and a panicking handler is recovered without
//! killing the consumer.
//!
//! ```ignore
//! let bus = EventBus::new();
//! let sub = bus.subscribe(|order: Arc<OrderPlaced>| async move {
//!     fulfil(&order).await;
//! })?;
//!
//! bus.publish(OrderPlaced { id: 42 }).await?;
//! bus.publish_to("priority", OrderPlaced { id: 43 }).await?;
//! # sub.unsubscribe().await;
//! ```
//!
//! A subscriber registered without a topic is a wildcard: it receives every
//! event of its type regardless of the publish topic. A subscriber with a
//! topic receives only exact matches.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use keel_core::app::App;
use keel_core::config::{ConfigFlag, ConfigProvider, ConfigValue, FlagKind, ProviderValues};
use keel_core::error::CoreError;
use keel_core::health::{HealthIndicator, HealthManager, HealthStatus};
use keel_core::lifecycle::{HookCtx, HookError, Lifecycle};
use keel_core::module::Module;

/// Default per-subscription queue capacity.
const DEFAULT_CAPACITY: usize = 64;

type ErasedEvent = Arc<dyn Any + Send + Sync>;

#[derive(Debug)]
struct SubEntry {
    id: u64,
    topic: String,
    tx: mpsc::Sender<ErasedEvent>,
    consumer: JoinHandle<()>,
}

#[derive(Debug)]
struct BusState {
    subs: HashMap<TypeId, Vec<SubEntry>>,
    next_id: u64,
    closed: bool,
}

#[derive(Debug)]
struct BusInner {
    state: Mutex<BusState>,
    default_capacity: usize,
}

/// Typed, topic-filtered pub/sub bus. `Clone` shares the same bus.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Use `capacity` as the default queue size for new subscriptions.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    subs: HashMap::new(),
                    next_id: 1,
                    closed: false,
                }),
                default_capacity: capacity.max(1),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("bus state poisoned").closed
    }

    /// Subscribe to every event of type `E` (wildcard topic).
    pub fn subscribe<E, F, Fut>(&self, handler: F) -> Result<Subscription, CoreError>
    where
        E: Send + Sync + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(None, self.inner.default_capacity, handler)
    }

    /// Subscribe to events of type `E` published under exactly `topic`.
    pub fn subscribe_topic<E, F, Fut>(
        &self,
        topic: &str,
        handler: F,
    ) -> Result<Subscription, CoreError>
    where
        E: Send + Sync + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(Some(topic), self.inner.default_capacity, handler)
    }

    /// Subscribe with an explicit queue capacity.
    pub fn subscribe_with<E, F, Fut>(
        &self,
        topic: Option<&str>,
        capacity: usize,
        handler: F,
    ) -> Result<Subscription, CoreError>
    where
        E: Send + Sync + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<ErasedEvent>(capacity.max(1));
        let event_type = std::any::type_name::<E>();

        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = event.downcast::<E>().expect("event type mismatch");
                // One task per event so a panicking handler is recovered and
                // the consumer keeps draining.
                let handle = tokio::spawn(handler(event));
                if let Err(join_err) = handle.await {
                    if join_err.is_panic() {
                        tracing::error!(event = event_type, "event handler panicked");
                    }
                }
            }
        });

        let mut state = self.inner.state.lock().expect("bus state poisoned");
        if state.closed {
            consumer.abort();
            return Err(CoreError::NotRunning {
                subsystem: "event bus",
            });
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subs.entry(TypeId::of::<E>()).or_default().push(SubEntry {
            id,
            topic: topic.unwrap_or("").to_string(),
            tx,
            consumer,
        });

        Ok(Subscription {
            bus: self.clone(),
            type_id: TypeId::of::<E>(),
            id,
        })
    }

    /// Publish with an empty topic: only wildcard subscribers receive it.
    pub async fn publish<E: Send + Sync + 'static>(&self, event: E) -> Result<(), CoreError> {
        self.publish_to("", event).await
    }

    /// Publish under `topic`: exact-topic subscribers plus wildcard
    /// subscribers receive it.
    ///
    /// Awaits each full subscriber queue in turn (backpressure). Dropping
    /// the returned future cancels the remaining fan-out.
    pub async fn publish_to<E: Send + Sync + 'static>(
        &self,
        topic: &str,
        event: E,
    ) -> Result<(), CoreError> {
        let event: ErasedEvent = Arc::new(event);
        let targets: Vec<mpsc::Sender<ErasedEvent>> = {
            let state = self.inner.state.lock().expect("bus state poisoned");
            if state.closed {
                return Err(CoreError::NotRunning {
                    subsystem: "event bus",
                });
            }
            match state.subs.get(&TypeId::of::<E>()) {
                Some(subs) => subs
                    .iter()
                    .filter(|s| s.topic == topic || (!topic.is_empty() && s.topic.is_empty()))
                    .map(|s| s.tx.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        for tx in targets {
            // A send error means the subscriber disappeared mid-publish.
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    /// Stop intake, drain every subscription's queue, and join all consumer
    /// tasks. Idempotent.
    pub async fn close(&self) {
        let entries: Vec<SubEntry> = {
            let mut state = self.inner.state.lock().expect("bus state poisoned");
            state.closed = true;
            state.subs.drain().flat_map(|(_, subs)| subs).collect()
        };
        for entry in entries {
            drop(entry.tx);
            let _ = entry.consumer.await;
        }
    }

    async fn remove_subscription(&self, type_id: TypeId, id: u64) {
        let entry = {
            let mut state = self.inner.state.lock().expect("bus state poisoned");
            match state.subs.get_mut(&type_id) {
                Some(subs) => match subs.iter().position(|s| s.id == id) {
                    Some(index) => Some(subs.remove(index)),
                    None => None,
                },
                None => None,
            }
        };
        if let Some(entry) = entry {
            drop(entry.tx);
            let _ = entry.consumer.await;
        }
    }
}

impl Lifecycle for EventBus {
    async fn stop(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.close().await;
        Ok(())
    }
}

impl ConfigProvider for EventBus {
    fn config_namespace() -> &'static str {
        "events"
    }

    fn config_flags() -> Vec<ConfigFlag> {
        vec![ConfigFlag::new("buffer", FlagKind::Int)
            .default_value(ConfigValue::Integer(DEFAULT_CAPACITY as i64))
            .describe("per-subscription queue capacity")]
    }
}

/// Handle to one subscription. Dropping it does NOT unsubscribe; call
/// [`Subscription::unsubscribe`] to detach and drain.
#[derive(Debug)]
pub struct Subscription {
    bus: EventBus,
    type_id: TypeId,
    id: u64,
}

impl Subscription {
    /// Detach: the queue is drained, the consumer joins, and subsequent
    /// publishes no longer target this subscriber. Idempotent.
    pub async fn unsubscribe(&self) {
        self.bus.remove_subscription(self.type_id, self.id).await;
    }
}

/// Health probe: a closed bus reports down.
pub struct EventBusHealth {
    bus: EventBus,
}

impl HealthIndicator for EventBusHealth {
    fn name(&self) -> &str {
        "events"
    }

    async fn check(&self) -> HealthStatus {
        if self.bus.is_closed() {
            HealthStatus::Down(
                CoreError::NotRunning {
                    subsystem: "event bus",
                }
                .to_string(),
            )
        } else {
            HealthStatus::Up
        }
    }
}

/// Installs a lifecycle-managed [`EventBus`], its queue capacity read from
/// `events.buffer`.
pub struct EventsModule;

impl Module for EventsModule {
    fn name(&self) -> &'static str {
        "events"
    }

    fn register(&self, app: &mut App) -> Result<(), CoreError> {
        app.container()
            .register::<EventBus>()
            .eager()
            .managed()
            .with_config()
            .provider(|c| {
                let values = c.resolve::<ProviderValues>()?;
                let capacity = values.get_or("events.buffer", DEFAULT_CAPACITY as i64);
                let bus = EventBus::with_capacity(capacity.max(1) as usize);
                if let Ok(health) = c.resolve::<HealthManager>() {
                    health.register(EventBusHealth { bus: bus.clone() });
                }
                Ok(bus)
            })
    }
}
