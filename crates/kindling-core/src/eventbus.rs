//! Registry event bus.
//!
//! Two ways to listen:
//! - [`EventBus::subscribe`] registers an async listener for one
//!   [`EventKind`]. `emit` awaits every listener of that kind concurrently and
//!   isolates their failures from each other and from the emitter.
//! - [`EventBus::receiver`] taps a broadcast channel carrying every event, for
//!   consumers that prefer pulling a stream.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::defaults;
use crate::extension::executor::{guarded, GuardError};
use crate::extension::ContributionKind;

// ============================================================================
// Events
// ============================================================================

/// Key listeners subscribe under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "extension:registered")]
    ExtensionRegistered,
    #[serde(rename = "extension:unregistered")]
    ExtensionUnregistered,
    #[serde(rename = "tools:changed")]
    ToolsChanged,
    #[serde(rename = "capability:registered")]
    CapabilityRegistered,
    #[serde(rename = "capability:removed")]
    CapabilityRemoved,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::ExtensionRegistered,
        EventKind::ExtensionUnregistered,
        EventKind::ToolsChanged,
        EventKind::CapabilityRegistered,
        EventKind::CapabilityRemoved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtensionRegistered => "extension:registered",
            Self::ExtensionUnregistered => "extension:unregistered",
            Self::ToolsChanged => "tools:changed",
            Self::CapabilityRegistered => "capability:registered",
            Self::CapabilityRemoved => "capability:removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events announced by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    ExtensionRegistered {
        extension_id: String,
        instance_id: String,
    },
    ExtensionUnregistered {
        extension_id: String,
        instance_id: String,
    },
    /// The set of callable tools changed. Carries the full, sorted tool list.
    ToolsChanged { tools: Vec<String> },
    CapabilityRegistered {
        extension_id: String,
        kind: ContributionKind,
        id: String,
    },
    CapabilityRemoved {
        extension_id: String,
        kind: ContributionKind,
        id: String,
    },
}

impl RegistryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ExtensionRegistered { .. } => EventKind::ExtensionRegistered,
            Self::ExtensionUnregistered { .. } => EventKind::ExtensionUnregistered,
            Self::ToolsChanged { .. } => EventKind::ToolsChanged,
            Self::CapabilityRegistered { .. } => EventKind::CapabilityRegistered,
            Self::CapabilityRemoved { .. } => EventKind::CapabilityRemoved,
        }
    }

    /// Extension the event concerns, if any.
    pub fn extension_id(&self) -> Option<&str> {
        match self {
            Self::ExtensionRegistered { extension_id, .. }
            | Self::ExtensionUnregistered { extension_id, .. }
            | Self::CapabilityRegistered { extension_id, .. }
            | Self::CapabilityRemoved { extension_id, .. } => Some(extension_id),
            Self::ToolsChanged { .. } => None,
        }
    }
}

/// Delivery metadata attached to every event on the broadcast tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Monotonic per-bus sequence number
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Listeners
// ============================================================================

/// Async event listener.
#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &RegistryEvent) -> anyhow::Result<()>;
}

struct FnListener<F>(F);

#[async_trait::async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(RegistryEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_event(&self, event: &RegistryEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

type ListenerTable = HashMap<EventKind, Vec<(u64, Arc<dyn EventListener>)>>;

struct BusInner {
    listeners: RwLock<ListenerTable>,
    next_listener: AtomicU64,
    sequence: AtomicU64,
    listener_failures: AtomicU64,
    listener_timeout: Option<Duration>,
    tx: broadcast::Sender<(RegistryEvent, EventMetadata)>,
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle leaves the listener installed; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the listener. Returns `false` if the bus is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut listeners = bus.listeners.write();
        match listeners.get_mut(&self.kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != self.id);
                list.len() != before
            }
            None => false,
        }
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Typed publish/subscribe bus for [`RegistryEvent`]s. Clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_options(
            defaults::EVENT_CHANNEL_CAPACITY,
            Some(Duration::from_millis(defaults::LISTENER_TIMEOUT_MS)),
        )
    }

    /// `capacity` bounds the broadcast tap; `listener_timeout` bounds each
    /// listener call during `emit`.
    pub fn with_options(capacity: usize, listener_timeout: Option<Duration>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                listener_failures: AtomicU64::new(0),
                listener_timeout,
                tx,
            }),
        }
    }

    /// Subscribe an async closure to one event kind.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(RegistryEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_listener(kind, Arc::new(FnListener(listener)))
    }

    pub fn subscribe_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, listener));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .listeners
            .read()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Listener calls that returned an error, panicked or timed out.
    pub fn listener_failures(&self) -> u64 {
        self.inner.listener_failures.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every listener of its kind and wait for all of them.
    ///
    /// Listener failures are logged and counted, never returned. Returns how
    /// many listeners handled the event successfully.
    pub async fn emit(&self, event: RegistryEvent) -> usize {
        let kind = event.kind();
        let metadata = EventMetadata {
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
        };
        // No tap subscribers is fine.
        let _ = self.inner.tx.send((event.clone(), metadata));

        let listeners: Vec<_> = self
            .inner
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            return 0;
        }

        let limit = self.inner.listener_timeout;
        let event = &event;
        let outcomes = join_all(listeners.iter().map(|(id, listener)| async move {
            (*id, guarded(listener.on_event(event), limit).await)
        }))
        .await;

        let mut delivered = 0;
        for (listener_id, outcome) in outcomes {
            let error = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(GuardError::TimedOut(after)) => {
                    format!("timed out after {}ms", after.as_millis())
                }
                Err(GuardError::Panicked(msg)) => format!("panicked: {}", msg),
            };
            self.inner.listener_failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = kind.as_str(), listener_id, error = %error, "Event listener failed");
        }
        delivered
    }

    /// Emit without waiting for listeners.
    ///
    /// Outside a tokio runtime only the broadcast tap sees the event.
    pub fn spawn_emit(&self, event: RegistryEvent) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move {
                    bus.emit(event).await;
                });
            }
            Err(_) => {
                debug!(event = event.kind().as_str(), "No runtime, listeners skipped");
                let metadata = EventMetadata {
                    sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
                    timestamp: Utc::now(),
                };
                let _ = self.inner.tx.send((event, metadata));
            }
        }
    }

    /// Tap every event.
    ///
    /// A slow receiver may miss events once the channel capacity is exceeded.
    pub fn receiver(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Tap events of one kind only.
    pub fn receiver_for(&self, kind: EventKind) -> FilteredReceiver {
        FilteredReceiver {
            rx: self.inner.tx.subscribe(),
            kind,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_timeout", &self.inner.listener_timeout)
            .field("tap_receivers", &self.inner.tx.receiver_count())
            .finish()
    }
}

/// Receiver for all events from the bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(RegistryEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Next event, or `None` once the bus is dropped. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<(RegistryEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(RegistryEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for events of a single kind.
pub struct FilteredReceiver {
    rx: broadcast::Receiver<(RegistryEvent, EventMetadata)>,
    kind: EventKind,
}

impl FilteredReceiver {
    pub async fn recv(&mut self) -> Option<(RegistryEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) if event.kind() == self.kind => return Some((event, meta)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(RegistryEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if event.kind() == self.kind {
                return Some((event, meta));
            }
        }
        None
    }
}
