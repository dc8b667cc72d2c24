//! Built-in Kindling extensions.
//!
//! - [`TasksExtension`]: a persistent to-do list (requires `storage`)
//! - [`TimerExtension`]: countdown timers with notifications (requires
//!   `timers` and `notifications`)
//!
//! [`HostFactory`] assembles a host environment per extension from shared
//! application resources, which is what an embedding application does
//! before calling `ExtensionRegistry::register`.

pub mod tasks;
pub mod timer;

pub use tasks::{Task, TaskStatus, TasksExtension, TASKS_CHANNEL, TASKS_EXTENSION_ID, TASKS_SLOT};
pub use timer::{ActiveTimer, TimerExtension, TIMER_CHANNEL, TIMER_EXTENSION_ID, TIMER_SLOT};

use kindling_core::extension::{DynExtension, ExtensionRegistry, RegisterOptions};
use kindling_core::host::{
    HostEnvironment, MessageBridge, Notifier, ScopedStorage, StorageBackend, TokioScheduler,
    TokioTimers,
};
use kindling_core::Result;
use std::sync::Arc;

/// Every built-in extension, in registration order.
pub fn builtin_extensions() -> Vec<DynExtension> {
    vec![
        Arc::new(TasksExtension::new()),
        Arc::new(TimerExtension::new()),
    ]
}

/// Shared resources handed out to per-extension hosts.
#[derive(Clone)]
pub struct HostFactory {
    backend: Arc<dyn StorageBackend>,
    notifier: Option<Arc<dyn Notifier>>,
    messaging: Option<Arc<dyn MessageBridge>>,
}

impl HostFactory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            notifier: None,
            messaging: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_messaging(mut self, bridge: Arc<dyn MessageBridge>) -> Self {
        self.messaging = Some(bridge);
        self
    }

    /// Host for one extension: storage scoped to its id, its own timers and
    /// scheduler, and the shared notifier and message bridge when present.
    ///
    /// Must be called from within a tokio runtime once timers are used.
    pub fn build(&self, extension_id: &str) -> HostEnvironment {
        let mut builder = HostEnvironment::builder()
            .with_storage(ScopedStorage::new(self.backend.clone(), extension_id))
            .with_logging(extension_id)
            .with_timers(TokioTimers::new())
            .with_scheduler(TokioScheduler::new());
        if let Some(notifier) = &self.notifier {
            builder = builder.with_notifier(notifier.clone());
        }
        if let Some(bridge) = &self.messaging {
            builder = builder.with_messaging(bridge.clone());
        }
        builder.build()
    }
}

/// Register every built-in extension with hosts from `factory`.
///
/// Stops at the first failure; extensions registered before it stay registered.
pub async fn register_builtins(
    registry: &ExtensionRegistry,
    factory: &HostFactory,
) -> Result<Vec<String>> {
    let mut instance_ids = Vec::new();
    for extension in builtin_extensions() {
        let id = extension.manifest().id.clone();
        let context = registry
            .register(extension, RegisterOptions::new(factory.build(&id)))
            .await?;
        tracing::info!(extension_id = %id, instance_id = %context.instance_id, "Registered built-in extension");
        instance_ids.push(context.instance_id);
    }
    Ok(instance_ids)
}
