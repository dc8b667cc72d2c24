//! Host environment handed to extensions at activation.
//!
//! The embedding application assembles one [`HostEnvironment`] per extension.
//! Installing an API advertises the matching [`Capability`]; the registry uses
//! the advertised set to gate activation. This is a declarative guard only:
//! nothing isolates an extension from the rest of the process.
//!
//! ```rust,ignore
//! let host = HostEnvironment::builder()
//!     .with_storage(ScopedStorage::new(backend.clone(), "tasks"))
//!     .with_logging("tasks")
//!     .with_timers(TokioTimers::new())
//!     .build();
//! ```

pub mod logging;
pub mod messaging;
pub mod oauth;
pub mod storage;
pub mod timers;

pub use logging::ExtensionLogger;
pub use messaging::{
    BridgeMessage, ChannelNotifier, LocalMessageBridge, MessageBridge, Notification,
    NotificationLevel, Notifier,
};
pub use oauth::{OAuthTokens, StaticTokens};
pub use storage::{KeyValueStorage, MemoryBackend, ScopedStorage, StorageBackend};
pub use timers::{ScheduleId, TaskScheduler, TimerId, TimerService, TokioScheduler, TokioTimers};

use std::fmt;
use std::sync::Arc;

use crate::error::{ExtensionError, Result};
use crate::extension::{Capability, CapabilitySet};

/// Capability-gated services available to an extension.
#[derive(Clone, Default)]
pub struct HostEnvironment {
    capabilities: CapabilitySet,
    storage: Option<Arc<dyn KeyValueStorage>>,
    logger: Option<ExtensionLogger>,
    timers: Option<Arc<dyn TimerService>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    messaging: Option<Arc<dyn MessageBridge>>,
    notifier: Option<Arc<dyn Notifier>>,
    oauth: Option<Arc<dyn OAuthTokens>>,
}

impl HostEnvironment {
    pub fn builder() -> HostEnvironmentBuilder {
        HostEnvironmentBuilder::default()
    }

    /// Host with no capabilities at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn storage(&self) -> Result<&dyn KeyValueStorage> {
        self.storage
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Storage))
    }

    pub fn logger(&self) -> Result<&ExtensionLogger> {
        self.logger
            .as_ref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Logging))
    }

    pub fn timers(&self) -> Result<&dyn TimerService> {
        self.timers
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Timers))
    }

    pub fn scheduler(&self) -> Result<&dyn TaskScheduler> {
        self.scheduler
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Scheduling))
    }

    pub fn messaging(&self) -> Result<&dyn MessageBridge> {
        self.messaging
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Messaging))
    }

    pub fn notifier(&self) -> Result<&dyn Notifier> {
        self.notifier
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Notifications))
    }

    pub fn oauth(&self) -> Result<&dyn OAuthTokens> {
        self.oauth
            .as_deref()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::OAuth))
    }

    /// Shared handles, for extensions that need to move them into tasks.
    pub fn timers_handle(&self) -> Result<Arc<dyn TimerService>> {
        self.timers
            .clone()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Timers))
    }

    pub fn notifier_handle(&self) -> Result<Arc<dyn Notifier>> {
        self.notifier
            .clone()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Notifications))
    }

    pub fn storage_handle(&self) -> Result<Arc<dyn KeyValueStorage>> {
        self.storage
            .clone()
            .ok_or(ExtensionError::CapabilityUnavailable(Capability::Storage))
    }
}

impl fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Builder for [`HostEnvironment`].
#[derive(Default)]
pub struct HostEnvironmentBuilder {
    env: HostEnvironment,
}

impl HostEnvironmentBuilder {
    pub fn with_storage(mut self, storage: impl KeyValueStorage + 'static) -> Self {
        self.env.storage = Some(Arc::new(storage));
        self.env.capabilities.insert(Capability::Storage);
        self
    }

    /// Structured logging tagged with `extension_id`.
    pub fn with_logging(mut self, extension_id: impl Into<String>) -> Self {
        self.env.logger = Some(ExtensionLogger::new(extension_id));
        self.env.capabilities.insert(Capability::Logging);
        self
    }

    pub fn with_timers(mut self, timers: impl TimerService + 'static) -> Self {
        self.env.timers = Some(Arc::new(timers));
        self.env.capabilities.insert(Capability::Timers);
        self
    }

    pub fn with_scheduler(mut self, scheduler: impl TaskScheduler + 'static) -> Self {
        self.env.scheduler = Some(Arc::new(scheduler));
        self.env.capabilities.insert(Capability::Scheduling);
        self
    }

    pub fn with_messaging(mut self, bridge: Arc<dyn MessageBridge>) -> Self {
        self.env.messaging = Some(bridge);
        self.env.capabilities.insert(Capability::Messaging);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.env.notifier = Some(notifier);
        self.env.capabilities.insert(Capability::Notifications);
        self
    }

    pub fn with_oauth(mut self, tokens: Arc<dyn OAuthTokens>) -> Self {
        self.env.oauth = Some(tokens);
        self.env.capabilities.insert(Capability::OAuth);
        self
    }

    pub fn build(self) -> HostEnvironment {
        self.env
    }
}
