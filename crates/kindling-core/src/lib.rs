//! Core of the Kindling extension runtime.
//!
//! This crate defines the extension contract, the capability-gated host
//! environment, the contribution model and the registry that activates,
//! indexes and tears down extensions.

pub mod config;
pub mod error;
pub mod eventbus;
pub mod extension;
pub mod host;
pub mod state;

pub use config::RuntimeConfig;
pub use error::{ExtensionError, Result};
pub use eventbus::{
    EventBus, EventBusReceiver, EventKind, EventListener, EventMetadata, FilteredReceiver,
    RegistryEvent, Subscription,
};
pub use extension::{ExtensionRegistry, RegisterOptions, ToolResult};
pub use host::{HostEnvironment, HostEnvironmentBuilder};
pub use state::{StateReader, StateStore, StateSubscription};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{ExtensionError, Result};
    pub use crate::eventbus::{EventBus, EventKind, RegistryEvent};
    pub use crate::extension::{
        Capability, DynExtension, Extension, ExtensionContext, ExtensionManifest,
        ExtensionRegistry, ExtensionRuntimeContribution, ParameterSchema, PropertySchema,
        RegisterOptions, Service, Slot, SlotState, StateChannel, Tool, ToolDefinition, ToolResult,
    };
    pub use crate::host::{HostEnvironment, KeyValueStorage, Notification, TimerService};
    pub use crate::state::{StateReader, StateStore};
}
