//! Extension system.
//!
//! Extensions are in-process units that contribute tools, services, state
//! channels and UI slots to the embedding application.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                   ExtensionRegistry                    │
//! │  - capability gating before activation                 │
//! │  - conflict detection and indexing                     │
//! │  - tool / service routing                              │
//! └───────────────────────────────────────────────────────┘
//!            │ activate(host, ctx)          ▲ contribution
//!            ▼                              │
//!   ┌─────────────────┐          ┌──────────────────────┐
//!   │ HostEnvironment │ ◄─────── │  dyn Extension       │
//!   │ storage, timers │          │  tools, services,    │
//!   │ logging, ...    │          │  channels, slots     │
//!   └─────────────────┘          └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use kindling_core::extension::{ExtensionRegistry, RegisterOptions};
//!
//! let registry = ExtensionRegistry::new();
//! registry.register(Arc::new(MyExtension::new()), RegisterOptions::new(host)).await?;
//!
//! let result = registry.execute_tool("addTask", json!({ "text": "buy milk" }), None).await;
//! ```

pub mod capability;
pub mod contribution;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod system;

pub use capability::{Capability, CapabilitySet, UnknownCapability};
pub use contribution::{
    ContributionKind, DisposeHook, ExtensionRuntimeContribution, FnServiceHandler, FnToolHandler,
    FnToolValidator, SchemaValidator, Service, ServiceContext, ServiceHandler, Slot, SlotState,
    StateChannel, Tool, ToolContext, ToolDefinition, ToolHandler, ToolValidator,
};
pub use executor::{FailureKind, ToolResult};
pub use registry::{
    CapabilitiesSummary, ExtensionInfo, ExtensionRegistry, RegisterOptions, RegistryStats,
    ServiceDescriptor, SlotEntry, StateChannelEntry, ToolEntry,
};
pub use schema::{ParameterSchema, PropertySchema, SchemaType};
pub use system::{DynExtension, Extension, ExtensionContext, ExtensionManifest, ExtensionState};
