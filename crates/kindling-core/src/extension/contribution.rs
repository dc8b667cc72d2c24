//! Contribution model.
//!
//! An extension hands back one [`ExtensionRuntimeContribution`] from
//! `activate()`. The registry indexes it once and never mutates it afterwards;
//! extensions keep talking to their consumers through the state stores they
//! retained clones of.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::schema::ParameterSchema;
use crate::host::HostEnvironment;
use crate::state::StateStore;

// ============================================================================
// Contribution Kinds
// ============================================================================

/// The four kinds of things an extension can contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    Tool,
    Service,
    StateChannel,
    Slot,
}

impl fmt::Display for ContributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool => write!(f, "tool"),
            Self::Service => write!(f, "service"),
            Self::StateChannel => write!(f, "state channel"),
            Self::Slot => write!(f, "slot"),
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Schema-described description of a tool, as shown to tool-calling callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Globally unique tool name
    pub name: String,
    pub description: String,
    pub parameter_schema: ParameterSchema,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: ParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema,
        }
    }
}

/// Context passed to a tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Extension that owns the tool
    pub extension_id: String,
    /// Caller-supplied metadata
    pub metadata: Option<Value>,
}

/// Executes a tool call.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: ToolContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnToolHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value, ctx: ToolContext) -> anyhow::Result<Value> {
        (self.0)(args, ctx).await
    }
}

/// Checks tool arguments before the handler runs.
pub trait ToolValidator: Send + Sync {
    /// `Err` carries the message returned to the caller.
    fn validate(&self, args: &Value) -> Result<(), String>;
}

/// Adapter turning a closure into a [`ToolValidator`].
pub struct FnToolValidator<F>(F);

impl<F> ToolValidator for FnToolValidator<F>
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, args: &Value) -> Result<(), String> {
        (self.0)(args)
    }
}

/// Validator backed by a tool's own parameter schema.
pub struct SchemaValidator(ParameterSchema);

impl ToolValidator for SchemaValidator {
    fn validate(&self, args: &Value) -> Result<(), String> {
        self.0.validate(args)
    }
}

/// A callable tool contributed by an extension.
#[derive(Clone)]
pub struct Tool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
    pub validator: Option<Arc<dyn ToolValidator>>,
}

impl Tool {
    /// Create a tool from a definition and an async closure.
    pub fn new<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::from_handler(definition, Arc::new(FnToolHandler(handler)))
    }

    pub fn from_handler(definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            definition,
            handler,
            validator: None,
        }
    }

    /// Install a custom argument validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(FnToolValidator(validator)));
        self
    }

    /// Validate arguments against the tool's parameter schema.
    pub fn with_schema_validation(mut self) -> Self {
        self.validator = Some(Arc::new(SchemaValidator(
            self.definition.parameter_schema.clone(),
        )));
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

// ============================================================================
// Services
// ============================================================================

/// Context passed to a service handler.
#[derive(Clone)]
pub struct ServiceContext {
    pub extension_id: String,
    /// Host environment the extension was registered with
    pub host: Arc<HostEnvironment>,
    pub metadata: Option<Value>,
}

/// Executes a service invocation.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, payload: Value, ctx: ServiceContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`ServiceHandler`].
pub struct FnServiceHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ServiceHandler for FnServiceHandler<F>
where
    F: Fn(Value, ServiceContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, payload: Value, ctx: ServiceContext) -> anyhow::Result<Value> {
        (self.0)(payload, ctx).await
    }
}

/// A named operation, namespaced by the owning extension.
#[derive(Clone)]
pub struct Service {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<ParameterSchema>,
    pub handler: Arc<dyn ServiceHandler>,
}

impl Service {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
            handler: Arc::new(FnServiceHandler(handler)),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input_schema(mut self, schema: ParameterSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

// ============================================================================
// State Channels & Slots
// ============================================================================

/// Globally identified, subscribable state snapshot.
#[derive(Debug, Clone)]
pub struct StateChannel {
    pub id: String,
    pub description: Option<String>,
    pub store: StateStore<Value>,
}

impl StateChannel {
    pub fn new(id: impl Into<String>, store: StateStore<Value>) -> Self {
        Self {
            id: id.into(),
            description: None,
            store,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Observable presentation state of a slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel: Option<Value>,
}

impl SlotState {
    pub fn visible() -> Self {
        Self {
            visible: true,
            ..Self::default()
        }
    }

    pub fn with_badge(mut self, badge: impl Into<String>) -> Self {
        self.badge = Some(badge.into());
        self
    }
}

/// A UI contribution rendered by the presentation layer.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: String,
    pub label: String,
    pub icon: String,
    /// Higher priorities are listed first
    pub priority: Option<i32>,
    pub state: StateStore<SlotState>,
}

impl Slot {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        icon: impl Into<String>,
        state: StateStore<SlotState>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            icon: icon.into(),
            priority: None,
            state,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

// ============================================================================
// Dispose Hook
// ============================================================================

/// Teardown hook run once when the contribution is unregistered.
pub struct DisposeHook(Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>);

impl DisposeHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

impl fmt::Debug for DisposeHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisposeHook")
    }
}

// ============================================================================
// Contribution
// ============================================================================

/// Everything an extension contributes once activated.
#[derive(Debug, Default)]
pub struct ExtensionRuntimeContribution {
    pub tools: Vec<Tool>,
    pub services: Vec<Service>,
    pub state_channels: Vec<StateChannel>,
    pub slots: Vec<Slot>,
    /// Free-form metadata exposed through `get_contribution_metadata`
    pub metadata: Option<Value>,
    pub dispose: Option<DisposeHook>,
}

impl ExtensionRuntimeContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_state_channel(mut self, channel: StateChannel) -> Self {
        self.state_channels.push(channel);
        self
    }

    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn on_dispose<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispose = Some(DisposeHook::new(f));
        self
    }

    /// No tools, services, channels or slots. Metadata and dispose don't count.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
            && self.services.is_empty()
            && self.state_channels.is_empty()
            && self.slots.is_empty()
    }

    /// Globally unique identifiers claimed by this contribution.
    ///
    /// Services are namespaced per extension and are not included.
    pub fn global_identifiers(&self) -> impl Iterator<Item = (ContributionKind, &str)> + '_ {
        self.tools
            .iter()
            .map(|t| (ContributionKind::Tool, t.name()))
            .chain(
                self.state_channels
                    .iter()
                    .map(|c| (ContributionKind::StateChannel, c.id.as_str())),
            )
            .chain(self.slots.iter().map(|s| (ContributionKind::Slot, s.id.as_str())))
    }
}
