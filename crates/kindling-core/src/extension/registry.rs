//! Extension registry.
//!
//! The registry owns every registration record and the four contribution
//! indexes. Callers only ever see cloned, read-only views.
//!
//! Registration order is fixed: manifest check, capability check, activation,
//! empty check, conflict check, indexing, events. Calls for the same extension
//! id are serialized by a per-id async mutex held from the existence check
//! through indexing; events go out after it is released.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capability::{Capability, CapabilitySet};
use super::contribution::{
    ContributionKind, DisposeHook, ExtensionRuntimeContribution, Service, ServiceContext, Slot,
    SlotState, StateChannel, Tool, ToolContext, ToolDefinition,
};
use super::executor::{guarded, run_service, run_tool, FailureKind, GuardError, ToolResult};
use super::schema::ParameterSchema;
use super::system::{DynExtension, ExtensionContext, ExtensionManifest, ExtensionState};
use crate::config::RuntimeConfig;
use crate::error::{ExtensionError, Result};
use crate::eventbus::{EventBus, RegistryEvent};
use crate::host::HostEnvironment;
use crate::state::StateReader;

// ============================================================================
// Options & Views
// ============================================================================

/// Options for [`ExtensionRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Host environment handed to `activate` and to service handlers
    pub host: Arc<HostEnvironment>,
    /// Extension configuration, exposed through [`ExtensionContext::config`]
    pub config: Option<Value>,
    /// Unregister an existing registration with the same id first
    pub replace: bool,
}

impl RegisterOptions {
    pub fn new(host: HostEnvironment) -> Self {
        Self::with_host(Arc::new(host))
    }

    pub fn with_host(host: Arc<HostEnvironment>) -> Self {
        Self {
            host,
            config: None,
            replace: false,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }
}

/// A registered tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub extension_id: String,
    #[serde(flatten)]
    pub definition: ToolDefinition,
}

/// A registered service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub extension_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<ParameterSchema>,
}

/// A registered state channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChannelEntry {
    pub extension_id: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip)]
    pub channel: StateReader<Value>,
}

/// A registered slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub extension_id: String,
    pub id: String,
    pub label: String,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip)]
    pub state: StateReader<SlotState>,
}

/// What an extension required, was granted, and contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesSummary {
    pub required: Vec<Capability>,
    pub granted: CapabilitySet,
    pub tools: usize,
    pub services: usize,
    pub state_channels: usize,
    pub slots: usize,
}

/// Read-only view of a registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInfo {
    pub manifest: ExtensionManifest,
    pub instance_id: String,
    pub registered_at: DateTime<Utc>,
    pub state: ExtensionState,
    pub capabilities: CapabilitiesSummary,
}

/// Registry-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub extensions: usize,
    pub tools: usize,
    pub services: usize,
    pub state_channels: usize,
    pub slots: usize,
    pub tool_executions: u64,
    pub tool_failures: u64,
    pub service_invocations: u64,
    pub service_failures: u64,
    pub listener_failures: u64,
}

// ============================================================================
// Internal State
// ============================================================================

struct RegisteredExtension {
    extension: DynExtension,
    manifest: ExtensionManifest,
    host: Arc<HostEnvironment>,
    context: ExtensionContext,
    tool_names: Vec<String>,
    service_names: Vec<String>,
    channel_ids: Vec<String>,
    slot_ids: Vec<String>,
    metadata: Option<Value>,
    dispose: Option<DisposeHook>,
    registered_at: DateTime<Utc>,
    capabilities: CapabilitiesSummary,
}

impl RegisteredExtension {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            manifest: self.manifest.clone(),
            instance_id: self.context.instance_id.clone(),
            registered_at: self.registered_at,
            state: ExtensionState::Registered,
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Handles needed to tear down a detached registration, plus the index
/// entries it gave up.
type Detached = (
    DynExtension,
    ExtensionContext,
    Option<DisposeHook>,
    Vec<(ContributionKind, String)>,
);

/// A registration that is indexed but not yet announced.
struct Registered {
    context: ExtensionContext,
    added: Vec<(ContributionKind, String)>,
    tools: Vec<String>,
}

/// A finished unregistration whose events are still owed.
struct Unregistered {
    extension_id: String,
    instance_id: String,
    tools: Vec<String>,
    reasons: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    extensions: HashMap<String, RegisteredExtension>,
    tools: BTreeMap<String, (String, Tool)>,
    /// Keyed by (extension id, service name)
    services: BTreeMap<(String, String), Service>,
    channels: BTreeMap<String, (String, StateChannel)>,
    slots: BTreeMap<String, (String, Slot)>,
    /// Ids currently activating or deactivating
    transitions: HashMap<String, ExtensionState>,
}

impl RegistryState {
    fn owner_of(&self, kind: ContributionKind, id: &str) -> Option<&str> {
        match kind {
            ContributionKind::Tool => self.tools.get(id).map(|(owner, _)| owner.as_str()),
            ContributionKind::StateChannel => {
                self.channels.get(id).map(|(owner, _)| owner.as_str())
            }
            ContributionKind::Slot => self.slots.get(id).map(|(owner, _)| owner.as_str()),
            ContributionKind::Service => None,
        }
    }

    /// First identifier of `contribution` that cannot be indexed for `extension_id`.
    fn find_conflict(
        &self,
        extension_id: &str,
        contribution: &ExtensionRuntimeContribution,
    ) -> Option<ExtensionError> {
        let mut seen = HashSet::new();
        for (kind, id) in contribution.global_identifiers() {
            if let Some(owner) = self.owner_of(kind, id) {
                if owner != extension_id {
                    return Some(ExtensionError::IdentifierConflict {
                        kind,
                        id: id.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
            if !seen.insert((kind, id)) {
                return Some(ExtensionError::IdentifierConflict {
                    kind,
                    id: id.to_string(),
                    owner: extension_id.to_string(),
                });
            }
        }

        let mut services = HashSet::new();
        for service in &contribution.services {
            if !services.insert(service.name.as_str()) {
                return Some(ExtensionError::IdentifierConflict {
                    kind: ContributionKind::Service,
                    id: service.name.clone(),
                    owner: extension_id.to_string(),
                });
            }
        }
        None
    }

    /// Index every part of `contribution` and store the record.
    ///
    /// Returns the identifiers added, in index order.
    fn index(
        &mut self,
        extension: DynExtension,
        manifest: ExtensionManifest,
        host: Arc<HostEnvironment>,
        context: ExtensionContext,
        contribution: ExtensionRuntimeContribution,
    ) -> Vec<(ContributionKind, String)> {
        let extension_id = manifest.id.clone();
        let ExtensionRuntimeContribution {
            tools,
            services,
            state_channels,
            slots,
            metadata,
            dispose,
        } = contribution;

        let mut added = Vec::new();
        let mut record = RegisteredExtension {
            extension,
            capabilities: CapabilitiesSummary {
                required: manifest.required_capabilities.clone(),
                granted: host.capabilities().clone(),
                tools: tools.len(),
                services: services.len(),
                state_channels: state_channels.len(),
                slots: slots.len(),
            },
            manifest,
            host,
            context,
            tool_names: Vec::new(),
            service_names: Vec::new(),
            channel_ids: Vec::new(),
            slot_ids: Vec::new(),
            metadata,
            dispose,
            registered_at: Utc::now(),
        };

        for tool in tools {
            let name = tool.name().to_string();
            record.tool_names.push(name.clone());
            added.push((ContributionKind::Tool, name.clone()));
            self.tools.insert(name, (extension_id.clone(), tool));
        }
        for service in services {
            let name = service.name.clone();
            record.service_names.push(name.clone());
            added.push((ContributionKind::Service, name.clone()));
            self.services.insert((extension_id.clone(), name), service);
        }
        for channel in state_channels {
            let id = channel.id.clone();
            record.channel_ids.push(id.clone());
            added.push((ContributionKind::StateChannel, id.clone()));
            self.channels.insert(id, (extension_id.clone(), channel));
        }
        for slot in slots {
            let id = slot.id.clone();
            record.slot_ids.push(id.clone());
            added.push((ContributionKind::Slot, id.clone()));
            self.slots.insert(id, (extension_id.clone(), slot));
        }

        self.extensions.insert(extension_id, record);
        added
    }

    /// Remove every index entry owned by `extension_id` and take its dispose
    /// hook. The record itself stays until teardown finishes.
    fn detach(&mut self, extension_id: &str) -> Option<Detached> {
        let record = self.extensions.get_mut(extension_id)?;
        let dispose = record.dispose.take();
        let extension = record.extension.clone();
        let context = record.context.clone();
        let tool_names = std::mem::take(&mut record.tool_names);
        let service_names = std::mem::take(&mut record.service_names);
        let channel_ids = std::mem::take(&mut record.channel_ids);
        let slot_ids = std::mem::take(&mut record.slot_ids);

        let mut removed = Vec::new();
        for name in tool_names {
            if self.tools.remove(&name).is_some() {
                removed.push((ContributionKind::Tool, name));
            }
        }
        for name in service_names {
            if self
                .services
                .remove(&(extension_id.to_string(), name.clone()))
                .is_some()
            {
                removed.push((ContributionKind::Service, name));
            }
        }
        for id in channel_ids {
            if self.channels.remove(&id).is_some() {
                removed.push((ContributionKind::StateChannel, id));
            }
        }
        for id in slot_ids {
            if self.slots.remove(&id).is_some() {
                removed.push((ContributionKind::Slot, id));
            }
        }
        Some((extension, context, dispose, removed))
    }

    fn info(&self, record: &RegisteredExtension) -> ExtensionInfo {
        let mut info = record.info();
        if let Some(transition) = self.transitions.get(&record.manifest.id) {
            info.state = *transition;
        }
        info
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Orchestrates extension lifecycle, indexing and call routing.
pub struct ExtensionRegistry {
    state: RwLock<RegistryState>,
    id_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventBus,
    config: RuntimeConfig,
    tool_executions: AtomicU64,
    tool_failures: AtomicU64,
    service_invocations: AtomicU64,
    service_failures: AtomicU64,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let events = EventBus::with_options(config.event_channel_capacity, config.listener_timeout);
        Self {
            state: RwLock::new(RegistryState::default()),
            id_locks: Mutex::new(HashMap::new()),
            events,
            config,
            tool_executions: AtomicU64::new(0),
            tool_failures: AtomicU64::new(0),
            service_invocations: AtomicU64::new(0),
            service_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Event bus announcing registry changes.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn id_lock(&self, extension_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.id_locks
            .lock()
            .entry(extension_id.to_string())
            .or_default()
            .clone()
    }

    /// Give back a lock taken with [`Self::id_lock`]. The map entry is dropped
    /// once no other caller holds or waits on it.
    fn release_id_lock(&self, extension_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.id_locks.lock();
        drop(lock);
        if locks
            .get(extension_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(extension_id);
        }
    }

    fn set_transition(&self, extension_id: &str, state: Option<ExtensionState>) {
        let mut guard = self.state.write();
        match state {
            Some(state) => {
                guard.transitions.insert(extension_id.to_string(), state);
            }
            None => {
                guard.transitions.remove(extension_id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Register
    // ------------------------------------------------------------------------

    /// Register and activate an extension.
    ///
    /// Returns the context of the new registration. On error, every previously
    /// registered extension is left untouched.
    ///
    /// Events are emitted after the per-id lock is released, so listeners may
    /// call back into the registry for the same id.
    pub async fn register(
        &self,
        extension: DynExtension,
        options: RegisterOptions,
    ) -> Result<ExtensionContext> {
        let manifest = extension.manifest().clone();
        manifest.validate()?;
        let extension_id = manifest.id.clone();

        let lock = self.id_lock(&extension_id);
        let guard = lock.lock().await;
        let mut replaced = None;
        let outcome = self
            .register_locked(extension, manifest, options, &mut replaced)
            .await;
        drop(guard);
        self.release_id_lock(&extension_id, lock);

        if let Some(replaced) = replaced {
            if let Err(e) = self.announce_unregistered(replaced).await {
                warn!(extension_id = %extension_id, error = %e, "Previous instance teardown incomplete");
            }
        }

        let Registered {
            context,
            added,
            tools,
        } = outcome?;
        for (kind, id) in added {
            self.events.spawn_emit(RegistryEvent::CapabilityRegistered {
                extension_id: extension_id.clone(),
                kind,
                id,
            });
        }
        self.events
            .emit(RegistryEvent::ExtensionRegistered {
                extension_id,
                instance_id: context.instance_id.clone(),
            })
            .await;
        self.events.emit(RegistryEvent::ToolsChanged { tools }).await;

        Ok(context)
    }

    /// Everything from the existence check to indexing. The caller holds the
    /// per-id lock; an instance removed by `replace` is handed back through
    /// `replaced`.
    async fn register_locked(
        &self,
        extension: DynExtension,
        manifest: ExtensionManifest,
        options: RegisterOptions,
        replaced: &mut Option<Unregistered>,
    ) -> Result<Registered> {
        let extension_id = manifest.id.clone();

        if self.is_registered(&extension_id) {
            if !options.replace {
                return Err(ExtensionError::AlreadyRegistered(extension_id));
            }
            warn!(extension_id = %extension_id, "Replacing registered extension");
            *replaced = self.unregister_locked(&extension_id).await;
        }

        if let Some(capability) = options
            .host
            .capabilities()
            .first_missing(&manifest.required_capabilities)
        {
            return Err(ExtensionError::MissingCapability {
                extension_id,
                capability,
            });
        }

        let host = options.host;
        let context = ExtensionContext::new(&extension_id, options.config);
        self.set_transition(&extension_id, Some(ExtensionState::Activating));
        debug!(extension_id = %extension_id, instance_id = %context.instance_id, "Activating extension");

        let activated = guarded(
            extension.activate(host.clone(), &context),
            self.config.activation_timeout,
        )
        .await;
        let contribution = match activated {
            Ok(Ok(contribution)) => contribution,
            Ok(Err(e)) => {
                self.set_transition(&extension_id, None);
                return Err(ExtensionError::ActivationFailed {
                    extension_id,
                    reason: e.to_string(),
                });
            }
            Err(GuardError::TimedOut(after)) => {
                self.set_transition(&extension_id, None);
                return Err(ExtensionError::Timeout {
                    operation: format!("activation of '{}'", extension_id),
                    after_ms: after.as_millis() as u64,
                });
            }
            Err(GuardError::Panicked(msg)) => {
                self.set_transition(&extension_id, None);
                return Err(ExtensionError::ActivationFailed {
                    extension_id,
                    reason: format!("panicked: {}", msg),
                });
            }
        };

        if contribution.is_empty() {
            self.set_transition(&extension_id, None);
            self.compensate(&extension, &context, contribution.dispose).await;
            return Err(ExtensionError::EmptyContribution(extension_id));
        }

        let indexed = {
            let mut state = self.state.write();
            state.transitions.remove(&extension_id);
            match state.find_conflict(&extension_id, &contribution) {
                Some(conflict) => Err((conflict, contribution)),
                None => {
                    let added = state.index(
                        extension.clone(),
                        manifest,
                        host,
                        context.clone(),
                        contribution,
                    );
                    Ok((added, state.tool_names()))
                }
            }
        };

        let (added, tools) = match indexed {
            Ok(indexed) => indexed,
            Err((conflict, contribution)) => {
                self.compensate(&extension, &context, contribution.dispose).await;
                return Err(conflict);
            }
        };

        info!(
            extension_id = %extension_id,
            instance_id = %context.instance_id,
            contributions = added.len(),
            "Extension registered"
        );
        Ok(Registered {
            context,
            added,
            tools,
        })
    }

    /// Undo an activation whose contribution was rejected.
    async fn compensate(
        &self,
        extension: &DynExtension,
        context: &ExtensionContext,
        dispose: Option<DisposeHook>,
    ) {
        let reasons = self.teardown(extension, context, dispose).await;
        for reason in reasons {
            warn!(instance_id = %context.instance_id, error = %reason, "Compensating teardown failed");
        }
    }

    /// Run `dispose` then `deactivate`. Both always run; failures are collected.
    async fn teardown(
        &self,
        extension: &DynExtension,
        context: &ExtensionContext,
        dispose: Option<DisposeHook>,
    ) -> Vec<String> {
        let limit = self.config.teardown_timeout;
        let mut reasons = Vec::new();

        if let Some(dispose) = dispose {
            match guarded(dispose.run(), limit).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => reasons.push(format!("dispose: {:#}", e)),
                Err(GuardError::TimedOut(after)) => {
                    reasons.push(format!("dispose: timed out after {}ms", after.as_millis()))
                }
                Err(GuardError::Panicked(msg)) => reasons.push(format!("dispose: panicked: {}", msg)),
            }
        }

        match guarded(extension.deactivate(context), limit).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => reasons.push(format!("deactivate: {}", e)),
            Err(GuardError::TimedOut(after)) => {
                reasons.push(format!("deactivate: timed out after {}ms", after.as_millis()))
            }
            Err(GuardError::Panicked(msg)) => {
                reasons.push(format!("deactivate: panicked: {}", msg))
            }
        }
        reasons
    }

    // ------------------------------------------------------------------------
    // Unregister
    // ------------------------------------------------------------------------

    /// Unregister an extension.
    ///
    /// Returns `Ok(false)` for unknown ids. The extension is always fully
    /// removed; `Err(TeardownFailed)` reports a failing `dispose` or
    /// `deactivate` after the fact.
    pub async fn unregister(&self, extension_id: &str) -> Result<bool> {
        let lock = self.id_lock(extension_id);
        let guard = lock.lock().await;
        let unregistered = self.unregister_locked(extension_id).await;
        drop(guard);
        self.release_id_lock(extension_id, lock);

        match unregistered {
            Some(unregistered) => self.announce_unregistered(unregistered).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Unregister with the per-id lock already held.
    ///
    /// Index entries go first, then `dispose` and `deactivate` run while the
    /// record is still present in the `Deactivating` state, then the record
    /// is deleted.
    async fn unregister_locked(&self, extension_id: &str) -> Option<Unregistered> {
        let (extension, context, dispose, removed) = {
            let mut state = self.state.write();
            let detached = state.detach(extension_id)?;
            state
                .transitions
                .insert(extension_id.to_string(), ExtensionState::Deactivating);
            detached
        };

        for (kind, id) in removed {
            self.events.spawn_emit(RegistryEvent::CapabilityRemoved {
                extension_id: extension_id.to_string(),
                kind,
                id,
            });
        }

        let reasons = self.teardown(&extension, &context, dispose).await;
        let tools = {
            let mut state = self.state.write();
            state.extensions.remove(extension_id);
            state.transitions.remove(extension_id);
            state.tool_names()
        };

        info!(
            extension_id = %extension_id,
            instance_id = %context.instance_id,
            "Extension unregistered"
        );
        Some(Unregistered {
            extension_id: extension_id.to_string(),
            instance_id: context.instance_id,
            tools,
            reasons,
        })
    }

    /// Emit `extension:unregistered` then `tools:changed`, and turn collected
    /// teardown failures into an error.
    async fn announce_unregistered(&self, unregistered: Unregistered) -> Result<()> {
        let Unregistered {
            extension_id,
            instance_id,
            tools,
            reasons,
        } = unregistered;

        self.events
            .emit(RegistryEvent::ExtensionUnregistered {
                extension_id: extension_id.clone(),
                instance_id,
            })
            .await;
        self.events.emit(RegistryEvent::ToolsChanged { tools }).await;

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ExtensionError::TeardownFailed {
                extension_id,
                reasons,
            })
        }
    }

    /// Unregister every extension. Returns how many were removed.
    pub async fn destroy(&self) -> usize {
        let mut removed = 0;
        for extension_id in self.get_extension_ids() {
            match self.unregister(&extension_id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    removed += 1;
                    warn!(extension_id = %extension_id, error = %e, "Teardown failed during destroy");
                }
            }
        }
        info!(removed, "Registry destroyed");
        removed
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Execute a tool by name. Never fails; problems come back as a failed
    /// [`ToolResult`].
    pub async fn execute_tool(&self, name: &str, args: Value, metadata: Option<Value>) -> ToolResult {
        self.tool_executions.fetch_add(1, Ordering::Relaxed);

        let found = self.state.read().tools.get(name).cloned();
        let result = match found {
            Some((extension_id, tool)) => {
                let ctx = ToolContext {
                    extension_id,
                    metadata,
                };
                run_tool(&tool, args, ctx, self.config.handler_timeout).await
            }
            None => {
                debug!(tool = name, "Unknown tool");
                ToolResult::failed(FailureKind::NotFound, format!("Tool '{}' not found", name))
            }
        };

        if !result.success {
            self.tool_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Invoke a service of a registered extension.
    ///
    /// Fails only when the extension or service does not exist. Handler
    /// failures come back as a failed [`ToolResult`].
    pub async fn invoke_service(
        &self,
        extension_id: &str,
        service: &str,
        payload: Value,
        metadata: Option<Value>,
    ) -> Result<ToolResult> {
        let (service, host) = {
            let state = self.state.read();
            let record = state
                .extensions
                .get(extension_id)
                .ok_or_else(|| ExtensionError::NotFound(extension_id.to_string()))?;
            let found = state
                .services
                .get(&(extension_id.to_string(), service.to_string()))
                .cloned()
                .ok_or_else(|| ExtensionError::ServiceNotFound {
                    extension_id: extension_id.to_string(),
                    service: service.to_string(),
                })?;
            (found, record.host.clone())
        };

        self.service_invocations.fetch_add(1, Ordering::Relaxed);
        let ctx = ServiceContext {
            extension_id: extension_id.to_string(),
            host,
            metadata,
        };
        let result = run_service(&service, payload, ctx, self.config.handler_timeout).await;
        if !result.success {
            self.service_failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// All tools, sorted by name.
    pub fn get_all_tools(&self) -> Vec<ToolEntry> {
        self.state
            .read()
            .tools
            .values()
            .map(|(extension_id, tool)| ToolEntry {
                extension_id: extension_id.clone(),
                definition: tool.definition.clone(),
            })
            .collect()
    }

    /// Definitions only, in the shape tool-calling callers expect.
    pub fn get_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.state
            .read()
            .tools
            .values()
            .map(|(_, tool)| tool.definition.clone())
            .collect()
    }

    pub fn get_tools_by_extension(&self, extension_id: &str) -> Vec<ToolEntry> {
        self.get_all_tools()
            .into_iter()
            .filter(|t| t.extension_id == extension_id)
            .collect()
    }

    /// All services, sorted by extension id then name.
    pub fn get_services(&self) -> Vec<ServiceDescriptor> {
        self.state
            .read()
            .services
            .iter()
            .map(|((extension_id, _), service)| ServiceDescriptor {
                extension_id: extension_id.clone(),
                name: service.name.clone(),
                description: service.description.clone(),
                input_schema: service.input_schema.clone(),
            })
            .collect()
    }

    pub fn get_services_by_extension(&self, extension_id: &str) -> Vec<ServiceDescriptor> {
        self.get_services()
            .into_iter()
            .filter(|s| s.extension_id == extension_id)
            .collect()
    }

    pub fn get_state_channels(&self) -> Vec<StateChannelEntry> {
        self.state
            .read()
            .channels
            .values()
            .map(|(extension_id, channel)| channel_entry(extension_id, channel))
            .collect()
    }

    pub fn get_state_channel(&self, id: &str) -> Option<StateChannelEntry> {
        self.state
            .read()
            .channels
            .get(id)
            .map(|(extension_id, channel)| channel_entry(extension_id, channel))
    }

    /// All slots, highest priority first, then by id. Missing priority counts as 0.
    pub fn get_slots(&self) -> Vec<SlotEntry> {
        let mut slots: Vec<_> = self
            .state
            .read()
            .slots
            .values()
            .map(|(extension_id, slot)| slot_entry(extension_id, slot))
            .collect();
        slots.sort_by(|a, b| {
            b.priority
                .unwrap_or(0)
                .cmp(&a.priority.unwrap_or(0))
                .then_with(|| a.id.cmp(&b.id))
        });
        slots
    }

    pub fn get_slot(&self, id: &str) -> Option<SlotEntry> {
        self.state
            .read()
            .slots
            .get(id)
            .map(|(extension_id, slot)| slot_entry(extension_id, slot))
    }

    pub fn has_slot(&self, id: &str) -> bool {
        self.state.read().slots.contains_key(id)
    }

    /// Metadata the extension attached to its contribution.
    pub fn get_contribution_metadata(&self, extension_id: &str) -> Option<Value> {
        self.state
            .read()
            .extensions
            .get(extension_id)
            .and_then(|record| record.metadata.clone())
    }

    /// Registered extension ids, sorted.
    pub fn get_extension_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.read().extensions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_extension_info(&self, extension_id: &str) -> Option<ExtensionInfo> {
        let state = self.state.read();
        state
            .extensions
            .get(extension_id)
            .map(|record| state.info(record))
    }

    /// Every registration, sorted by id.
    pub fn list_extensions(&self) -> Vec<ExtensionInfo> {
        let state = self.state.read();
        let mut list: Vec<_> = state
            .extensions
            .values()
            .map(|record| state.info(record))
            .collect();
        list.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        list
    }

    pub fn is_registered(&self, extension_id: &str) -> bool {
        self.state.read().extensions.contains_key(extension_id)
    }

    /// Lifecycle state of an extension id.
    pub fn get_extension_state(&self, extension_id: &str) -> ExtensionState {
        let state = self.state.read();
        if let Some(transition) = state.transitions.get(extension_id) {
            return *transition;
        }
        if state.extensions.contains_key(extension_id) {
            ExtensionState::Registered
        } else {
            ExtensionState::Unregistered
        }
    }

    pub fn get_stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            extensions: state.extensions.len(),
            tools: state.tools.len(),
            services: state.services.len(),
            state_channels: state.channels.len(),
            slots: state.slots.len(),
            tool_executions: self.tool_executions.load(Ordering::Relaxed),
            tool_failures: self.tool_failures.load(Ordering::Relaxed),
            service_invocations: self.service_invocations.load(Ordering::Relaxed),
            service_failures: self.service_failures.load(Ordering::Relaxed),
            listener_failures: self.events.listener_failures(),
        }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_entry(extension_id: &str, channel: &StateChannel) -> StateChannelEntry {
    StateChannelEntry {
        extension_id: extension_id.to_string(),
        id: channel.id.clone(),
        description: channel.description.clone(),
        channel: channel.store.reader(),
    }
}

fn slot_entry(extension_id: &str, slot: &Slot) -> SlotEntry {
    SlotEntry {
        extension_id: extension_id.to_string(),
        id: slot.id.clone(),
        label: slot.label.clone(),
        icon: slot.icon.clone(),
        priority: slot.priority,
        state: slot.state.reader(),
    }
}
