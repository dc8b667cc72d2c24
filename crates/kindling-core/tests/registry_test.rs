//! Registry behaviour tests
//!
//! Covers registration, conflicts, replacement, teardown, tool execution and
//! capability gating through the public API only.

use kindling_core::extension::{
    Capability, ContributionKind, ExtensionContext, ExtensionManifest, ExtensionRegistry,
    ExtensionRuntimeContribution, ExtensionState, FailureKind, ParameterSchema, PropertySchema,
    RegisterOptions, Service, Slot, SlotState, StateChannel, Tool, ToolDefinition,
};
use kindling_core::host::{MemoryBackend, ScopedStorage};
use kindling_core::prelude::Extension;
use kindling_core::{EventKind, ExtensionError, HostEnvironment, Result, RuntimeConfig, StateStore};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ============================================================================
// Test extension
// ============================================================================

#[derive(Default)]
struct Counters {
    activate: AtomicUsize,
    deactivate: AtomicUsize,
    dispose: AtomicUsize,
}

struct TestExtension {
    manifest: ExtensionManifest,
    tools: Vec<String>,
    services: Vec<String>,
    channels: Vec<(String, Value)>,
    slots: Vec<String>,
    counters: Arc<Counters>,
}

impl TestExtension {
    fn new(id: &str) -> Self {
        Self {
            manifest: ExtensionManifest::new(id, id, semver::Version::new(1, 0, 0)),
            tools: Vec::new(),
            services: Vec::new(),
            channels: Vec::new(),
            slots: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    fn tool(mut self, name: &str) -> Self {
        self.tools.push(name.to_string());
        self
    }

    fn service(mut self, name: &str) -> Self {
        self.services.push(name.to_string());
        self
    }

    fn channel(mut self, id: &str, state: Value) -> Self {
        self.channels.push((id.to_string(), state));
        self
    }

    fn slot(mut self, id: &str) -> Self {
        self.slots.push(id.to_string());
        self
    }

    fn requires(mut self, capability: Capability) -> Self {
        self.manifest = self.manifest.requires(capability);
        self
    }

    fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }
}

#[async_trait::async_trait]
impl Extension for TestExtension {
    fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    async fn activate(
        &self,
        _host: Arc<HostEnvironment>,
        context: &ExtensionContext,
    ) -> Result<ExtensionRuntimeContribution> {
        self.counters.activate.fetch_add(1, Ordering::SeqCst);

        let mut contribution = ExtensionRuntimeContribution::new()
            .with_metadata(json!({ "instance": context.instance_id }));
        for name in &self.tools {
            let instance = context.instance_id.clone();
            contribution = contribution.with_tool(Tool::new(
                ToolDefinition::new(name.as_str(), "test tool", ParameterSchema::new()),
                move |args, _ctx| {
                    let instance = instance.clone();
                    async move { Ok(json!({ "instance": instance, "args": args })) }
                },
            ));
        }
        for name in &self.services {
            contribution = contribution.with_service(Service::new(name.as_str(), |payload, ctx| async move {
                Ok(json!({ "extension": ctx.extension_id, "payload": payload }))
            }));
        }
        for (id, state) in &self.channels {
            contribution =
                contribution.with_state_channel(StateChannel::new(id.as_str(), StateStore::new(state.clone())));
        }
        for id in &self.slots {
            contribution = contribution.with_slot(Slot::new(
                id.as_str(),
                id.as_str(),
                "star",
                StateStore::new(SlotState::visible()),
            ));
        }

        let counters = self.counters.clone();
        Ok(contribution.on_dispose(move || async move {
            counters.dispose.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    async fn deactivate(&self, _context: &ExtensionContext) -> Result<()> {
        self.counters.deactivate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn options() -> RegisterOptions {
    RegisterOptions::default()
}

fn tool_names(registry: &ExtensionRegistry) -> Vec<String> {
    registry
        .get_all_tools()
        .into_iter()
        .map(|t| t.definition.name)
        .collect()
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_disjoint_extensions_union_of_tools() {
    let registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(TestExtension::new("a").tool("alpha").tool("beta")), options())
        .await
        .unwrap();
    registry
        .register(Arc::new(TestExtension::new("b").tool("gamma")), options())
        .await
        .unwrap();

    assert_eq!(tool_names(&registry), vec!["alpha", "beta", "gamma"]);
    assert_eq!(registry.get_tools_by_extension("a").len(), 2);
    assert_eq!(registry.get_extension_ids(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_duplicate_id_without_replace_keeps_original() {
    let registry = ExtensionRegistry::new();
    registry
        .register(
            Arc::new(
                TestExtension::new("tasks")
                    .tool("addTask")
                    .service("refresh")
                    .channel("tasks.list", json!([]))
                    .slot("tasks"),
            ),
            options(),
        )
        .await
        .unwrap();

    let second = TestExtension::new("tasks").tool("other");
    let second_counters = second.counters();
    let err = registry
        .register(Arc::new(second), options())
        .await
        .unwrap_err();

    assert!(matches!(err, ExtensionError::AlreadyRegistered(ref id) if id == "tasks"));
    assert!(err.to_string().contains("tasks"));
    assert_eq!(second_counters.activate.load(Ordering::SeqCst), 0);

    assert_eq!(tool_names(&registry), vec!["addTask"]);
    assert_eq!(registry.get_services_by_extension("tasks").len(), 1);
    assert!(registry.get_state_channel("tasks.list").is_some());
    assert!(registry.has_slot("tasks"));
}

#[tokio::test]
async fn test_replace_purges_previous_instance() {
    let registry = ExtensionRegistry::new();
    let first = TestExtension::new("tasks")
        .tool("addTask")
        .tool("legacyTool")
        .service("legacy")
        .channel("tasks.old", json!(1))
        .slot("old-slot");
    let first_counters = first.counters();
    let first_ctx = registry.register(Arc::new(first), options()).await.unwrap();

    let second_ctx = registry
        .register(
            Arc::new(TestExtension::new("tasks").tool("addTask").service("refresh")),
            options().replace(true),
        )
        .await
        .unwrap();

    assert_ne!(first_ctx.instance_id, second_ctx.instance_id);
    assert_eq!(first_counters.dispose.load(Ordering::SeqCst), 1);
    assert_eq!(first_counters.deactivate.load(Ordering::SeqCst), 1);

    assert_eq!(tool_names(&registry), vec!["addTask"]);
    assert!(registry.get_state_channel("tasks.old").is_none());
    assert!(!registry.has_slot("old-slot"));
    let services: Vec<_> = registry
        .get_services()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(services, vec!["refresh"]);

    let result = registry.execute_tool("addTask", json!({}), None).await;
    assert_eq!(result.data.unwrap()["instance"], second_ctx.instance_id.as_str());
}

#[tokio::test]
async fn test_tool_conflict_names_existing_owner() {
    let registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(TestExtension::new("a").tool("shared")), options())
        .await
        .unwrap();

    let loser = TestExtension::new("b").tool("shared").tool("unique");
    let loser_counters = loser.counters();
    let err = registry.register(Arc::new(loser), options()).await.unwrap_err();

    match err {
        ExtensionError::IdentifierConflict { kind, id, owner } => {
            assert_eq!(kind, ContributionKind::Tool);
            assert_eq!(id, "shared");
            assert_eq!(owner, "a");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // No partial indexing, and the rejected activation is torn down.
    assert_eq!(tool_names(&registry), vec!["shared"]);
    assert!(!registry.is_registered("b"));
    assert_eq!(loser_counters.dispose.load(Ordering::SeqCst), 1);
    assert_eq!(loser_counters.deactivate.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slot_and_channel_conflicts() {
    let registry = ExtensionRegistry::new();
    registry
        .register(
            Arc::new(TestExtension::new("a").slot("panel").channel("feed", json!(null))),
            options(),
        )
        .await
        .unwrap();

    let err = registry
        .register(Arc::new(TestExtension::new("b").slot("panel")), options())
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let err = registry
        .register(Arc::new(TestExtension::new("c").channel("feed", json!(1))), options())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ExtensionError::IdentifierConflict { kind: ContributionKind::StateChannel, .. })
    );
}

#[tokio::test]
async fn test_same_service_name_in_different_extensions() {
    let registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(TestExtension::new("a").service("refresh")), options())
        .await
        .unwrap();
    registry
        .register(Arc::new(TestExtension::new("b").service("refresh")), options())
        .await
        .unwrap();

    assert_eq!(registry.get_services().len(), 2);
    let result = registry
        .invoke_service("b", "refresh", json!({ "n": 1 }), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.data.unwrap()["extension"], "b");
}

#[tokio::test]
async fn test_empty_contribution_rejected() {
    struct Nothing(ExtensionManifest, Arc<Counters>);

    #[async_trait::async_trait]
    impl Extension for Nothing {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Ok(ExtensionRuntimeContribution::new().with_metadata(json!({ "only": "metadata" })))
        }

        async fn deactivate(&self, _context: &ExtensionContext) -> Result<()> {
            self.1.deactivate.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let counters = Arc::new(Counters::default());
    let registry = ExtensionRegistry::new();
    let err = registry
        .register(
            Arc::new(Nothing(
                ExtensionManifest::new("empty", "Empty", semver::Version::new(0, 1, 0)),
                counters.clone(),
            )),
            options(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExtensionError::EmptyContribution(ref id) if id == "empty"));
    assert!(registry.get_extension_ids().is_empty());
    assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_manifest_rejected() {
    let registry = ExtensionRegistry::new();
    let err = registry
        .register(Arc::new(TestExtension::new("").tool("x")), options())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::InvalidManifest(_)));
}

// ============================================================================
// Capabilities
// ============================================================================

#[tokio::test]
async fn test_missing_capability_prevents_activation() {
    let registry = ExtensionRegistry::new();
    let ext = TestExtension::new("calendar")
        .tool("listEvents")
        .requires(Capability::Storage)
        .requires(Capability::OAuth);
    let counters = ext.counters();

    let host = HostEnvironment::builder()
        .with_storage(ScopedStorage::new(Arc::new(MemoryBackend::new()), "calendar"))
        .build();
    let err = registry
        .register(Arc::new(ext), RegisterOptions::new(host))
        .await
        .unwrap_err();

    match &err {
        ExtensionError::MissingCapability { capability, .. } => {
            assert_eq!(*capability, Capability::OAuth)
        }
        other => panic!("expected capability error, got {other:?}"),
    }
    assert!(err.to_string().contains("oauth"));
    assert_eq!(counters.activate.load(Ordering::SeqCst), 0);
    assert!(!registry.is_registered("calendar"));
}

#[tokio::test]
async fn test_capabilities_summary() {
    let registry = ExtensionRegistry::new();
    let host = HostEnvironment::builder().with_logging("notes").build();
    registry
        .register(
            Arc::new(TestExtension::new("notes").tool("note").requires(Capability::Logging)),
            RegisterOptions::new(host),
        )
        .await
        .unwrap();

    let info = registry.get_extension_info("notes").unwrap();
    assert_eq!(info.state, ExtensionState::Registered);
    assert_eq!(info.capabilities.required, vec![Capability::Logging]);
    assert!(info.capabilities.granted.contains(Capability::Logging));
    assert_eq!(info.capabilities.tools, 1);
    assert!(info.instance_id.starts_with("notes#"));
}

// ============================================================================
// Unregister & destroy
// ============================================================================

#[tokio::test]
async fn test_unregister_unknown_returns_false() {
    let registry = ExtensionRegistry::new();
    assert!(!registry.unregister("unknown-id").await.unwrap());
}

#[tokio::test]
async fn test_unregister_removes_everything() {
    let registry = ExtensionRegistry::new();
    let ext = TestExtension::new("a")
        .tool("t")
        .service("s")
        .channel("c", json!(0))
        .slot("slot");
    let counters = ext.counters();
    registry.register(Arc::new(ext), options()).await.unwrap();

    assert!(registry.unregister("a").await.unwrap());
    assert!(registry.get_all_tools().is_empty());
    assert!(registry.get_services().is_empty());
    assert!(registry.get_state_channels().is_empty());
    assert!(registry.get_slots().is_empty());
    assert!(registry.get_contribution_metadata("a").is_none());
    assert_eq!(counters.dispose.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_destroy_tears_down_each_extension_once() {
    let registry = ExtensionRegistry::new();
    let mut all = Vec::new();
    for id in ["a", "b", "c"] {
        let ext = TestExtension::new(id).tool(&format!("{id}-tool"));
        all.push(ext.counters());
        registry.register(Arc::new(ext), options()).await.unwrap();
    }

    assert_eq!(registry.destroy().await, 3);
    assert!(registry.get_extension_ids().is_empty());
    for counters in &all {
        assert_eq!(counters.dispose.load(Ordering::SeqCst), 1);
        assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
    }

    assert_eq!(registry.destroy().await, 0);
    for counters in &all {
        assert_eq!(counters.dispose.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_failing_dispose_still_runs_deactivate() {
    struct Fragile(ExtensionManifest, Arc<Counters>);

    #[async_trait::async_trait]
    impl Extension for Fragile {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Ok(ExtensionRuntimeContribution::new()
                .with_tool(Tool::new(
                    ToolDefinition::new("fragile", "Fragile", ParameterSchema::new()),
                    |_args, _ctx| async { Ok(Value::Null) },
                ))
                .on_dispose(|| async { Err(anyhow::anyhow!("socket already closed")) }))
        }

        async fn deactivate(&self, _context: &ExtensionContext) -> Result<()> {
            self.1.deactivate.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let counters = Arc::new(Counters::default());
    let registry = ExtensionRegistry::new();
    registry
        .register(
            Arc::new(Fragile(
                ExtensionManifest::new("fragile", "Fragile", semver::Version::new(0, 1, 0)),
                counters.clone(),
            )),
            options(),
        )
        .await
        .unwrap();

    let err = registry.unregister("fragile").await.unwrap_err();
    match err {
        ExtensionError::TeardownFailed { reasons, .. } => {
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].contains("socket already closed"));
        }
        other => panic!("expected teardown failure, got {other:?}"),
    }
    assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
    assert!(!registry.is_registered("fragile"));
    assert!(registry.get_all_tools().is_empty());
}

#[tokio::test]
async fn test_failed_replacement_leaves_id_unregistered() {
    struct Broken(ExtensionManifest);

    #[async_trait::async_trait]
    impl Extension for Broken {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Err(ExtensionError::Other("config file missing".to_string()))
        }
    }

    let registry = ExtensionRegistry::new();
    let first = TestExtension::new("tasks").tool("addTask");
    let counters = first.counters();
    registry.register(Arc::new(first), options()).await.unwrap();

    let err = registry
        .register(
            Arc::new(Broken(ExtensionManifest::new("tasks", "Tasks", semver::Version::new(2, 0, 0)))),
            options().replace(true),
        )
        .await
        .unwrap_err();

    match err {
        ExtensionError::ActivationFailed { extension_id, reason } => {
            assert_eq!(extension_id, "tasks");
            assert!(reason.contains("config file missing"));
        }
        other => panic!("expected activation failure, got {other:?}"),
    }
    // No rollback: the previous instance stays torn down
    assert!(!registry.is_registered("tasks"));
    assert!(registry.get_all_tools().is_empty());
    assert_eq!(counters.dispose.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_dispose_times_out_and_still_deactivates() {
    struct Stuck(ExtensionManifest, Arc<Counters>);

    #[async_trait::async_trait]
    impl Extension for Stuck {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Ok(ExtensionRuntimeContribution::new()
                .with_tool(Tool::new(
                    ToolDefinition::new("stuck", "Stuck", ParameterSchema::new()),
                    |_args, _ctx| async { Ok(Value::Null) },
                ))
                .on_dispose(|| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }))
        }

        async fn deactivate(&self, _context: &ExtensionContext) -> Result<()> {
            self.1.deactivate.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let counters = Arc::new(Counters::default());
    let registry = ExtensionRegistry::with_config(
        RuntimeConfig::default().with_teardown_timeout(Some(Duration::from_millis(100))),
    );
    registry
        .register(
            Arc::new(Stuck(
                ExtensionManifest::new("stuck", "Stuck", semver::Version::new(0, 1, 0)),
                counters.clone(),
            )),
            options(),
        )
        .await
        .unwrap();

    let err = registry.unregister("stuck").await.unwrap_err();
    match err {
        ExtensionError::TeardownFailed { extension_id, reasons } => {
            assert_eq!(extension_id, "stuck");
            assert_eq!(reasons, vec!["dispose: timed out after 100ms".to_string()]);
        }
        other => panic!("expected teardown failure, got {other:?}"),
    }
    assert_eq!(counters.deactivate.load(Ordering::SeqCst), 1);
    assert!(!registry.is_registered("stuck"));
    assert_eq!(registry.get_extension_state("stuck"), ExtensionState::Unregistered);
}

#[tokio::test]
async fn test_panicking_listener_does_not_abort_registration() {
    let registry = ExtensionRegistry::new();
    registry
        .events()
        .subscribe(EventKind::ExtensionRegistered, |_event| async { panic!("listener bug") });

    let context = registry
        .register(Arc::new(TestExtension::new("a").tool("alpha")), options())
        .await
        .unwrap();

    assert!(registry.is_registered("a"));
    assert_eq!(registry.get_extension_info("a").unwrap().instance_id, context.instance_id);
    assert_eq!(registry.get_stats().listener_failures, 1);
    assert!(registry.execute_tool("alpha", json!({}), None).await.success);
}

#[tokio::test]
async fn test_teardown_runs_with_record_in_deactivating_state() {
    #[derive(Debug, PartialEq)]
    struct Seen {
        registered: bool,
        state: ExtensionState,
        info_state: Option<ExtensionState>,
        tools: usize,
    }

    struct Observed {
        manifest: ExtensionManifest,
        registry: Weak<ExtensionRegistry>,
        seen: Arc<parking_lot::Mutex<Option<Seen>>>,
    }

    #[async_trait::async_trait]
    impl Extension for Observed {
        fn manifest(&self) -> &ExtensionManifest {
            &self.manifest
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            let registry = self.registry.clone();
            let seen = self.seen.clone();
            Ok(ExtensionRuntimeContribution::new()
                .with_tool(Tool::new(
                    ToolDefinition::new("observe", "Observe", ParameterSchema::new()),
                    |_args, _ctx| async { Ok(Value::Null) },
                ))
                .on_dispose(move || async move {
                    if let Some(registry) = registry.upgrade() {
                        *seen.lock() = Some(Seen {
                            registered: registry.is_registered("observed"),
                            state: registry.get_extension_state("observed"),
                            info_state: registry.get_extension_info("observed").map(|i| i.state),
                            tools: registry.get_all_tools().len(),
                        });
                    }
                    Ok(())
                }))
        }
    }

    let registry = Arc::new(ExtensionRegistry::new());
    let seen = Arc::new(parking_lot::Mutex::new(None));
    registry
        .register(
            Arc::new(Observed {
                manifest: ExtensionManifest::new("observed", "Observed", semver::Version::new(0, 1, 0)),
                registry: Arc::downgrade(&registry),
                seen: seen.clone(),
            }),
            options(),
        )
        .await
        .unwrap();

    assert!(registry.unregister("observed").await.unwrap());
    assert_eq!(
        *seen.lock(),
        Some(Seen {
            registered: true,
            state: ExtensionState::Deactivating,
            info_state: Some(ExtensionState::Deactivating),
            tools: 0,
        })
    );
    assert!(!registry.is_registered("observed"));
    assert_eq!(registry.get_extension_state("observed"), ExtensionState::Unregistered);
}

// ============================================================================
// Tool execution
// ============================================================================

#[tokio::test]
async fn test_unknown_tool_fails_without_error() {
    let registry = ExtensionRegistry::new();
    let result = registry.execute_tool("unknown-tool", json!({}), None).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::NotFound));
    assert!(result.error.unwrap().contains("unknown-tool"));
}

struct Guarded {
    manifest: ExtensionManifest,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Extension for Guarded {
    fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    async fn activate(
        &self,
        _host: Arc<HostEnvironment>,
        _context: &ExtensionContext,
    ) -> Result<ExtensionRuntimeContribution> {
        let calls = self.calls.clone();
        let guarded = Tool::new(
            ToolDefinition::new(
                "divide",
                "Divide two numbers",
                ParameterSchema::new()
                    .required_property("a", PropertySchema::number())
                    .required_property("b", PropertySchema::number()),
            ),
            move |args, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let a = args["a"].as_f64().unwrap_or_default();
                    let b = args["b"].as_f64().unwrap_or_default();
                    if b == 0.0 {
                        anyhow::bail!("division by zero");
                    }
                    Ok(json!(a / b))
                }
            },
        )
        .with_validator(|args| {
            if args.get("b").is_some() {
                Ok(())
            } else {
                Err("b is required".to_string())
            }
        });
        Ok(ExtensionRuntimeContribution::new().with_tool(guarded))
    }
}

async fn guarded_registry(config: RuntimeConfig) -> (ExtensionRegistry, Arc<AtomicUsize>) {
    let registry = ExtensionRegistry::with_config(config);
    let calls = Arc::new(AtomicUsize::new(0));
    registry
        .register(
            Arc::new(Guarded {
                manifest: ExtensionManifest::new("math", "Math", semver::Version::new(1, 0, 0)),
                calls: calls.clone(),
            }),
            options(),
        )
        .await
        .unwrap();
    (registry, calls)
}

#[tokio::test]
async fn test_validator_blocks_handler() {
    let (registry, calls) = guarded_registry(RuntimeConfig::default()).await;

    let result = registry.execute_tool("divide", json!({ "a": 1 }), None).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Validation));
    assert_eq!(result.error.as_deref(), Some("b is required"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let result = registry.execute_tool("divide", json!({ "a": 6, "b": 3 }), None).await;
    assert!(result.success);
    assert_eq!(result.data, Some(json!(2.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_error_becomes_failed_result() {
    let (registry, _calls) = guarded_registry(RuntimeConfig::default()).await;
    let result = registry.execute_tool("divide", json!({ "a": 1, "b": 0 }), None).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Execution));
    assert_eq!(result.error.as_deref(), Some("division by zero"));
}

#[tokio::test]
async fn test_tool_context_carries_metadata() {
    struct Meta(ExtensionManifest);

    #[async_trait::async_trait]
    impl Extension for Meta {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Ok(ExtensionRuntimeContribution::new().with_tool(Tool::new(
                ToolDefinition::new("whoami", "Echo context", ParameterSchema::new()),
                |_args, ctx| async move {
                    Ok(json!({ "extension": ctx.extension_id, "metadata": ctx.metadata }))
                },
            )))
        }
    }

    let registry = ExtensionRegistry::new();
    registry
        .register(
            Arc::new(Meta(ExtensionManifest::new("meta", "Meta", semver::Version::new(0, 1, 0)))),
            options(),
        )
        .await
        .unwrap();

    let result = registry
        .execute_tool("whoami", json!({}), Some(json!({ "conversation": "c-1" })))
        .await;
    let data = result.data.unwrap();
    assert_eq!(data["extension"], "meta");
    assert_eq!(data["metadata"]["conversation"], "c-1");
}

// ============================================================================
// Services
// ============================================================================

#[tokio::test]
async fn test_invoke_service_unknown_targets() {
    let registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(TestExtension::new("a").service("refresh")), options())
        .await
        .unwrap();

    let err = registry
        .invoke_service("nobody", "refresh", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));

    let err = registry
        .invoke_service("a", "missing", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::ServiceNotFound { .. }));
}

// ============================================================================
// State channels
// ============================================================================

#[tokio::test]
async fn test_channel_first_delivery_equals_state() {
    let registry = ExtensionRegistry::new();
    registry
        .register(
            Arc::new(TestExtension::new("feed").channel("feed.items", json!({ "items": [1, 2, 3] }))),
            options(),
        )
        .await
        .unwrap();

    let entry = registry.get_state_channel("feed.items").unwrap();
    assert_eq!(entry.extension_id, "feed");
    let mut sub = entry.channel.subscribe();
    let first = sub.next().await.unwrap();
    assert_eq!(first, entry.channel.get_state());
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_activation_times_out() {
    struct Slow(ExtensionManifest);

    #[async_trait::async_trait]
    impl Extension for Slow {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExtensionRuntimeContribution::new())
        }
    }

    let registry = ExtensionRegistry::with_config(
        RuntimeConfig::default().with_activation_timeout(Some(Duration::from_millis(200))),
    );
    let err = registry
        .register(
            Arc::new(Slow(ExtensionManifest::new("slow", "Slow", semver::Version::new(0, 1, 0)))),
            options(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExtensionError::Timeout { after_ms: 200, .. }));
    assert_eq!(registry.get_extension_state("slow"), ExtensionState::Unregistered);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    struct Sleepy(ExtensionManifest);

    #[async_trait::async_trait]
    impl Extension for Sleepy {
        fn manifest(&self) -> &ExtensionManifest {
            &self.0
        }

        async fn activate(
            &self,
            _host: Arc<HostEnvironment>,
            _context: &ExtensionContext,
        ) -> Result<ExtensionRuntimeContribution> {
            Ok(ExtensionRuntimeContribution::new().with_tool(Tool::new(
                ToolDefinition::new("sleep", "Sleeps", ParameterSchema::new()),
                |_args, _ctx| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                },
            )))
        }
    }

    let registry = ExtensionRegistry::with_config(
        RuntimeConfig::default().with_handler_timeout(Some(Duration::from_millis(50))),
    );
    registry
        .register(
            Arc::new(Sleepy(ExtensionManifest::new("sleepy", "Sleepy", semver::Version::new(0, 1, 0)))),
            options(),
        )
        .await
        .unwrap();

    let result = registry.execute_tool("sleep", json!({}), None).await;
    assert_eq!(result.failure, Some(FailureKind::Timeout));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_id_registration_is_serialized() {
    let registry = Arc::new(ExtensionRegistry::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .register(Arc::new(TestExtension::new("race").tool("raceTool")), RegisterOptions::default())
                .await
        }));
    }

    let mut ok = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ExtensionError::AlreadyRegistered(_)) => already += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already, 7);
    assert_eq!(registry.get_all_tools().len(), 1);
}
