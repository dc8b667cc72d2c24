//! Kindling Extension Contract
//!
//! This module defines what every extension must provide:
//! - A manifest with a stable id and the host capabilities it needs
//! - `activate()` returning the extension's contribution
//! - An optional `deactivate()` for symmetric cleanup
//!
//! Extensions keep their own state private. The registry only ever sees the
//! contribution returned from activation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::capability::Capability;
use super::contribution::ExtensionRuntimeContribution;
use crate::error::{ExtensionError, Result};
use crate::host::HostEnvironment;

// ============================================================================
// Manifest
// ============================================================================

/// Static identity of an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    /// Stable extension identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Extension version
    pub version: semver::Version,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Host capabilities that must be present before activation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<Capability>,
}

impl ExtensionManifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
            description: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare a required host capability.
    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.required_capabilities.contains(&capability) {
            self.required_capabilities.push(capability);
        }
        self
    }

    /// Check that the id is usable as a registry key.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "extension id cannot be empty".to_string(),
            ));
        }
        if self.id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension id '{}' contains whitespace or control characters",
                self.id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

/// Process-wide instance counter. Never reset, so instance ids are never reused.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-registration context handed to `activate` and `deactivate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionContext {
    /// Unique id of this registration, `<manifest id>#<n>`
    pub instance_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Caller-supplied configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl ExtensionContext {
    /// Create a fresh context for a registration of `extension_id`.
    pub fn new(extension_id: &str, config: Option<serde_json::Value>) -> Self {
        let n = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            instance_id: format!("{}#{}", extension_id, n),
            created_at: chrono::Utc::now(),
            config,
        }
    }

    /// Read a typed value from the configuration object.
    pub fn config_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ============================================================================
// Extension Trait
// ============================================================================

/// The extension contract.
///
/// `activate` is called once per registration and must return everything the
/// extension contributes. Mutable state lives behind interior mutability inside
/// the extension; the registry only holds shared references.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    /// Get extension manifest
    fn manifest(&self) -> &ExtensionManifest;

    /// Activate the extension and produce its contribution.
    async fn activate(
        &self,
        host: Arc<HostEnvironment>,
        context: &ExtensionContext,
    ) -> Result<ExtensionRuntimeContribution>;

    /// Optional: cleanup after the registry has removed the contribution.
    async fn deactivate(&self, _context: &ExtensionContext) -> Result<()> {
        Ok(())
    }
}

/// Type alias for a shared extension instance
pub type DynExtension = Arc<dyn Extension>;

// ============================================================================
// Extension State
// ============================================================================

/// Lifecycle state of an extension id inside a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    #[default]
    Unregistered,
    Activating,
    Registered,
    Deactivating,
}

impl std::fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unregistered => write!(f, "Unregistered"),
            Self::Activating => write!(f, "Activating"),
            Self::Registered => write!(f, "Registered"),
            Self::Deactivating => write!(f, "Deactivating"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
