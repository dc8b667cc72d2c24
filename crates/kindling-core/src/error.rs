//! Error types for the extension runtime.
//!
//! Registration-time failures are returned from [`ExtensionRegistry::register`]
//! and must be handled by the caller. Tool and service execution never surfaces
//! these errors; failures there are folded into a [`ToolResult`].
//!
//! [`ExtensionRegistry::register`]: crate::extension::ExtensionRegistry::register
//! [`ToolResult`]: crate::extension::ToolResult

use crate::extension::{Capability, ContributionKind};

/// Result type for extension runtime operations.
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Extension runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// Manifest is missing an id or the id is malformed.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A capability required by the manifest is not advertised by the host.
    #[error("Extension '{extension_id}' requires capability '{capability}' which the host does not provide")]
    MissingCapability {
        extension_id: String,
        capability: Capability,
    },

    /// An extension with the same id is already registered.
    #[error("Extension already registered: {0}")]
    AlreadyRegistered(String),

    /// A tool, state channel or slot id is already owned by an extension.
    #[error("{kind} '{id}' is already registered by extension '{owner}'")]
    IdentifierConflict {
        kind: ContributionKind,
        id: String,
        owner: String,
    },

    /// Activation returned no tools, services, channels or slots.
    #[error("Extension '{0}' contributed nothing")]
    EmptyContribution(String),

    /// The extension's `activate` returned an error.
    #[error("Activation of '{extension_id}' failed: {reason}")]
    ActivationFailed {
        extension_id: String,
        reason: String,
    },

    /// A bounded operation exceeded its configured timeout.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// No extension is registered under this id.
    #[error("Extension not found: {0}")]
    NotFound(String),

    /// The extension is registered but exposes no service with this name.
    #[error("Service '{service}' not found on extension '{extension_id}'")]
    ServiceNotFound {
        extension_id: String,
        service: String,
    },

    /// Host API accessed for a capability that was never installed.
    #[error("Host capability unavailable: {0}")]
    CapabilityUnavailable(Capability),

    /// `dispose` or `deactivate` failed; the extension was removed regardless.
    #[error("Teardown of '{extension_id}' incomplete: {}", reasons.join("; "))]
    TeardownFailed {
        extension_id: String,
        reasons: Vec<String>,
    },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ExtensionError {
    /// Whether this error was raised while registering an extension.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidManifest(_)
                | Self::MissingCapability { .. }
                | Self::AlreadyRegistered(_)
                | Self::IdentifierConflict { .. }
                | Self::EmptyContribution(_)
                | Self::ActivationFailed { .. }
        )
    }

    /// Whether this is any kind of conflict (duplicate extension or identifier).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRegistered(_) | Self::IdentifierConflict { .. }
        )
    }
}

impl From<anyhow::Error> for ExtensionError {
    fn from(e: anyhow::Error) -> Self {
        ExtensionError::Other(e.to_string())
    }
}
