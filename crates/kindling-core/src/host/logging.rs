//! Logging capability.

use serde_json::Value;

/// Structured logger that tags every record with the owning extension.
///
/// Records go through `tracing` under the `kindling::extension` target, so
/// the host's subscriber decides formatting and filtering.
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    extension_id: String,
}

impl ExtensionLogger {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(target: "kindling::extension", extension_id = %self.extension_id, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(target: "kindling::extension", extension_id = %self.extension_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(target: "kindling::extension", extension_id = %self.extension_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "kindling::extension", extension_id = %self.extension_id, "{}", message);
    }

    /// Info record with a structured JSON payload attached.
    pub fn info_with(&self, message: &str, fields: &Value) {
        tracing::info!(
            target: "kindling::extension",
            extension_id = %self.extension_id,
            fields = %fields,
            "{}",
            message
        );
    }
}
