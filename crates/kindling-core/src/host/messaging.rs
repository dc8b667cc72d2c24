//! Messaging and notification capabilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ExtensionError, Result};

// ============================================================================
// Message Bridge
// ============================================================================

/// A message exchanged between extensions and the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub topic: String,
    pub payload: Value,
    /// Extension or host component that posted the message
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl BridgeMessage {
    pub fn new(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Publish/subscribe bridge.
pub trait MessageBridge: Send + Sync {
    /// Post a message. Returns how many subscribers received it.
    fn post(&self, message: BridgeMessage) -> usize;

    fn subscribe(&self) -> broadcast::Receiver<BridgeMessage>;
}

/// In-process [`MessageBridge`] over a broadcast channel.
pub struct LocalMessageBridge {
    tx: broadcast::Sender<BridgeMessage>,
}

impl LocalMessageBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalMessageBridge {
    fn default() -> Self {
        Self::new(128)
    }
}

impl MessageBridge for LocalMessageBridge {
    fn post(&self, message: BridgeMessage) -> usize {
        // No subscribers is not an error.
        self.tx.send(message).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeMessage> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub level: NotificationLevel,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            level: NotificationLevel::Info,
        }
    }

    pub fn with_level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }
}

/// Delivers notifications to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<()>;
}

/// [`Notifier`] forwarding into an unbounded channel drained by the host.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| ExtensionError::Other("notification receiver closed".to_string()))
    }
}
