//! Host capability tokens.
//!
//! Capabilities are a closed set so an unknown capability name is a compile
//! error in Rust code and a parse error at the configuration boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A capability the host environment can advertise to extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Key/value storage scoped to the extension
    Storage,
    /// Structured logging
    Logging,
    /// One-shot and repeating timers
    Timers,
    /// Wall-clock job scheduling
    Scheduling,
    /// Messaging bridge to the rest of the application
    Messaging,
    /// User-facing notifications
    Notifications,
    /// OAuth access tokens
    #[serde(rename = "oauth")]
    OAuth,
}

impl Capability {
    /// Every capability kind, in declaration order.
    pub const ALL: [Capability; 7] = [
        Capability::Storage,
        Capability::Logging,
        Capability::Timers,
        Capability::Scheduling,
        Capability::Messaging,
        Capability::Notifications,
        Capability::OAuth,
    ];

    /// Token used in manifests and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Logging => "logging",
            Self::Timers => "timers",
            Self::Scheduling => "scheduling",
            Self::Messaging => "messaging",
            Self::Notifications => "notifications",
            Self::OAuth => "oauth",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown capability token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// The set of capabilities a host advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Required capabilities not advertised by this set, in the order given.
    pub fn missing<'a>(
        &'a self,
        required: &'a [Capability],
    ) -> impl Iterator<Item = Capability> + 'a {
        required.iter().copied().filter(move |cap| !self.contains(*cap))
    }

    /// First required capability not advertised by this set.
    pub fn first_missing(&self, required: &[Capability]) -> Option<Capability> {
        self.missing(required).next()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
