//! Countdown timer extension.
//!
//! Each `startTimer` call arms a one-shot host timer. When it fires the
//! timer leaves the active list and a notification is sent. Disposing the
//! contribution clears everything still armed.

use chrono::{DateTime, Utc};
use kindling_core::extension::{
    Capability, Extension, ExtensionContext, ExtensionManifest, ExtensionRuntimeContribution,
    ParameterSchema, PropertySchema, Slot, SlotState, StateChannel, Tool, ToolDefinition,
};
use kindling_core::host::{
    HostEnvironment, Notification, NotificationLevel, Notifier, TimerId, TimerService,
};
use kindling_core::{Result, StateStore};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const TIMER_EXTENSION_ID: &str = "timer";
pub const TIMER_CHANNEL: &str = "timer.active";
pub const TIMER_SLOT: &str = "timer";

/// Longest accepted countdown, one day.
pub const MAX_TIMER_SECONDS: f64 = 86_400.0;

/// A running countdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTimer {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub seconds: f64,
    pub started_at: DateTime<Utc>,
    pub fires_at: DateTime<Utc>,
    #[serde(skip)]
    handle: TimerId,
}

impl ActiveTimer {
    fn remaining_seconds(&self, now: DateTime<Utc>) -> f64 {
        let ms = (self.fires_at - now).num_milliseconds().max(0);
        ms as f64 / 1000.0
    }

    fn title(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{}s timer", self.seconds),
        }
    }
}

struct TimerBoard {
    timers: Arc<dyn TimerService>,
    notifier: Arc<dyn Notifier>,
    active: Mutex<BTreeMap<String, ActiveTimer>>,
    channel: StateStore<Value>,
    slot: StateStore<SlotState>,
}

impl TimerBoard {
    fn new(timers: Arc<dyn TimerService>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            timers,
            notifier,
            active: Mutex::new(BTreeMap::new()),
            channel: StateStore::new(Value::Array(Vec::new())),
            slot: StateStore::new(SlotState::default()),
        }
    }

    fn publish(&self, active: &BTreeMap<String, ActiveTimer>) {
        let timers: Vec<&ActiveTimer> = active.values().collect();
        self.channel.set_state(json!(timers));
        self.slot.set_state(if active.is_empty() {
            SlotState::default()
        } else {
            SlotState::visible().with_badge(active.len().to_string())
        });
    }

    fn start(self: &Arc<Self>, seconds: f64, label: Option<String>) -> ActiveTimer {
        let id = uuid::Uuid::new_v4().to_string();
        let weak: Weak<Self> = Arc::downgrade(self);
        let fired = id.clone();

        // The callback takes the same lock, so it cannot observe the map
        // before the entry is inserted.
        let mut active = self.active.lock();
        let handle = self.timers.set_timeout(
            Duration::from_secs_f64(seconds),
            Box::new(move || {
                if let Some(board) = weak.upgrade() {
                    board.fire(&fired);
                }
            }),
        );
        let started_at = Utc::now();
        let timer = ActiveTimer {
            id: id.clone(),
            label,
            seconds,
            started_at,
            fires_at: started_at + chrono::Duration::milliseconds((seconds * 1000.0) as i64),
            handle,
        };
        active.insert(id, timer.clone());
        self.publish(&active);
        timer
    }

    fn fire(&self, id: &str) {
        let timer = {
            let mut active = self.active.lock();
            let Some(timer) = active.remove(id) else {
                return;
            };
            self.publish(&active);
            timer
        };

        tracing::debug!(timer_id = %timer.id, "Timer fired");
        let notification = Notification::new(timer.title(), "Time is up")
            .with_level(NotificationLevel::Success);
        if let Err(e) = self.notifier.notify(notification) {
            tracing::warn!(timer_id = %timer.id, error = %e, "Failed to deliver timer notification");
        }
    }

    fn cancel(&self, id: &str) -> bool {
        let removed = {
            let mut active = self.active.lock();
            let removed = active.remove(id);
            if removed.is_some() {
                self.publish(&active);
            }
            removed
        };
        match removed {
            Some(timer) => {
                self.timers.clear(timer.handle);
                true
            }
            None => false,
        }
    }

    fn list(&self) -> Value {
        let now = Utc::now();
        let active = self.active.lock();
        Value::Array(
            active
                .values()
                .map(|t| {
                    let mut entry = json!(t);
                    entry["remainingSeconds"] = json!(t.remaining_seconds(now));
                    entry
                })
                .collect(),
        )
    }

    /// Cancel every armed timer. Returns how many were cleared.
    fn clear_all(&self) -> usize {
        let drained: Vec<ActiveTimer> = {
            let mut active = self.active.lock();
            let drained = std::mem::take(&mut *active).into_values().collect();
            self.publish(&active);
            drained
        };
        for timer in &drained {
            self.timers.clear(timer.handle);
        }
        drained.len()
    }
}

fn validate_start(args: &Value) -> std::result::Result<(), String> {
    let Some(seconds) = args.get("seconds").and_then(Value::as_f64) else {
        return Err("seconds must be a number".to_string());
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err("seconds must be greater than zero".to_string());
    }
    if seconds > MAX_TIMER_SECONDS {
        return Err(format!("seconds cannot exceed {}", MAX_TIMER_SECONDS));
    }
    match args.get("label") {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err("label must be a string".to_string()),
    }
}

/// Built-in countdown timers.
pub struct TimerExtension {
    manifest: ExtensionManifest,
}

impl TimerExtension {
    pub fn new() -> Self {
        Self {
            manifest: ExtensionManifest::new(
                TIMER_EXTENSION_ID,
                "Timer",
                semver::Version::new(1, 0, 0),
            )
            .with_description("Countdown timers with a notification when they finish")
            .requires(Capability::Timers)
            .requires(Capability::Notifications),
        }
    }
}

impl Default for TimerExtension {
    fn default() -> Self {
        Self::new()
    }
}

fn tools(board: &Arc<TimerBoard>) -> Vec<Tool> {
    let b = board.clone();
    let start = Tool::new(
        ToolDefinition::new(
            "startTimer",
            "Start a countdown",
            ParameterSchema::new()
                .required_property(
                    "seconds",
                    PropertySchema::number().describe("Countdown length in seconds"),
                )
                .property("label", PropertySchema::string()),
        ),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let seconds = args
                    .get("seconds")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| anyhow::anyhow!("missing numeric argument 'seconds'"))?;
                let label = args.get("label").and_then(Value::as_str).map(str::to_string);
                Ok(serde_json::to_value(board.start(seconds, label))?)
            }
        },
    )
    .with_validator(validate_start);

    let b = board.clone();
    let cancel = Tool::new(
        ToolDefinition::new(
            "cancelTimer",
            "Cancel a running countdown",
            ParameterSchema::new().required_property("id", PropertySchema::string()),
        ),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("missing string argument 'id'"))?;
                Ok(json!({ "id": id, "cancelled": board.cancel(id) }))
            }
        },
    )
    .with_schema_validation();

    let b = board.clone();
    let list = Tool::new(
        ToolDefinition::new("listTimers", "List running countdowns", ParameterSchema::new()),
        move |_args, _ctx| {
            let board = b.clone();
            async move { Ok(board.list()) }
        },
    );

    vec![start, cancel, list]
}

#[async_trait::async_trait]
impl Extension for TimerExtension {
    fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    async fn activate(
        &self,
        host: Arc<HostEnvironment>,
        context: &ExtensionContext,
    ) -> Result<ExtensionRuntimeContribution> {
        let board = Arc::new(TimerBoard::new(
            host.timers_handle()?,
            host.notifier_handle()?,
        ));
        tracing::debug!(instance_id = %context.instance_id, "Timer extension activated");

        let mut contribution = ExtensionRuntimeContribution::new()
            .with_state_channel(
                StateChannel::new(TIMER_CHANNEL, board.channel.clone())
                    .with_description("Running countdowns"),
            )
            .with_slot(Slot::new(TIMER_SLOT, "Timers", "hourglass", board.slot.clone()));
        for tool in tools(&board) {
            contribution = contribution.with_tool(tool);
        }

        Ok(contribution.on_dispose(move || async move {
            let cleared = board.clear_all();
            if cleared > 0 {
                tracing::info!(cleared, "Cleared running timers on dispose");
            }
            Ok(())
        }))
    }
}
