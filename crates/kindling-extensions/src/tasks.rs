//! Task list extension.
//!
//! Tasks live in the host's storage under a single `items` key, so they
//! survive restarts when the host is backed by a persistent backend. The
//! current list is mirrored into the `tasks.list` state channel and the open
//! count into the `tasks` slot badge.

use chrono::{DateTime, Utc};
use kindling_core::extension::{
    Capability, Extension, ExtensionContext, ExtensionManifest, ExtensionRuntimeContribution,
    ParameterSchema, PropertySchema, Service, Slot, SlotState, StateChannel, Tool, ToolDefinition,
};
use kindling_core::host::{HostEnvironment, KeyValueStorage};
use kindling_core::{Result, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TASKS_EXTENSION_ID: &str = "tasks";
pub const TASKS_CHANNEL: &str = "tasks.list";
pub const TASKS_SLOT: &str = "tasks";

const ITEMS_KEY: &str = "items";

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Done => "done",
        }
    }
}

/// A single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    fn new(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.trim().to_string(),
            status: TaskStatus::Todo,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// State owned by one activation of the extension.
struct TaskBoard {
    storage: Arc<dyn KeyValueStorage>,
    /// Serializes read-modify-persist cycles
    tasks: Mutex<Vec<Task>>,
    channel: StateStore<Value>,
    slot: StateStore<SlotState>,
}

impl TaskBoard {
    async fn open(storage: Arc<dyn KeyValueStorage>) -> Result<Self> {
        let tasks = Self::load(storage.as_ref()).await?;
        let board = Self {
            storage,
            tasks: Mutex::new(Vec::new()),
            channel: StateStore::new(Value::Array(Vec::new())),
            slot: StateStore::new(SlotState::visible()),
        };
        board.publish(&tasks, serde_json::to_value(&tasks)?);
        *board.tasks.lock().await = tasks;
        Ok(board)
    }

    async fn load(storage: &dyn KeyValueStorage) -> Result<Vec<Task>> {
        match storage.get(ITEMS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn publish(&self, tasks: &[Task], value: Value) {
        let open = tasks.iter().filter(|t| t.status == TaskStatus::Todo).count();
        self.channel.set_state(value);
        self.slot
            .set_state(SlotState::visible().with_badge(open.to_string()));
    }

    /// Persist `next`, then make it the current list.
    async fn commit(&self, current: &mut Vec<Task>, next: Vec<Task>) -> Result<()> {
        let value = serde_json::to_value(&next)?;
        self.storage.set(ITEMS_KEY, value.clone()).await?;
        self.publish(&next, value);
        *current = next;
        Ok(())
    }

    async fn add(&self, text: &str) -> anyhow::Result<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = Task::new(text);
        let mut next = tasks.clone();
        next.push(task.clone());
        self.commit(&mut tasks, next).await?;
        tracing::debug!(task_id = %task.id, status = task.status.as_str(), "Task added");
        Ok(task)
    }

    async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect()
    }

    async fn complete(&self, id: &str) -> anyhow::Result<Task> {
        let mut tasks = self.tasks.lock().await;
        let mut next = tasks.clone();
        let Some(task) = next.iter_mut().find(|t| t.id == id) else {
            anyhow::bail!("task '{}' not found", id);
        };
        if task.status == TaskStatus::Done {
            return Ok(task.clone());
        }
        task.status = TaskStatus::Done;
        task.completed_at = Some(Utc::now());
        let done = task.clone();
        self.commit(&mut tasks, next).await?;
        Ok(done)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.iter().any(|t| t.id == id) {
            return Ok(false);
        }
        let next = tasks.iter().filter(|t| t.id != id).cloned().collect();
        self.commit(&mut tasks, next).await?;
        Ok(true)
    }

    async fn clear_completed(&self) -> anyhow::Result<usize> {
        let mut tasks = self.tasks.lock().await;
        let next: Vec<Task> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Done)
            .cloned()
            .collect();
        let removed = tasks.len() - next.len();
        if removed > 0 {
            self.commit(&mut tasks, next).await?;
        }
        Ok(removed)
    }

    /// Reload from storage, discarding the in-memory copy.
    async fn refresh(&self) -> anyhow::Result<usize> {
        let mut tasks = self.tasks.lock().await;
        let loaded = Self::load(self.storage.as_ref()).await?;
        self.publish(&loaded, serde_json::to_value(&loaded)?);
        *tasks = loaded;
        Ok(tasks.len())
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing string argument '{}'", key))
}

/// Built-in task list.
pub struct TasksExtension {
    manifest: ExtensionManifest,
}

impl TasksExtension {
    pub fn new() -> Self {
        Self {
            manifest: ExtensionManifest::new(
                TASKS_EXTENSION_ID,
                "Tasks",
                semver::Version::new(1, 0, 0),
            )
            .with_description("A persistent to-do list")
            .requires(Capability::Storage),
        }
    }
}

impl Default for TasksExtension {
    fn default() -> Self {
        Self::new()
    }
}

fn tools(board: &Arc<TaskBoard>) -> Vec<Tool> {
    let add_schema = ParameterSchema::new().required_property(
        "text",
        PropertySchema::string().describe("What needs doing"),
    );
    let validate_add = add_schema.clone();
    let b = board.clone();
    let add = Tool::new(
        ToolDefinition::new("addTask", "Add a task to the list", add_schema),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let task = board.add(required_str(&args, "text")?).await?;
                Ok(serde_json::to_value(task)?)
            }
        },
    )
    .with_validator(move |args| {
        validate_add.validate(args)?;
        match args.get("text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err("text cannot be empty".to_string()),
        }
    });

    let b = board.clone();
    let list = Tool::new(
        ToolDefinition::new(
            "listTasks",
            "List tasks, optionally filtered by status",
            ParameterSchema::new().property(
                "status",
                PropertySchema::string()
                    .describe("Only return tasks with this status")
                    .one_of(["todo", "done"]),
            ),
        ),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let status = match args.get("status") {
                    Some(value) if !value.is_null() => Some(serde_json::from_value(value.clone())?),
                    _ => None,
                };
                Ok(serde_json::to_value(board.list(status).await)?)
            }
        },
    )
    .with_schema_validation();

    let b = board.clone();
    let complete = Tool::new(
        ToolDefinition::new(
            "completeTask",
            "Mark a task as done",
            ParameterSchema::new().required_property("id", PropertySchema::string()),
        ),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let task = board.complete(required_str(&args, "id")?).await?;
                Ok(serde_json::to_value(task)?)
            }
        },
    )
    .with_schema_validation();

    let b = board.clone();
    let remove = Tool::new(
        ToolDefinition::new(
            "removeTask",
            "Delete a task",
            ParameterSchema::new().required_property("id", PropertySchema::string()),
        ),
        move |args, _ctx| {
            let board = b.clone();
            async move {
                let id = required_str(&args, "id")?;
                let removed = board.remove(id).await?;
                Ok(json!({ "id": id, "removed": removed }))
            }
        },
    )
    .with_schema_validation();

    vec![add, list, complete, remove]
}

fn services(board: &Arc<TaskBoard>) -> Vec<Service> {
    let b = board.clone();
    let refresh = Service::new("refresh", move |_payload, _ctx| {
        let board = b.clone();
        async move {
            let count = board.refresh().await?;
            Ok(json!({ "count": count }))
        }
    })
    .with_description("Reload tasks from storage");

    let b = board.clone();
    let clear = Service::new("clearCompleted", move |_payload, _ctx| {
        let board = b.clone();
        async move {
            let removed = board.clear_completed().await?;
            Ok(json!({ "removed": removed }))
        }
    })
    .with_description("Delete every completed task");

    vec![refresh, clear]
}

#[async_trait::async_trait]
impl Extension for TasksExtension {
    fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    async fn activate(
        &self,
        host: Arc<HostEnvironment>,
        context: &ExtensionContext,
    ) -> Result<ExtensionRuntimeContribution> {
        let board = Arc::new(TaskBoard::open(host.storage_handle()?).await?);
        if let Ok(logger) = host.logger() {
            logger.info_with(
                "Tasks loaded",
                &json!({ "instance_id": context.instance_id, "count": board.list(None).await.len() }),
            );
        }

        let mut contribution = ExtensionRuntimeContribution::new()
            .with_state_channel(
                StateChannel::new(TASKS_CHANNEL, board.channel.clone())
                    .with_description("All tasks"),
            )
            .with_slot(
                Slot::new(TASKS_SLOT, "Tasks", "checklist", board.slot.clone()).with_priority(10),
            )
            .with_metadata(json!({ "storageKey": ITEMS_KEY }));
        for tool in tools(&board) {
            contribution = contribution.with_tool(tool);
        }
        for service in services(&board) {
            contribution = contribution.with_service(service);
        }

        let slot = board.slot.clone();
        Ok(contribution.on_dispose(move || async move {
            slot.set_state(SlotState::default());
            Ok(())
        }))
    }

    async fn deactivate(&self, context: &ExtensionContext) -> Result<()> {
        tracing::debug!(instance_id = %context.instance_id, "Tasks extension deactivated");
        Ok(())
    }
}
