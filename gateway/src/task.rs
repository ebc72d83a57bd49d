//! Task model, in-process registry, and the durable mirror.
//!
//! The registry is the authoritative view served by the status endpoint and
//! the source of each task's cancellation channel. Every transition is also
//! mirrored to the `gateway_tasks` table in the engine store for post-mortem
//! inspection; mirror writes are best-effort because the store is
//! legitimately down during the early pipeline stages (the pipeline itself
//! restarts it).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use parley_core::{AccessLevel, Party};

/// Submission payload for a provisioning task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    /// Submitting party id; also names the staging table.
    pub owner: String,

    /// Remote file-store path of the source dataset.
    pub dataset: String,

    /// Target query. Empty means this node is the joining party.
    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub columns: Vec<ColumnSpec>,

    #[serde(default)]
    pub counterparty: Option<Party>,

    /// Session network parameters substituted into the config templates.
    #[serde(default)]
    pub owner_public_key: String,

    #[serde(default)]
    pub owner_endpoint: String,

    #[serde(default)]
    pub engine_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,

    #[serde(default = "default_dtype")]
    pub dtype: String,

    #[serde(default)]
    pub grants: Vec<GrantSpec>,
}

fn default_dtype() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantSpec {
    pub grantee: String,
    pub level: AccessLevel,
}

/// Task lifecycle. Terminal states are never revisited.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Running { stage: &'static str },
    Succeeded,
    Failed { stage: &'static str, error: String },
    Cancelled { stage: &'static str },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { .. } | TaskState::Cancelled { .. }
        )
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Running { .. } => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed { .. } => "failed",
            TaskState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn stage(&self) -> Option<&'static str> {
        match self {
            TaskState::Running { stage }
            | TaskState::Failed { stage, .. }
            | TaskState::Cancelled { stage } => Some(stage),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Status-endpoint view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub owner: String,
    pub dataset: String,
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub state: TaskState,
}

struct TaskEntry {
    owner: String,
    dataset: String,
    created_at: DateTime<Utc>,
    state: TaskState,
    cancel: watch::Sender<bool>,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<Uuid, TaskEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
    Unknown,
}

impl TaskRegistry {
    /// Register a new task and hand back its cancellation channel.
    pub async fn insert(&self, task_id: Uuid, spec: &TaskSpec) -> watch::Receiver<bool> {
        let (cancel, rx) = watch::channel(false);
        let entry = TaskEntry {
            owner: spec.owner.clone(),
            dataset: spec.dataset.clone(),
            created_at: Utc::now(),
            state: TaskState::Submitted,
            cancel,
        };
        self.inner.write().await.insert(task_id, entry);
        rx
    }

    /// Apply a state transition. Terminal states are sticky: a transition
    /// attempted after one is ignored.
    pub async fn set_state(&self, task_id: Uuid, state: TaskState) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(&task_id) {
            if !entry.state.is_terminal() {
                entry.state = state;
            }
        }
    }

    pub async fn view(&self, task_id: Uuid) -> Option<TaskView> {
        let inner = self.inner.read().await;
        inner.get(&task_id).map(|entry| TaskView {
            task_id,
            owner: entry.owner.clone(),
            dataset: entry.dataset.clone(),
            created_at: entry.created_at,
            state: entry.state.clone(),
        })
    }

    /// Request cancellation; the pipeline observes it at the next stage or
    /// retry boundary.
    pub async fn cancel(&self, task_id: Uuid) -> CancelOutcome {
        let inner = self.inner.read().await;
        match inner.get(&task_id) {
            None => CancelOutcome::Unknown,
            Some(entry) if entry.state.is_terminal() => CancelOutcome::AlreadyFinished,
            Some(entry) => {
                let _ = entry.cancel.send(true);
                CancelOutcome::Requested
            }
        }
    }
}

/// Create the durable mirror table if it is missing.
pub async fn ensure_schema(pool: &MySqlPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gateway_tasks (
          task_id char(36) PRIMARY KEY,
          owner varchar(64) NOT NULL,
          dataset varchar(512) NOT NULL,
          status varchar(32) NOT NULL,
          stage varchar(64) NULL,
          error text NULL,
          created_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
          updated_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
        "#,
    )
    .execute(pool)
    .await
    .context("create gateway_tasks")?;
    Ok(())
}

/// Upsert the durable record for one task transition.
///
/// The schema is ensured on every write: the store is often first reachable
/// mid-pipeline, long after gateway boot.
pub async fn mirror_state(
    pool: &MySqlPool,
    task_id: Uuid,
    owner: &str,
    dataset: &str,
    state: &TaskState,
) -> anyhow::Result<()> {
    ensure_schema(pool).await?;
    sqlx::query(
        r#"
        INSERT INTO gateway_tasks (task_id, owner, dataset, status, stage, error)
        VALUES (?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          status = VALUES(status),
          stage = VALUES(stage),
          error = VALUES(error)
        "#,
    )
    .bind(task_id.to_string())
    .bind(owner)
    .bind(dataset)
    .bind(state.status_str())
    .bind(state.stage())
    .bind(state.error())
    .execute(pool)
    .await
    .context("upsert task mirror")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TaskSpec {
        serde_json::from_value(serde_json::json!({
            "owner": "alice",
            "dataset": "/ds/a.csv",
        }))
        .expect("minimal spec")
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() -> anyhow::Result<()> {
        let registry = TaskRegistry::default();
        let task_id = Uuid::new_v4();
        let _rx = registry.insert(task_id, &spec()).await;

        registry
            .set_state(task_id, TaskState::Running { stage: "fetch_dataset" })
            .await;
        registry.set_state(task_id, TaskState::Succeeded).await;
        registry
            .set_state(task_id, TaskState::Running { stage: "run_query" })
            .await;

        let view = registry.view(task_id).await.expect("view");
        anyhow::ensure!(view.state.status_str() == "succeeded");
        Ok(())
    }

    #[tokio::test]
    async fn cancel_flips_the_channel_once() -> anyhow::Result<()> {
        let registry = TaskRegistry::default();
        let task_id = Uuid::new_v4();
        let rx = registry.insert(task_id, &spec()).await;
        anyhow::ensure!(!*rx.borrow());

        anyhow::ensure!(registry.cancel(task_id).await == CancelOutcome::Requested);
        anyhow::ensure!(*rx.borrow());

        registry
            .set_state(task_id, TaskState::Cancelled { stage: "restart_engine" })
            .await;
        anyhow::ensure!(registry.cancel(task_id).await == CancelOutcome::AlreadyFinished);
        anyhow::ensure!(registry.cancel(Uuid::new_v4()).await == CancelOutcome::Unknown);
        Ok(())
    }

    #[test]
    fn spec_defaults_cover_optional_fields() -> anyhow::Result<()> {
        let spec: TaskSpec = serde_json::from_value(serde_json::json!({
            "owner": "alice",
            "dataset": "/ds/a.csv",
            "columns": [
                {"name": "age", "grants": [{"grantee": "bob", "level": "PLAINTEXT"}]}
            ]
        }))?;
        anyhow::ensure!(spec.query.is_empty());
        anyhow::ensure!(spec.counterparty.is_none());
        anyhow::ensure!(spec.columns[0].dtype == "string");
        anyhow::ensure!(spec.columns[0].grants[0].grantee == "bob");
        Ok(())
    }
}
