//! The stage sequencer: one spawned execution unit per submitted task.
//!
//! Stages run strictly in declared order. A stage is complete only when its
//! action succeeds or its failure classifies as an idempotent conflict;
//! nothing is skipped, reordered, or rolled back. Single-attempt stages
//! abort the task on failure, polling stages block only their own task, and
//! the readiness gates are advisory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use uuid::Uuid;

use parley_core::broker::BrokerErrorKind;

use crate::retry::{retry_all, run_stage, settled_on, RetryPolicy, StageError};
use crate::server::AppState;
use crate::task::{self, TaskSpec, TaskState};
use crate::{grants, query, readiness, service, session, staging, template};

pub const STAGE_APPLY_PARAMS: &str = "apply_session_params";
pub const STAGE_RESTART_ENGINE: &str = "restart_engine";
pub const STAGE_AWAIT_STORE: &str = "await_store";
pub const STAGE_FETCH_DATASET: &str = "fetch_dataset";
pub const STAGE_LOAD_DATASET: &str = "load_dataset";
pub const STAGE_AWAIT_SERVICES: &str = "await_services";
pub const STAGE_ESTABLISH_SESSION: &str = "establish_session";
pub const STAGE_REGISTER_TABLE: &str = "register_table";
pub const STAGE_GRANT_COLUMNS: &str = "grant_columns";
pub const STAGE_RUN_QUERY: &str = "run_query";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct PipelineError {
    stage: &'static str,
    source: StageError,
}

impl PipelineError {
    fn new(stage: &'static str, source: StageError) -> Self {
        Self { stage, source }
    }

    fn fatal(stage: &'static str, err: anyhow::Error) -> Self {
        Self::new(stage, StageError::Fatal(err))
    }
}

pub struct Pipeline {
    state: Arc<AppState>,
}

impl Pipeline {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Drive the whole pipeline for one task and record its terminal state.
    pub async fn run(self, task_id: Uuid, spec: TaskSpec, mut cancel: watch::Receiver<bool>) {
        tracing::info!(
            event = "gateway.pipeline.started",
            task_id = %task_id,
            owner = %spec.owner,
            dataset = %spec.dataset,
            query = %spec.query,
            "pipeline started"
        );

        match self.drive(task_id, &spec, &mut cancel).await {
            Ok(()) => {
                tracing::info!(
                    event = "gateway.pipeline.succeeded",
                    task_id = %task_id,
                    "pipeline finished"
                );
                self.record(task_id, &spec, TaskState::Succeeded).await;
            }
            Err(PipelineError {
                stage,
                source: StageError::Cancelled,
            }) => {
                tracing::info!(
                    event = "gateway.pipeline.cancelled",
                    task_id = %task_id,
                    stage,
                    "pipeline cancelled"
                );
                self.record(task_id, &spec, TaskState::Cancelled { stage })
                    .await;
            }
            Err(PipelineError { stage, source }) => {
                tracing::error!(
                    event = "gateway.pipeline.failed",
                    task_id = %task_id,
                    stage,
                    error = %source,
                    "pipeline failed"
                );
                self.record(
                    task_id,
                    &spec,
                    TaskState::Failed {
                        stage,
                        error: source.to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn drive(
        &self,
        task_id: Uuid,
        spec: &TaskSpec,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let cfg = &self.state.cfg;
        let broker = self.state.broker.as_ref();
        let delay = Duration::from_millis(cfg.retry_delay_ms);
        let budget = Duration::from_secs(cfg.readiness_wait_secs);

        // 1. Write session parameters into the local config templates.
        self.enter(task_id, spec, STAGE_APPLY_PARAMS, cancel).await?;
        template::apply_session_params(cfg, spec)
            .await
            .map_err(|err| PipelineError::fatal(STAGE_APPLY_PARAMS, err))?;

        // 2. Restart the compute engine until the service manager takes it.
        self.enter(task_id, spec, STAGE_RESTART_ENGINE, cancel)
            .await?;
        run_stage(
            STAGE_RESTART_ENGINE,
            RetryPolicy::indefinite(delay),
            cancel,
            retry_all,
            || async { service::restart_engine(cfg).await },
        )
        .await
        .map_err(|err| PipelineError::new(STAGE_RESTART_ENGINE, err))?;

        // 3. Engine store readiness (advisory).
        self.enter(task_id, spec, STAGE_AWAIT_STORE, cancel).await?;
        if !readiness::wait_for_port(&cfg.engine_db_addr, budget, POLL_INTERVAL, cancel).await {
            tracing::warn!(
                event = "gateway.pipeline.store_not_ready",
                task_id = %task_id,
                addr = %cfg.engine_db_addr,
                "engine store not reachable within budget; proceeding"
            );
        }

        // 4. Fetch the dataset from the remote file store.
        self.enter(task_id, spec, STAGE_FETCH_DATASET, cancel).await?;
        let content = staging::fetch_dataset(
            self.state.store.as_ref(),
            &spec.dataset,
            Path::new(&cfg.dataset_path),
        )
        .await
        .map_err(|err| PipelineError::fatal(STAGE_FETCH_DATASET, err))?;

        // 5. Recreate the staging table and bulk-load the rows.
        self.enter(task_id, spec, STAGE_LOAD_DATASET, cancel).await?;
        let staged = staging::load_dataset(&self.state.pool, &spec.owner, &content)
            .await
            .map_err(|err| PipelineError::fatal(STAGE_LOAD_DATASET, err))?;
        tracing::info!(
            event = "gateway.pipeline.dataset_loaded",
            task_id = %task_id,
            table = %staged.table,
            columns = staged.columns.len(),
            rows = staged.rows,
            "dataset staged"
        );

        // 6. Broker/engine ports readiness (advisory).
        self.enter(task_id, spec, STAGE_AWAIT_SERVICES, cancel)
            .await?;
        let service_addrs: Vec<String> = cfg
            .service_ports
            .iter()
            .map(|port| format!("127.0.0.1:{port}"))
            .collect();
        if !readiness::wait_for_ports(&service_addrs, budget, POLL_INTERVAL, cancel).await {
            tracing::warn!(
                event = "gateway.pipeline.services_not_ready",
                task_id = %task_id,
                ports = ?cfg.service_ports,
                "broker/engine ports not reachable within budget; proceeding"
            );
        }

        // 7. Session establishment, branched by role.
        self.enter(task_id, spec, STAGE_ESTABLISH_SESSION, cancel)
            .await?;
        let session = if spec.query.trim().is_empty() {
            session::establish_joiner(broker, &spec.owner, &cfg.project_prefix, delay, cancel)
                .await
                .map_err(|err| PipelineError::new(STAGE_ESTABLISH_SESSION, err))?
        } else {
            let counterparty = spec
                .counterparty
                .as_ref()
                .map(|party| party.party_id.clone())
                .ok_or_else(|| {
                    PipelineError::fatal(
                        STAGE_ESTABLISH_SESSION,
                        anyhow!("counterparty is required when a query is set"),
                    )
                })?;
            let project_id = session::task_project_id(&cfg.project_prefix, task_id);
            session::establish_initiator(broker, &project_id, &counterparty, delay, cancel)
                .await
                .map_err(|err| PipelineError::new(STAGE_ESTABLISH_SESSION, err))?
        };
        tracing::info!(
            event = "gateway.pipeline.session_established",
            task_id = %task_id,
            project_id = %session.project_id,
            "session established"
        );

        // 8. Register the staged dataset as a virtual table.
        self.enter(task_id, spec, STAGE_REGISTER_TABLE, cancel)
            .await?;
        let def = grants::table_def(&spec.owner, &spec.columns);
        run_stage(
            STAGE_REGISTER_TABLE,
            RetryPolicy::indefinite(delay),
            cancel,
            settled_on(&[BrokerErrorKind::AlreadyExists]),
            || async {
                broker
                    .register_table(&session.project_id, &def)
                    .await
                    .map_err(anyhow::Error::from)
            },
        )
        .await
        .map_err(|err| PipelineError::new(STAGE_REGISTER_TABLE, err))?;

        // 9. Column grants, best-effort per grant.
        self.enter(task_id, spec, STAGE_GRANT_COLUMNS, cancel).await?;
        let stats =
            grants::grant_columns(broker, &session.project_id, &spec.owner, &spec.columns).await;
        tracing::info!(
            event = "gateway.pipeline.grants_done",
            task_id = %task_id,
            attempted = stats.attempted,
            failed = stats.failed,
            "column grants attempted; waiting on counterparty grants"
        );

        // 10. Target query, bounded; nothing to run for the joining party.
        self.enter(task_id, spec, STAGE_RUN_QUERY, cancel).await?;
        if spec.query.trim().is_empty() {
            tracing::info!(
                event = "gateway.pipeline.no_query",
                task_id = %task_id,
                "no target query; provisioning complete"
            );
            return Ok(());
        }
        let outcome = run_stage(
            STAGE_RUN_QUERY,
            RetryPolicy::bounded(cfg.query_max_attempts, delay),
            cancel,
            retry_all,
            || async {
                query::execute_and_upload(
                    broker,
                    self.state.store.as_ref(),
                    &session.project_id,
                    &spec.query,
                    Path::new(&cfg.result_path),
                    &spec.dataset,
                    &cfg.project_prefix,
                )
                .await
            },
        )
        .await
        .map_err(|err| PipelineError::new(STAGE_RUN_QUERY, err))?;

        if let Some(outcome) = outcome.into_completed() {
            tracing::info!(
                event = "gateway.pipeline.result_uploaded",
                task_id = %task_id,
                remote_path = %outcome.remote_path,
                etag = %outcome.etag,
                size = outcome.size,
                rows = outcome.rows,
                "result uploaded"
            );
        }
        Ok(())
    }

    /// Record entering a stage; bails out when cancellation was requested.
    async fn enter(
        &self,
        task_id: Uuid,
        spec: &TaskSpec,
        stage: &'static str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        if *cancel.borrow() {
            return Err(PipelineError::new(stage, StageError::Cancelled));
        }
        tracing::info!(
            event = "gateway.pipeline.stage",
            task_id = %task_id,
            stage,
            "stage started"
        );
        self.record(task_id, spec, TaskState::Running { stage }).await;
        Ok(())
    }

    /// Update the registry, then mirror the transition best-effort.
    async fn record(&self, task_id: Uuid, spec: &TaskSpec, state: TaskState) {
        self.state.registry.set_state(task_id, state.clone()).await;
        if let Err(err) =
            task::mirror_state(&self.state.pool, task_id, &spec.owner, &spec.dataset, &state).await
        {
            tracing::debug!(
                event = "gateway.task.mirror_skipped",
                task_id = %task_id,
                error = %err,
                "task mirror write skipped"
            );
        }
    }
}
