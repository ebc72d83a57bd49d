//! Broker collaborator: project/membership/table/grant/query operations.
//!
//! The gateway only depends on the [`Broker`] trait; [`HttpBroker`] talks to
//! a real broker over its intra JSON API. Every broker failure carries a
//! typed [`BrokerErrorKind`] so callers can classify idempotent conflicts
//! without matching error text themselves.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ColumnDesc, ColumnGrant};

/// Machine classification of a broker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// The object the call would create already exists.
    AlreadyExists,
    /// The project already contains the invitee.
    AlreadyInvited,
    /// The referenced record does not exist.
    NotFound,
    /// Transport-level failure reaching the broker.
    Unavailable,
    /// Anything the broker reported that fits no known class.
    Other,
}

#[derive(Debug, Error)]
#[error("broker: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Unavailable, message)
    }

    /// Classify a non-zero broker status into a typed kind.
    ///
    /// Brokers that predate typed codes report only human-readable text, so
    /// the known "already applied" phrasings are matched here and nowhere
    /// else.
    pub fn classify(code: i64, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = format!("status code {code}");
        }
        let kind = if message.contains("already exists") {
            BrokerErrorKind::AlreadyExists
        } else if message.contains("already contains invitee") {
            BrokerErrorKind::AlreadyInvited
        } else if message.contains("record not found") || message.contains("not found") {
            BrokerErrorKind::NotFound
        } else {
            BrokerErrorKind::Other
        };
        Self { kind, message }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Runtime configuration submitted when creating a project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectConfig {
    pub spu_runtime_cfg: SpuRuntimeConfig,
    pub session_expire_seconds: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpuRuntimeConfig {
    pub protocol: String,
    pub field: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            spu_runtime_cfg: SpuRuntimeConfig {
                protocol: "SEMI2K".to_string(),
                field: "FM64".to_string(),
            },
            session_expire_seconds: "86400".to_string(),
        }
    }
}

/// A pending invitation into a project.
#[derive(Debug, Clone, Deserialize)]
pub struct Invitation {
    pub invitation_id: i64,
    pub project_id: String,
    #[serde(default)]
    pub inviter: String,
}

/// Virtual-table registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct TableDef {
    pub table_name: String,
    pub db_type: String,
    pub ref_table: String,
    pub columns: Vec<ColumnDesc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugOptions {
    pub enable_psi_detail_log: bool,
}

/// Row-major result of a broker query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub cost_seconds: f64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn create_project(&self, project_id: &str, conf: &ProjectConfig) -> BrokerResult<()>;

    async fn invite_member(&self, project_id: &str, invitee: &str) -> BrokerResult<()>;

    async fn list_invitations(&self) -> BrokerResult<Vec<Invitation>>;

    async fn accept_invitation(&self, invitation_id: i64) -> BrokerResult<()>;

    /// Current member party ids of a project.
    async fn list_members(&self, project_id: &str) -> BrokerResult<Vec<String>>;

    async fn register_table(&self, project_id: &str, table: &TableDef) -> BrokerResult<()>;

    async fn grant_columns(&self, project_id: &str, grants: &[ColumnGrant]) -> BrokerResult<()>;

    async fn run_query(
        &self,
        project_id: &str,
        sql: &str,
        debug: &DebugOptions,
    ) -> BrokerResult<QueryResult>;
}

#[derive(Debug, Default, Deserialize)]
struct WireStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl WireStatus {
    fn check(self) -> BrokerResult<()> {
        if self.code == 0 {
            Ok(())
        } else {
            Err(BrokerError::classify(self.code, self.message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    #[serde(default)]
    status: WireStatus,
}

#[derive(Debug, Deserialize)]
struct InvitationListResponse {
    #[serde(default)]
    status: WireStatus,
    #[serde(default)]
    invitations: Vec<Invitation>,
}

#[derive(Debug, Deserialize)]
struct ProjectListResponse {
    #[serde(default)]
    status: WireStatus,
    #[serde(default)]
    projects: Vec<WireProject>,
}

#[derive(Debug, Deserialize)]
struct WireProject {
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: WireStatus,
    result: Option<WireQueryResult>,
}

#[derive(Debug, Deserialize)]
struct WireQueryResult {
    #[serde(default)]
    out_columns: Vec<WireColumn>,
    #[serde(default)]
    cost_time_s: f64,
}

#[derive(Debug, Deserialize)]
struct WireColumn {
    name: String,
    #[serde(default)]
    values: Vec<Value>,
}

#[derive(Serialize)]
struct WireColumnControl<'a> {
    col: WireColumnDef<'a>,
    party_code: &'a str,
    constraint: &'a str,
}

#[derive(Serialize)]
struct WireColumnDef<'a> {
    column_name: &'a str,
    table_name: &'a str,
}

/// Broker client over the intra JSON API.
#[derive(Clone, Debug)]
pub struct HttpBroker {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpBroker {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.parse().context("parse broker base URL")?,
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("build broker http client")?,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> BrokerResult<R>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| BrokerError::unavailable(format!("join broker URL {path}: {err}")))?;
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| BrokerError::unavailable(format!("POST {path}: {err}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|err| BrokerError::unavailable(format!("{path} status: {err}")))?;
        resp.json::<R>().await.map_err(|err| {
            BrokerError::new(
                BrokerErrorKind::Other,
                format!("decode {path} response: {err}"),
            )
        })
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn create_project(&self, project_id: &str, conf: &ProjectConfig) -> BrokerResult<()> {
        let resp: StatusEnvelope = self
            .post(
                "/intra/project/create",
                &serde_json::json!({ "project_id": project_id, "conf": conf }),
            )
            .await?;
        resp.status.check()
    }

    async fn invite_member(&self, project_id: &str, invitee: &str) -> BrokerResult<()> {
        let resp: StatusEnvelope = self
            .post(
                "/intra/member/invite",
                &serde_json::json!({ "project_id": project_id, "invitee": invitee }),
            )
            .await?;
        resp.status.check()
    }

    async fn list_invitations(&self) -> BrokerResult<Vec<Invitation>> {
        let resp: InvitationListResponse = self
            .post("/intra/invitation/list", &serde_json::json!({}))
            .await?;
        resp.status.check()?;
        Ok(resp.invitations)
    }

    async fn accept_invitation(&self, invitation_id: i64) -> BrokerResult<()> {
        let resp: StatusEnvelope = self
            .post(
                "/intra/invitation/process",
                &serde_json::json!({ "invitation_id": invitation_id, "respond": "ACCEPT" }),
            )
            .await?;
        resp.status.check()
    }

    async fn list_members(&self, project_id: &str) -> BrokerResult<Vec<String>> {
        let resp: ProjectListResponse = self
            .post(
                "/intra/project/list",
                &serde_json::json!({ "project_id": project_id }),
            )
            .await?;
        resp.status.check()?;
        let project = resp.projects.into_iter().next().ok_or_else(|| {
            BrokerError::new(
                BrokerErrorKind::NotFound,
                format!("project {project_id} not found"),
            )
        })?;
        Ok(project.members)
    }

    async fn register_table(&self, project_id: &str, table: &TableDef) -> BrokerResult<()> {
        let resp: StatusEnvelope = self
            .post(
                "/intra/table/create",
                &serde_json::json!({
                    "project_id": project_id,
                    "table_name": table.table_name,
                    "db_type": table.db_type,
                    "ref_table": table.ref_table,
                    "columns": table.columns,
                }),
            )
            .await?;
        resp.status.check()
    }

    async fn grant_columns(&self, project_id: &str, grants: &[ColumnGrant]) -> BrokerResult<()> {
        let column_control_list: Vec<WireColumnControl<'_>> = grants
            .iter()
            .map(|grant| WireColumnControl {
                col: WireColumnDef {
                    column_name: &grant.column,
                    table_name: &grant.table,
                },
                party_code: &grant.party_id,
                constraint: grant.level.as_str(),
            })
            .collect();
        let resp: StatusEnvelope = self
            .post(
                "/intra/ccl/grant",
                &serde_json::json!({
                    "project_id": project_id,
                    "column_control_list": column_control_list,
                }),
            )
            .await?;
        resp.status.check()
    }

    async fn run_query(
        &self,
        project_id: &str,
        sql: &str,
        debug: &DebugOptions,
    ) -> BrokerResult<QueryResult> {
        let resp: QueryResponse = self
            .post(
                "/intra/query",
                &serde_json::json!({
                    "project_id": project_id,
                    "query": sql,
                    "debug_opts": debug,
                }),
            )
            .await?;
        resp.status.check()?;
        let result = resp.result.ok_or_else(|| {
            BrokerError::new(BrokerErrorKind::Other, "query response missing result")
        })?;
        Ok(transpose(result))
    }
}

/// Broker results are column-major tensors; the gateway works row-major.
fn transpose(result: WireQueryResult) -> QueryResult {
    let columns: Vec<String> = result.out_columns.iter().map(|c| c.name.clone()).collect();
    let height = result
        .out_columns
        .iter()
        .map(|c| c.values.len())
        .max()
        .unwrap_or(0);
    let mut rows = Vec::with_capacity(height);
    for i in 0..height {
        rows.push(
            result
                .out_columns
                .iter()
                .map(|c| c.values.get(i).cloned().unwrap_or(Value::Null))
                .collect(),
        );
    }
    QueryResult {
        columns,
        rows,
        cost_seconds: result.cost_time_s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_maps_known_phrasings() {
        let err = BrokerError::classify(1, "project tsql_1a2b3c4d already exists");
        assert_eq!(err.kind, BrokerErrorKind::AlreadyExists);

        let err = BrokerError::classify(1, "project already contains invitee bob");
        assert_eq!(err.kind, BrokerErrorKind::AlreadyInvited);

        let err = BrokerError::classify(1, "record not found");
        assert_eq!(err.kind, BrokerErrorKind::NotFound);

        let err = BrokerError::classify(1, "rpc deadline exceeded");
        assert_eq!(err.kind, BrokerErrorKind::Other);
    }

    #[test]
    fn classifier_keeps_message_and_fills_empty_text() {
        let err = BrokerError::classify(1, "project tsql already exists");
        assert!(err.message.contains("already exists"));

        let err = BrokerError::classify(42, "");
        assert_eq!(err.kind, BrokerErrorKind::Other);
        assert!(err.message.contains("42"));
    }

    #[test]
    fn transpose_builds_rows_from_columns() {
        let wire = WireQueryResult {
            out_columns: vec![
                WireColumn {
                    name: "age".to_string(),
                    values: vec![30.into(), 41.into()],
                },
                WireColumn {
                    name: "name".to_string(),
                    values: vec!["bob".into()],
                },
            ],
            cost_time_s: 0.5,
        };
        let result = transpose(wire);
        assert_eq!(result.columns, vec!["age", "name"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0], vec![Value::from(30), Value::from("bob")]);
        assert_eq!(result.rows[1], vec![Value::from(41), Value::Null]);
    }
}
