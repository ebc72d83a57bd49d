//! Session, grant, and query flows against a scripted broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use parley_core::broker::{
    Broker, BrokerError, BrokerResult, DebugOptions, Invitation, ProjectConfig, QueryResult,
    TableDef,
};
use parley_core::filestore::{FileStore, WriteReceipt};
use parley_core::ColumnGrant;
use parley_gateway::retry::{run_stage, settled_on, RetryPolicy};
use parley_gateway::task::ColumnSpec;
use parley_gateway::{grants, query, session};

#[derive(Default)]
struct FakeBroker {
    calls: Mutex<Vec<String>>,

    /// Error text returned by every invite attempt.
    invite_error: Option<&'static str>,

    /// `list_members` reports `members` only from this call count on.
    members_after: u32,
    members: Vec<String>,
    member_polls: AtomicU32,

    /// `list_invitations` reports the invitation only from this call count
    /// on.
    invitations_after: u32,
    invitation: Option<Invitation>,
    invitations_error: Option<&'static str>,
    invitation_polls: AtomicU32,

    query_result: Option<QueryResult>,
}

impl FakeBroker {
    fn log(&self, entry: String) {
        self.calls.lock().expect("calls lock").push(entry);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn count_of(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn position_of(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|call| call.starts_with(prefix))
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn create_project(&self, project_id: &str, _conf: &ProjectConfig) -> BrokerResult<()> {
        self.log(format!("create_project:{project_id}"));
        Ok(())
    }

    async fn invite_member(&self, project_id: &str, invitee: &str) -> BrokerResult<()> {
        self.log(format!("invite_member:{project_id}:{invitee}"));
        match self.invite_error {
            Some(text) => Err(BrokerError::classify(1, text)),
            None => Ok(()),
        }
    }

    async fn list_invitations(&self) -> BrokerResult<Vec<Invitation>> {
        self.log("list_invitations".to_string());
        if let Some(text) = self.invitations_error {
            return Err(BrokerError::classify(1, text));
        }
        let polls = self.invitation_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls >= self.invitations_after {
            Ok(self.invitation.clone().into_iter().collect())
        } else {
            Ok(Vec::new())
        }
    }

    async fn accept_invitation(&self, invitation_id: i64) -> BrokerResult<()> {
        self.log(format!("accept_invitation:{invitation_id}"));
        Ok(())
    }

    async fn list_members(&self, project_id: &str) -> BrokerResult<Vec<String>> {
        self.log(format!("list_members:{project_id}"));
        let polls = self.member_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls >= self.members_after {
            Ok(self.members.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn register_table(&self, project_id: &str, table: &TableDef) -> BrokerResult<()> {
        self.log(format!(
            "register_table:{project_id}:{}:{}",
            table.table_name, table.ref_table
        ));
        Ok(())
    }

    async fn grant_columns(&self, project_id: &str, grants: &[ColumnGrant]) -> BrokerResult<()> {
        for grant in grants {
            self.log(format!(
                "grant:{project_id}:{}:{}:{}",
                grant.party_id,
                grant.column,
                grant.level.as_str()
            ));
        }
        Ok(())
    }

    async fn run_query(
        &self,
        project_id: &str,
        sql: &str,
        _debug: &DebugOptions,
    ) -> BrokerResult<QueryResult> {
        self.log(format!("run_query:{project_id}:{sql}"));
        self.query_result
            .clone()
            .ok_or_else(|| BrokerError::classify(1, "query pending"))
    }
}

#[derive(Default)]
struct RecordingStore {
    writes: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl FileStore for RecordingStore {
    async fn read_file(&self, _path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(b"age,name\n30,bob\n".to_vec())
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> anyhow::Result<WriteReceipt> {
        let size = data.len() as i64;
        self.writes
            .lock()
            .expect("writes lock")
            .push((path.to_string(), data));
        Ok(WriteReceipt {
            etag: "fake-etag".to_string(),
            size,
        })
    }
}

fn columns() -> Vec<ColumnSpec> {
    serde_json::from_value(serde_json::json!([
        {"name": "age", "grants": [{"grantee": "bob", "level": "PLAINTEXT"}]}
    ]))
    .expect("columns fixture")
}

const DELAY: Duration = Duration::from_millis(1);

#[tokio::test]
async fn initiator_provisions_the_full_session() -> anyhow::Result<()> {
    // Scenario: alice initiates against bob; the invite reports the project
    // already contains the invitee, bob shows up on the second membership
    // poll, the query succeeds first try.
    let broker = FakeBroker {
        invite_error: Some("project already contains invitee bob"),
        members_after: 2,
        members: vec!["alice".to_string(), "bob".to_string()],
        query_result: Some(QueryResult {
            columns: vec!["age".to_string()],
            rows: vec![vec![serde_json::Value::from(30)]],
            cost_seconds: 0.2,
        }),
        ..FakeBroker::default()
    };
    let store = RecordingStore::default();
    let (_tx, mut cancel) = watch::channel(false);

    let established =
        session::establish_initiator(&broker, "tsql_0a1b2c3d", "bob", DELAY, &mut cancel).await;
    let established = match established {
        Ok(session) => session,
        Err(err) => anyhow::bail!("establish failed: {err}"),
    };
    anyhow::ensure!(established.project_id == "tsql_0a1b2c3d");

    // An invite classified as already-contains-invitee settles with no
    // further attempts.
    anyhow::ensure!(broker.count_of("invite_member") == 1);
    anyhow::ensure!(broker.count_of("list_members") == 2);

    let def = grants::table_def("alice", &columns());
    let registered = run_stage(
        "register_table",
        RetryPolicy::indefinite(DELAY),
        &mut cancel,
        settled_on(&[parley_core::broker::BrokerErrorKind::AlreadyExists]),
        || async {
            broker
                .register_table(&established.project_id, &def)
                .await
                .map_err(anyhow::Error::from)
        },
    )
    .await;
    anyhow::ensure!(registered.is_ok());

    let stats = grants::grant_columns(&broker, &established.project_id, "alice", &columns()).await;
    anyhow::ensure!(stats.attempted == 2);
    anyhow::ensure!(stats.failed == 0);

    let dir = tempfile::tempdir()?;
    let local_result = dir.path().join("result.csv");
    let outcome = query::execute_and_upload(
        &broker,
        &store,
        &established.project_id,
        "SELECT age FROM alice",
        &local_result,
        "/ds/a.csv",
        "tsql",
    )
    .await?;

    // Result lands beside the dataset with a timestamp suffix.
    anyhow::ensure!(outcome.remote_path.starts_with("/ds/tsql_result_"));
    anyhow::ensure!(outcome.remote_path.ends_with(".csv"));
    anyhow::ensure!(outcome.rows == 1);
    anyhow::ensure!(outcome.etag == "fake-etag");

    let local = tokio::fs::read_to_string(&local_result).await?;
    anyhow::ensure!(local == "age\n30\n");
    let writes = store.writes.lock().expect("writes lock").clone();
    anyhow::ensure!(writes.len() == 1);
    anyhow::ensure!(writes[0].1 == b"age\n30\n");

    // Declared grants plus the implicit owner grant.
    let calls = broker.calls();
    anyhow::ensure!(calls.contains(&"grant:tsql_0a1b2c3d:alice:age:PLAINTEXT".to_string()));
    anyhow::ensure!(calls.contains(&"grant:tsql_0a1b2c3d:bob:age:PLAINTEXT".to_string()));

    // Strict stage order: create, invite, join, register, grant, query.
    let create = broker.position_of("create_project").expect("create");
    let invite = broker.position_of("invite_member").expect("invite");
    let joined = broker.position_of("list_members").expect("members");
    let register = broker.position_of("register_table").expect("register");
    let grant = broker.position_of("grant:").expect("grant");
    let ran = broker.position_of("run_query").expect("query");
    anyhow::ensure!(create < invite && invite < joined);
    anyhow::ensure!(joined < register && register < grant && grant < ran);
    Ok(())
}

#[tokio::test]
async fn joiner_polls_accepts_and_learns_the_project_id() -> anyhow::Result<()> {
    let broker = FakeBroker {
        invitations_after: 3,
        invitation: Some(Invitation {
            invitation_id: 7,
            project_id: "tsql_12345678".to_string(),
            inviter: "alice".to_string(),
        }),
        members: vec!["alice".to_string(), "bob".to_string()],
        ..FakeBroker::default()
    };
    let (_tx, mut cancel) = watch::channel(false);

    let established = session::establish_joiner(&broker, "bob", "tsql", DELAY, &mut cancel).await;
    let established = match established {
        Ok(session) => session,
        Err(err) => anyhow::bail!("join failed: {err}"),
    };

    anyhow::ensure!(established.project_id == "tsql_12345678");
    anyhow::ensure!(broker.count_of("list_invitations") == 3, "polled until invited");
    anyhow::ensure!(broker.calls().contains(&"accept_invitation:7".to_string()));
    Ok(())
}

#[tokio::test]
async fn joiner_without_invitation_record_falls_back() -> anyhow::Result<()> {
    let broker = FakeBroker {
        invitations_error: Some("record not found"),
        ..FakeBroker::default()
    };
    let (_tx, mut cancel) = watch::channel(false);

    let established = session::establish_joiner(&broker, "bob", "tsql", DELAY, &mut cancel).await;
    let established = match established {
        Ok(session) => session,
        Err(err) => anyhow::bail!("join failed: {err}"),
    };

    anyhow::ensure!(established.project_id == "tsql");
    anyhow::ensure!(broker.count_of("list_invitations") == 1, "no retry after no-op exit");
    anyhow::ensure!(broker.count_of("accept_invitation") == 0);
    Ok(())
}

#[tokio::test]
async fn bounded_query_stage_gives_up_after_the_cap() -> anyhow::Result<()> {
    let broker = FakeBroker::default();
    let store = RecordingStore::default();
    let (_tx, mut cancel) = watch::channel(false);
    let dir = tempfile::tempdir()?;
    let local_result = dir.path().join("result.csv");

    let result = run_stage(
        "run_query",
        RetryPolicy::bounded(5, DELAY),
        &mut cancel,
        parley_gateway::retry::retry_all,
        || async {
            query::execute_and_upload(
                &broker,
                &store,
                "tsql_0a1b2c3d",
                "SELECT age FROM alice",
                &local_result,
                "/ds/a.csv",
                "tsql",
            )
            .await
        },
    )
    .await;

    anyhow::ensure!(result.is_err());
    anyhow::ensure!(broker.count_of("run_query") == 5);
    anyhow::ensure!(store.writes.lock().expect("writes lock").is_empty());
    Ok(())
}
