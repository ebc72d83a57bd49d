//! Broker session establishment.
//!
//! The initiating party (the one holding the target query) creates the
//! project and invites the counterparty; the joining party polls for an
//! invitation and accepts it. Both roles confirm membership before the
//! pipeline moves on to table registration. Each task threads its own
//! project id; nothing session-scoped is shared between tasks.

use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use uuid::Uuid;

use parley_core::broker::{Broker, BrokerErrorKind, ProjectConfig};

use crate::retry::{retry_all, run_stage, settled_on, RetryPolicy, StageError, StageResult};

const STAGE: &str = "establish_session";

/// The established broker scope downstream stages operate in.
#[derive(Debug, Clone)]
pub struct Session {
    pub project_id: String,
}

/// Per-task project id: prefix plus the first eight hex digits of the task
/// id.
pub fn task_project_id(prefix: &str, task_id: Uuid) -> String {
    let hex = task_id.simple().to_string();
    format!("{}_{}", prefix, &hex[..8])
}

/// Initiator role: create the project, invite the counterparty, wait for it
/// to join.
pub async fn establish_initiator(
    broker: &dyn Broker,
    project_id: &str,
    counterparty: &str,
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Session, StageError> {
    let conf = ProjectConfig::default();
    run_stage(
        STAGE,
        RetryPolicy::indefinite(delay),
        cancel,
        settled_on(&[BrokerErrorKind::AlreadyExists]),
        || async {
            broker
                .create_project(project_id, &conf)
                .await
                .map_err(anyhow::Error::from)
        },
    )
    .await?;

    run_stage(
        STAGE,
        RetryPolicy::indefinite(delay),
        cancel,
        settled_on(&[BrokerErrorKind::AlreadyInvited]),
        || async {
            broker
                .invite_member(project_id, counterparty)
                .await
                .map_err(anyhow::Error::from)
        },
    )
    .await?;

    run_stage(
        STAGE,
        RetryPolicy::indefinite(delay),
        cancel,
        retry_all,
        || async {
            let members = broker
                .list_members(project_id)
                .await
                .map_err(anyhow::Error::from)?;
            if members.iter().any(|member| member == counterparty) {
                Ok(())
            } else {
                Err(anyhow!("waiting for {counterparty} to join {project_id}"))
            }
        },
    )
    .await?;

    Ok(Session {
        project_id: project_id.to_string(),
    })
}

/// Joiner role: poll for an invitation, accept it, wait until the broker
/// lists us as a member.
///
/// A broker that reports no invitation record settles the stage; the task
/// then operates in the configured fallback scope, which covers deployments
/// where the project is provisioned out of band.
pub async fn establish_joiner(
    broker: &dyn Broker,
    owner: &str,
    fallback_project: &str,
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Session, StageError> {
    let accepted = run_stage(
        STAGE,
        RetryPolicy::indefinite(delay),
        cancel,
        settled_on(&[BrokerErrorKind::NotFound]),
        || async {
            let invitations = broker
                .list_invitations()
                .await
                .map_err(anyhow::Error::from)?;
            let invitation = invitations
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no invitation received yet"))?;
            broker
                .accept_invitation(invitation.invitation_id)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(invitation.project_id)
        },
    )
    .await?;

    let project_id = match accepted {
        StageResult::Completed(project_id) => project_id,
        StageResult::AlreadyApplied => {
            return Ok(Session {
                project_id: fallback_project.to_string(),
            });
        }
    };

    run_stage(
        STAGE,
        RetryPolicy::indefinite(delay),
        cancel,
        retry_all,
        || async {
            let members = broker
                .list_members(&project_id)
                .await
                .map_err(anyhow::Error::from)?;
            if members.iter().any(|member| member == owner) {
                Ok(())
            } else {
                Err(anyhow!("membership in {project_id} not visible yet"))
            }
        },
    )
    .await?;

    Ok(Session { project_id })
}
