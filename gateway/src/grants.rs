//! Virtual-table registration and column-level access grants.

use parley_core::broker::{Broker, TableDef};
use parley_core::{AccessLevel, ColumnDesc, ColumnGrant};

use crate::task::ColumnSpec;

/// Broker registration payload for the staged dataset.
///
/// The virtual table is named after the owner and references the physical
/// table the staging stage created in the engine store.
pub fn table_def(owner: &str, columns: &[ColumnSpec]) -> TableDef {
    TableDef {
        table_name: owner.to_string(),
        db_type: "mysql".to_string(),
        ref_table: format!("engine.{owner}"),
        columns: columns
            .iter()
            .map(|column| ColumnDesc {
                name: column.name.clone(),
                dtype: column.dtype.clone(),
            })
            .collect(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GrantStats {
    pub attempted: usize,
    pub failed: usize,
}

/// Issue the implicit owner grant plus each declared grant.
///
/// The owner always receives `PLAINTEXT` visibility on every declared
/// column. Failures are logged per grant and never abort the task; a failed
/// owner grant skips that column's explicit grants, which cannot be narrower
/// than it.
pub async fn grant_columns(
    broker: &dyn Broker,
    project_id: &str,
    owner: &str,
    columns: &[ColumnSpec],
) -> GrantStats {
    let mut stats = GrantStats::default();
    for column in columns {
        stats.attempted += 1;
        let owner_grant = ColumnGrant {
            party_id: owner.to_string(),
            table: owner.to_string(),
            column: column.name.clone(),
            level: AccessLevel::Plaintext,
        };
        if let Err(err) = broker
            .grant_columns(project_id, std::slice::from_ref(&owner_grant))
            .await
        {
            stats.failed += 1;
            tracing::warn!(
                event = "gateway.grants.failed",
                project_id,
                column = %column.name,
                party = owner,
                error = %err,
                "owner grant failed; skipping column"
            );
            continue;
        }

        for grant in &column.grants {
            stats.attempted += 1;
            let ccl = ColumnGrant {
                party_id: grant.grantee.clone(),
                table: owner.to_string(),
                column: column.name.clone(),
                level: grant.level,
            };
            if let Err(err) = broker
                .grant_columns(project_id, std::slice::from_ref(&ccl))
                .await
            {
                stats.failed += 1;
                tracing::warn!(
                    event = "gateway.grants.failed",
                    project_id,
                    column = %column.name,
                    party = %grant.grantee,
                    error = %err,
                    "column grant failed"
                );
            }
        }
    }
    stats
}
