//! Target-query execution and result handoff.

use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};

use parley_core::broker::{Broker, DebugOptions, QueryResult};
use parley_core::filestore::FileStore;

#[derive(Debug)]
pub struct QueryOutcome {
    pub remote_path: String,
    pub etag: String,
    pub size: i64,
    pub rows: usize,
}

/// One bounded attempt: run the query, persist the rows locally, upload the
/// result beside the source dataset.
///
/// A response without output columns counts as a failed attempt; the engine
/// answers that way while the counterparty's grants are still propagating.
pub async fn execute_and_upload(
    broker: &dyn Broker,
    store: &dyn FileStore,
    project_id: &str,
    sql: &str,
    local_result: &Path,
    dataset_path: &str,
    prefix: &str,
) -> anyhow::Result<QueryOutcome> {
    let result = broker
        .run_query(project_id, sql, &DebugOptions::default())
        .await
        .context("run query")?;
    if result.columns.is_empty() {
        bail!("query returned no output columns");
    }

    let csv = render_csv(&result);
    tokio::fs::write(local_result, csv.as_bytes())
        .await
        .with_context(|| format!("write result file {}", local_result.display()))?;

    let remote_path = result_destination(dataset_path, prefix, Utc::now());
    let receipt = store
        .write_file(&remote_path, csv.into_bytes())
        .await
        .context("upload result")?;

    Ok(QueryOutcome {
        remote_path,
        etag: receipt.etag,
        size: receipt.size,
        rows: result.rows.len(),
    })
}

/// Destination path: the source dataset's directory plus a
/// timestamp-suffixed result name.
fn result_destination(dataset_path: &str, prefix: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S");
    match dataset_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => format!("{dir}/{prefix}_result_{stamp}.csv"),
        Some(_) => format!("/{prefix}_result_{stamp}.csv"),
        None => format!("{prefix}_result_{stamp}.csv"),
    }
}

fn render_csv(result: &QueryResult) -> String {
    let mut out = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .map(|name| escape_field(name))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');
    for row in &result.rows {
        let fields: Vec<String> = row
            .iter()
            .map(|value| escape_field(&cell_text(value)))
            .collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
