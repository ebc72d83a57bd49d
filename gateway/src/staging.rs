//! Dataset staging: fetch from the remote file store, load into the engine
//! store.
//!
//! The destination table is recreated from the dataset's header row with
//! every column typed `varchar(512)`. Table and column names come from
//! caller- and file-supplied strings, so identifiers pass an allow-list and
//! are quoted, and all row values are bound parameters.

use std::path::Path;

use anyhow::{bail, Context};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use parley_core::filestore::FileStore;

const INSERT_BATCH_ROWS: usize = 1000;

#[derive(Debug)]
pub struct StagedDataset {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: usize,
}

/// Fetch the dataset and persist it to the local staging path.
pub async fn fetch_dataset(
    store: &dyn FileStore,
    remote_path: &str,
    local_path: &Path,
) -> anyhow::Result<String> {
    let bytes = store
        .read_file(remote_path)
        .await
        .with_context(|| format!("fetch dataset {remote_path}"))?;
    tokio::fs::write(local_path, &bytes)
        .await
        .with_context(|| format!("persist dataset to {}", local_path.display()))?;
    String::from_utf8(bytes).context("dataset is not valid utf-8")
}

/// Recreate the destination table from the header row and bulk-load the data
/// records.
pub async fn load_dataset(
    pool: &MySqlPool,
    table: &str,
    content: &str,
) -> anyhow::Result<StagedDataset> {
    let (header, records) = parse_csv(content)?;
    if header.is_empty() {
        bail!("dataset header row is empty");
    }
    for (n, row) in records.iter().enumerate() {
        if row.len() != header.len() {
            // +2: one for the header line, one for 1-based numbering.
            bail!(
                "row {} has {} fields, expected {}",
                n + 2,
                row.len(),
                header.len()
            );
        }
    }

    let table_ident = quote_ident(table)?;
    let column_idents = header
        .iter()
        .map(|column| quote_ident(column))
        .collect::<anyhow::Result<Vec<_>>>()?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {table_ident}"))
        .execute(pool)
        .await
        .context("drop staging table")?;

    sqlx::query(&create_table_sql(&table_ident, &column_idents))
        .execute(pool)
        .await
        .context("create staging table")?;

    sqlx::query(&format!("DELETE FROM {table_ident}"))
        .execute(pool)
        .await
        .context("clear staging table")?;

    let insert_prefix = format!("INSERT INTO {table_ident} ({}) ", column_idents.join(","));
    let mut loaded = 0usize;
    for chunk in records.chunks(INSERT_BATCH_ROWS) {
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(insert_prefix.as_str());
        builder.push_values(chunk.iter(), |mut row_builder, row| {
            for value in row {
                row_builder.push_bind(value.as_str());
            }
        });
        builder
            .build()
            .execute(pool)
            .await
            .context("bulk-load dataset rows")?;
        loaded += chunk.len();
    }

    Ok(StagedDataset {
        table: table.to_string(),
        columns: header,
        rows: loaded,
    })
}

/// DDL for the staging table: every header column, in order, uniformly
/// typed as a fixed-width string.
fn create_table_sql(table_ident: &str, column_idents: &[String]) -> String {
    let mut create = format!("CREATE TABLE {table_ident} (");
    for (n, column) in column_idents.iter().enumerate() {
        if n > 0 {
            create.push(',');
        }
        create.push_str(column);
        create.push_str(" varchar(512)");
    }
    create.push_str(") ENGINE=InnoDB DEFAULT CHARSET=utf8mb4");
    create
}

/// Allow-list and quote a SQL identifier: letters, digits, underscore, not
/// starting with a digit, at most 64 chars.
pub fn quote_ident(name: &str) -> anyhow::Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid identifier {name:?}");
    }
    Ok(format!("`{name}`"))
}

/// Split a CSV document into the header row and data records.
pub fn parse_csv(content: &str) -> anyhow::Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut rows = parse_records(content)?;
    if rows.is_empty() {
        bail!("dataset is empty");
    }
    let header = rows.remove(0);
    Ok((header, rows))
}

// Minimal RFC 4180 subset: quoted fields, doubled-quote escapes, CRLF line
// endings, blank lines skipped.
fn parse_records(content: &str) -> anyhow::Result<Vec<Vec<String>>> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if record.len() == 1 && record[0].is_empty() {
                    record.clear();
                } else {
                    records.push(std::mem::take(&mut record));
                }
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        bail!("unterminated quoted field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_order_is_preserved() -> anyhow::Result<()> {
        let (header, records) = parse_csv("age,name,city\n30,bob,berlin\n41,eve,oslo\n")?;
        anyhow::ensure!(header == vec!["age", "name", "city"]);
        anyhow::ensure!(records.len() == 2);
        anyhow::ensure!(records[0] == vec!["30", "bob", "berlin"]);
        Ok(())
    }

    #[test]
    fn quoted_fields_and_escapes() -> anyhow::Result<()> {
        let (header, records) = parse_csv("a,b\n\"x,y\",\"he said \"\"hi\"\"\"\n")?;
        anyhow::ensure!(header == vec!["a", "b"]);
        anyhow::ensure!(records[0] == vec!["x,y", "he said \"hi\""]);
        Ok(())
    }

    #[test]
    fn crlf_and_missing_trailing_newline() -> anyhow::Result<()> {
        let (header, records) = parse_csv("a,b\r\n1,2\r\n3,4")?;
        anyhow::ensure!(header == vec!["a", "b"]);
        anyhow::ensure!(records == vec![vec!["1", "2"], vec!["3", "4"]]);
        Ok(())
    }

    #[test]
    fn blank_lines_are_skipped() -> anyhow::Result<()> {
        let (_, records) = parse_csv("a\n1\n\n2\n")?;
        anyhow::ensure!(records == vec![vec!["1"], vec!["2"]]);
        Ok(())
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_csv("a,b\n\"oops,1\n").is_err());
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(parse_csv("").is_err());
    }

    #[test]
    fn staging_table_mirrors_the_header() -> anyhow::Result<()> {
        let idents = ["age", "name", "city"]
            .iter()
            .map(|c| quote_ident(c))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let sql = create_table_sql(&quote_ident("alice")?, &idents);
        anyhow::ensure!(
            sql == "CREATE TABLE `alice` (`age` varchar(512),`name` varchar(512),\
                    `city` varchar(512)) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
        Ok(())
    }

    #[test]
    fn identifiers_are_allow_listed() -> anyhow::Result<()> {
        anyhow::ensure!(quote_ident("age")? == "`age`");
        anyhow::ensure!(quote_ident("_hidden2")? == "`_hidden2`");
        anyhow::ensure!(quote_ident("1age").is_err());
        anyhow::ensure!(quote_ident("").is_err());
        anyhow::ensure!(quote_ident("age; drop table users").is_err());
        anyhow::ensure!(quote_ident("na`me").is_err());
        anyhow::ensure!(quote_ident(&"x".repeat(65)).is_err());
        Ok(())
    }
}
