// ABOUTME: PostgresSink - upserts accepted records into a system-of-record table
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE with values cast to each target column type

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::SinkAdapter;
use crate::error::SyncError;
use crate::postgres::PgConnection;
use crate::record::Record;
use crate::utils::{quote_ident, validate_postgres_identifier, TableRef};

/// A target column: name and the type name used for casting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    pub udt_name: String,
}

/// Writes records into one target table, keyed by the entity id column.
///
/// Every value is bound as text and cast to the column's type in SQL, so a record
/// field lands in any column whose type can parse its text form. Fields without a
/// matching column are skipped.
pub struct PostgresSink {
    conn: Arc<PgConnection>,
    table: TableRef,
    id_column: String,
    time_column: Option<String>,
    columns: Mutex<Option<Arc<Vec<TargetColumn>>>>,
    name: String,
}

impl PostgresSink {
    pub fn new(
        conn: Arc<PgConnection>,
        table: TableRef,
        id_column: &str,
        time_column: Option<&str>,
    ) -> Result<Self> {
        validate_postgres_identifier(id_column).context("Invalid sink id column")?;
        if let Some(column) = time_column {
            validate_postgres_identifier(column).context("Invalid sink time column")?;
        }

        Ok(Self {
            name: table.qualified_name(),
            conn,
            table,
            id_column: id_column.to_string(),
            time_column: time_column.map(str::to_string),
            columns: Mutex::new(None),
        })
    }

    /// Target column metadata, loaded on first use.
    async fn target_columns(&self, client: &Client) -> Result<Arc<Vec<TargetColumn>>> {
        let mut cached = self.columns.lock().await;
        if let Some(columns) = cached.as_ref() {
            return Ok(columns.clone());
        }

        let columns = get_table_columns(client, &self.table).await?;
        if columns.is_empty() {
            return Err(SyncError::SchemaMissing(self.name.clone()).into());
        }
        if !columns.iter().any(|c| c.name == self.id_column) {
            bail!("Table {} has no column {}", self.name, self.id_column);
        }

        let columns = Arc::new(columns);
        *cached = Some(columns.clone());
        Ok(columns)
    }

    /// Forget cached column metadata, e.g. after the target table changed.
    pub async fn invalidate_columns(&self) {
        *self.columns.lock().await = None;
    }

    /// Pair every writable target column with the record's text value for it.
    fn bind_values<'c>(
        &self,
        columns: &'c [TargetColumn],
        record: &Record,
    ) -> (Vec<&'c TargetColumn>, Vec<Option<String>>) {
        let mut written = Vec::new();
        let mut values = Vec::new();

        for column in columns {
            let value = if column.name == self.id_column {
                Some(record.entity_id.clone())
            } else if self.time_column.as_deref() == Some(column.name.as_str()) {
                Some(record.event_time.to_rfc3339())
            } else if let Some(field) = record.field(&column.name) {
                field.to_sql_text()
            } else {
                continue;
            };
            written.push(column);
            values.push(value);
        }

        (written, values)
    }
}

#[async_trait]
impl SinkAdapter for PostgresSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &Record) -> Result<u64> {
        let client = self.conn.client().await?;
        let columns = self.target_columns(&client).await?;
        let (written, values) = self.bind_values(&columns, record);

        let query = build_upsert_query(&self.table, &self.id_column, &written);
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();

        let affected = client.execute(&query, &params).await.with_context(|| {
            format!("Failed to upsert {} into {}", record.entity_id, self.name)
        })?;

        Ok(affected)
    }

    async fn health_check(&self) -> Result<()> {
        self.conn.ping().await
    }

    async fn table_exists(&self) -> Result<bool> {
        self.conn.table_exists(&self.table).await
    }
}

/// Build a single-row upsert for the given columns.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("id", "x", "status")
/// VALUES ($1::text::int8, $2::text::numeric, $3::text::varchar)
/// ON CONFLICT ("id") DO UPDATE SET
///   "x" = EXCLUDED."x",
///   "status" = EXCLUDED."status"
/// ```
fn build_upsert_query(table: &TableRef, conflict_column: &str, columns: &[&TargetColumn]) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();

    let placeholders: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("${}::text::{}", idx + 1, c.udt_name))
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| c.name != conflict_column)
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(&c.name), quote_ident(&c.name)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table.quoted(),
        quoted_columns.join(", "),
        placeholders.join(", "),
        quote_ident(conflict_column),
        update_clause
    )
}

/// Column names and type names of a table, in ordinal order.
pub async fn get_table_columns(client: &Client, table: &TableRef) -> Result<Vec<TargetColumn>> {
    let rows = client
        .query(
            "SELECT column_name, udt_name
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&table.schema, &table.table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}", table.qualified_name()))?;

    rows.iter()
        .map(|row| {
            Ok(TargetColumn {
                name: row.try_get(0).context("Failed to read column_name")?,
                udt_name: row.try_get(1).context("Failed to read udt_name")?,
            })
        })
        .collect()
}
