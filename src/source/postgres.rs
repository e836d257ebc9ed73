// ABOUTME: PostgresSource - reads entity rows from a source table by (event_time, id) cursor
// ABOUTME: Converts rows to records by column type, keeping numerics exact

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Row;

use super::SourceAdapter;
use crate::postgres::PgConnection;
use crate::record::{FieldValue, Record, RecordKey};
use crate::utils::{quote_ident, validate_postgres_identifier, TableRef};

const ENTITY_ID_ALIAS: &str = "_entity_id";
const EVENT_TIME_ALIAS: &str = "_event_time";

/// Reads one entity type from a PostgreSQL table.
///
/// The id column is compared as text under `COLLATE "C"` so the database orders
/// ties exactly like `RecordKey` does.
pub struct PostgresSource {
    conn: Arc<PgConnection>,
    table: TableRef,
    id_column: String,
    time_column: String,
    /// Business columns to read; empty reads every column
    columns: Vec<String>,
    name: String,
}

impl PostgresSource {
    pub fn new(
        conn: Arc<PgConnection>,
        table: TableRef,
        id_column: &str,
        time_column: &str,
        columns: Vec<String>,
    ) -> Result<Self> {
        validate_postgres_identifier(id_column).context("Invalid id column")?;
        validate_postgres_identifier(time_column).context("Invalid time column")?;
        for column in &columns {
            validate_postgres_identifier(column)
                .with_context(|| format!("Invalid column in {}", table.qualified_name()))?;
        }

        Ok(Self {
            name: table.qualified_name(),
            conn,
            table,
            id_column: id_column.to_string(),
            time_column: time_column.to_string(),
            columns,
        })
    }

    fn projection(&self) -> String {
        let column_list = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "{}, {}::text AS {}, {}::timestamptz AS {}",
            column_list,
            quote_ident(&self.id_column),
            ENTITY_ID_ALIAS,
            quote_ident(&self.time_column),
            EVENT_TIME_ALIAS
        )
    }

    fn order_clause(&self) -> String {
        format!(
            "ORDER BY {}, {}::text COLLATE \"C\"",
            quote_ident(&self.time_column),
            quote_ident(&self.id_column)
        )
    }

    fn incremental_query(&self, with_cursor: bool) -> String {
        if with_cursor {
            format!(
                "SELECT {} FROM {} WHERE ({}, {}::text COLLATE \"C\") > ($1::timestamptz, $2::text) {} LIMIT $3",
                self.projection(),
                self.table.quoted(),
                quote_ident(&self.time_column),
                quote_ident(&self.id_column),
                self.order_clause()
            )
        } else {
            format!(
                "SELECT {} FROM {} {} LIMIT $1",
                self.projection(),
                self.table.quoted(),
                self.order_clause()
            )
        }
    }

    fn full_query(&self) -> String {
        format!(
            "SELECT {} FROM {} {}",
            self.projection(),
            self.table.quoted(),
            self.order_clause()
        )
    }

    fn changed_since_query(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} >= $1::timestamptz {}",
            self.projection(),
            self.table.quoted(),
            quote_ident(&self.time_column),
            self.order_clause()
        )
    }

    async fn query_records(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        what: &str,
    ) -> Result<Vec<Record>> {
        let client = self.conn.client().await?;
        let rows = client
            .query(query, params)
            .await
            .with_context(|| format!("Failed to read {} from {}", what, self.name))?;

        rows.iter()
            .map(|row| row_to_record(row, &self.id_column, &self.time_column))
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for PostgresSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_incremental(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let limit = limit as i64;
        match after {
            Some(cursor) => {
                self.query_records(
                    &self.incremental_query(true),
                    &[&cursor.event_time, &cursor.entity_id, &limit],
                    "incremental page",
                )
                .await
            }
            None => {
                self.query_records(&self.incremental_query(false), &[&limit], "first page")
                    .await
            }
        }
    }

    async fn fetch_all(&self) -> Result<Vec<Record>> {
        self.query_records(&self.full_query(), &[], "full table").await
    }

    async fn fetch_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Record>> {
        self.query_records(&self.changed_since_query(), &[&since], "changed rows")
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.conn.ping().await
    }

    async fn table_exists(&self) -> Result<bool> {
        self.conn.table_exists(&self.table).await
    }
}

/// Convert a source row into a record.
///
/// The id and time columns become the record key and are not repeated as fields.
fn row_to_record(row: &Row, id_column: &str, time_column: &str) -> Result<Record> {
    let entity_id: Option<String> = row
        .try_get(ENTITY_ID_ALIAS)
        .context("Failed to read entity id")?;
    let event_time: Option<DateTime<Utc>> = row
        .try_get(EVENT_TIME_ALIAS)
        .context("Failed to read event time")?;

    let (Some(entity_id), Some(event_time)) = (entity_id, event_time) else {
        bail!(
            "Row with NULL {} or {} cannot be tracked",
            id_column,
            time_column
        );
    };

    let mut record = Record::new(entity_id, event_time);
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if name == ENTITY_ID_ALIAS
            || name == EVENT_TIME_ALIAS
            || name == id_column
            || name == time_column
        {
            continue;
        }
        let value = column_value(row, idx, column.type_())
            .with_context(|| format!("Failed to read column {}", name))?;
        record.fields.insert(name.to_string(), value);
    }

    Ok(record)
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<FieldValue> {
    let value = match ty.name() {
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(|v| FieldValue::Int(v.into())),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(|v| FieldValue::Int(v.into())),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(FieldValue::Int),
        "numeric" => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(FieldValue::Decimal),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| float_value(f64::from(v))),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(float_value),
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(FieldValue::Bool),
        "text" | "varchar" | "bpchar" | "name" => {
            row.try_get::<_, Option<String>>(idx)?.map(FieldValue::Text)
        }
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(FieldValue::Timestamp),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| FieldValue::Timestamp(v.and_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| FieldValue::Text(v.to_string())),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(FieldValue::Json),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(value) => value.map(FieldValue::Text),
            Err(_) => {
                tracing::debug!("Unsupported column type {}, reading as NULL", ty);
                None
            }
        },
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

/// Floats are carried as exact decimals when representable, otherwise as text.
fn float_value(v: f64) -> FieldValue {
    match Decimal::from_f64_retain(v) {
        Some(d) => FieldValue::Decimal(d.normalize()),
        None => FieldValue::Text(v.to_string()),
    }
}
