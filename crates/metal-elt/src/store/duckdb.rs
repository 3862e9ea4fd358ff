//! DuckDB destination
//!
//! The dataset is a DuckDB schema inside one database file. Every write runs
//! `CREATE OR REPLACE TABLE` plus the inserts in a single transaction, so a
//! failed load leaves the previous table in place. No primary key constraint
//! is declared; duplicate keys load and are reported by the verifier.

use ::duckdb::types::{Value as DuckValue, ValueRef};
use ::duckdb::{params, params_from_iter, Connection};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

use super::{quote_ident, Destination};
use crate::data::{Column, TableData};
use crate::error::{PipelineError, Result};
use crate::tables::DataType;

pub struct DuckDbDestination {
    /// None for in-memory databases
    db_path: Option<PathBuf>,
    schema: String,
    connection: Arc<Mutex<Connection>>,
}

impl DuckDbDestination {
    pub fn open(db_path: impl AsRef<Path>, schema: &str) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(&path).map_err(|e| {
            PipelineError::destination(format!("Failed to open DuckDB at {}: {}", path.display(), e))
        })?;
        info!("Opened DuckDB database {}", path.display());

        Ok(Self {
            db_path: Some(path),
            schema: schema.to_string(),
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn in_memory(schema: &str) -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(|e| {
            PipelineError::destination(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            schema: schema.to_string(),
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run blocking DuckDB work off the async runtime
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|e| PipelineError::destination(format!("DuckDB lock error: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PipelineError::destination(format!("DuckDB task failed: {}", e)))?
    }
}

fn to_duck_value(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => DuckValue::BigInt(i),
            (None, Some(f)) => DuckValue::Double(f),
            (None, None) => DuckValue::Text(n.to_string()),
        },
        Value::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => Value::String(format!("{:?}", other)),
    }
}

fn write_table(conn: &mut Connection, schema: &str, table: &str, data: &TableData) -> ::duckdb::Result<u64> {
    let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
    let tx = conn.transaction()?;

    tx.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {};", quote_ident(schema)))?;

    if data.columns.is_empty() {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", qualified))?;
        tx.commit()?;
        return Ok(0);
    }

    let column_defs: Vec<String> = data
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type.duckdb_type()))
        .collect();
    tx.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {} ({});",
        qualified,
        column_defs.join(", ")
    ))?;

    {
        let placeholders = vec!["?"; data.columns.len()].join(", ");
        let mut stmt = tx.prepare(&format!("INSERT INTO {} VALUES ({})", qualified, placeholders))?;
        for row in &data.rows {
            stmt.execute(params_from_iter(row.iter().map(to_duck_value)))?;
        }
    }

    tx.commit()?;
    Ok(data.row_count())
}

fn read_columns(conn: &Connection, schema: &str, table: &str) -> ::duckdb::Result<Vec<Column>> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map(params![schema, table], |row| {
            let name: String = row.get(0)?;
            let data_type: String = row.get(1)?;
            Ok(Column::new(name, DataType::from_sql_type(&data_type)))
        })?
        .collect::<::duckdb::Result<Vec<_>>>()?;
    Ok(columns)
}

fn read_rows(conn: &Connection, schema: &str, table: &str, width: usize) -> ::duckdb::Result<Vec<Vec<Value>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {}.{}",
        quote_ident(schema),
        quote_ident(table)
    ))?;
    let mut result = stmt.query([])?;

    let mut rows = Vec::new();
    while let Some(row) = result.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(value_ref_to_json(row.get_ref(i)?));
        }
        rows.push(values);
    }
    Ok(rows)
}

#[async_trait]
impl Destination for DuckDbDestination {
    fn describe(&self) -> String {
        match &self.db_path {
            Some(path) => format!("duckdb:{}/{}", path.display(), self.schema),
            None => format!("duckdb:memory/{}", self.schema),
        }
    }

    #[instrument(skip(self), fields(schema = %self.schema))]
    async fn drop_dataset(&self) -> Result<()> {
        let schema = self.schema.clone();
        self.with_connection(move |conn| {
            conn.execute_batch(&format!("DROP SCHEMA IF EXISTS {} CASCADE;", quote_ident(&schema)))
                .map_err(|e| PipelineError::destination(format!("Failed to drop schema '{}': {}", schema, e)))
        })
        .await?;

        info!("Dropped DuckDB schema {}", self.schema);
        Ok(())
    }

    #[instrument(skip(self, data), fields(schema = %self.schema, rows = data.rows.len()))]
    async fn write_replace(&self, table: &str, data: TableData) -> Result<u64> {
        let schema = self.schema.clone();
        let table_name = table.to_string();

        let written = self
            .with_connection(move |conn| {
                write_table(conn, &schema, &table_name, &data)
                    .map_err(|e| PipelineError::destination_write(table_name.as_str(), e.to_string()))
            })
            .await?;

        debug!("Replaced {}.{} with {} rows", self.schema, table, written);
        Ok(written)
    }

    #[instrument(skip(self), fields(schema = %self.schema))]
    async fn read_table(&self, table: &str) -> Result<TableData> {
        let schema = self.schema.clone();
        let table_name = table.to_string();

        self.with_connection(move |conn| {
            let read_err =
                |e: ::duckdb::Error| PipelineError::destination(format!("Failed to read {}.{}: {}", schema, table_name, e));

            let columns = read_columns(conn, &schema, &table_name).map_err(read_err)?;
            if columns.is_empty() {
                return Err(PipelineError::destination(format!(
                    "Table {}.{} does not exist",
                    schema, table_name
                )));
            }

            let rows = read_rows(conn, &schema, &table_name, columns.len()).map_err(read_err)?;
            Ok(TableData { columns, rows })
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn bands(ids: &[i64]) -> TableData {
        let mut data = TableData::new(vec![
            Column::new("id", DataType::Integer),
            Column::new("name", DataType::Text),
            Column::new("score", DataType::Float),
        ]);
        for id in ids {
            data.rows.push(vec![json!(id), json!(format!("band-{}", id)), json!(1.5)]);
        }
        data
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let db = DuckDbDestination::in_memory("metal_data").unwrap();
        assert_eq!(db.write_replace("bands", bands(&[1, 2, 3])).await.unwrap(), 3);

        let data = db.read_table("bands").await.unwrap();
        assert_eq!(data.row_count(), 3);
        assert_eq!(data.columns[0], Column::new("id", DataType::Integer));
        assert_eq!(data.columns[2].data_type, DataType::Float);
        assert_eq!(data.rows[0], vec![json!(1), json!("band-1"), json!(1.5)]);
    }

    #[tokio::test]
    async fn test_replace_discards_previous_rows() {
        let db = DuckDbDestination::in_memory("metal_data").unwrap();
        db.write_replace("bands", bands(&[1, 2, 3, 4])).await.unwrap();
        db.write_replace("bands", bands(&[9])).await.unwrap();

        let data = db.read_table("bands").await.unwrap();
        assert_eq!(data.rows.len(), 1);
        assert_eq!(data.rows[0][0], json!(9));
    }

    #[tokio::test]
    async fn test_empty_table_and_nulls() {
        let db = DuckDbDestination::in_memory("metal_data").unwrap();
        assert_eq!(db.write_replace("albums", bands(&[])).await.unwrap(), 0);
        assert!(db.read_table("albums").await.unwrap().is_empty());

        let mut data = bands(&[]);
        data.rows.push(vec![Value::Null, json!("nameless"), Value::Null]);
        db.write_replace("albums", data).await.unwrap();
        let back = db.read_table("albums").await.unwrap();
        assert_eq!(back.rows[0], vec![Value::Null, json!("nameless"), Value::Null]);
    }

    #[tokio::test]
    async fn test_drop_dataset_removes_tables() {
        let dir = TempDir::new().unwrap();
        let db = DuckDbDestination::open(dir.path().join("nested").join("metal.duckdb"), "metal_data").unwrap();
        db.write_replace("bands", bands(&[1])).await.unwrap();

        db.drop_dataset().await.unwrap();
        assert!(matches!(db.read_table("bands").await, Err(PipelineError::Destination(_))));

        // dropping twice is fine
        db.drop_dataset().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_table() {
        let db = DuckDbDestination::in_memory("metal_data").unwrap();
        db.write_replace("bands", bands(&[1, 2])).await.unwrap();

        let mut bad = bands(&[3]);
        bad.rows.push(vec![json!("not a number"), json!("x"), json!(1.0)]);
        let err = db.write_replace("bands", bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::DestinationWrite { ref table, .. } if table == "bands"));

        let data = db.read_table("bands").await.unwrap();
        assert_eq!(data.row_count(), 2);
    }
}
