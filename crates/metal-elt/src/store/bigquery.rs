//! BigQuery destination over the REST API
//!
//! Tables are replaced with a multipart load job (`WRITE_TRUNCATE`,
//! newline-delimited JSON, explicit schema), which BigQuery applies
//! atomically. Empty row sets become a `CREATE OR REPLACE TABLE` query since a
//! load job needs at least one row.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::Destination;
use crate::data::{Column, TableData};
use crate::error::{PipelineError, Result};
use crate::tables::DataType;

const REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_MAX_POLLS: u32 = 600;
const MULTIPART_BOUNDARY: &str = "metal_elt_load_boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: Option<String>,
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{}: {}", reason, message),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: JobReference,
    #[serde(default)]
    job_complete: bool,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableDataList {
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

/// Standard SQL type used in DDL statements
fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer => "INT64",
        DataType::Text => "STRING",
        DataType::Float => "FLOAT64",
    }
}

/// BigQuery returns every scalar as a string; convert back by column type
fn cell_to_json(cell: Value, data_type: DataType) -> Value {
    match (cell, data_type) {
        (Value::String(s), DataType::Integer) => s.parse::<i64>().map(Value::from).unwrap_or(Value::String(s)),
        (Value::String(s), DataType::Float) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(s)),
        (other, _) => other,
    }
}

fn row_to_object(columns: &[Column], row: &[Value]) -> Value {
    let mut object = Map::with_capacity(columns.len());
    for (column, value) in columns.iter().zip(row) {
        if !value.is_null() {
            object.insert(column.name.clone(), value.clone());
        }
    }
    Value::Object(object)
}

pub struct BigQueryDestination {
    client: Client,
    api_url: String,
    project: String,
    dataset: String,
    location: String,
    token: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl BigQueryDestination {
    pub fn new(
        api_url: &str,
        project: &str,
        dataset: &str,
        location: &str,
        token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::destination(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            dataset: dataset.to_string(),
            location: location.to_string(),
            token,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_polls: DEFAULT_MAX_POLLS,
        })
    }

    /// Override how often and how long job completion is polled
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    fn project_url(&self) -> String {
        format!("{}/bigquery/v2/projects/{}", self.api_url, self.project)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/datasets/{}/tables/{}", self.project_url(), self.dataset, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| PipelineError::destination(format!("{} request failed: {}", what, e)))
    }

    /// Turn a non-2xx response into an error carrying the API message
    async fn api_error(response: Response, what: &str) -> PipelineError {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("no error message");
        PipelineError::destination(format!("{} failed with HTTP {}: {}", what, status.as_u16(), message))
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::api_error(response, what).await);
        }
        response
            .json()
            .await
            .map_err(|e| PipelineError::destination(format!("Invalid {} response: {}", what, e)))
    }

    /// Create the dataset if it does not exist yet
    async fn ensure_dataset(&self) -> Result<()> {
        let body = json!({
            "datasetReference": { "projectId": self.project, "datasetId": self.dataset },
            "location": self.location,
        });
        let response = self
            .send(
                self.client.post(format!("{}/datasets", self.project_url())).json(&body),
                "Dataset creation",
            )
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!("Created BigQuery dataset {}.{}", self.project, self.dataset);
                Ok(())
            },
            StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::api_error(response, "Dataset creation").await),
        }
    }

    fn load_body(&self, table: &str, job_id: &str, data: &TableData) -> Result<String> {
        let fields: Vec<Value> = data
            .columns
            .iter()
            .map(|c| json!({ "name": c.name, "type": c.data_type.bigquery_type(), "mode": "NULLABLE" }))
            .collect();

        let job = json!({
            "jobReference": { "projectId": self.project, "jobId": job_id, "location": self.location },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.project,
                        "datasetId": self.dataset,
                        "tableId": table,
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_TRUNCATE",
                    "createDisposition": "CREATE_IF_NEEDED",
                    "schema": { "fields": fields },
                }
            }
        });

        let mut ndjson = String::new();
        for row in &data.rows {
            let line = serde_json::to_string(&row_to_object(&data.columns, row))
                .map_err(|e| PipelineError::destination_write(table, format!("Failed to encode row: {}", e)))?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        Ok(format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{job}\r\n\
             --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
            b = MULTIPART_BOUNDARY,
            job = job,
            data = ndjson
        ))
    }

    /// Poll a job until it reaches `DONE`
    async fn wait_for_job(&self, reference: JobReference) -> Result<Job> {
        let url = format!("{}/jobs/{}", self.project_url(), reference.job_id);
        let location = reference.location.unwrap_or_else(|| self.location.clone());

        for poll in 1..=self.max_polls {
            let response = self
                .send(self.client.get(&url).query(&[("location", location.as_str())]), "Job status")
                .await?;
            let job: Job = Self::parse(response, "Job status").await?;

            if job.status.state.as_deref() == Some("DONE") {
                if let Some(error) = &job.status.error_result {
                    let details: Vec<String> = job.status.errors.iter().map(ErrorProto::describe).collect();
                    return Err(PipelineError::destination(format!(
                        "Job {} failed: {}{}",
                        job.job_reference.job_id,
                        error.describe(),
                        if details.is_empty() {
                            String::new()
                        } else {
                            format!(" ({})", details.join("; "))
                        }
                    )));
                }
                return Ok(job);
            }

            debug!(poll, "Job {} is {:?}", reference.job_id, job.status.state);
            if !self.poll_interval.is_zero() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(PipelineError::destination(format!(
            "Job {} did not finish after {} polls",
            reference.job_id, self.max_polls
        )))
    }

    /// Run a standard SQL statement and wait for it
    async fn run_statement(&self, sql: String) -> Result<()> {
        let body = json!({ "query": sql, "useLegacySql": false, "location": self.location });
        let response = self
            .send(self.client.post(format!("{}/queries", self.project_url())).json(&body), "Query")
            .await?;
        let query: QueryResponse = Self::parse(response, "Query").await?;

        if !query.job_complete {
            self.wait_for_job(query.job_reference).await?;
        }
        Ok(())
    }

    async fn replace_with_empty(&self, table: &str, columns: &[Column]) -> Result<()> {
        let qualified = format!("`{}.{}.{}`", self.project, self.dataset, table);
        let sql = if columns.is_empty() {
            format!("DROP TABLE IF EXISTS {}", qualified)
        } else {
            let defs: Vec<String> = columns
                .iter()
                .map(|c| format!("`{}` {}", c.name, sql_type(c.data_type)))
                .collect();
            format!("CREATE OR REPLACE TABLE {} ({})", qualified, defs.join(", "))
        };
        self.run_statement(sql).await
    }

    async fn load_rows(&self, table: &str, data: &TableData) -> Result<u64> {
        let job_id = format!("metal_elt_{}_{}", table, Uuid::new_v4().simple());
        let body = self.load_body(table, &job_id, data)?;

        let response = self
            .send(
                self.client
                    .post(format!(
                        "{}/upload/bigquery/v2/projects/{}/jobs",
                        self.api_url, self.project
                    ))
                    .query(&[("uploadType", "multipart")])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
                    )
                    .body(body),
                "Load job",
            )
            .await?;
        let job: Job = Self::parse(response, "Load job").await?;
        debug!("Started load job {}", job.job_reference.job_id);

        let done = self.wait_for_job(job.job_reference).await?;
        let output_rows = done
            .statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .and_then(|rows| rows.parse::<u64>().ok())
            .unwrap_or_else(|| data.row_count());

        Ok(output_rows)
    }
}

#[async_trait]
impl Destination for BigQueryDestination {
    fn describe(&self) -> String {
        format!("bigquery:{}.{}", self.project, self.dataset)
    }

    #[instrument(skip(self), fields(dataset = %self.dataset))]
    async fn drop_dataset(&self) -> Result<()> {
        let url = format!("{}/datasets/{}", self.project_url(), self.dataset);
        let response = self
            .send(
                self.client.delete(&url).query(&[("deleteContents", "true")]),
                "Dataset deletion",
            )
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!("Deleted BigQuery dataset {}.{}", self.project, self.dataset);
                Ok(())
            },
            StatusCode::NOT_FOUND => {
                debug!("Dataset {}.{} did not exist", self.project, self.dataset);
                Ok(())
            },
            _ => Err(Self::api_error(response, "Dataset deletion").await),
        }
    }

    #[instrument(skip(self, data), fields(dataset = %self.dataset, rows = data.rows.len()))]
    async fn write_replace(&self, table: &str, data: TableData) -> Result<u64> {
        let to_write_error = |e: PipelineError| match e {
            PipelineError::Destination(message) => PipelineError::destination_write(table, message),
            other => other,
        };

        self.ensure_dataset().await.map_err(to_write_error)?;

        let written = if data.is_empty() {
            self.replace_with_empty(table, &data.columns)
                .await
                .map_err(to_write_error)?;
            0
        } else {
            self.load_rows(table, &data).await.map_err(to_write_error)?
        };

        if written != data.row_count() {
            warn!(
                "BigQuery reported {} rows for {} but {} were sent",
                written,
                table,
                data.row_count()
            );
        }
        info!("Replaced {}.{}.{} with {} rows", self.project, self.dataset, table, written);
        Ok(written)
    }

    #[instrument(skip(self), fields(dataset = %self.dataset))]
    async fn read_table(&self, table: &str) -> Result<TableData> {
        let response = self.send(self.client.get(self.table_url(table)), "Table lookup").await?;
        let resource: TableResource = Self::parse(response, "Table lookup").await?;
        let columns: Vec<Column> = resource
            .schema
            .map(|s| s.fields)
            .unwrap_or_default()
            .into_iter()
            .map(|f| Column::new(f.name, DataType::from_sql_type(&f.field_type)))
            .collect();

        let mut data = TableData::new(columns);
        let data_url = format!("{}/data", self.table_url(table));
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&data_url);
            if let Some(token) = page_token.take() {
                request = request.query(&[("pageToken", token)]);
            }
            let page: TableDataList = Self::parse(self.send(request, "Table read").await?, "Table read").await?;

            for row in page.rows {
                let values = row
                    .f
                    .into_iter()
                    .zip(&data.columns)
                    .map(|(cell, column)| cell_to_json(cell.v, column.data_type))
                    .collect();
                data.rows.push(values);
            }

            match page.page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Read {} rows from {}.{}", data.row_count(), self.dataset, table);
        Ok(data)
    }
}
