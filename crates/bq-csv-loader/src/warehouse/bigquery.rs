//! Google BigQuery backend.
//!
//! This module provides [`BigQueryClient`], which implements the
//! [`Warehouse`] trait over the BigQuery v2 REST API
//! (<https://cloud.google.com/bigquery/docs/reference/rest>).
//!
//! - table metadata: `tables.get`
//! - statements: `jobs.query`, then `jobs.getQueryResults` until complete
//! - loads: multipart `jobs.insert` upload of newline-delimited JSON, then
//!   `jobs.get` until the job is `DONE`

use std::thread;
use std::time::{Duration, Instant};

use crate::auth::{AccessTokenProvider, CredentialSource, Credentials};
use crate::error::{LoaderError, Result};
use crate::locator::TableLocator;
use crate::normalize::NormalizedFrame;

use super::Warehouse;
use chrono::Utc;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Default REST endpoint.
const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Default media upload endpoint.
const DEFAULT_UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

/// Default timeout for a single HTTP request in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default delay between `jobs.get` polls in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default upper bound on waiting for one job, in seconds.
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 6 * 3600;

/// Server-side wait requested from `jobs.query` / `jobs.getQueryResults`.
const QUERY_WAIT_MS: u64 = 10_000;

/// Job error reasons that mean the warehouse refused the request itself.
const REJECTION_REASONS: [&str; 2] = ["invalid", "invalidQuery"];

// BigQuery REST request/response structures
#[derive(Deserialize)]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Deserialize)]
struct TableField {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
    statistics: Option<JobStatistics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

/// A non-success HTTP answer from the API.
#[derive(Debug)]
struct ApiFailure {
    status: StatusCode,
    message: String,
    reason: Option<String>,
}

impl ApiFailure {
    fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Self::from_body(status, &body)
    }

    fn from_body(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(parsed) => Self {
                status,
                reason: parsed.error.errors.first().and_then(|e| e.reason.clone()),
                message: parsed.error.message.unwrap_or_else(|| body.to_string()),
            },
            Err(_) => Self {
                status,
                message: body.trim().to_string(),
                reason: None,
            },
        }
    }

    fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// HTTP 400 means the submitted statement or job was rejected.
    fn into_statement_error(self) -> LoaderError {
        if self.status == StatusCode::BAD_REQUEST {
            LoaderError::StatementSyntax(self.message)
        } else {
            self.into_api_error()
        }
    }

    fn into_api_error(self) -> LoaderError {
        match self.reason {
            Some(reason) => {
                LoaderError::WarehouseApi(format!("{} ({}): {}", self.status, reason, self.message))
            }
            None => LoaderError::WarehouseApi(format!("{}: {}", self.status, self.message)),
        }
    }
}

/// Map a finished job's `errorResult` to a loader error.
fn job_error(error: ErrorProto) -> LoaderError {
    let message = error.message.unwrap_or_else(|| "job failed".to_string());
    match error.reason.as_deref() {
        Some(reason) if REJECTION_REASONS.contains(&reason) => LoaderError::StatementSyntax(message),
        Some(reason) => LoaderError::WarehouseApi(format!("{}: {}", reason, message)),
        None => LoaderError::WarehouseApi(message),
    }
}

/// Read an int64 count that the API may encode as a string or a number.
fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Append path segments (percent-encoded) to a base URL.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| LoaderError::ClientConstruction(format!("invalid URL '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| LoaderError::ClientConstruction(format!("URL '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Load job configuration: append only, never create the table.
fn load_job_resource(locator: &TableLocator, location: Option<&str>) -> Value {
    let mut reference = json!({ "projectId": locator.project() });
    if let Some(location) = location {
        reference["location"] = json!(location);
    }

    json!({
        "jobReference": reference,
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": locator.project(),
                    "datasetId": locator.dataset(),
                    "tableId": locator.table(),
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_APPEND",
                "createDisposition": "CREATE_NEVER",
            }
        }
    })
}

/// Build a `multipart/related` body with a JSON metadata part and a media part.
///
/// Returns the boundary and the body.
fn multipart_related(metadata: &Value, media: &[u8]) -> (String, Vec<u8>) {
    let metadata = metadata.to_string();
    let mut boundary = format!(
        "bq_csv_loader_{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    while metadata.contains(&boundary) || contains_bytes(media, boundary.as_bytes()) {
        boundary.push('x');
    }

    let mut body = Vec::with_capacity(media.len() + metadata.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    (boundary, body)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Configuration for the BigQuery client.
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// REST endpoint (useful for proxies or emulators).
    pub base_url: String,
    /// Media upload endpoint.
    pub upload_url: String,
    /// Timeout for a single HTTP request in seconds.
    pub timeout_secs: u64,
    /// Delay between job status polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Give up waiting for a job after this many seconds.
    pub job_timeout_secs: u64,
    /// Job location (e.g. "US", "EU"); `None` lets BigQuery pick.
    pub location: Option<String>,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            upload_url: DEFAULT_UPLOAD_URL.to_owned(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            location: None,
        }
    }
}

impl BigQueryConfig {
    /// Create a new configuration builder.
    pub fn builder() -> BigQueryConfigBuilder {
        BigQueryConfigBuilder::default()
    }
}

/// Builder for [`BigQueryConfig`].
#[derive(Default)]
pub struct BigQueryConfigBuilder {
    base_url: Option<String>,
    upload_url: Option<String>,
    timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    job_timeout_secs: Option<u64>,
    location: Option<String>,
}

impl BigQueryConfigBuilder {
    /// Set a custom REST endpoint.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set a custom media upload endpoint.
    pub fn upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = Some(upload_url.into());
        self
    }

    /// Set the per-request timeout in seconds.
    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the job polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = Some(poll_interval_ms);
        self
    }

    /// Set the maximum time to wait for one job in seconds.
    pub fn job_timeout_secs(mut self, job_timeout_secs: u64) -> Self {
        self.job_timeout_secs = Some(job_timeout_secs);
        self
    }

    /// Set the job location.
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> BigQueryConfig {
        BigQueryConfig {
            base_url: self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            upload_url: self.upload_url.unwrap_or_else(|| DEFAULT_UPLOAD_URL.to_owned()),
            timeout_secs: self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            job_timeout_secs: self.job_timeout_secs.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            location: self.location,
        }
    }
}

/// BigQuery implementation of [`Warehouse`].
///
/// Statements and load jobs run in (and are billed to) the client project,
/// which may differ from the destination table's project.
///
/// # Example
///
/// ```rust,ignore
/// use bq_csv_loader::auth::CredentialSource;
/// use bq_csv_loader::warehouse::{BigQueryClient, BigQueryConfig};
///
/// // Ambient credentials, default endpoints
/// let client = BigQueryClient::new("my-project", &CredentialSource::Ambient)?;
///
/// // Explicit key file, EU jobs
/// let config = BigQueryConfig::builder().location("EU").build();
/// let client = BigQueryClient::with_config(
///     "my-project",
///     &CredentialSource::File("key.json".into()),
///     config,
/// )?;
/// ```
pub struct BigQueryClient {
    project: String,
    config: BigQueryConfig,
    http: Client,
    tokens: AccessTokenProvider,
}

static_assertions::assert_impl_all!(BigQueryClient: Send, Sync);

impl BigQueryClient {
    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be loaded or the HTTP client
    /// cannot be created.
    pub fn new(project: impl Into<String>, credentials: &CredentialSource) -> Result<Self> {
        Self::with_config(project, credentials, BigQueryConfig::default())
    }

    /// Create a client with custom configuration.
    pub fn with_config(
        project: impl Into<String>,
        credentials: &CredentialSource,
        config: BigQueryConfig,
    ) -> Result<Self> {
        let credentials = Credentials::load(credentials)?;
        Self::from_credentials(project, credentials, config)
    }

    /// Create a client from already-loaded credentials.
    pub fn from_credentials(
        project: impl Into<String>,
        credentials: Credentials,
        config: BigQueryConfig,
    ) -> Result<Self> {
        let project = project.into();
        if project.is_empty() {
            return Err(LoaderError::ClientConstruction(
                "project id must not be empty".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                LoaderError::ClientConstruction(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            project,
            config,
            tokens: AccessTokenProvider::new(credentials, http.clone()),
            http,
        })
    }

    /// Project that runs (and pays for) jobs.
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.tokens.token()?;
        request
            .bearer_auth(token)
            .send()
            .map_err(|e| LoaderError::WarehouseApi(format!("request failed: {}", e)))
    }

    fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json::<T>()
            .map_err(|e| LoaderError::WarehouseApi(format!("malformed API response: {}", e)))
    }

    fn table_url(&self, locator: &TableLocator) -> Result<Url> {
        endpoint(
            &self.config.base_url,
            &[
                "projects",
                locator.project(),
                "datasets",
                locator.dataset(),
                "tables",
                locator.table(),
            ],
        )
    }

    fn get_table(&self, locator: &TableLocator) -> Result<Option<TableResource>> {
        let response = self.send(self.http.get(self.table_url(locator)?))?;
        if response.status().is_success() {
            return Self::read_json(response).map(Some);
        }

        let failure = ApiFailure::from_response(response);
        if failure.is_not_found() {
            Ok(None)
        } else {
            Err(failure.into_api_error())
        }
    }

    fn job_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.config.job_timeout_secs)
    }

    fn wait_for_query(&self, mut response: QueryResponse) -> Result<()> {
        let deadline = self.job_deadline();

        while !response.job_complete {
            let reference = response.job_reference.ok_or_else(|| {
                LoaderError::WarehouseApi("incomplete query without a job reference".to_string())
            })?;
            if Instant::now() > deadline {
                return Err(LoaderError::WarehouseApi(format!(
                    "timed out waiting for query job {}",
                    reference.job_id
                )));
            }

            debug!("Waiting for query job {}", reference.job_id);
            let url = endpoint(
                &self.config.base_url,
                &["projects", &reference.project_id, "queries", &reference.job_id],
            )?;
            let mut request = self.http.get(url).query(&[
                ("timeoutMs", QUERY_WAIT_MS.to_string()),
                ("maxResults", "0".to_string()),
            ]);
            if let Some(location) = &reference.location {
                request = request.query(&[("location", location)]);
            }

            let raw = self.send(request)?;
            if !raw.status().is_success() {
                return Err(ApiFailure::from_response(raw).into_statement_error());
            }
            response = Self::read_json(raw)?;
        }

        Ok(())
    }

    fn wait_for_job(&self, mut job: Job) -> Result<Job> {
        let deadline = self.job_deadline();

        loop {
            if job.status.as_ref().is_some_and(|s| s.state == "DONE") {
                return Ok(job);
            }

            let reference = job.job_reference.clone().ok_or_else(|| {
                LoaderError::WarehouseApi("job response without a job reference".to_string())
            })?;
            if Instant::now() > deadline {
                return Err(LoaderError::WarehouseApi(format!(
                    "timed out waiting for job {}",
                    reference.job_id
                )));
            }

            thread::sleep(Duration::from_millis(self.config.poll_interval_ms));

            let url = endpoint(
                &self.config.base_url,
                &["projects", &reference.project_id, "jobs", &reference.job_id],
            )?;
            let mut request = self.http.get(url);
            if let Some(location) = &reference.location {
                request = request.query(&[("location", location)]);
            }

            let raw = self.send(request)?;
            if !raw.status().is_success() {
                return Err(ApiFailure::from_response(raw).into_api_error());
            }
            job = Self::read_json(raw)?;
        }
    }
}

impl Warehouse for BigQueryClient {
    fn table_exists(&self, locator: &TableLocator) -> Result<bool> {
        Ok(self.get_table(locator)?.is_some())
    }

    fn table_columns(&self, locator: &TableLocator) -> Result<Vec<String>> {
        let table = self
            .get_table(locator)?
            .ok_or_else(|| LoaderError::TableNotFound(locator.to_string()))?;

        Ok(table
            .schema
            .map(|schema| schema.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default())
    }

    fn execute_statement(&self, sql: &str) -> Result<()> {
        let url = endpoint(&self.config.base_url, &["projects", &self.project, "queries"])?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: QUERY_WAIT_MS,
            location: self.config.location.as_deref(),
        };

        debug!("Submitting statement to project {}", self.project);
        let raw = self.send(self.http.post(url).json(&request))?;
        if !raw.status().is_success() {
            return Err(ApiFailure::from_response(raw).into_statement_error());
        }

        self.wait_for_query(Self::read_json(raw)?)
    }

    fn load_rows(&self, locator: &TableLocator, rows: &NormalizedFrame) -> Result<u64> {
        let mut media = Vec::new();
        rows.write_json_lines(&mut media)?;

        let metadata = load_job_resource(locator, self.config.location.as_deref());
        let (boundary, body) = multipart_related(&metadata, &media);

        let mut url = endpoint(&self.config.upload_url, &["projects", &self.project, "jobs"])?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");

        info!(
            "Uploading {} rows ({} bytes) to {}",
            rows.height(),
            media.len(),
            locator
        );
        let request = self
            .http
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);

        let raw = self.send(request)?;
        if !raw.status().is_success() {
            return Err(ApiFailure::from_response(raw).into_statement_error());
        }

        let job = self.wait_for_job(Self::read_json(raw)?)?;

        if let Some(error) = job.status.and_then(|s| s.error_result) {
            return Err(job_error(error));
        }

        let reported = job
            .statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .as_ref()
            .and_then(parse_count);

        Ok(reported.unwrap_or_else(|| {
            warn!("Load job did not report outputRows, using submitted row count");
            rows.height() as u64
        }))
    }

    fn name(&self) -> &str {
        "BigQuery"
    }
}

// ============================================================================
// Tests
// ============================================================================
