//! Google Sheets v4 REST adapter for the [`SpreadsheetApi`] port
//!
//! The client maps the value operations the gateway understands (`read`,
//! `write`, `append`, `clear`, `batch_update`) and raw request descriptors
//! onto HTTP calls, and HTTP failures onto [`UpstreamError`] kinds. It does
//! not retry: retries, breaker accounting and health tracking happen in the
//! execution pipeline around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as ReqwestClient, Method, Response};
use serde_json::{json, Value};
use sheetgate_core::{SpreadsheetApi, UpstreamError, UpstreamErrorKind};
use sheetgate_domain::{Operation, StateTarget};
use tracing::{debug, info, warn};
use url::Url;

use super::auth::AccessTokenProvider;
use crate::errors::IntoUpstreamError;

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com";
const VALUE_INPUT_OPTION: &str = "USER_ENTERED";

/// A resolved HTTP call
#[derive(Debug, Clone, PartialEq)]
struct RestCall {
    method: Method,
    /// Path segments below the base URL; each is percent-encoded
    segments: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RestCall {
    fn new(method: Method, segments: Vec<String>) -> Self {
        Self { method, segments, query: Vec::new(), body: None }
    }

    fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

fn invalid(message: impl Into<String>) -> UpstreamError {
    UpstreamError::new(UpstreamErrorKind::InvalidRequest, message)
}

fn values_segments(spreadsheet_id: &str, range: &str, suffix: &str) -> Vec<String> {
    vec![
        "v4".to_string(),
        "spreadsheets".to_string(),
        spreadsheet_id.to_string(),
        "values".to_string(),
        format!("{range}{suffix}"),
    ]
}

/// Translate an operation into its REST call
fn plan(operation: &Operation) -> Result<RestCall, UpstreamError> {
    let params = operation.parameters();
    if let Some(raw) = params.get("request") {
        return plan_raw(raw);
    }

    let spreadsheet_id = operation
        .spreadsheet_id()
        .ok_or_else(|| invalid(format!("{} requires spreadsheetId", operation.qualified_name())))?;
    let values = || params.get("values").cloned().unwrap_or_else(|| json!([]));
    let range = || {
        operation
            .range()
            .ok_or_else(|| invalid(format!("{} requires range", operation.qualified_name())))
    };

    let call = match (operation.tool(), operation.action()) {
        ("sheets_data", "read") => {
            RestCall::new(Method::GET, values_segments(spreadsheet_id, range()?, ""))
        }
        ("sheets_data", "write") => {
            let range = range()?;
            RestCall::new(Method::PUT, values_segments(spreadsheet_id, range, ""))
                .query("valueInputOption", VALUE_INPUT_OPTION)
                .body(json!({ "range": range, "majorDimension": "ROWS", "values": values() }))
        }
        ("sheets_data", "append") => {
            let range = range()?;
            RestCall::new(Method::POST, values_segments(spreadsheet_id, range, ":append"))
                .query("valueInputOption", VALUE_INPUT_OPTION)
                .query("insertDataOption", "INSERT_ROWS")
                .body(json!({ "range": range, "majorDimension": "ROWS", "values": values() }))
        }
        ("sheets_data", "clear") => {
            RestCall::new(Method::POST, values_segments(spreadsheet_id, range()?, ":clear"))
                .body(json!({}))
        }
        (_, action) if action == "batch_update" || params.get("requests").is_some() => {
            let requests = params.get("requests").cloned().ok_or_else(|| {
                invalid(format!("{} requires a requests array", operation.qualified_name()))
            })?;
            RestCall::new(
                Method::POST,
                vec![
                    "v4".to_string(),
                    "spreadsheets".to_string(),
                    format!("{spreadsheet_id}:batchUpdate"),
                ],
            )
            .body(json!({ "requests": requests }))
        }
        _ => {
            return Err(invalid(format!(
                "{} has no REST mapping; supply a request descriptor",
                operation.qualified_name()
            )))
        }
    };
    Ok(call)
}

/// `{"method": "POST", "path": "v4/spreadsheets/..", "query": {..}, "body": ..}`
fn plan_raw(raw: &Value) -> Result<RestCall, UpstreamError> {
    let method = raw
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .parse::<Method>()
        .map_err(|err| invalid(format!("invalid request method: {err}")))?;
    let path = raw
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("request descriptor requires path"))?;
    let segments: Vec<String> =
        path.split('/').filter(|segment| !segment.is_empty()).map(str::to_string).collect();
    if segments.iter().any(|segment| segment == "..") {
        return Err(invalid("request path must not contain '..'"));
    }

    let mut call = RestCall::new(method, segments);
    if let Some(query) = raw.get("query").and_then(Value::as_object) {
        for (key, value) in query {
            let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            call = call.query(key, &value);
        }
    }
    if let Some(body) = raw.get("body") {
        call = call.body(body.clone());
    }
    Ok(call)
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Google error bodies look like `{"error": {"message": ..}}`
fn error_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value.pointer("/error/message").and_then(Value::as_str).map(str::to_string)
        })
        .unwrap_or_else(|| {
            let body = body.trim();
            if body.is_empty() { fallback.to_string() } else { body.to_string() }
        })
}

/// HTTP adapter for the Google Sheets API.
pub struct SheetsHttpClient {
    client: RwLock<ReqwestClient>,
    settings: ClientSettings,
    base_url: Url,
    tokens: Arc<dyn AccessTokenProvider>,
}

#[derive(Debug, Clone)]
struct ClientSettings {
    timeout: Duration,
    user_agent: Option<String>,
}

impl ClientSettings {
    fn build(&self) -> Result<ReqwestClient, UpstreamError> {
        let mut builder = ReqwestClient::builder().timeout(self.timeout).no_proxy();
        if let Some(agent) = &self.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        builder.build().map_err(IntoUpstreamError::into_upstream_error)
    }
}

impl SheetsHttpClient {
    pub fn builder(tokens: Arc<dyn AccessTokenProvider>) -> SheetsHttpClientBuilder {
        SheetsHttpClientBuilder::new(tokens)
    }

    fn url(&self, call: &RestCall) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(call.segments.iter());
        if !call.query.is_empty() {
            url.query_pairs_mut().extend_pairs(call.query.iter());
        }
        Ok(url)
    }

    async fn send(&self, call: RestCall) -> Result<Value, UpstreamError> {
        let url = self.url(&call)?;
        let token = self.tokens.access_token().await?;
        let client = self.client.read().clone();

        let mut request = client.request(call.method.clone(), url.clone()).bearer_auth(token);
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        debug!(method = %call.method, %url, "sending sheets request");

        let response = request.send().await.map_err(IntoUpstreamError::into_upstream_error)?;
        let status = response.status();
        if status.is_success() {
            let body = response.text().await.map_err(IntoUpstreamError::into_upstream_error)?;
            if body.trim().is_empty() {
                return Ok(json!({}));
            }
            return serde_json::from_str(&body).map_err(|err| {
                let message = format!("invalid JSON response: {err}");
                UpstreamError::new(UpstreamErrorKind::Other, message)
            });
        }

        let hint = retry_after(&response);
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body, status.canonical_reason().unwrap_or("request failed"));
        debug!(method = %call.method, %url, status = code, %message, "sheets request failed");

        let mut error = UpstreamError::from_status(code, message);
        if let Some(hint) = hint {
            error = error.with_retry_after(hint);
        }
        if error.kind == UpstreamErrorKind::Unauthenticated {
            self.tokens.invalidate().await;
        }
        Err(error)
    }
}

#[async_trait]
impl SpreadsheetApi for SheetsHttpClient {
    async fn call(&self, operation: &Operation) -> Result<Value, UpstreamError> {
        let call = plan(operation)?;
        self.send(call).await
    }

    async fn read_state(&self, target: &StateTarget) -> Result<Value, UpstreamError> {
        let call =
            RestCall::new(Method::GET, values_segments(&target.spreadsheet_id, &target.range, ""));
        let response = self.send(call).await?;
        Ok(response.get("values").cloned().unwrap_or_else(|| json!([])))
    }

    /// One reqwest client backs every pool; rebuilding it drops all idle
    /// keep-alive connections
    async fn reset_connection(&self, pool: &str) -> Result<(), UpstreamError> {
        let fresh = self.settings.build().inspect_err(|err| {
            warn!(pool, error = %err, "failed to rebuild HTTP client");
        })?;
        *self.client.write() = fresh;
        info!(pool, "HTTP connections recycled");
        Ok(())
    }
}

/// Builder for [`SheetsHttpClient`].
pub struct SheetsHttpClientBuilder {
    tokens: Arc<dyn AccessTokenProvider>,
    base_url: String,
    timeout: Duration,
    user_agent: Option<String>,
}

impl SheetsHttpClientBuilder {
    fn new(tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            tokens,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("sheetgate/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn build(self) -> Result<SheetsHttpClient, UpstreamError> {
        let base_url =
            Url::parse(&self.base_url).map_err(|err| invalid(format!("invalid base URL: {err}")))?;
        let settings = ClientSettings { timeout: self.timeout, user_agent: self.user_agent };
        let client = settings.build()?;
        Ok(SheetsHttpClient {
            client: RwLock::new(client),
            settings,
            base_url,
            tokens: self.tokens,
        })
    }
}
