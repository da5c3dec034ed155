//! Remote record sources
//!
//! [`RecordSource`] is the seam between the pager and the remote API. The
//! HTTP implementation speaks the OData-style contract: `GET {base}/{table}`
//! with paging query parameters, answered by `{"value": [...]}`.

use crate::config::ApiSettings;
use crate::error::{FetchError, Result, TableSyncError};
use crate::ingest::TableSpec;
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;

/// User agent sent with every API request
pub const DEFAULT_USER_AGENT: &str = concat!("tablesync/", env!("CARGO_PKG_VERSION"));

/// One page request
#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    /// `skip`/`top` window
    Offset {
        /// Records to skip
        skip: u64,
        /// Records to return
        top: usize,
    },
    /// Records with `key` strictly greater than `after`, ascending
    Cursor {
        /// Primary key column
        key: String,
        /// Last key seen, `None` for the first page
        after: Option<Value>,
        /// Records to return
        limit: usize,
    },
}

impl PageRequest {
    /// Query parameters for this request
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match self {
            Self::Offset { skip, top } => vec![
                ("$skip".to_string(), skip.to_string()),
                ("$top".to_string(), top.to_string()),
            ],
            Self::Cursor { key, after, limit } => {
                let mut pairs = vec![
                    ("$top".to_string(), limit.to_string()),
                    ("$orderby".to_string(), format!("{} asc", key)),
                ];
                if let Some(value) = after {
                    pairs.push((
                        "$filter".to_string(),
                        format!("{} gt {}", key, filter_literal(value)),
                    ));
                }
                pairs
            }
        }
    }
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset { skip, top } => write!(f, "skip={} top={}", skip, top),
            Self::Cursor { key, after: None, limit } => write!(f, "{} first {}", key, limit),
            Self::Cursor { key, after: Some(v), limit } => {
                write!(f, "{} > {} top {}", key, v, limit)
            }
        }
    }
}

/// Render a key value as a filter literal; strings are single-quoted with
/// embedded quotes doubled.
fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Source of raw record pages
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch one page of records for `table`
    async fn fetch_page(
        &self,
        table: &TableSpec,
        request: &PageRequest,
    ) -> std::result::Result<Vec<Value>, FetchError>;
}

/// HTTP implementation of [`RecordSource`]
#[derive(Debug, Clone)]
pub struct HttpRecordSource {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpRecordSource {
    /// Build a source from API settings
    pub fn new(api: &ApiSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(api.request_timeout())
            .build()
            .map_err(|e| TableSyncError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            bearer_token: api.bearer_token.clone(),
        })
    }

    /// URL of a table's collection endpoint
    pub fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch_page(
        &self,
        table: &TableSpec,
        request: &PageRequest,
    ) -> std::result::Result<Vec<Value>, FetchError> {
        let url = self.table_url(table.name());
        let mut builder = self
            .client
            .get(&url)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .query(&request.query_pairs());
        if let Some(ref token) = self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::transient(&url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = status.canonical_reason().unwrap_or("error").to_string();
            return Err(classify_status(&url, status, message));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transient(&url, format!("body read failed: {}", e)))?;
        parse_page_body(&url, &body)
    }
}

fn classify_status(url: &str, status: StatusCode, message: String) -> FetchError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchError::transient(url, format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        FetchError::Rejected {
            url: url.to_string(),
            status: status.as_u16(),
            message,
        }
    }
}

/// Extract the records of a `{"value": [...]}` body.
///
/// A missing or null `value` is end-of-data and yields an empty page.
pub fn parse_page_body(url: &str, body: &str) -> std::result::Result<Vec<Value>, FetchError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::malformed(url, format!("invalid JSON: {}", e)))?;

    let object = match parsed {
        Value::Object(map) => map,
        other => {
            return Err(FetchError::malformed(
                url,
                format!("expected a JSON object, got {}", json_kind(&other)),
            ))
        }
    };

    match object.get("value") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            if let Some(bad) = items.iter().find(|item| !item.is_object()) {
                return Err(FetchError::malformed(
                    url,
                    format!("record is {} rather than an object", json_kind(bad)),
                ));
            }
            Ok(items.clone())
        }
        Some(other) => Err(FetchError::malformed(
            url,
            format!("'value' is {} rather than an array", json_kind(other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offset_query() {
        let request = PageRequest::Offset { skip: 2000, top: 1000 };
        assert_eq!(
            request.query_pairs(),
            vec![
                ("$skip".to_string(), "2000".to_string()),
                ("$top".to_string(), "1000".to_string())
            ]
        );
    }

    #[test]
    fn test_cursor_query() {
        let first = PageRequest::Cursor {
            key: "OrderId".into(),
            after: None,
            limit: 500,
        };
        assert_eq!(first.query_pairs().len(), 2);

        let next = PageRequest::Cursor {
            key: "Code".into(),
            after: Some(json!("O'Brien")),
            limit: 500,
        };
        let pairs = next.query_pairs();
        assert!(pairs.contains(&("$filter".to_string(), "Code gt 'O''Brien'".to_string())));
        assert!(pairs.contains(&("$orderby".to_string(), "Code asc".to_string())));

        let numeric = PageRequest::Cursor {
            key: "OrderId".into(),
            after: Some(json!(1234)),
            limit: 10,
        };
        assert!(numeric
            .query_pairs()
            .contains(&("$filter".to_string(), "OrderId gt 1234".to_string())));
    }

    #[test]
    fn test_parse_page_body() {
        let records = parse_page_body("u", r#"{"value": [{"id": 1}, {"id": 2}]}"#).unwrap();
        assert_eq!(records.len(), 2);

        assert!(parse_page_body("u", r#"{"value": []}"#).unwrap().is_empty());
        assert!(parse_page_body("u", r#"{"@odata.context": "x"}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_page_body_malformed() {
        assert!(parse_page_body("u", "<html>gateway</html>").unwrap_err().is_malformed());
        assert!(parse_page_body("u", "[1, 2]").unwrap_err().is_malformed());
        assert!(parse_page_body("u", r#"{"value": {"id": 1}}"#).unwrap_err().is_malformed());
        assert!(parse_page_body("u", r#"{"value": [1]}"#).unwrap_err().is_malformed());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status("u", StatusCode::BAD_GATEWAY, "x".into()).is_retryable());
        assert!(classify_status("u", StatusCode::TOO_MANY_REQUESTS, "x".into()).is_retryable());
        assert!(!classify_status("u", StatusCode::NOT_FOUND, "x".into()).is_retryable());
    }

    #[test]
    fn test_table_url() {
        let api = ApiSettings {
            base_url: "https://api.example.com/odata/".into(),
            ..Default::default()
        };
        let source = HttpRecordSource::new(&api).unwrap();
        assert_eq!(source.table_url("orders"), "https://api.example.com/odata/orders");
    }
}
