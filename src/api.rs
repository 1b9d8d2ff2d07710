//! Admin dashboard API client.
//!
//! [`RemoteApi`] is the boundary the sync engine and the facade talk to;
//! [`AdminApiClient`] implements it over HTTP with `reqwest`. Every request
//! carries a bounded timeout so a hung server cannot hold a sync cycle
//! forever.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::credentials::ServerEndpoint;
use crate::error::ApiError;
use crate::models::{CachedProduct, SubmitReceipt, TransactionSubmission};

const CATALOG_PATH: &str = "/api/inventory/products";
const SEARCH_PATH: &str = "/api/pos/retail/search";
const LOOKUP_PATH: &str = "/api/pos/retail/lookup";
const SUBMIT_PATH: &str = "/api/pos/transaction";
const HEALTH_PATH: &str = "/api/health";

/// Server operations the offline layer depends on.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Full product list for the catalog mirror.
    async fn fetch_catalog(&self) -> Result<Vec<CachedProduct>, ApiError>;

    async fn search_products(&self, query: &str) -> Result<Vec<CachedProduct>, ApiError>;

    /// `Ok(None)` when the server does not know the code.
    async fn lookup_barcode(&self, code: &str) -> Result<Option<CachedProduct>, ApiError>;

    /// Submit one sale. The server deduplicates on `offline_id`.
    async fn submit_transaction(
        &self,
        submission: &TransactionSubmission,
    ) -> Result<SubmitReceipt, ApiError>;

    /// Lightweight reachability check.
    async fn health_check(&self) -> bool;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// API key embedded in a terminal connection string, if `raw` is one.
pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|u| normalize_admin_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(url.to_string());
    }
    if err.is_connect() {
        return ApiError::Network(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_builder() {
        return ApiError::Client(format!("Invalid admin dashboard URL: {url}"));
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Transaction already recorded".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Pull the most useful message out of an error body.
fn status_error(status: StatusCode, body_text: &str) -> ApiError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .or_else(|| json.get("details"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| status_message(status));
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Accept either a bare array or an object wrapping one.
fn product_list(body: Value) -> Result<Vec<CachedProduct>, ApiError> {
    let array = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match ["products", "items", "data"]
            .iter()
            .find_map(|k| obj.remove(*k))
        {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ApiError::InvalidResponse(
                    "expected a product array".to_string(),
                ))
            }
        },
        Value::Null => Vec::new(),
        _ => {
            return Err(ApiError::InvalidResponse(
                "expected a product array".to_string(),
            ))
        }
    };

    let mut products = Vec::with_capacity(array.len());
    for item in array {
        match serde_json::from_value::<CachedProduct>(item) {
            Ok(p) => products.push(p),
            Err(e) => warn!(error = %e, "Skipping malformed catalog item"),
        }
    }
    Ok(products)
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for one terminal.
pub struct AdminApiClient {
    client: Client,
    health_client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
}

impl AdminApiClient {
    pub fn new(endpoint: &ServerEndpoint, config: &SyncConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        let health_client = Client::builder()
            .timeout(config.connectivity_timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        let api_key = extract_api_key_from_connection_string(&endpoint.api_key)
            .unwrap_or_else(|| endpoint.api_key.trim().to_string());
        let terminal_id = extract_terminal_id_from_connection_string(&endpoint.api_key)
            .unwrap_or_else(|| endpoint.terminal_id.clone());

        Ok(Self {
            client,
            health_client,
            base_url: normalize_admin_url(&endpoint.base_url),
            api_key,
            terminal_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request and decode the JSON body.
    ///
    /// `path` includes the leading slash. Returns `Value::Null` for empty
    /// bodies (e.g. 204).
    async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Option<&TransactionSubmission>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{path}", self.base_url);
        let started = Instant::now();

        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json");
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        debug!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "admin request finished"
        );

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for AdminApiClient {
    async fn fetch_catalog(&self) -> Result<Vec<CachedProduct>, ApiError> {
        let body = self.fetch(Method::GET, CATALOG_PATH, None, None).await?;
        let products = product_list(body)?;
        info!(count = products.len(), "Catalog downloaded");
        Ok(products)
    }

    async fn search_products(&self, query: &str) -> Result<Vec<CachedProduct>, ApiError> {
        let path = format!("{SEARCH_PATH}?q={}", percent_encode(query));
        let body = self.fetch(Method::GET, &path, None, None).await?;
        product_list(body)
    }

    async fn lookup_barcode(&self, code: &str) -> Result<Option<CachedProduct>, ApiError> {
        let path = format!("{LOOKUP_PATH}?code={}", percent_encode(code));
        let body = match self.fetch(Method::GET, &path, None, None).await {
            Ok(body) => body,
            Err(ApiError::Status { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let item = body.get("product").cloned().unwrap_or(body);
        if item.is_null() {
            return Ok(None);
        }
        serde_json::from_value(item)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn submit_transaction(
        &self,
        submission: &TransactionSubmission,
    ) -> Result<SubmitReceipt, ApiError> {
        let result = self
            .fetch(
                Method::POST,
                SUBMIT_PATH,
                Some(submission),
                Some(&submission.offline_id),
            )
            .await;
        match result {
            Ok(body) => Ok(SubmitReceipt::from_response(&body)),
            // The server already holds this offline id: same logical effect.
            Err(ApiError::Status { status: 409, .. }) => Ok(SubmitReceipt {
                duplicate: true,
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        match self
            .health_client
            .head(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_offline_id, PendingTransaction};
    use crate::testing;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[test]
    fn test_normalize_admin_url() {
        assert_eq!(normalize_admin_url("admin.thesmall.app/"), "https://admin.thesmall.app");
        assert_eq!(normalize_admin_url("localhost:3000/api/"), "http://localhost:3000");
        assert_eq!(
            normalize_admin_url(" https://pos.example.com/api "),
            "https://pos.example.com"
        );
    }

    #[test]
    fn test_connection_string_decoding() {
        let json = r#"{"key":"k-123","url":"pos.example.com/api","tid":"term-9"}"#;
        let encoded = BASE64_STANDARD.encode(json);
        assert_eq!(
            extract_api_key_from_connection_string(&encoded).as_deref(),
            Some("k-123")
        );
        assert_eq!(
            extract_admin_url_from_connection_string(&encoded).as_deref(),
            Some("https://pos.example.com")
        );
        assert_eq!(
            extract_terminal_id_from_connection_string(json).as_deref(),
            Some("term-9")
        );
        assert!(extract_api_key_from_connection_string("plain-api-key").is_none());
    }

    #[test]
    fn test_product_list_accepts_wrapped_and_bare_arrays() {
        let bare = serde_json::json!([{ "id": "1", "name": "Chips", "price": 1.5 }]);
        assert_eq!(product_list(bare).unwrap().len(), 1);

        let wrapped = serde_json::json!({
            "products": [
                { "id": "1", "name": "Chips", "price": 1.5 },
                { "id": "2", "name": "Broken" }
            ]
        });
        let products = product_list(wrapped).unwrap();
        assert_eq!(products.len(), 1, "malformed items are skipped");

        assert!(product_list(serde_json::json!({ "ok": true })).is_err());
        assert!(product_list(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_status_error_prefers_server_message() {
        let err = status_error(StatusCode::BAD_REQUEST, r#"{"error":"Invalid items"}"#);
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.to_string(), "Invalid items (HTTP 400)");

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(err.to_string(), "Admin dashboard server error (HTTP 503)");
    }

    #[test]
    fn test_percent_encode_query() {
        assert_eq!(percent_encode("cola 2L&x"), "cola%202L%26x");
    }

    // -----------------------------------------------------------------------
    // Over the wire
    // -----------------------------------------------------------------------

    /// Serve one canned response on a local port. The handle yields the raw
    /// request text (headers and body).
    async fn respond_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (url, handle)
    }

    fn client_for(url: &str) -> AdminApiClient {
        let endpoint = ServerEndpoint::new(url, "test-key", "term-1");
        AdminApiClient::new(&endpoint, &SyncConfig::default()).unwrap()
    }

    fn submission() -> TransactionSubmission {
        let now = Utc::now();
        let sale = testing::cash_sale(vec![testing::line("p-1", 2, 1.5)]);
        let tx = PendingTransaction::from_sale(new_offline_id(now), sale, now);
        TransactionSubmission::from_pending(&tx, &[])
    }

    #[tokio::test]
    async fn test_conflict_status_is_a_duplicate_receipt() {
        let (url, request) = respond_once("409 Conflict", r#"{"error":"duplicate"}"#).await;
        let client = client_for(&url);
        assert_eq!(client.base_url(), url);
        let submission = submission();

        let receipt = client.submit_transaction(&submission).await.unwrap();

        assert!(receipt.duplicate);
        assert!(receipt.server_id.is_none());
        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with(&format!("post {SUBMIT_PATH} ")));
        assert!(request.contains(&format!("idempotency-key: {}", submission.offline_id)));
        assert!(request.contains("x-pos-api-key: test-key"));
        assert!(request.contains("x-terminal-id: term-1"));
        assert!(request.contains(&format!("\"offlineid\":\"{}\"", submission.offline_id)));
    }

    #[tokio::test]
    async fn test_accepted_submission_reads_server_receipt() {
        let (url, request) =
            respond_once("200 OK", r#"{"id":"srv-1","receiptNumber":"R-1"}"#).await;
        let receipt = client_for(&url)
            .submit_transaction(&submission())
            .await
            .unwrap();

        assert!(!receipt.duplicate);
        assert_eq!(receipt.server_id.as_deref(), Some("srv-1"));
        assert_eq!(receipt.receipt_number.as_deref(), Some("R-1"));
        request.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_surfaces_status() {
        let (url, request) = respond_once("503 Service Unavailable", r#"{"error":"down"}"#).await;
        let err = client_for(&url)
            .submit_transaction(&submission())
            .await
            .unwrap_err();

        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        request.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_barcode_is_none() {
        let (url, request) = respond_once("404 Not Found", r#"{"error":"not found"}"#).await;
        let found = client_for(&url).lookup_barcode("400 123").await.unwrap();

        assert!(found.is_none());
        let request = request.await.unwrap();
        assert!(request.starts_with(&format!("GET {LOOKUP_PATH}?code=400%20123 ")));
    }

    #[tokio::test]
    async fn test_catalog_download_over_http() {
        let (url, request) = respond_once(
            "200 OK",
            r#"{"products":[{"id":"p-1","name":"Chips","price":1.5},{"id":"p-2","name":"Cola","price":2.0}]}"#,
        )
        .await;
        let products = client_for(&url).fetch_catalog().await.unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[1].name, "Cola");
        let request = request.await.unwrap();
        assert!(request.starts_with(&format!("GET {CATALOG_PATH} ")));
        assert!(!request.to_lowercase().contains("idempotency-key"));
    }
}
