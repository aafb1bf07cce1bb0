//! HTTP transport for the marketplace API
//!
//! Implements [`MarketplaceApi`] over reqwest. Listings are fetched with
//! `GET {base}/{resource}?page=&per_page=` and writes go to
//! `POST {base}/{resource}/batch`. Every request carries the account's bearer
//! token and, when configured, its seller id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::classify::{parse_retry_after, ErrorClassifier};
use super::gateway::MarketplaceApi;
use crate::config::ApiConfig;
use crate::error::ClassifiedError;
use crate::models::{AccountCredentials, BatchRequest, BatchResponse, PageRequest, PageResponse};

/// Seller id header
pub const SELLER_ID_HEADER: &str = "X-Seller-Id";

/// Longest error body excerpt kept in a classified error
const MAX_ERROR_BODY: usize = 512;

/// reqwest-backed marketplace client
#[derive(Debug, Clone)]
pub struct HttpMarketplaceClient {
    client: Client,
    base_url: String,
    classifier: ErrorClassifier,
}

impl HttpMarketplaceClient {
    /// Create a client from configuration
    pub fn new(config: &ApiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("marketplace-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create a client with a custom reqwest Client
    pub fn with_client(client: Client, config: &ApiConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            classifier: ErrorClassifier::new(config.default_retry_after_secs)
                .with_max_retry_after(config.max_retry_after_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder, credentials: &AccountCredentials) -> RequestBuilder {
        let builder = builder.bearer_auth(&credentials.api_key);
        match &credentials.seller_id {
            Some(seller_id) => builder.header(SELLER_ID_HEADER, seller_id),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClassifiedError> {
        builder
            .send()
            .await
            .map_err(|e| self.classifier.classify_transport(&e))
    }

    async fn read_body(&self, response: Response) -> Result<String, ClassifiedError> {
        response
            .text()
            .await
            .map_err(|e| self.classifier.classify_transport(&e))
    }

    /// Classify a failed response from its status, headers and body
    fn classify_response(&self, status: StatusCode, headers: &HeaderMap, body: &str) -> ClassifiedError {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let retry_after = parsed
            .as_ref()
            .and_then(body_retry_after)
            .or_else(|| {
                headers
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after)
            });
        let message = parsed
            .as_ref()
            .and_then(body_message)
            .unwrap_or_else(|| truncate(body, MAX_ERROR_BODY));

        self.classifier
            .classify_status(status.as_u16(), retry_after, message)
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, ClassifiedError> {
        let url = self.url(request.operation.resource());
        let mut query: Vec<(String, String)> = vec![
            ("page".to_string(), request.page.to_string()),
            ("per_page".to_string(), request.items_per_page.to_string()),
        ];
        query.extend(
            request
                .filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        debug!(url = %url, page = request.page, "Sending page request");
        let builder = self.authorize(self.client.get(&url).query(&query), &request.credentials);
        let response = self.send(builder).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = self.read_body(response).await?;

        if !status.is_success() {
            let err = self.classify_response(status, &headers, &body);
            warn!(url = %url, status = status.as_u16(), kind = %err.kind, "Page request failed");
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| {
            self.classifier.classify_status(
                status.as_u16(),
                None,
                format!("invalid page body: {}", e),
            )
        })
    }

    async fn submit_batch(
        &self,
        request: &BatchRequest,
    ) -> Result<BatchResponse, ClassifiedError> {
        let url = self.url(request.operation.path());
        debug!(url = %url, items = request.items.len(), "Sending batch request");

        let builder = self.authorize(
            self.client.post(&url).json(&json!({ "items": request.items })),
            &request.credentials,
        );
        let response = self.send(builder).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = self.read_body(response).await?;

        // Throttling, credential and server failures follow the retry taxonomy
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status.is_server_error()
        {
            let err = self.classify_response(status, &headers, &body);
            warn!(url = %url, status = status.as_u16(), kind = %err.kind, "Batch request failed");
            return Err(err);
        }

        // Otherwise the payload indicator is authoritative over the status
        match serde_json::from_str::<BatchResponse>(&body) {
            Ok(parsed) if parsed.is_error.is_some() => Ok(parsed),
            Ok(parsed) if status.is_success() => Ok(parsed),
            Err(_) if status.is_success() => Ok(BatchResponse::default()),
            _ => Err(self.classify_response(status, &headers, &body)),
        }
    }
}

fn body_retry_after(body: &Value) -> Option<f64> {
    ["retry_after", "retryAfter"]
        .iter()
        .find_map(|key| body.get(*key))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_retry_after(s),
            _ => None,
        })
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

fn body_message(body: &Value) -> Option<String> {
    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Some(error.to_string());
    }
    let messages = body.get("messages")?.as_array()?;
    let joined: Vec<String> = messages
        .iter()
        .filter_map(|m| match m {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("message").and_then(Value::as_str).map(String::from),
            _ => None,
        })
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("; "))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{OperationType, WriteOperation};
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpMarketplaceClient {
        HttpMarketplaceClient::new(&ApiConfig {
            base_url: format!("{}/v1/", server.uri()),
            request_timeout_secs: 5,
            default_retry_after_secs: 60.0,
            max_retry_after_secs: 300.0,
            acquire_timeout_secs: None,
        })
        .unwrap()
    }

    fn page_request(operation: OperationType, page: u32) -> PageRequest {
        PageRequest {
            credentials: AccountCredentials::new("secret").with_seller_id("42"),
            operation,
            page,
            items_per_page: 2,
            filters: BTreeMap::from([("status".to_string(), "active".to_string())]),
        }
    }

    // Test 1: Page request carries pagination, filters and credentials
    #[tokio::test]
    async fn test_fetch_page_request_shape() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/offers"))
            .and(query_param("page", "3"))
            .and(query_param("per_page", "2"))
            .and(query_param("status", "active"))
            .and(header("Authorization", "Bearer secret"))
            .and(header(SELLER_ID_HEADER, "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": "A"}, {"id": "B"}],
                "isError": false,
                "messages": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let page = client(&mock_server)
            .fetch_page(&page_request(OperationType::Offers, 3))
            .await
            .unwrap();

        assert_eq!(page.results.len(), 2);
        assert_eq!(page.is_error, Some(false));
    }

    // Test 2: HTTP 429 uses the Retry-After header
    #[tokio::test]
    async fn test_429_retry_after_header() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .fetch_page(&page_request(OperationType::Orders, 1))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.suggested_delay_secs, Some(120.0));
        assert_eq!(err.http_status, Some(429));
    }

    // Test 3: Body retry_after wins over the header
    #[tokio::test]
    async fn test_429_body_retry_after_preferred() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orders"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "120")
                    .set_body_json(json!({"message": "slow down", "retry_after": 7})),
            )
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .fetch_page(&page_request(OperationType::Orders, 1))
            .await
            .unwrap_err();

        assert_eq!(err.suggested_delay_secs, Some(7.0));
        assert_eq!(err.raw_message, "slow down");
    }

    // Test 4: HTTP 429 without a hint uses the default
    #[tokio::test]
    async fn test_429_uses_default_wait() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .fetch_page(&page_request(OperationType::Orders, 1))
            .await
            .unwrap_err();

        assert_eq!(err.suggested_delay_secs, Some(60.0));
    }

    // Test 5: Error statuses are classified
    #[tokio::test]
    async fn test_error_statuses_classified() {
        let cases = [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (400, ErrorKind::Validation),
            (404, ErrorKind::Business),
            (422, ErrorKind::Business),
            (503, ErrorKind::Network),
        ];

        for (status, kind) in cases {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/v1/offers"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&mock_server)
                .await;

            let err = client(&mock_server)
                .fetch_page(&page_request(OperationType::Offers, 1))
                .await
                .unwrap_err();
            assert_eq!(err.kind, kind, "status {}", status);
        }
    }

    // Test 6: Batch body carries the items
    #[tokio::test]
    async fn test_submit_batch_request_shape() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offers/price-stock/batch"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_json(json!({"items": [{"sku": "A", "price": 9.5}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isError": false,
                "messages": [],
                "results": [{"sku": "A", "ok": true}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let resp = client(&mock_server)
            .submit_batch(&BatchRequest {
                credentials: AccountCredentials::new("secret"),
                operation: WriteOperation::PriceStockUpdate,
                items: vec![json!({"sku": "A", "price": 9.5})],
            })
            .await
            .unwrap();

        assert_eq!(resp.is_error, Some(false));
        assert_eq!(resp.results.len(), 1);
    }

    // Test 7: Payload isError is authoritative over HTTP status
    #[tokio::test]
    async fn test_batch_payload_indicator_authoritative() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offers/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isError": true,
                "messages": ["invalid sku"]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/orders/batch"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "isError": false,
                "messages": []
            })))
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);
        let offers = client
            .submit_batch(&BatchRequest {
                credentials: AccountCredentials::new("secret"),
                operation: WriteOperation::OfferUpdate,
                items: vec![json!({"sku": "A"})],
            })
            .await
            .unwrap();
        assert_eq!(offers.is_error, Some(true));
        assert_eq!(offers.joined_messages(), "invalid sku");

        let orders = client
            .submit_batch(&BatchRequest {
                credentials: AccountCredentials::new("secret"),
                operation: WriteOperation::OrderStatusUpdate,
                items: vec![json!({"id": "O-1", "status": "shipped"})],
            })
            .await
            .unwrap();
        assert_eq!(orders.is_error, Some(false));
    }

    // Test 8: Batch 5xx without indicator is a network error
    #[tokio::test]
    async fn test_batch_server_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offers/batch"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .submit_batch(&BatchRequest {
                credentials: AccountCredentials::new("secret"),
                operation: WriteOperation::OfferUpdate,
                items: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.raw_message, "bad gateway");
    }

    // Test 9: Unparseable page body is not retryable
    #[tokio::test]
    async fn test_invalid_page_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/offers"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .fetch_page(&page_request(OperationType::Offers, 1))
            .await
            .unwrap_err();
        assert!(err.raw_message.starts_with("invalid page body"));
        assert!(!err.retryable);
    }

    // Test 10: Long bodies are truncated on char boundaries
    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "é...");
    }
}
