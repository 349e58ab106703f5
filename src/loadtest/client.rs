//! HTTP client for load testing.
//!
//! [`HttpClient`] issues one GET per call, measures it, and records the
//! built-in request metrics into the run's [`MetricRegistry`]. The network is
//! reached through the [`Transport`] trait: [`ReqwestTransport`] in
//! production, a simulated backend in tests.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::loadtest::error::RequestError;
use crate::loadtest::metrics::{names, MetricKind, MetricRegistry};

/// Status code recorded for requests that never produced an HTTP response.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// Tag keys the client sets on every request sample.
pub const RESERVED_TAGS: [&str; 2] = ["status", "error"];

/// An HTTP response as seen by checks and custom metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status, or [`NO_RESPONSE_STATUS`] when the request errored.
    pub status: u16,
    /// Time from dispatch until the body was fully read.
    pub duration: Duration,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// The sentinel response used to evaluate custom metrics after a
    /// transport error.
    pub fn no_response(duration: Duration) -> Self {
        Self {
            status: NO_RESPONSE_STATUS,
            duration,
            body: Vec::new(),
        }
    }

    /// Body decoded as UTF-8, lossily.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Returns `true` for statuses counted as failed requests: anything
    /// outside `200..=399`, including the no-response sentinel.
    pub fn is_failure(&self) -> bool {
        !(200..=399).contains(&self.status)
    }
}

/// Status and body returned by a [`Transport`], before timing is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// The network seam of the client.
///
/// Implementations perform one GET and return the status and body. Non-2xx
/// statuses are successful transport results.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET request to `url`.
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawResponse, RequestError>;
}

/// [`Transport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps an existing client (connection pool is shared by all VUs).
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawResponse, RequestError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RequestError::classify_reqwest(&e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| RequestError::classify_reqwest(&e))?;
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    /// Tags attached to every metric sample of this request.
    pub tags: BTreeMap<String, String>,
}

/// Measuring HTTP client. Cheap to clone; every VU holds one.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    registry: Arc<MetricRegistry>,
    default_timeout: Duration,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Creates a client recording into `registry`.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<MetricRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            default_timeout,
        }
    }

    /// The registry this client records into.
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Issues a GET and records `http_reqs`, `http_req_duration`,
    /// `http_req_failed` and `data_received`.
    ///
    /// The timeout is measured from dispatch. Metrics are recorded whatever
    /// the outcome; errored requests carry `status:0` and an `error` tag with
    /// the error category.
    pub async fn get(&self, url: &str, options: &RequestOptions) -> Result<Response, RequestError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.transport.get(url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout),
        };
        let duration = start.elapsed();

        let mut tags = options.tags.clone();
        let outcome = match result {
            Ok(raw) => {
                tags.insert("status".to_string(), raw.status.to_string());
                Ok(Response {
                    status: raw.status,
                    duration,
                    body: raw.body,
                })
            },
            Err(err) => {
                tracing::debug!(url, error = %err, "request failed");
                tags.insert("status".to_string(), NO_RESPONSE_STATUS.to_string());
                tags.insert("error".to_string(), err.error_category().to_string());
                Err(err)
            },
        };

        let (failed, received) = match &outcome {
            Ok(response) => (response.is_failure(), response.body.len()),
            Err(_) => (true, 0),
        };
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.emit(names::HTTP_REQS, MetricKind::Counter, 1.0, &tags);
        self.emit(names::HTTP_REQ_DURATION, MetricKind::Trend, duration_ms, &tags);
        self.emit(
            names::HTTP_REQ_FAILED,
            MetricKind::Rate,
            if failed { 1.0 } else { 0.0 },
            &tags,
        );
        self.emit(names::DATA_RECEIVED, MetricKind::Counter, received as f64, &tags);

        outcome
    }

    fn emit(&self, name: &str, kind: MetricKind, value: f64, tags: &BTreeMap<String, String>) {
        if let Err(err) = self.registry.record_tagged(name, kind, value, tags) {
            tracing::warn!(metric = name, error = %err, "dropping request metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::MetricSnapshot;

    struct FixedTransport {
        status: u16,
        body: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn get(&self, _url: &str, _timeout: Duration) -> Result<RawResponse, RequestError> {
            tokio::time::sleep(self.delay).await;
            Ok(RawResponse {
                status: self.status,
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn get(&self, _url: &str, _timeout: Duration) -> Result<RawResponse, RequestError> {
            Err(RequestError::Network {
                message: "connection refused".to_string(),
            })
        }
    }

    fn client(transport: impl Transport + 'static) -> HttpClient {
        HttpClient::new(
            Arc::new(transport),
            Arc::new(MetricRegistry::new()),
            Duration::from_secs(5),
        )
    }

    fn tagged(tag: &str, value: &str) -> RequestOptions {
        RequestOptions {
            timeout: None,
            tags: BTreeMap::from([(tag.to_string(), value.to_string())]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_metrics() {
        let client = client(FixedTransport {
            status: 200,
            body: "hello",
            delay: Duration::from_millis(120),
        });
        let response = client
            .get("http://test.local/", &tagged("endpoint", "homepage"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.duration, Duration::from_millis(120));
        assert_eq!(response.body_text(), "hello");

        let snap = client.registry().snapshot();
        assert_eq!(snap.counter_total("http_reqs"), 1.0);
        assert_eq!(snap.counter_total("http_reqs{endpoint:homepage}"), 1.0);
        assert_eq!(snap.counter_total("http_reqs{status:200}"), 1.0);
        assert_eq!(snap.counter_total("data_received"), 5.0);
        assert_eq!(snap.rate("http_req_failed"), Some(0.0));
        let trend = snap.trend("http_req_duration").unwrap();
        assert!((trend.max - 120.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_counts_as_failed_request() {
        let client = client(FixedTransport {
            status: 500,
            body: "",
            delay: Duration::from_millis(5),
        });
        let response = client.get("http://test.local/", &RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(response.is_failure());
        assert_eq!(client.registry().snapshot().rate("http_req_failed"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_measured_from_dispatch() {
        let client = client(FixedTransport {
            status: 200,
            body: "",
            delay: Duration::from_secs(10),
        });
        let options = RequestOptions {
            timeout: Some(Duration::from_secs(2)),
            ..RequestOptions::default()
        };
        let err = client.get("http://test.local/", &options).await.unwrap_err();
        assert_eq!(err, RequestError::Timeout);

        let snap = client.registry().snapshot();
        assert_eq!(snap.counter_total("http_reqs{status:0}"), 1.0);
        assert_eq!(snap.counter_total("http_reqs{error:timeout}"), 1.0);
        assert_eq!(snap.rate("http_req_failed"), Some(1.0));
        let trend = snap.trend("http_req_duration").unwrap();
        assert!((trend.max - 2000.0).abs() < 1e-6, "max was {}", trend.max);
    }

    #[tokio::test]
    async fn test_network_error_records_sentinel_status() {
        let client = client(RefusingTransport);
        let err = client.get("http://test.local/", &RequestOptions::default()).await.unwrap_err();
        assert_eq!(err.error_category(), "network");
        let snap = client.registry().snapshot();
        assert_eq!(snap.counter_total("http_reqs{status:0}"), 1.0);
        assert_eq!(snap.counter_total("http_reqs{error:network}"), 1.0);
        assert_eq!(snap.counter_total("data_received"), 0.0);
    }

    #[test]
    fn test_failure_classification() {
        let ok = |status| Response {
            status,
            duration: Duration::ZERO,
            body: Vec::new(),
        };
        assert!(!ok(200).is_failure());
        assert!(!ok(302).is_failure());
        assert!(!ok(399).is_failure());
        assert!(ok(404).is_failure());
        assert!(ok(503).is_failure());
        assert!(Response::no_response(Duration::ZERO).is_failure());
    }

    #[tokio::test]
    async fn test_reqwest_transport_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let transport = ReqwestTransport::default();
        let raw = transport
            .get(&format!("{}/", server.url()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, b"<html>ok</html>");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reqwest_transport_returns_error_status_as_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let transport = ReqwestTransport::default();
        let raw = transport
            .get(&format!("{}/missing", server.url()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(raw.status, 404);
    }

    #[tokio::test]
    async fn test_reqwest_transport_connection_refused() {
        let transport = ReqwestTransport::default();
        let err = transport
            .get("http://127.0.0.1:1/", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Network { .. }));
    }

    #[test]
    fn test_snapshot_kind_of_request_metrics() {
        let registry = MetricRegistry::with_builtins();
        let snap = registry.snapshot();
        assert!(matches!(
            snap.get("http_req_failed"),
            Some(MetricSnapshot::Rate { .. })
        ));
    }
}
