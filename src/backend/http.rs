use crate::backend::UsageBackend;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{LogUsageRequest, UsageResponse};
use crate::session::Session;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid api_base_url '{base_url}': {e}")))?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, AppError> {
        Self::new(
            &cfg.api_base_url,
            Duration::from_secs(cfg.request_timeout_secs.max(1)),
        )
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}/{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url
    }

    async fn error_for_response(response: Response) -> AppError {
        let status = response.status();
        let fallback = status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) if !body.error.trim().is_empty() => body.error,
            _ => fallback,
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized(message),
            s if s.is_server_error() => AppError::Server {
                status: s.as_u16(),
                message,
            },
            s => AppError::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl UsageBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_usage(&self, session: &Session) -> Result<UsageResponse, AppError> {
        let url = self.endpoint("api/usage");
        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "usage response received"
        );
        if !status.is_success() {
            return Err(Self::error_for_response(response).await);
        }

        let mut body: UsageResponse = response.json().await?;
        body.logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(body)
    }

    async fn log_usage(
        &self,
        session: &Session,
        request: &LogUsageRequest,
    ) -> Result<(), AppError> {
        let url = self.endpoint("api/log-usage");
        let response = self
            .client
            .post(url)
            .bearer_auth(&session.access_token)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for_response(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> Session {
        Session {
            user_id: Some("user-1".into()),
            access_token: "tok-123".into(),
        }
    }

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&server.uri(), Duration::from_secs(5)).expect("backend")
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let backend =
            HttpBackend::new("https://aetheria.ai/app", Duration::from_secs(5)).expect("backend");
        assert_eq!(
            backend.endpoint("api/usage").as_str(),
            "https://aetheria.ai/app/api/usage"
        );

        let backend =
            HttpBackend::new("https://aetheria.ai", Duration::from_secs(5)).expect("backend");
        assert_eq!(
            backend.endpoint("api/usage").as_str(),
            "https://aetheria.ai/api/usage"
        );
    }

    #[tokio::test]
    async fn fetch_usage_sends_bearer_token_and_orders_by_recency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/usage"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logs": [
                    {"id": 1, "user_id": "user-1", "input_tokens": 1, "output_tokens": 1,
                     "total_tokens": 2, "created_at": "2025-01-01T10:00:00+00:00"},
                    {"id": 2, "user_id": "user-1", "input_tokens": 3, "output_tokens": 4,
                     "total_tokens": 7, "created_at": "2025-01-03T10:00:00+00:00"}
                ],
                "totalMetrics": {"request_count": 2, "input_tokens": 4,
                                 "output_tokens": 5, "total_tokens": 9}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = backend(&server)
            .fetch_usage(&session())
            .await
            .expect("fetch should succeed");
        assert_eq!(body.logs.len(), 2);
        assert_eq!(body.logs[0].id, "2");
        assert_eq!(body.logs[1].id, "1");
        assert_eq!(body.total_metrics.map(|t| t.total_tokens), Some(9));
    }

    #[tokio::test]
    async fn fetch_usage_with_no_rows_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logs": [],
                "totalMetrics": {"request_count": 0, "input_tokens": 0,
                                 "output_tokens": 0, "total_tokens": 0}
            })))
            .mount(&server)
            .await;

        let body = backend(&server)
            .fetch_usage(&session())
            .await
            .expect("empty fetch should succeed");
        assert!(body.logs.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_carries_backend_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/usage"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let err = backend(&server)
            .fetch_usage(&session())
            .await
            .expect_err("401 should fail");
        assert!(matches!(err, AppError::Unauthorized(ref m) if m == "Unauthorized"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_errors_are_retryable_and_fall_back_to_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/usage"))
            .respond_with(ResponseTemplate::new(503).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .fetch_usage(&session())
            .await
            .expect_err("503 should fail");
        match &err {
            AppError::Server { status, message } => {
                assert_eq!(*status, 503);
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logs": [{"id": "x", "created_at": "yesterday"}]
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .fetch_usage(&session())
            .await
            .expect_err("bad timestamp should fail");
        assert!(matches!(err, AppError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let backend =
            HttpBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).expect("backend");
        let err = backend
            .fetch_usage(&session())
            .await
            .expect_err("closed port should fail");
        assert!(matches!(err, AppError::Network(_)));
    }

    #[tokio::test]
    async fn log_usage_posts_token_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/log-usage"))
            .and(header("authorization", "Bearer tok-123"))
            .and(body_json(json!({"input_tokens": 120, "output_tokens": 30})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server)
            .log_usage(
                &session(),
                &LogUsageRequest {
                    input_tokens: 120,
                    output_tokens: 30,
                },
            )
            .await
            .expect("log should succeed");
    }

    #[tokio::test]
    async fn log_usage_surfaces_validation_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/log-usage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "Invalid input: input_tokens and output_tokens must be numbers"
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .log_usage(
                &session(),
                &LogUsageRequest {
                    input_tokens: 1,
                    output_tokens: 1,
                },
            )
            .await
            .expect_err("400 should fail");
        assert!(matches!(err, AppError::Rejected { status: 400, .. }));
    }
}
