use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::error::QueryError;
use crate::llm;
use crate::models::{Credential, ProviderDescriptor, QueryRequest, QueryResult};
use crate::providers::ProviderRegistry;
use crate::retry::{AttemptState, RetryPolicy};
use crate::transport::{HttpTransport, WireRequest};

/**
 * \brief 统一的 Provider 请求适配器：构造请求、限时执行、解析响应、429 退避重试。
 *
 * 每次调用各自持有超时与重试计数，并发调用之间没有共享可变状态。
 */
#[derive(Clone)]
pub struct ProviderRequestAdapter {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ProviderRequestAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &AdapterConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::new(config.max_retries, config.base_delay),
            timeout: config.timeout,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /**
     * \brief 从注册表解析 Provider 与凭证后执行查询。解析失败不会发起网络请求。
     */
    pub async fn query(
        &self,
        registry: &ProviderRegistry,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let (descriptor, credential) = registry.resolve(&request.provider_id)?;
        self.execute(descriptor, credential, request).await
    }

    /**
     * \brief 针对单个 Provider 执行一次逻辑查询。
     */
    pub async fn execute(
        &self,
        descriptor: &ProviderDescriptor,
        credential: &Credential,
        request: &QueryRequest,
    ) -> Result<QueryResult, QueryError> {
        let wire = llm::build_wire_request(descriptor, credential, &request.combined_text())?;

        let mut attempt = 1;
        loop {
            let err = match self.attempt_once(descriptor, &wire, attempt).await {
                Ok(text) => {
                    info!(provider = %descriptor.id, attempt, "query succeeded");
                    return Ok(QueryResult { text });
                }
                Err(err) => err,
            };
            match self.policy.decide(attempt, &err) {
                AttemptState::RetryScheduled {
                    attempt: next,
                    delay,
                } => {
                    warn!(
                        provider = %descriptor.id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                _ => {
                    warn!(provider = %descriptor.id, attempt, error = %err, "query failed");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        descriptor: &ProviderDescriptor,
        wire: &WireRequest,
        attempt: u32,
    ) -> Result<String, QueryError> {
        debug!(
            provider = %descriptor.id,
            host = wire.url.host_str().unwrap_or_default(),
            attempt,
            "sending request"
        );
        let resp = tokio::time::timeout(self.timeout, self.transport.post_json(wire))
            .await
            .map_err(|_| QueryError::Timeout(self.timeout.as_millis() as u64))??;

        if !resp.is_success() {
            let message = llm::provider_error_message(&resp.body);
            debug!(provider = %descriptor.id, status = resp.status, "provider returned error");
            return Err(match QueryError::from_status(resp.status, message) {
                QueryError::RateLimited { message, .. } => QueryError::RateLimited {
                    attempts: attempt,
                    message,
                },
                other => other,
            });
        }
        llm::extract_answer(descriptor, &resp.body)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::models::{AuthScheme, GenerationParams, RequestShape, ResponseShape};
    use crate::providers::PredefinedProvider;
    use crate::transport::WireResponse;

    /** \brief 按脚本依次返回响应，并记录每次调用的时刻与请求体。 */
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<WireResponse, QueryError>>>,
        calls: Mutex<Vec<(Instant, WireRequest)>>,
        hang: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<(u16, &str)>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(status, body)| {
                            Ok(WireResponse {
                                status,
                                body: body.to_string(),
                            })
                        })
                        .collect(),
                ),
                ..Self::default()
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang: true,
                ..Self::default()
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1].0 - w[0].0).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn post_json(&self, request: &WireRequest) -> Result<WireResponse, QueryError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), request.clone()));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(QueryError::Network("script exhausted".into())))
        }
    }

    fn adapter(transport: Arc<ScriptedTransport>) -> ProviderRequestAdapter {
        ProviderRequestAdapter::new(transport, &AdapterConfig::default())
    }

    fn key() -> Credential {
        Credential::new("sk-test").unwrap()
    }

    const OPENAI_OK: &str = r#"{"choices":[{"message":{"content":" answer "}}]}"#;
    const LIMITED: &str = r#"{"error":{"message":"Rate limit reached"}}"#;

    #[tokio::test(start_paused = true)]
    async fn test_predefined_shapes_extract_trimmed_answer() {
        let cases = [
            (PredefinedProvider::OpenAi, OPENAI_OK),
            (
                PredefinedProvider::Together,
                r#"{"choices":[{"text":"\n answer"}]}"#,
            ),
            (
                PredefinedProvider::Claude,
                r#"{"content":[{"type":"text","text":"answer  "}]}"#,
            ),
            (
                PredefinedProvider::Gemini,
                r#"{"candidates":[{"content":{"parts":[{"text":" answer"}]}}]}"#,
            ),
        ];
        for (provider, body) in cases {
            let transport = ScriptedTransport::new(vec![(200, body)]);
            let result = adapter(transport.clone())
                .execute(
                    &provider.descriptor(),
                    &key(),
                    &QueryRequest::new(provider.id(), "Summarize", "text"),
                )
                .await
                .expect("query succeeds");
            assert_eq!(result.text, "answer", "provider {}", provider.id());
            assert_eq!(transport.call_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_template_provider_end_to_end() {
        let descriptor = ProviderDescriptor {
            id: "custom_local".into(),
            name: "Local".into(),
            endpoint: "http://localhost:8080/complete".into(),
            auth: AuthScheme::Bearer,
            request: RequestShape::CustomTemplate {
                template: r#"{"prompt":"{{prompt}}","max_tokens":{{maxTokens}}}"#.into(),
            },
            response: ResponseShape::CustomPath {
                path: "choices.0.text".into(),
            },
            params: GenerationParams::default(),
        };
        let transport = ScriptedTransport::new(vec![(200, r#"{"choices":[{"text":"ans "}]}"#)]);
        let result = adapter(transport.clone())
            .execute(&descriptor, &key(), &QueryRequest::new("custom_local", "Y", "X"))
            .await
            .expect("query succeeds");
        assert_eq!(result.text, "ans");

        let calls = transport.calls.lock().unwrap();
        let wire = serde_json::to_string(&calls[0].1.body).unwrap();
        assert!(wire.contains(r#""prompt":"Y:\n\nX""#), "wire body: {}", wire);
        assert!(wire.contains(r#""max_tokens":1024"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success_uses_exponential_delays() {
        let transport =
            ScriptedTransport::new(vec![(429, LIMITED), (429, LIMITED), (200, OPENAI_OK)]);
        let result = adapter(transport.clone())
            .execute(
                &PredefinedProvider::OpenAi.descriptor(),
                &key(),
                &QueryRequest::new("openai", "p", "t"),
            )
            .await
            .expect("third attempt succeeds");
        assert_eq!(result.text, "answer");
        assert_eq!(
            transport.gaps(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausts_after_max_attempts() {
        let transport = ScriptedTransport::new(vec![
            (429, LIMITED),
            (429, LIMITED),
            (429, LIMITED),
            (200, OPENAI_OK),
        ]);
        let started = Instant::now();
        let err = adapter(transport.clone())
            .execute(
                &PredefinedProvider::OpenAi.descriptor(),
                &key(),
                &QueryRequest::new("openai", "p", "t"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::RateLimited {
                attempts: 3,
                message: "Rate limit reached".into()
            }
        );
        assert_eq!(transport.call_count(), 3);
        // 最后一次失败后不再等待
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_fails_without_retry() {
        let transport = ScriptedTransport::new(vec![
            (401, r#"{"error":{"message":"Incorrect API key"}}"#),
            (200, OPENAI_OK),
        ]);
        let started = Instant::now();
        let err = adapter(transport.clone())
            .execute(
                &PredefinedProvider::OpenAi.descriptor(),
                &key(),
                &QueryRequest::new("openai", "p", "t"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::Unauthorized {
                status: 401,
                message: "Incorrect API key".into()
            }
        );
        assert_eq!(transport.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_aborts_retry_loop() {
        let transport = ScriptedTransport::new(vec![(429, LIMITED), (500, "upstream down")]);
        let err = adapter(transport.clone())
            .execute(
                &PredefinedProvider::OpenAi.descriptor(),
                &key(),
                &QueryRequest::new("openai", "p", "t"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::ProviderError {
                status: 500,
                message: "upstream down".into()
            }
        );
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let transport = ScriptedTransport::hanging();
        let started = Instant::now();
        let err = adapter(transport.clone())
            .execute(
                &PredefinedProvider::OpenAi.descriptor(),
                &key(),
                &QueryRequest::new("openai", "p", "t"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Timeout(30_000));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_issues_no_request() {
        let transport = ScriptedTransport::new(vec![(200, OPENAI_OK)]);
        let registry = ProviderRegistry::with_predefined();
        let err = adapter(transport.clone())
            .query(&registry, &QueryRequest::new("openai", "p", "t"))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::MissingCredential("openai".into()));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_choices_is_shape_mismatch() {
        let transport = ScriptedTransport::new(vec![(200, r#"{"choices":[]}"#)]);
        let err = adapter(transport)
            .execute(
                &PredefinedProvider::Together.descriptor(),
                &key(),
                &QueryRequest::new("together", "p", "t"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::ResponseShapeMismatch {
                path: "choices.0.text".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_keep_independent_retry_state() {
        let limited = ScriptedTransport::new(vec![(429, LIMITED), (200, OPENAI_OK)]);
        let direct = ScriptedTransport::new(vec![(200, OPENAI_OK)]);
        let descriptor = PredefinedProvider::OpenAi.descriptor();
        let request = QueryRequest::new("openai", "p", "t");
        let slow_adapter = adapter(limited.clone());
        let fast_adapter = adapter(direct.clone());
        let credential = key();

        let (slow, fast) = futures_util::future::join(
            slow_adapter.execute(&descriptor, &credential, &request),
            fast_adapter.execute(&descriptor, &credential, &request),
        )
        .await;
        assert_eq!(slow.expect("slow").text, "answer");
        assert_eq!(fast.expect("fast").text, "answer");
        assert_eq!(limited.call_count(), 2);
        assert_eq!(direct.call_count(), 1);
    }
}
