use std::sync::Arc;
use std::time::Duration;

use lucidselect_core_sdk::prelude::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter() -> ProviderRequestAdapter {
    let config = AdapterConfig {
        base_delay: Duration::from_millis(10),
        ..AdapterConfig::default()
    };
    ProviderRequestAdapter::new(Arc::new(ReqwestTransport::new()), &config)
}

fn against(server: &MockServer, provider: PredefinedProvider, route: &str) -> ProviderDescriptor {
    let mut descriptor = provider.descriptor();
    descriptor.endpoint = format!("{}{}", server.uri(), route);
    descriptor
}

fn key() -> Credential {
    Credential::new("test-key").expect("credential")
}

#[tokio::test]
async fn openai_chat_completion_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Summarize:\n\nRust is fast."}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "  Rust is quick.\n"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = against(&server, PredefinedProvider::OpenAi, "/v1/chat/completions");
    let result = adapter()
        .execute(
            &descriptor,
            &key(),
            &QueryRequest::new("openai", "Summarize", "Rust is fast."),
        )
        .await
        .expect("openai query");
    assert_eq!(result.text, "Rust is quick.");
}

#[tokio::test]
async fn claude_messages_send_version_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "Bonjour"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = against(&server, PredefinedProvider::Claude, "/v1/messages");
    let result = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("claude", "Translate", "Hello"))
        .await
        .expect("claude query");
    assert_eq!(result.text, "Bonjour");
}

#[tokio::test]
async fn gemini_key_travels_in_query_string() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({
            "generationConfig": {"maxOutputTokens": 1024}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "42"}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = against(
        &server,
        PredefinedProvider::Gemini,
        "/v1beta/models/gemini-pro:generateContent",
    );
    let result = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("gemini", "Answer", "6*7"))
        .await
        .expect("gemini query");
    assert_eq!(result.text, "42");
}

#[tokio::test]
async fn together_rate_limit_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"text": " paraphrased "}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = against(&server, PredefinedProvider::Together, "/v1/completions");
    let result = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("together", "Paraphrase", "x"))
        .await
        .expect("together query");
    assert_eq!(result.text, "paraphrased");
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "invalid x-api-key"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = against(&server, PredefinedProvider::Claude, "/v1/messages");
    let err = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("claude", "p", "t"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        QueryError::Unauthorized {
            status: 401,
            message: "invalid x-api-key".into()
        }
    );
}

#[tokio::test]
async fn custom_template_provider_with_query_param_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(query_param("token", "test-key"))
        .and(body_partial_json(json!({
            "input": {"text": "Y:\n\nX", "model": "local-7b"},
            "limit": 256
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"outputs": [{"generated": "ans "}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = ProviderDescriptor {
        id: "custom_local".into(),
        name: "Local".into(),
        endpoint: format!("{}/generate", server.uri()),
        auth: AuthScheme::QueryParam {
            name: "token".into(),
        },
        request: RequestShape::CustomTemplate {
            template: r#"{"input":{"text":"{{prompt}}","model":"{{modelName}}"},"limit":{{maxTokens}}}"#
                .into(),
        },
        response: ResponseShape::CustomPath {
            path: "data.outputs.0.generated".into(),
        },
        params: GenerationParams {
            model_name: "local-7b".into(),
            temperature: 0.2,
            max_tokens: 256,
        },
    };
    let result = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("custom_local", "Y", "X"))
        .await
        .expect("custom query");
    assert_eq!(result.text, "ans");
}

#[tokio::test]
async fn connection_failure_is_network_error() {
    // 端口 1 上没有服务监听
    let mut descriptor = PredefinedProvider::OpenAi.descriptor();
    descriptor.endpoint = "http://127.0.0.1:1/v1/chat/completions".into();
    let err = adapter()
        .execute(&descriptor, &key(), &QueryRequest::new("openai", "p", "t"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Network(_)), "got {:?}", err);
}
