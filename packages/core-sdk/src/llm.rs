use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::{json, Value};

use crate::error::QueryError;
use crate::models::{AuthScheme, Credential, GenerationParams, ProviderDescriptor, RequestShape};
use crate::providers::ANTHROPIC_VERSION;
use crate::template::{render_template, value_at_path, TemplateValues};
use crate::transport::WireRequest;

const MAX_ERROR_BODY: usize = 200;

/**
 * \brief 按 Provider 描述构造线上请求：地址、鉴权、请求体。
 * \param prompt 已拼接好的完整提示文本
 */
pub fn build_wire_request(
    descriptor: &ProviderDescriptor,
    credential: &Credential,
    prompt: &str,
) -> Result<WireRequest, QueryError> {
    descriptor
        .validate()
        .map_err(QueryError::InvalidDescriptor)?;

    // 模板错误需要在任何网络调用之前暴露
    let body = build_body(&descriptor.request, &descriptor.params, prompt)?;

    let mut url = Url::parse(descriptor.endpoint.trim()).map_err(|e| {
        QueryError::InvalidDescriptor(format!("endpoint of {}: {}", descriptor.id, e))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match &descriptor.auth {
        AuthScheme::Bearer => {
            headers.insert(
                AUTHORIZATION,
                secret_header(&format!("Bearer {}", credential.expose()))?,
            );
        }
        AuthScheme::XApiKey => {
            headers.insert("x-api-key", secret_header(credential.expose())?);
        }
        AuthScheme::Header { name } => {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                QueryError::InvalidDescriptor(format!("auth header of {}: {}", descriptor.id, e))
            })?;
            headers.insert(name, secret_header(credential.expose())?);
        }
        AuthScheme::QueryParam { name } => {
            url.query_pairs_mut()
                .append_pair(name.trim(), credential.expose());
        }
    }

    if descriptor.request == RequestShape::AnthropicMessages {
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }

    Ok(WireRequest { url, headers, body })
}

fn secret_header(value: &str) -> Result<HeaderValue, QueryError> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        QueryError::InvalidDescriptor("credential contains invalid header characters".to_string())
    })?;
    header.set_sensitive(true);
    Ok(header)
}

fn build_body(
    shape: &RequestShape,
    params: &GenerationParams,
    prompt: &str,
) -> Result<Value, QueryError> {
    let body = match shape {
        RequestShape::OpenAiChat => json!({
            "model": params.model_name,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        }),
        RequestShape::TogetherCompletion { instruct_tags } => {
            let prompt = if *instruct_tags {
                format!("<s>[INST] {} [/INST]", prompt)
            } else {
                prompt.to_string()
            };
            json!({
                "model": params.model_name,
                "prompt": prompt,
                "temperature": params.temperature,
                "max_tokens": params.max_tokens,
            })
        }
        RequestShape::AnthropicMessages => json!({
            "model": params.model_name,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": params.max_tokens,
        }),
        RequestShape::GeminiGenerate => json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_tokens,
            }
        }),
        RequestShape::CustomTemplate { template } => {
            let values = TemplateValues {
                prompt: prompt.to_string(),
                temperature: params.temperature,
                max_tokens: params.max_tokens,
                model_name: params.model_name.clone(),
            };
            render_template(template, &values)?
        }
    };
    Ok(body)
}

/**
 * \brief 从 2xx 响应体中提取回答文本；缺失、非字符串或空白一律视为格式不匹配。
 */
pub fn extract_answer(descriptor: &ProviderDescriptor, body: &str) -> Result<String, QueryError> {
    let path = descriptor.response.path();
    let mismatch = || QueryError::ResponseShapeMismatch {
        path: path.to_string(),
    };
    let v: Value = serde_json::from_str(body).map_err(|_| mismatch())?;
    let text = value_at_path(&v, path)
        .and_then(|t| t.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(mismatch)?;
    Ok(text.to_string())
}

/**
 * \brief 从错误响应体中提取可读信息。
 */
pub fn provider_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let candidates = [
            v.get("error").and_then(|e| e.get("message")),
            v.get("error"),
            v.get("message"),
        ];
        if let Some(msg) = candidates
            .into_iter()
            .flatten()
            .filter_map(|m| m.as_str())
            .find(|m| !m.trim().is_empty())
        {
            return msg.trim().to_string();
        }
    }
    let raw = body.trim();
    if raw.is_empty() {
        "unknown error".to_string()
    } else {
        raw.chars().take(MAX_ERROR_BODY).collect()
    }
}
