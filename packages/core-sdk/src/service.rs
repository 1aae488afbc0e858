use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::adapter::ProviderRequestAdapter;
use crate::history;
use crate::models::{
    unique_id, AuthScheme, Credential, GenerationParams, ProviderDescriptor, ProviderKind,
    QueryOutcome, QueryRequest, RequestShape, ResponseShape,
};
use crate::prompts::{self, PromptTemplate};
use crate::providers::{
    console_hint, custom_provider_id, PredefinedProvider, ProviderRegistry, DEFAULT_PROVIDER_ID,
};
use crate::store::SettingsStore;

/**
 * \brief Provider 管理操作的输入错误，由 HTTP 层映射为 4xx。
 */
#[derive(Debug, Error)]
pub enum ManageError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),
    #[error("{0}")]
    InvalidInput(String),
}

/**
 * \brief Provider 列表项；凭证只以掩码形式出现。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub has_credential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<&'static str>,
    pub selected: bool,
}

/**
 * \brief 新增/更新自定义 Provider 的输入。
 */
#[derive(Debug, Clone, Deserialize)]
pub struct CustomProviderInput {
    /** \brief 更新已有 Provider 时传入，否则由名称生成 */
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub endpoint: String,
    pub auth: AuthScheme,
    pub request: RequestShape,
    pub response: ResponseShape,
    #[serde(default)]
    pub params: GenerationParams,
    /** \brief 可选：同时保存凭证 */
    #[serde(default)]
    pub api_key: Option<String>,
}

/**
 * \brief 新增/更新用户提示词的输入；更新时空字段保留原值。
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/**
 * \brief 面向调用方的查询服务：UI 处理器与后台任务共用同一入口。
 */
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn SettingsStore>,
    adapter: ProviderRequestAdapter,
}

impl QueryService {
    pub fn new(store: Arc<dyn SettingsStore>, adapter: ProviderRequestAdapter) -> Self {
        Self { store, adapter }
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    /**
     * \brief 确定本次使用的 Provider：显式指定 > 已保存的选择 > openai。
     */
    pub async fn resolve_provider_id(&self, requested: Option<&str>) -> Result<String> {
        if let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        Ok(self
            .store
            .selected_provider()
            .await?
            .unwrap_or_else(|| DEFAULT_PROVIDER_ID.to_string()))
    }

    /**
     * \brief 查找内置或自定义 Provider 描述。
     */
    pub async fn descriptor(&self, provider_id: &str) -> Result<Option<ProviderDescriptor>> {
        if let Some(p) = PredefinedProvider::from_id(provider_id) {
            return Ok(Some(p.descriptor()));
        }
        if ProviderKind::from_id(provider_id) != ProviderKind::Custom {
            return Ok(None);
        }
        Ok(self
            .store
            .list_custom_providers()
            .await?
            .into_iter()
            .find(|d| d.id == provider_id))
    }

    /**
     * \brief 为单次调用构造注册表，只包含目标 Provider 的描述与凭证。
     */
    pub async fn registry_for(&self, provider_id: &str) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        if let Some(descriptor) = self.descriptor(provider_id).await? {
            registry.insert_descriptor(descriptor);
            if let Some(credential) = self.store.get_credential(provider_id).await? {
                registry.insert_credential(provider_id, credential);
            }
        }
        Ok(registry)
    }

    /**
     * \brief 执行查询。任何错误都转换为 `{success:false, error}`，不会向调用方抛出。
     */
    pub async fn query(
        &self,
        provider_id: Option<&str>,
        instruction_prompt: &str,
        selected_text: &str,
    ) -> QueryOutcome {
        let provider_id = match self.resolve_provider_id(provider_id).await {
            Ok(id) => id,
            Err(e) => return QueryOutcome::failure(format!("settings store error: {:#}", e)),
        };
        let registry = match self.registry_for(&provider_id).await {
            Ok(r) => r,
            Err(e) => return QueryOutcome::failure(format!("settings store error: {:#}", e)),
        };
        let request = QueryRequest::new(&provider_id, instruction_prompt, selected_text);

        match self.adapter.query(&registry, &request).await {
            Ok(result) => {
                self.record_history(&request, &result.text).await;
                QueryOutcome::success(result.text)
            }
            Err(err) => {
                let name = registry
                    .descriptor(&provider_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| provider_id.clone());
                QueryOutcome::failure(err.user_message(&name, console_hint(&provider_id)))
            }
        }
    }

    async fn record_history(&self, request: &QueryRequest, answer: &str) {
        let entry = match history::new_entry(
            &request.provider_id,
            &request.instruction_prompt,
            &request.selected_text,
            answer,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "failed to build history entry");
                return;
            }
        };
        if let Err(e) = self.store.append_history(&entry).await {
            warn!(error = %e, "failed to append history");
        }
    }

    /**
     * \brief 列出全部 Provider（内置在前，自定义按保存顺序）。
     */
    pub async fn list_providers(&self) -> Result<Vec<ProviderSummary>> {
        let selected = self.resolve_provider_id(None).await?;
        let mut descriptors: Vec<ProviderDescriptor> = PredefinedProvider::ALL
            .into_iter()
            .map(PredefinedProvider::descriptor)
            .collect();
        descriptors.extend(self.store.list_custom_providers().await?);

        let mut out = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let credential = self.store.get_credential(&d.id).await?;
            out.push(ProviderSummary {
                kind: d.kind(),
                has_credential: credential.is_some(),
                credential: credential.as_ref().map(Credential::masked),
                selected: d.id == selected,
                id: d.id,
                name: d.name,
                endpoint: d.endpoint,
            });
        }
        Ok(out)
    }

    /**
     * \brief 新增或更新自定义 Provider，返回其 ID。
     */
    pub async fn save_custom_provider(&self, input: CustomProviderInput) -> Result<String> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(ManageError::InvalidInput("provider name must not be empty".into()).into());
        }
        // 只有显式 id 才会覆盖已有 Provider
        let id = match input.id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let taken: Vec<String> = self
                    .store
                    .list_custom_providers()
                    .await
                    .context("load custom providers failed")?
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                unique_id(custom_provider_id(&name), &taken)
            }
        };
        if ProviderKind::from_id(&id) != ProviderKind::Custom {
            return Err(ManageError::InvalidInput(format!(
                "custom provider ids must start with `custom_`: {}",
                id
            ))
            .into());
        }
        let descriptor = ProviderDescriptor {
            id: id.clone(),
            name,
            endpoint: input.endpoint.trim().to_string(),
            auth: input.auth,
            request: input.request,
            response: input.response,
            params: input.params,
        };
        descriptor.validate().map_err(ManageError::InvalidInput)?;

        self.store
            .save_custom_provider(&descriptor)
            .await
            .context("save custom provider failed")?;
        if let Some(secret) = input.api_key {
            if let Some(credential) = Credential::new(secret) {
                self.store.set_credential(&id, &credential).await?;
            }
        }
        info!(provider = %id, "custom provider saved");
        Ok(id)
    }

    /**
     * \brief 删除自定义 Provider；内置 Provider 不可删除。
     */
    pub async fn delete_provider(&self, provider_id: &str) -> Result<()> {
        if PredefinedProvider::from_id(provider_id).is_some() {
            return Err(ManageError::InvalidInput(format!(
                "predefined provider {} cannot be deleted",
                provider_id
            ))
            .into());
        }
        if !self.store.delete_custom_provider(provider_id).await? {
            return Err(ManageError::UnknownProvider(provider_id.to_string()).into());
        }
        info!(provider = %provider_id, "custom provider deleted");
        Ok(())
    }

    /**
     * \brief 保存凭证。保存后只会以掩码回显。
     */
    pub async fn set_credential(&self, provider_id: &str, secret: &str) -> Result<()> {
        self.ensure_known(provider_id).await?;
        let credential = Credential::new(secret)
            .ok_or_else(|| ManageError::InvalidInput("API key must not be empty".into()))?;
        self.store.set_credential(provider_id, &credential).await?;
        info!(provider = %provider_id, credential = ?credential, "credential saved");
        Ok(())
    }

    pub async fn clear_credential(&self, provider_id: &str) -> Result<()> {
        self.ensure_known(provider_id).await?;
        self.store.remove_credential(provider_id).await?;
        info!(provider = %provider_id, "credential cleared");
        Ok(())
    }

    pub async fn select_provider(&self, provider_id: &str) -> Result<()> {
        self.ensure_known(provider_id).await?;
        self.store.set_selected_provider(provider_id).await
    }

    /**
     * \brief 列出全部提示词：内置在前，用户提示词在后。
     */
    pub async fn list_prompts(&self) -> Result<Vec<PromptTemplate>> {
        Ok(prompts::all_prompts(self.store.list_custom_prompts().await?))
    }

    /**
     * \brief 按 ID 查找提示词，内置提示词优先。
     */
    pub async fn find_prompt(&self, prompt_id: &str) -> Result<Option<PromptTemplate>> {
        if let Some(builtin) = prompts::find_prompt(prompt_id) {
            return Ok(Some(builtin.into()));
        }
        let saved = self.store.list_custom_prompts().await?;
        Ok(prompts::resolve_prompt(prompt_id, &saved))
    }

    /**
     * \brief 新增用户提示词，返回新 ID。
     */
    pub async fn add_prompt(&self, input: PromptInput) -> Result<String> {
        let name = non_blank(input.name)
            .ok_or_else(|| ManageError::InvalidInput("prompt name must not be empty".into()))?;
        let template = non_blank(input.template)
            .ok_or_else(|| ManageError::InvalidInput("prompt template must not be empty".into()))?;
        let saved = self.store.list_custom_prompts().await?;
        let prompt = PromptTemplate {
            id: prompts::new_prompt_id(&saved),
            name,
            template,
            builtin: false,
        };
        self.store
            .save_custom_prompt(&prompt)
            .await
            .context("save prompt failed")?;
        info!(prompt = %prompt.id, "custom prompt added");
        Ok(prompt.id)
    }

    /**
     * \brief 更新用户提示词；内置提示词只读。
     */
    pub async fn update_prompt(&self, prompt_id: &str, input: PromptInput) -> Result<()> {
        self.ensure_editable_prompt(prompt_id)?;
        let mut prompt = self
            .store
            .list_custom_prompts()
            .await?
            .into_iter()
            .find(|p| p.id == prompt_id)
            .ok_or_else(|| ManageError::UnknownPrompt(prompt_id.to_string()))?;
        if let Some(name) = non_blank(input.name) {
            prompt.name = name;
        }
        if let Some(template) = non_blank(input.template) {
            prompt.template = template;
        }
        self.store
            .save_custom_prompt(&prompt)
            .await
            .context("save prompt failed")?;
        info!(prompt = %prompt_id, "custom prompt updated");
        Ok(())
    }

    pub async fn delete_prompt(&self, prompt_id: &str) -> Result<()> {
        self.ensure_editable_prompt(prompt_id)?;
        if !self.store.delete_custom_prompt(prompt_id).await? {
            return Err(ManageError::UnknownPrompt(prompt_id.to_string()).into());
        }
        info!(prompt = %prompt_id, "custom prompt deleted");
        Ok(())
    }

    fn ensure_editable_prompt(&self, prompt_id: &str) -> Result<()> {
        if prompts::is_builtin(prompt_id) {
            return Err(ManageError::InvalidInput(format!(
                "builtin prompt {} cannot be modified",
                prompt_id
            ))
            .into());
        }
        Ok(())
    }

    async fn ensure_known(&self, provider_id: &str) -> Result<()> {
        if self.descriptor(provider_id).await?.is_none() {
            return Err(ManageError::UnknownProvider(provider_id.to_string()).into());
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::AdapterConfig;
    use crate::error::QueryError;
    use crate::store::MemoryStore;
    use crate::transport::{HttpTransport, WireRequest, WireResponse};

    struct FixedTransport {
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn post_json(&self, _request: &WireRequest) -> Result<WireResponse, QueryError> {
            Ok(WireResponse {
                status: self.status,
                body: self.body.to_string(),
            })
        }
    }

    fn service(status: u16, body: &'static str) -> QueryService {
        let config = AdapterConfig {
            base_delay: Duration::from_millis(1),
            ..AdapterConfig::default()
        };
        let adapter =
            ProviderRequestAdapter::new(Arc::new(FixedTransport { status, body }), &config);
        QueryService::new(Arc::new(MemoryStore::new()), adapter)
    }

    fn custom_input(name: &str) -> CustomProviderInput {
        CustomProviderInput {
            id: None,
            name: name.into(),
            endpoint: "http://localhost:9000/gen".into(),
            auth: AuthScheme::Bearer,
            request: RequestShape::CustomTemplate {
                template: r#"{"prompt":"{{prompt}}"}"#.into(),
            },
            response: ResponseShape::CustomPath {
                path: "output".into(),
            },
            params: GenerationParams::default(),
            api_key: Some("local-key".into()),
        }
    }

    #[tokio::test]
    async fn test_query_success_records_history() {
        let svc = service(200, r#"{"choices":[{"message":{"content":"42"}}]}"#);
        svc.set_credential("openai", "sk-x").await.expect("set key");
        let outcome = svc.query(None, "Answer", "6*7?").await;
        assert_eq!(outcome, QueryOutcome::success("42"));

        let history = svc.store().history().await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "6*7?");
        assert_eq!(history[0].provider_id, "openai");
    }

    #[tokio::test]
    async fn test_query_without_credential_fails_gracefully() {
        let svc = service(200, "{}");
        let outcome = svc.query(Some("gemini"), "Answer", "x").await;
        assert!(!outcome.success);
        assert!(outcome.answer.is_none());
        assert!(outcome.error.unwrap().contains("API key not configured for gemini"));
    }

    #[tokio::test]
    async fn test_query_unknown_provider() {
        let svc = service(200, "{}");
        let outcome = svc.query(Some("custom_missing"), "Answer", "x").await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("unknown provider: custom_missing")
        );
    }

    #[tokio::test]
    async fn test_rate_limit_message_carries_console_hint() {
        let svc = service(429, r#"{"error":{"message":"quota"}}"#);
        svc.set_credential("together", "tk").await.expect("set key");
        let outcome = svc.query(Some("together"), "Summarize", "x").await;
        let error = outcome.error.expect("error");
        assert!(error.contains("429"));
        assert!(error.contains("api.together.xyz"));
        assert!(svc.store().history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_provider_lifecycle() {
        let svc = service(200, r#"{"output":"done"}"#);
        let id = svc
            .save_custom_provider(custom_input("Local Llama"))
            .await
            .expect("save");
        assert_eq!(id, "custom_local_llama");
        svc.select_provider(&id).await.expect("select");

        let outcome = svc.query(None, "Paraphrase", "text").await;
        assert_eq!(outcome, QueryOutcome::success("done"));

        let providers = svc.list_providers().await.expect("list");
        let local = providers.iter().find(|p| p.id == id).expect("listed");
        assert!(local.selected && local.has_credential);
        assert_eq!(local.credential, Some(crate::models::CREDENTIAL_MASK));
        assert_eq!(providers.len(), 5);

        svc.delete_provider(&id).await.expect("delete");
        assert!(svc.store().get_credential(&id).await.unwrap().is_none());
        let err = svc.delete_provider(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManageError>(),
            Some(ManageError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_colliding_names_get_distinct_ids() {
        let svc = service(200, "{}");
        let mut first = custom_input("My LLM");
        first.endpoint = "https://a.example.com/gen".into();
        first.api_key = Some("key-a".into());
        let mut second = custom_input("my-llm");
        second.endpoint = "https://b.example.com/gen".into();
        second.api_key = Some("key-b".into());

        let a = svc.save_custom_provider(first).await.expect("save a");
        let b = svc.save_custom_provider(second).await.expect("save b");
        assert_eq!(a, "custom_my_llm");
        assert_eq!(b, "custom_my_llm_2");

        let customs = svc.store().list_custom_providers().await.unwrap();
        assert_eq!(customs.len(), 2);
        assert_eq!(customs[0].endpoint, "https://a.example.com/gen");
        let key_a = svc.store().get_credential(&a).await.unwrap().unwrap();
        assert_eq!(key_a.expose(), "key-a");
    }

    #[tokio::test]
    async fn test_explicit_id_updates_existing_provider() {
        let svc = service(200, "{}");
        let id = svc
            .save_custom_provider(custom_input("Local"))
            .await
            .expect("save");
        let mut update = custom_input("Local renamed");
        update.id = Some(id.clone());
        update.endpoint = "http://localhost:9001/gen".into();
        assert_eq!(svc.save_custom_provider(update).await.expect("update"), id);

        let customs = svc.store().list_custom_providers().await.unwrap();
        assert_eq!(customs.len(), 1);
        assert_eq!(customs[0].name, "Local renamed");
        assert_eq!(customs[0].endpoint, "http://localhost:9001/gen");
    }

    #[tokio::test]
    async fn test_prompt_lifecycle() {
        let svc = service(200, "{}");
        let id = svc
            .add_prompt(PromptInput {
                name: Some("Translate".into()),
                template: Some("Translate to French".into()),
            })
            .await
            .expect("add");
        assert!(id.starts_with(crate::models::CUSTOM_PREFIX));

        let found = svc.find_prompt(&id).await.unwrap().expect("found");
        assert_eq!(found.template, "Translate to French");
        assert!(!found.builtin);
        assert!(svc.find_prompt("summarize").await.unwrap().unwrap().builtin);

        svc.update_prompt(
            &id,
            PromptInput {
                name: None,
                template: Some("Translate to German".into()),
            },
        )
        .await
        .expect("update");
        let found = svc.find_prompt(&id).await.unwrap().unwrap();
        assert_eq!(found.name, "Translate");
        assert_eq!(found.template, "Translate to German");

        let all = svc.list_prompts().await.unwrap();
        assert_eq!(all.len(), prompts::BUILTIN_PROMPTS.len() + 1);

        svc.delete_prompt(&id).await.expect("delete");
        assert!(svc.find_prompt(&id).await.unwrap().is_none());
        let err = svc.delete_prompt(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManageError>(),
            Some(ManageError::UnknownPrompt(_))
        ));
    }

    #[tokio::test]
    async fn test_builtin_prompts_are_read_only() {
        let svc = service(200, "{}");
        assert!(svc.delete_prompt("summarize").await.is_err());
        assert!(svc
            .update_prompt("paraphrase", PromptInput::default())
            .await
            .is_err());
        assert!(svc.add_prompt(PromptInput::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_management_rejects_invalid_input() {
        let svc = service(200, "{}");
        assert!(svc.delete_provider("openai").await.is_err());
        assert!(svc.set_credential("openai", "   ").await.is_err());
        assert!(svc.select_provider("nope").await.is_err());

        let mut input = custom_input("Broken");
        input.request = RequestShape::CustomTemplate {
            template: String::new(),
        };
        assert!(svc.save_custom_provider(input).await.is_err());
    }
}
