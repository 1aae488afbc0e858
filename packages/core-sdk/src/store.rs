use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::history::MAX_HISTORY_ITEMS;
use crate::models::{Credential, HistoryEntry, ProviderDescriptor};
use crate::prompts::PromptTemplate;

/**
 * \brief 外部设置存储：凭证、自定义 Provider、当前选择与历史记录。
 *
 * 适配器只在调用开始时读取，不会跨挂起点持有任何存储句柄。
 */
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_credential(&self, provider_id: &str) -> Result<Option<Credential>>;
    async fn set_credential(&self, provider_id: &str, credential: &Credential) -> Result<()>;
    async fn remove_credential(&self, provider_id: &str) -> Result<()>;

    /** \brief 按保存顺序列出自定义 Provider。 */
    async fn list_custom_providers(&self) -> Result<Vec<ProviderDescriptor>>;
    /** \brief 新增或覆盖同 ID 的自定义 Provider。 */
    async fn save_custom_provider(&self, descriptor: &ProviderDescriptor) -> Result<()>;
    /** \brief 删除自定义 Provider 及其凭证（若被选中则清除选择）；不存在时返回 false。 */
    async fn delete_custom_provider(&self, provider_id: &str) -> Result<bool>;

    /** \brief 按保存顺序列出用户提示词。 */
    async fn list_custom_prompts(&self) -> Result<Vec<PromptTemplate>>;
    /** \brief 新增或覆盖同 ID 的用户提示词。 */
    async fn save_custom_prompt(&self, prompt: &PromptTemplate) -> Result<()>;
    async fn delete_custom_prompt(&self, prompt_id: &str) -> Result<bool>;

    async fn selected_provider(&self) -> Result<Option<String>>;
    async fn set_selected_provider(&self, provider_id: &str) -> Result<()>;

    async fn telemetry_enabled(&self) -> Result<bool>;
    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()>;

    /** \brief 追加历史记录（最新在前，最多保留 100 条）。 */
    async fn append_history(&self, entry: &HistoryEntry) -> Result<()>;
    async fn history(&self) -> Result<Vec<HistoryEntry>>;
    async fn clear_history(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    credentials: HashMap<String, Credential>,
    custom: Vec<ProviderDescriptor>,
    prompts: Vec<PromptTemplate>,
    selected: Option<String>,
    telemetry: bool,
    history: Vec<HistoryEntry>,
}

/**
 * \brief 进程内存储，用于测试与临时会话。
 */
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_credential(&self, provider_id: &str) -> Result<Option<Credential>> {
        self.with_state(|s| s.credentials.get(provider_id).cloned())
    }

    async fn set_credential(&self, provider_id: &str, credential: &Credential) -> Result<()> {
        self.with_state(|s| {
            s.credentials
                .insert(provider_id.to_string(), credential.clone());
        })
    }

    async fn remove_credential(&self, provider_id: &str) -> Result<()> {
        self.with_state(|s| {
            s.credentials.remove(provider_id);
        })
    }

    async fn list_custom_providers(&self) -> Result<Vec<ProviderDescriptor>> {
        self.with_state(|s| s.custom.clone())
    }

    async fn save_custom_provider(&self, descriptor: &ProviderDescriptor) -> Result<()> {
        self.with_state(|s| {
            match s.custom.iter_mut().find(|d| d.id == descriptor.id) {
                Some(existing) => *existing = descriptor.clone(),
                None => s.custom.push(descriptor.clone()),
            }
        })
    }

    async fn delete_custom_provider(&self, provider_id: &str) -> Result<bool> {
        self.with_state(|s| {
            let before = s.custom.len();
            s.custom.retain(|d| d.id != provider_id);
            let removed = s.custom.len() != before;
            if removed {
                s.credentials.remove(provider_id);
                if s.selected.as_deref() == Some(provider_id) {
                    s.selected = None;
                }
            }
            removed
        })
    }

    async fn list_custom_prompts(&self) -> Result<Vec<PromptTemplate>> {
        self.with_state(|s| s.prompts.clone())
    }

    async fn save_custom_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        self.with_state(|s| match s.prompts.iter_mut().find(|p| p.id == prompt.id) {
            Some(existing) => *existing = prompt.clone(),
            None => s.prompts.push(prompt.clone()),
        })
    }

    async fn delete_custom_prompt(&self, prompt_id: &str) -> Result<bool> {
        self.with_state(|s| {
            let before = s.prompts.len();
            s.prompts.retain(|p| p.id != prompt_id);
            s.prompts.len() != before
        })
    }

    async fn selected_provider(&self) -> Result<Option<String>> {
        self.with_state(|s| s.selected.clone())
    }

    async fn set_selected_provider(&self, provider_id: &str) -> Result<()> {
        self.with_state(|s| s.selected = Some(provider_id.to_string()))
    }

    async fn telemetry_enabled(&self) -> Result<bool> {
        self.with_state(|s| s.telemetry)
    }

    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.with_state(|s| s.telemetry = enabled)
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.with_state(|s| {
            s.history.insert(0, entry.clone());
            s.history.truncate(MAX_HISTORY_ITEMS);
        })
    }

    async fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.with_state(|s| s.history.clone())
    }

    async fn clear_history(&self) -> Result<()> {
        self.with_state(|s| s.history.clear())
    }
}
