use std::collections::HashMap;

use time::OffsetDateTime;

use crate::error::QueryError;
use crate::models::{
    AuthScheme, Credential, GenerationParams, ProviderDescriptor, RequestShape, ResponseShape,
    CUSTOM_PREFIX,
};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/** \brief 未选择 Provider 时的默认值。 */
pub const DEFAULT_PROVIDER_ID: &str = "openai";

/**
 * \brief 内置 Provider。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedProvider {
    OpenAi,
    Together,
    Claude,
    Gemini,
}

impl PredefinedProvider {
    pub const ALL: [PredefinedProvider; 4] = [
        PredefinedProvider::OpenAi,
        PredefinedProvider::Together,
        PredefinedProvider::Claude,
        PredefinedProvider::Gemini,
    ];

    pub fn id(self) -> &'static str {
        match self {
            PredefinedProvider::OpenAi => "openai",
            PredefinedProvider::Together => "together",
            PredefinedProvider::Claude => "claude",
            PredefinedProvider::Gemini => "gemini",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            PredefinedProvider::OpenAi => "OpenAI",
            PredefinedProvider::Together => "Together.ai",
            PredefinedProvider::Claude => "Claude",
            PredefinedProvider::Gemini => "Gemini",
        }
    }

    /**
     * \brief 账户控制台地址，用于 429/401 的提示信息。
     */
    pub fn console(self) -> &'static str {
        match self {
            PredefinedProvider::OpenAi => "platform.openai.com",
            PredefinedProvider::Together => "api.together.xyz",
            PredefinedProvider::Claude => "console.anthropic.com",
            PredefinedProvider::Gemini => "aistudio.google.com",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            PredefinedProvider::OpenAi => "https://api.openai.com/v1/chat/completions",
            PredefinedProvider::Together => "https://api.together.xyz/v1/completions",
            PredefinedProvider::Claude => "https://api.anthropic.com/v1/messages",
            PredefinedProvider::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
            }
        }
    }

    /**
     * \brief 生成内置 Provider 的固定描述。
     */
    pub fn descriptor(self) -> ProviderDescriptor {
        let (auth, request, response, model_name) = match self {
            PredefinedProvider::OpenAi => (
                AuthScheme::Bearer,
                RequestShape::OpenAiChat,
                ResponseShape::OpenAiChat,
                "gpt-3.5-turbo",
            ),
            PredefinedProvider::Together => (
                AuthScheme::Bearer,
                RequestShape::TogetherCompletion {
                    instruct_tags: true,
                },
                ResponseShape::TogetherCompletion,
                "mistralai/Mixtral-8x7B-Instruct-v0.1",
            ),
            PredefinedProvider::Claude => (
                AuthScheme::XApiKey,
                RequestShape::AnthropicMessages,
                ResponseShape::AnthropicMessages,
                "claude-2",
            ),
            PredefinedProvider::Gemini => (
                AuthScheme::QueryParam {
                    name: "key".to_string(),
                },
                RequestShape::GeminiGenerate,
                ResponseShape::GeminiGenerate,
                "gemini-pro",
            ),
        };
        ProviderDescriptor {
            id: self.id().to_string(),
            name: self.display_name().to_string(),
            endpoint: self.endpoint().to_string(),
            auth,
            request,
            response,
            params: GenerationParams {
                model_name: model_name.to_string(),
                ..GenerationParams::default()
            },
        }
    }
}

/**
 * \brief 查找 Provider 的控制台提示地址（仅内置 Provider 有）。
 */
pub fn console_hint(provider_id: &str) -> Option<&'static str> {
    PredefinedProvider::from_id(provider_id).map(PredefinedProvider::console)
}

/**
 * \brief 由显示名称生成自定义 Provider ID：`custom_<slug>`。
 */
pub fn custom_provider_id(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        format!("{}{}", CUSTOM_PREFIX, millis)
    } else {
        format!("{}{}", CUSTOM_PREFIX, slug)
    }
}

/**
 * \brief 单次调用所需的 Provider 描述与凭证集合，显式构造、显式传递。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    descriptors: HashMap<String, ProviderDescriptor>,
    credentials: HashMap<String, Credential>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 预置全部内置 Provider 描述（不含凭证）。
     */
    pub fn with_predefined() -> Self {
        let mut registry = Self::new();
        for provider in PredefinedProvider::ALL {
            registry.insert_descriptor(provider.descriptor());
        }
        registry
    }

    pub fn insert_descriptor(&mut self, descriptor: ProviderDescriptor) {
        self.descriptors.insert(descriptor.id.clone(), descriptor);
    }

    pub fn insert_credential(&mut self, provider_id: impl Into<String>, credential: Credential) {
        self.credentials.insert(provider_id.into(), credential);
    }

    pub fn descriptor(&self, provider_id: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.get(provider_id)
    }

    /**
     * \brief 解析描述与凭证：未知 ID 优先报 UnknownProvider，其次 MissingCredential。
     */
    pub fn resolve(
        &self,
        provider_id: &str,
    ) -> Result<(&ProviderDescriptor, &Credential), QueryError> {
        let descriptor = self
            .descriptors
            .get(provider_id)
            .ok_or_else(|| QueryError::UnknownProvider(provider_id.to_string()))?;
        let credential = self
            .credentials
            .get(provider_id)
            .ok_or_else(|| QueryError::MissingCredential(provider_id.to_string()))?;
        Ok((descriptor, credential))
    }
}
