use std::fmt;

use serde::{Deserialize, Serialize};

/** \brief 自定义 Provider ID 前缀。 */
pub const CUSTOM_PREFIX: &str = "custom_";

/** \brief 凭证在界面上的固定掩码，不随真实长度变化。 */
pub const CREDENTIAL_MASK: &str = "********";

/**
 * \brief 若 `base` 已被占用，依次追加 `_2`、`_3`… 直到不冲突。
 */
pub fn unique_id(base: String, taken: &[String]) -> String {
    if !taken.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/**
 * \brief Provider 来源：内置或用户自定义。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Predefined,
    Custom,
}

impl ProviderKind {
    /**
     * \brief 根据 ID 前缀判断 Provider 来源。
     */
    pub fn from_id(id: &str) -> Self {
        if id.starts_with(CUSTOM_PREFIX) {
            ProviderKind::Custom
        } else {
            ProviderKind::Predefined
        }
    }
}

/**
 * \brief 鉴权方式，每次请求只会附加其中一种。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /** \brief `Authorization: Bearer <key>` */
    Bearer,
    /** \brief `x-api-key: <key>` */
    XApiKey,
    /** \brief 自定义请求头名称 */
    Header { name: String },
    /** \brief URL 查询参数 */
    QueryParam { name: String },
}

/**
 * \brief 请求体格式。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestShape {
    OpenAiChat,
    TogetherCompletion {
        /** \brief 是否以 `<s>[INST] ... [/INST]` 包裹提示词 */
        #[serde(default)]
        instruct_tags: bool,
    },
    AnthropicMessages,
    GeminiGenerate,
    /** \brief 原样保存的 JSON 模板，调用时替换 `{{placeholder}}` */
    CustomTemplate { template: String },
}

/**
 * \brief 响应体格式；内置格式隐含固定的提取路径。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseShape {
    OpenAiChat,
    TogetherCompletion,
    AnthropicMessages,
    GeminiGenerate,
    CustomPath { path: String },
}

impl ResponseShape {
    /**
     * \brief 返回用于提取回答文本的点分路径。
     */
    pub fn path(&self) -> &str {
        match self {
            ResponseShape::OpenAiChat => "choices.0.message.content",
            ResponseShape::TogetherCompletion => "choices.0.text",
            ResponseShape::AnthropicMessages => "content.0.text",
            ResponseShape::GeminiGenerate => "candidates.0.content.parts.0.text",
            ResponseShape::CustomPath { path } => path,
        }
    }
}

/**
 * \brief 生成参数，同时作为模板占位符的取值来源。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model_name: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model_name: "default".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/**
 * \brief 单个 LLM 后端的完整描述。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /** \brief 稳定 ID，如 openai / custom_my_llm */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 请求地址 */
    pub endpoint: String,
    pub auth: AuthScheme,
    pub request: RequestShape,
    pub response: ResponseShape,
    #[serde(default)]
    pub params: GenerationParams,
}

impl ProviderDescriptor {
    pub fn kind(&self) -> ProviderKind {
        ProviderKind::from_id(&self.id)
    }

    /**
     * \brief 校验描述是否可用于发起请求；返回第一条违反的约束。
     */
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err(format!("provider {} has no endpoint", self.id));
        }
        match &self.auth {
            AuthScheme::Header { name } | AuthScheme::QueryParam { name }
                if name.trim().is_empty() =>
            {
                return Err(format!("provider {} has an empty auth name", self.id));
            }
            _ => {}
        }
        if let RequestShape::CustomTemplate { template } = &self.request {
            if template.trim().is_empty() {
                return Err(format!("provider {} has an empty request template", self.id));
            }
        }
        if let ResponseShape::CustomPath { path } = &self.response {
            if path.trim().is_empty() {
                return Err(format!("provider {} has an empty response path", self.id));
            }
        }
        Ok(())
    }
}

/**
 * \brief API 凭证。Debug 输出始终为掩码，原文只能通过 `expose` 读取。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /**
     * \brief 构造凭证；空白字符串视为未配置。
     */
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn masked(&self) -> &'static str {
        CREDENTIAL_MASK
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", CREDENTIAL_MASK)
    }
}

/**
 * \brief 一次逻辑查询：提示词 + 选中文本 + 目标 Provider。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub provider_id: String,
    pub instruction_prompt: String,
    pub selected_text: String,
}

impl QueryRequest {
    pub fn new(
        provider_id: impl Into<String>,
        instruction_prompt: impl Into<String>,
        selected_text: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            instruction_prompt: instruction_prompt.into(),
            selected_text: selected_text.into(),
        }
    }

    /**
     * \brief 拼接发送给模型的完整文本：`<prompt>:\n\n<selectedText>`。
     */
    pub fn combined_text(&self) -> String {
        format!("{}:\n\n{}", self.instruction_prompt, self.selected_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub text: String,
}

/**
 * \brief 面向调用方的结果：`{success:true, answer}` 或 `{success:false, error}`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn success(answer: impl Into<String>) -> Self {
        Self {
            success: true,
            answer: Some(answer.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            answer: None,
            error: Some(error.into()),
        }
    }
}

/**
 * \brief 历史记录条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /** \brief RFC 3339 时间戳 */
    pub timestamp: String,
    pub provider_id: String,
    pub prompt: String,
    /** \brief 用户选中的文本 */
    pub query: String,
    pub response: String,
}
