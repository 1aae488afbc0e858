use thiserror::Error;

/**
 * \brief 单次查询的错误分类，所有错误都只影响当前调用。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("API key not configured for {0}")]
    MissingCredential(String),

    #[error("invalid provider configuration: {0}")]
    InvalidDescriptor(String),

    #[error("request template error: {0}")]
    TemplateError(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("rate limited (429) after {attempts} attempt(s): {message}")]
    RateLimited { attempts: u32, message: String },

    #[error("response did not contain text at `{path}`")]
    ResponseShapeMismatch { path: String },

    #[error("provider error ({status}): {message}")]
    ProviderError { status: u16, message: String },
}

impl QueryError {
    /**
     * \brief 根据非 2xx 状态码归类错误。429 的尝试次数由重试层补全。
     */
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => QueryError::Unauthorized { status, message },
            429 => QueryError::RateLimited {
                attempts: 1,
                message,
            },
            _ => QueryError::ProviderError { status, message },
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, QueryError::RateLimited { .. })
    }

    /**
     * \brief 生成给用户看的错误文本，`console` 为 Provider 控制台地址（若已知）。
     */
    pub fn user_message(&self, provider_name: &str, console: Option<&str>) -> String {
        match (self, console) {
            (QueryError::RateLimited { .. }, Some(site)) => format!(
                "{} ({}): too many requests. This can be caused by exceeding the request limit, \
                 an insufficient account balance or a problem with your API key. Please check your account on {}.",
                self, provider_name, site
            ),
            (QueryError::RateLimited { .. }, None) => format!(
                "{} ({}): too many requests, please wait a moment and try again.",
                self, provider_name
            ),
            (QueryError::Unauthorized { .. }, Some(site)) => format!(
                "{} ({}): the API key was rejected. Please verify it on {} and save it again in the options.",
                self, provider_name, site
            ),
            (QueryError::Unauthorized { .. }, None) | (QueryError::MissingCredential(_), _) => {
                format!(
                    "{}. Please configure the API key in the extension options.",
                    self
                )
            }
            _ => self.to_string(),
        }
    }
}
