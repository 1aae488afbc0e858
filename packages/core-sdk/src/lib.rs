pub mod adapter;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod transport;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::adapter::ProviderRequestAdapter;
    pub use crate::config::{AdapterConfig, AppConfig};
    pub use crate::error::QueryError;
    pub use crate::models::{
        AuthScheme, Credential, GenerationParams, ProviderDescriptor, QueryOutcome, QueryRequest,
        QueryResult, RequestShape, ResponseShape,
    };
    pub use crate::providers::{PredefinedProvider, ProviderRegistry};
    pub use crate::service::QueryService;
    pub use crate::store::{MemoryStore, SettingsStore};
    pub use crate::transport::{HttpTransport, ReqwestTransport};
}
