pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod prompt;
pub mod rag;
pub mod server;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::db::{KeyStore, SqliteStore};
    pub use crate::error::{AuthError, GatewayError, ParseError};
    pub use crate::models::{GenerationRequest, GenerationResult, ProviderKind};
    pub use crate::pipeline::GenerationPipeline;
    pub use crate::server;
    pub use crate::telemetry;
}
