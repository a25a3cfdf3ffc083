use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::ProviderKind;

/**
 * \brief 鉴权失败原因，均映射为 401。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("API key required")]
    Missing,
    #[error("Invalid API key")]
    Invalid,
    #[error("invalid username or password")]
    BadCredentials,
}

/**
 * \brief Provider 回复结构不符合预期，`path` 指明出错的 JSON 路径。
 */
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse {provider} response: {source}")]
    InvalidJson {
        provider: ProviderKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{provider} response is missing `{path}`")]
    MissingField {
        provider: ProviderKind,
        path: &'static str,
    },
    #[error("{provider} response field `{path}` is not {expected}")]
    WrongType {
        provider: ProviderKind,
        path: &'static str,
        expected: &'static str,
    },
    #[error("{provider} response field `{path}` is empty")]
    EmptyArray {
        provider: ProviderKind,
        path: &'static str,
    },
}

impl ParseError {
    /** \brief 出错的 JSON 路径；整体无法解析时返回 None。 */
    pub fn path(&self) -> Option<&'static str> {
        match self {
            ParseError::InvalidJson { .. } => None,
            ParseError::MissingField { path, .. }
            | ParseError::WrongType { path, .. }
            | ParseError::EmptyArray { path, .. } => Some(path),
        }
    }
}

/**
 * \brief 网关统一错误类型，在请求边界转换为 JSON 响应。
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    NotFound(String),
    #[error("no LLM provider API key configured")]
    Configuration,
    #[error("{provider} API error: {body}")]
    Upstream {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider} API error: {source}")]
    Transport {
        provider: ProviderKind,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("retrieval service error: {0}")]
    Retrieval(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Configuration
            | GatewayError::Upstream { .. }
            | GatewayError::Transport { .. }
            | GatewayError::Parse(_)
            | GatewayError::Retrieval(_)
            | GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            GatewayError::Upstream {
                provider,
                status: upstream_status,
                body,
            } => json!({
                "error": self.to_string(),
                "provider": provider,
                "upstream_status": upstream_status,
                "upstream_body": body,
            }),
            GatewayError::Parse(err) => json!({
                "error": self.to_string(),
                "field": err.path(),
            }),
            GatewayError::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                json!({ "error": "internal storage error" })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
