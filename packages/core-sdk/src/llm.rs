use std::time::Duration;

use anyhow::Result;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{
    error::GatewayError,
    models::{GenerationRequest, ProviderCredential, ProviderKind},
    normalize::RawReply,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:generateContent";
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const CLAUDE_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/**
 * \brief 各 Provider 的请求地址，默认即官方固定地址。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub gemini: String,
    pub openai: String,
    pub claude: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            gemini: GEMINI_ENDPOINT.to_string(),
            openai: OPENAI_ENDPOINT.to_string(),
            claude: CLAUDE_ENDPOINT.to_string(),
        }
    }
}

impl ProviderEndpoints {
    fn url(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::Claude => &self.claude,
        }
    }
}

/**
 * \brief 上游 LLM 客户端：构造各 Provider 的请求体并返回原始回复。
 * \details 不重试；`timeout` 为 None 时请求可无限期等待。
 */
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoints: ProviderEndpoints,
}

impl LlmClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        Self::with_endpoints(ProviderEndpoints::default(), timeout)
    }

    pub fn with_endpoints(
        endpoints: ProviderEndpoints,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(Self {
            http: builder.build()?,
            endpoints,
        })
    }

    /**
     * \brief 发送一次生成请求。
     * \param prompt 已组装好的完整提示词
     */
    pub async fn send(
        &self,
        credential: &ProviderCredential,
        prompt: &str,
        request: &GenerationRequest,
    ) -> Result<RawReply, GatewayError> {
        let kind = credential.kind;
        let url = self.endpoints.url(kind);
        let body = request_body(kind, prompt, request.temperature(), request.max_tokens());

        let builder = match kind {
            ProviderKind::Gemini => self
                .http
                .post(url)
                .query(&[("key", credential.secret.as_str())])
                .header(CONTENT_TYPE, "application/json"),
            ProviderKind::OpenAI => self
                .http
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {}", credential.secret)),
            ProviderKind::Claude => self.http.post(url).headers(claude_headers(&credential.secret)?),
        };

        tracing::debug!(provider = %kind, prompt_len = prompt.len(), "sending generation request");
        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(kind, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(kind, e))?;

        if !status.is_success() {
            tracing::error!(provider = %kind, status = status.as_u16(), "provider request failed");
            return Err(GatewayError::Upstream {
                provider: kind,
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(RawReply::parse(kind, &text)?)
    }
}

/**
 * \brief 按 Provider 构造请求体，字段名与嵌套结构各不相同。
 */
pub fn request_body(kind: ProviderKind, prompt: &str, temperature: f64, max_tokens: i64) -> Value {
    match kind {
        ProviderKind::Gemini => json!({
            "contents": [
                { "parts": [{ "text": prompt }] }
            ],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
            }
        }),
        ProviderKind::OpenAI => json!({
            "model": kind.model_id(),
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": temperature,
            "max_tokens": max_tokens,
        }),
        ProviderKind::Claude => json!({
            "model": kind.model_id(),
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{ "role": "user", "content": prompt }],
        }),
    }
}

/** \brief Gemini 的密钥位于 URL 中，错误信息里去掉 URL。 */
fn transport_error(kind: ProviderKind, err: reqwest::Error) -> GatewayError {
    tracing::error!(provider = %kind, timeout = err.is_timeout(), "provider request did not complete");
    GatewayError::Transport {
        provider: kind,
        source: err.without_url(),
    }
}

fn claude_headers(secret: &str) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-api-key",
        HeaderValue::from_str(secret).map_err(|_| GatewayError::Configuration)?,
    );
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    Ok(headers)
}
