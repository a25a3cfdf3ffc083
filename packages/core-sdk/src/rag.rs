use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::GatewayError, models::ContextSnippet};

/** \brief 未指定数量时返回的片段数。 */
pub const DEFAULT_CONTEXT_LIMIT: u32 = 5;

#[derive(Debug, Serialize)]
struct ContextQuery<'a> {
    query: &'a str,
    limit: u32,
}

/**
 * \brief 检索服务响应体，也是 `/api/v1/context` 的返回结构。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub results: Vec<ContextSnippet>,
}

/** \brief `"results": null` 按空列表处理。 */
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ContextSnippet>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ContextSnippet>>::deserialize(deserializer)?.unwrap_or_default())
}

/**
 * \brief 外部检索服务客户端。
 */
#[derive(Debug, Clone)]
pub struct RagClient {
    base_url: String,
    http: reqwest::Client,
}

impl RagClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder().build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /**
     * \brief 查询上下文片段，保持检索服务返回的顺序。
     * \param limit 为 0 时使用默认值 5
     */
    pub async fn get_context(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ContextSnippet>, GatewayError> {
        let limit = if limit == 0 {
            DEFAULT_CONTEXT_LIMIT
        } else {
            limit
        };
        let url = format!("{}/api/v1/context", self.base_url.trim_end_matches('/'));

        let resp = self
            .http
            .post(url)
            .json(&ContextQuery { query, limit })
            .send()
            .await
            .map_err(|e| GatewayError::Retrieval(format!("failed to call RAG service: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Retrieval(format!(
                "RAG service error: {} -> {}",
                status, text
            )));
        }

        let body: ContextResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Retrieval(format!("failed to decode response: {}", e)))?;
        Ok(body.results)
    }
}

/**
 * \brief 按原顺序拼接片段内容，每段后追加一个空行。
 */
pub fn join_snippets(snippets: &[ContextSnippet]) -> String {
    snippets
        .iter()
        .map(|s| format!("{}\n\n", s.content))
        .collect()
}
