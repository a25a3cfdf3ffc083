use anyhow::Result;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    error::GatewayError,
    extract::extract_code,
    llm::LlmClient,
    models::{
        ChatChoice, ChatCompletion, ChatCompletionRequest, ChatMessage, ContextStatus,
        GenerationRequest, GenerationResult, ProviderCredential,
    },
    normalize::extract_text,
    prompt::{build_prompt, TargetLanguage},
    rag::{join_snippets, RagClient, DEFAULT_CONTEXT_LIMIT},
};

/**
 * \brief 一次生成的结果与上下文获取情况。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub result: GenerationResult,
    pub context_status: ContextStatus,
}

/**
 * \brief 代码生成流水线：上下文检索 → 提示词 → Provider → 文本抽取 → 代码抽取。
 * \details 凭据在启动时确定并通过构造函数传入；为空时每次生成都返回配置错误。
 */
#[derive(Debug, Clone)]
pub struct GenerationPipeline {
    credential: Option<ProviderCredential>,
    llm: LlmClient,
    rag: RagClient,
    language: TargetLanguage,
}

impl GenerationPipeline {
    pub fn new(
        credential: Option<ProviderCredential>,
        llm: LlmClient,
        rag: RagClient,
        language: TargetLanguage,
    ) -> Self {
        Self {
            credential,
            llm,
            rag,
            language,
        }
    }

    /**
     * \brief 按启动配置构造，Provider 地址使用官方固定地址。
     */
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self::new(
            config.credential.clone(),
            LlmClient::new(config.provider_timeout)?,
            RagClient::new(config.rag_service_url.clone())?,
            config.language.clone(),
        ))
    }

    pub fn credential(&self) -> Option<&ProviderCredential> {
        self.credential.as_ref()
    }

    pub fn rag(&self) -> &RagClient {
        &self.rag
    }

    /**
     * \brief 获取并拼接上下文；检索失败时降级为空上下文，不中断生成。
     */
    pub async fn gather_context(&self, query: Option<&str>) -> (String, ContextStatus) {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return (String::new(), ContextStatus::Skipped);
        };
        match self.rag.get_context(query, DEFAULT_CONTEXT_LIMIT).await {
            Ok(snippets) if snippets.is_empty() => (String::new(), ContextStatus::Empty),
            Ok(snippets) => (join_snippets(&snippets), ContextStatus::Applied),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    rag = self.rag.base_url(),
                    "context retrieval failed, generating without context"
                );
                (String::new(), ContextStatus::Unavailable)
            }
        }
    }

    /**
     * \brief 对已补全默认值的请求执行一次生成。
     */
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GatewayError> {
        let prompt = build_prompt(&self.language, request.prompt(), request.context());
        let credential = self.credential.as_ref().ok_or(GatewayError::Configuration)?;

        let reply = self.llm.send(credential, &prompt, request).await?;
        let text = extract_text(&reply).inspect_err(|err| {
            tracing::error!(provider = %credential.kind, error = %err, "unexpected provider reply shape")
        })?;
        let code = extract_code(&text, self.language.fence_tag());
        tracing::info!(
            provider = %credential.kind,
            reply_len = text.len(),
            code_len = code.len(),
            "generation completed"
        );
        Ok(GenerationResult {
            code,
            explanation: text,
        })
    }

    /**
     * \brief `/generate` 入口：可选检索后生成。
     */
    pub async fn generate_for_query(
        &self,
        prompt: &str,
        query: Option<&str>,
        temperature: Option<f64>,
        max_tokens: Option<i64>,
    ) -> Result<Generation, GatewayError> {
        let (context, context_status) = self.gather_context(query).await;
        let request = GenerationRequest::new(prompt, context, temperature, max_tokens);
        let result = self.generate(&request).await?;
        Ok(Generation {
            result,
            context_status,
        })
    }

    /**
     * \brief OpenAI 兼容入口：以最后一条用户消息为提示词与检索查询，结果包装为 chat completion。
     */
    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<(ChatCompletion, ContextStatus), GatewayError> {
        let last = request
            .messages
            .last()
            .ok_or_else(|| GatewayError::Validation("messages array cannot be empty".into()))?;
        if last.role != "user" {
            return Err(GatewayError::Validation(
                "last message must be from user".into(),
            ));
        }

        let generation = self
            .generate_for_query(
                &last.content,
                Some(&last.content),
                request.temperature,
                request.max_tokens,
            )
            .await?;

        let model = request
            .model
            .filter(|m| !m.is_empty())
            .or_else(|| self.credential.as_ref().map(|c| c.kind.model_id().to_string()))
            .unwrap_or_default();

        Ok((
            wrap_chat_completion(model, generation.result),
            generation.context_status,
        ))
    }
}

/**
 * \brief 将生成结果包装为 OpenAI chat completion 结构。
 */
pub fn wrap_chat_completion(model: String, result: GenerationResult) -> ChatCompletion {
    ChatCompletion {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: format!("{}\n\n{}", result.code, result.explanation),
            },
            finish_reason: "stop".to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{llm::ProviderEndpoints, models::ProviderKind};
    use axum::{extract::Query, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn endpoints(base: &str) -> ProviderEndpoints {
        ProviderEndpoints {
            gemini: format!("{}/gemini", base),
            openai: format!("{}/openai", base),
            claude: format!("{}/claude", base),
        }
    }

    fn dead_rag() -> RagClient {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        RagClient::new(format!("http://{}", addr)).expect("rag")
    }

    fn pipeline(
        kind: Option<ProviderKind>,
        base: &str,
        rag: RagClient,
        timeout: Option<Duration>,
    ) -> GenerationPipeline {
        GenerationPipeline::new(
            kind.map(|kind| ProviderCredential {
                kind,
                secret: "secret-1".to_string(),
            }),
            LlmClient::with_endpoints(endpoints(base), timeout).expect("llm"),
            rag,
            TargetLanguage::default(),
        )
    }

    /** \brief 记录收到的请求体并按 Provider 返回固定回复。 */
    fn fake_providers(seen: Arc<Mutex<Vec<Value>>>) -> Router {
        let gemini_seen = seen.clone();
        let openai_seen = seen.clone();
        let claude_seen = seen;
        Router::new()
            .route(
                "/gemini",
                post(
                    move |Query(q): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
                        assert_eq!(q.get("key").map(String::as_str), Some("secret-1"));
                        gemini_seen.lock().expect("lock").push(body);
                        Json(json!({"candidates": [{"content": {"parts": [
                            {"text": "Here you go:\n```motoko\nactor { public func add(a : Nat, b : Nat) : async Nat { a + b } }\n```\nEnjoy."}
                        ]}}]}))
                    },
                ),
            )
            .route(
                "/openai",
                post(move |headers: axum::http::HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(
                        headers.get("authorization").and_then(|v| v.to_str().ok()),
                        Some("Bearer secret-1")
                    );
                    openai_seen.lock().expect("lock").push(body);
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": "plain answer"}}]}))
                }),
            )
            .route(
                "/claude",
                post(move |headers: axum::http::HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(
                        headers.get("x-api-key").and_then(|v| v.to_str().ok()),
                        Some("secret-1")
                    );
                    assert_eq!(
                        headers.get("anthropic-version").and_then(|v| v.to_str().ok()),
                        Some("2023-06-01")
                    );
                    claude_seen.lock().expect("lock").push(body);
                    Json(json!({"content": [{"type": "text", "text": "```\nlet x = 1;\n```"}]}))
                }),
            )
    }

    #[tokio::test]
    async fn test_gemini_generation_extracts_code_and_keeps_full_reply() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn(fake_providers(seen.clone())).await;
        let p = pipeline(Some(ProviderKind::Gemini), &base, dead_rag(), None);

        let out = p
            .generate_for_query("add two numbers", None, Some(0.0), None)
            .await
            .expect("generate");
        assert_eq!(
            out.result.code,
            "actor { public func add(a : Nat, b : Nat) : async Nat { a + b } }"
        );
        assert!(out.result.explanation.starts_with("Here you go:"));
        assert!(out.result.explanation.ends_with("Enjoy."));
        assert_eq!(out.context_status, ContextStatus::Skipped);

        let bodies = seen.lock().expect("lock");
        assert_eq!(bodies[0]["generationConfig"]["temperature"], 0.7);
        assert_eq!(bodies[0]["generationConfig"]["maxOutputTokens"], 2000);
        assert_eq!(
            bodies[0]["contents"][0]["parts"][0]["text"],
            "Generate Motoko code for the following request:\n\nadd two numbers\n\nProvide complete, working Motoko code."
        );
    }

    #[tokio::test]
    async fn test_openai_and_claude_paths_share_prompt_template() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn(fake_providers(seen.clone())).await;

        let openai = pipeline(Some(ProviderKind::OpenAI), &base, dead_rag(), None);
        let out = openai
            .generate_for_query("a counter", None, Some(0.3), Some(100))
            .await
            .expect("openai");
        assert_eq!(out.result.code, "plain answer");

        let claude = pipeline(Some(ProviderKind::Claude), &base, dead_rag(), None);
        let out = claude
            .generate_for_query("a counter", None, None, None)
            .await
            .expect("claude");
        assert_eq!(out.result.code, "let x = 1;");

        let bodies = seen.lock().expect("lock");
        assert_eq!(bodies[0]["temperature"], 0.3);
        assert_eq!(bodies[0]["max_tokens"], 100);
        assert_eq!(bodies[1]["max_tokens"], 2000);
        assert_eq!(
            bodies[0]["messages"][0]["content"],
            bodies[1]["messages"][0]["content"]
        );
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let p = pipeline(None, "http://127.0.0.1:9", dead_rag(), None);
        let err = p
            .generate_for_query("add two numbers", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration));
    }

    #[tokio::test]
    async fn test_retrieval_failure_fails_open() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn(fake_providers(seen.clone())).await;
        let p = pipeline(Some(ProviderKind::OpenAI), &base, dead_rag(), None);

        let out = p
            .generate_for_query("a counter", Some("counter actor"), None, None)
            .await
            .expect("generation proceeds");
        assert_eq!(out.context_status, ContextStatus::Unavailable);
        let bodies = seen.lock().expect("lock");
        let prompt = bodies[0]["messages"][0]["content"].as_str().expect("prompt");
        assert!(prompt.starts_with("Generate Motoko code"));
    }

    #[tokio::test]
    async fn test_retrieved_context_is_prepended() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn(fake_providers(seen.clone())).await;
        let rag_base = spawn(Router::new().route(
            "/api/v1/context",
            post(|| async {
                Json(json!({"results": [
                    {"content": "stable var x = 0;", "source": "a", "score": 0.9},
                    {"content": "actor Counter {}", "source": "b", "score": 0.8}
                ]}))
            }),
        ))
        .await;
        let p = pipeline(
            Some(ProviderKind::OpenAI),
            &base,
            RagClient::new(rag_base).expect("rag"),
            None,
        );

        let out = p
            .generate_for_query("a counter", Some("counter"), None, None)
            .await
            .expect("generate");
        assert_eq!(out.context_status, ContextStatus::Applied);
        let bodies = seen.lock().expect("lock");
        let prompt = bodies[0]["messages"][0]["content"].as_str().expect("prompt");
        assert!(prompt.starts_with(
            "Context from Motoko documentation:\n\nstable var x = 0;\n\nactor Counter {}\n\n\n\nGenerate"
        ));
    }

    #[tokio::test]
    async fn test_query_reaches_retrieval_untrimmed() {
        let queries = Arc::new(Mutex::new(Vec::new()));
        let recorded = queries.clone();
        let rag_base = spawn(Router::new().route(
            "/api/v1/context",
            post(move |Json(body): Json<Value>| async move {
                recorded.lock().expect("lock").push(body["query"].clone());
                Json(json!({"results": []}))
            }),
        ))
        .await;
        let p = pipeline(None, "http://unused", RagClient::new(rag_base).expect("rag"), None);

        let (context, status) = p.gather_context(Some("  stable memory\n")).await;
        assert_eq!(status, ContextStatus::Empty);
        assert!(context.is_empty());
        assert_eq!(*queries.lock().expect("lock"), vec![json!("  stable memory\n")]);

        let (_, status) = p.gather_context(Some(" \t ")).await;
        assert_eq!(status, ContextStatus::Skipped);
        assert_eq!(queries.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_carries_body() {
        let base = spawn(Router::new().route(
            "/openai",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"message":"quota exceeded"}}"#,
                )
            }),
        ))
        .await;
        let p = pipeline(Some(ProviderKind::OpenAI), &base, dead_rag(), None);
        let err = p.generate_for_query("x", None, None, None).await.unwrap_err();
        match err {
            GatewayError::Upstream {
                provider,
                status,
                body,
            } => {
                assert_eq!(provider, ProviderKind::OpenAI);
                assert_eq!(status, 429);
                assert_eq!(body, r#"{"error":{"message":"quota exceeded"}}"#);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_parse_error() {
        let base = spawn(Router::new().route(
            "/gemini",
            post(|| async { Json(json!({"promptFeedback": {"blockReason": "SAFETY"}})) }),
        ))
        .await;
        let p = pipeline(Some(ProviderKind::Gemini), &base, dead_rag(), None);
        let err = p.generate_for_query("x", None, None, None).await.unwrap_err();
        match err {
            GatewayError::Parse(parse) => assert_eq!(parse.path(), Some("candidates")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn hanging_provider() -> Router {
        Router::new().route(
            "/claude",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "never"
            }),
        )
    }

    #[tokio::test]
    async fn test_hung_upstream_blocks_without_timeout() {
        let base = spawn(hanging_provider()).await;
        let p = pipeline(Some(ProviderKind::Claude), &base, dead_rag(), None);
        let waited = tokio::time::timeout(
            Duration::from_millis(300),
            p.generate_for_query("x", None, None, None),
        )
        .await;
        assert!(waited.is_err(), "call should still be pending");
    }

    #[tokio::test]
    async fn test_configured_timeout_bounds_hung_upstream() {
        let base = spawn(hanging_provider()).await;
        let p = pipeline(
            Some(ProviderKind::Claude),
            &base,
            dead_rag(),
            Some(Duration::from_millis(200)),
        );
        let err = p.generate_for_query("x", None, None, None).await.unwrap_err();
        match err {
            GatewayError::Transport { provider, source } => {
                assert_eq!(provider, ProviderKind::Claude);
                assert!(source.is_timeout());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_completion_validates_and_wraps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn(fake_providers(seen)).await;
        let p = pipeline(Some(ProviderKind::Claude), &base, dead_rag(), None);

        let empty = ChatCompletionRequest {
            model: None,
            messages: vec![],
            temperature: None,
            max_tokens: None,
        };
        assert!(matches!(
            p.chat_completion(empty).await.unwrap_err(),
            GatewayError::Validation(_)
        ));

        let not_user = ChatCompletionRequest {
            model: None,
            messages: vec![ChatMessage {
                role: "assistant".into(),
                content: "hi".into(),
            }],
            temperature: None,
            max_tokens: None,
        };
        assert!(matches!(
            p.chat_completion(not_user).await.unwrap_err(),
            GatewayError::Validation(_)
        ));

        let ok = ChatCompletionRequest {
            model: None,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: "be terse".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: "a counter".into(),
                },
            ],
            temperature: None,
            max_tokens: None,
        };
        let (completion, status) = p.chat_completion(ok).await.expect("completion");
        assert_eq!(status, ContextStatus::Unavailable);
        assert!(completion.id.starts_with("chatcmpl-"));
        assert!(!completion.id.starts_with("chatcmpl-chatcmpl-"));
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "claude-3-5-sonnet-20241022");
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.choices[0].message.role, "assistant");
        assert_eq!(
            completion.choices[0].message.content,
            "let x = 1;\n\n```\nlet x = 1;\n```"
        );
    }
}
