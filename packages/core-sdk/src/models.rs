use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/** \brief 未设置（或为 0）时使用的默认采样温度。 */
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/** \brief 未设置（或为 0）时使用的默认最大输出 token 数。 */
pub const DEFAULT_MAX_TOKENS: i64 = 2000;

/**
 * \brief 上游 LLM Provider 类型，顺序即凭据解析优先级。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAI,
    Claude,
}

impl ProviderKind {
    /** \brief 凭据解析顺序：Gemini → OpenAI → Claude。 */
    pub const PRECEDENCE: [ProviderKind; 3] =
        [ProviderKind::Gemini, ProviderKind::OpenAI, ProviderKind::Claude];

    /** \brief 读取该 Provider 密钥的环境变量名。 */
    pub fn env_var(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Claude => "CLAUDE_API_KEY",
        }
    }

    /** \brief 请求上游时使用的模型标识。 */
    pub fn model_id(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini-2.0-flash-exp",
            ProviderKind::OpenAI => "gpt-4o-mini",
            ProviderKind::Claude => "claude-3-5-sonnet-20241022",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Claude => "claude",
        };
        f.write_str(name)
    }
}

/**
 * \brief 当前进程生效的 Provider 凭据。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    pub kind: ProviderKind,
    pub secret: String,
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("kind", &self.kind)
            .field("secret", &"***")
            .finish()
    }
}

/**
 * \brief 已补全默认值的生成请求。
 * \details 只能通过 `new` 构造，保证交给 Provider 的温度与 token 上限都已确定。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    context: String,
    temperature: f64,
    max_tokens: i64,
}

impl GenerationRequest {
    /**
     * \brief 构造请求并应用默认值；数值不做上限校验，原样透传。
     */
    pub fn new(
        prompt: impl Into<String>,
        context: impl Into<String>,
        temperature: Option<f64>,
        max_tokens: Option<i64>,
    ) -> Self {
        let temperature = match temperature {
            Some(t) if t != 0.0 => t,
            _ => DEFAULT_TEMPERATURE,
        };
        let max_tokens = match max_tokens {
            Some(n) if n != 0 => n,
            _ => DEFAULT_MAX_TOKENS,
        };
        Self {
            prompt: prompt.into(),
            context: context.into(),
            temperature,
            max_tokens,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn max_tokens(&self) -> i64 {
        self.max_tokens
    }
}

/**
 * \brief 生成结果：`explanation` 为完整原始回复，`code` 为抽取出的代码。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub code: String,
    pub explanation: String,
}

/**
 * \brief 检索服务返回的上下文片段。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/**
 * \brief 上下文获取情况，通过 `x-context-status` 响应头暴露给调用方。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /** \brief 请求未携带查询。 */
    Skipped,
    /** \brief 已拼接检索片段。 */
    Applied,
    /** \brief 检索服务正常返回但没有片段。 */
    Empty,
    /** \brief 检索失败，按无上下文继续生成。 */
    Unavailable,
}

impl ContextStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextStatus::Skipped => "skipped",
            ContextStatus::Applied => "applied",
            ContextStatus::Empty => "empty",
            ContextStatus::Unavailable => "unavailable",
        }
    }
}

/**
 * \brief API Key 记录。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    /** \brief 创建时间（Unix 秒） */
    pub created_at: i64,
}

/**
 * \brief 用户公开信息，不含密码。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

/**
 * \brief OpenAI 兼容的 chat completion 请求。
 */
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/**
 * \brief OpenAI 兼容的 chat completion 响应外壳，仅包装 `GenerationResult`。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}
