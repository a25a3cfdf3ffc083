use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::{
    models::{ProviderCredential, ProviderKind},
    prompt::TargetLanguage,
};

pub const DEFAULT_RAG_SERVICE_URL: &str = "http://localhost:8000";
pub const DEFAULT_PORT: u16 = 8080;

/**
 * \brief 数据库连接参数；内置的 SQLite 存储只使用 `name` 作为文件名。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub port: String,
}

impl DatabaseConfig {
    /** \brief SQLite 数据库文件路径。 */
    pub fn sqlite_path(&self) -> String {
        format!("{}.db", self.name)
    }

    /** \brief 可写入日志的描述，不包含密码。 */
    pub fn describe(&self) -> String {
        format!(
            "host={} port={} user={} name={}",
            self.host, self.port, self.user, self.name
        )
    }
}

/**
 * \brief 网关启动配置，进程启动时解析一次后显式传递。
 */
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /** \brief 生效的 Provider 凭据；为空时生成请求返回配置错误。 */
    pub credential: Option<ProviderCredential>,
    pub rag_service_url: String,
    pub port: u16,
    pub database: DatabaseConfig,
    /** \brief Provider 请求超时；None 表示不设超时。 */
    pub provider_timeout: Option<Duration>,
    pub language: TargetLanguage,
}

impl GatewayConfig {
    /**
     * \brief 从进程环境变量读取配置。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /**
     * \brief 从任意键值来源读取配置，空白值视为未设置。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or_default = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid PORT value: {}", raw))?,
            None => DEFAULT_PORT,
        };

        let provider_timeout = match get("PROVIDER_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid PROVIDER_TIMEOUT_SECS value: {}", raw))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        let language = get("TARGET_LANGUAGE")
            .map(TargetLanguage::new)
            .unwrap_or_default();

        Ok(Self {
            credential: resolve_credential(&lookup),
            rag_service_url: or_default("RAG_SERVICE_URL", DEFAULT_RAG_SERVICE_URL),
            port,
            database: DatabaseConfig {
                host: or_default("DB_HOST", "localhost"),
                user: or_default("DB_USER", "postgres"),
                password: or_default("DB_PASSWORD", "postgres"),
                name: or_default("DB_NAME", "codegate"),
                port: or_default("DB_PORT", "5432"),
            },
            provider_timeout,
            language,
        })
    }

    /** \brief 监听地址。 */
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/**
 * \brief 按固定顺序（Gemini → OpenAI → Claude）挑选第一个非空密钥。
 */
pub fn resolve_credential<F>(lookup: F) -> Option<ProviderCredential>
where
    F: Fn(&str) -> Option<String>,
{
    ProviderKind::PRECEDENCE.iter().find_map(|kind| {
        lookup(kind.env_var())
            .filter(|secret| !secret.trim().is_empty())
            .map(|secret| ProviderCredential {
                kind: *kind,
                secret,
            })
    })
}
