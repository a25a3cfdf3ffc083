use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/**
 * \brief 日志输出格式，由 `LOG_FORMAT` 决定。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/**
 * \brief 初始化全局 tracing 订阅者，重复调用只生效一次。
 * \details 过滤规则取自 `RUST_LOG`，缺省为 `info`。
 */
pub fn init(format: LogFormat) -> Result<()> {
    INITIALIZED
        .get_or_try_init(|| {
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .map_err(|e| anyhow!("invalid log filter: {}", e))?;
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true);
            let installed = match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Text => builder.try_init(),
            };
            installed.map_err(|e| anyhow!("telemetry init failed: {}", e))
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
    }
}
