use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use codegate_core_sdk::{
    auth,
    config::GatewayConfig,
    db::{KeyStore, SqliteStore},
    pipeline::GenerationPipeline,
    server, telemetry,
};

/**
 * \brief CLI 程序入口：启动网关、单次生成与初始化账号。
 */
#[derive(Parser, Debug)]
#[command(name = "codegate", version, about = "CodeGate code-generation gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 网关服务。
     */
    Serve {
        /// 监听地址，缺省为 0.0.0.0:$PORT
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 执行一次代码生成并打印代码。
     */
    Generate {
        #[arg(long)]
        prompt: String,
        /// 可选的检索查询
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<i64>,
        /// 同时打印完整回复
        #[arg(long, default_value_t = false)]
        explain: bool,
    },

    /**
     * \brief 不经 HTTP 直接创建用户并签发 API Key。
     */
    Bootstrap {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init(telemetry::LogFormat::from_env())?;

    let cli = Cli::parse();
    let config = GatewayConfig::from_env().context("load configuration failed")?;

    match cli.command {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.listen_addr());
            server::run(&config, &addr).await?;
        }
        Commands::Generate {
            prompt,
            query,
            temperature,
            max_tokens,
            explain,
        } => {
            let pipeline =
                GenerationPipeline::from_config(&config).context("build pipeline failed")?;
            let generation = pipeline
                .generate_for_query(&prompt, query.as_deref(), temperature, max_tokens)
                .await
                .context("generation failed")?;
            tracing::debug!(
                context = generation.context_status.as_str(),
                "generation finished"
            );
            println!("{}", generation.result.code);
            if explain {
                println!("\n---\n{}", generation.result.explanation);
            }
        }
        Commands::Bootstrap {
            username,
            email,
            password,
        } => {
            let store = SqliteStore::open(&config.database.sqlite_path())
                .context("open database failed")?;
            let user = store
                .create_user(&username, &email, &auth::hash_password(&password))
                .context("create user failed")?
                .context("username or email already registered")?;
            let key = store
                .create_key(user.id, &auth::generate_api_key())
                .context("create api key failed")?;
            println!(
                "Created user id={} (username={}) api_key={}",
                user.id, user.username, key.key
            );
        }
    }

    Ok(())
}
