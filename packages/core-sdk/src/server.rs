use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{header::HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::{self, AuthUser, API_KEY_HEADER},
    config::GatewayConfig,
    db::{KeyStore, SqliteStore},
    error::{AuthError, GatewayError},
    models::{ApiKeyRecord, ChatCompletionRequest, ContextStatus, GenerationResult, User},
    pipeline::GenerationPipeline,
    rag::ContextResponse,
};

/** \brief 上下文获取情况响应头。 */
pub const CONTEXT_STATUS_HEADER: &str = "x-context-status";

/**
 * \brief 路由共享状态：存储与流水线均在启动时构造后注入。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KeyStore>,
    pub pipeline: Arc<GenerationPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn KeyStore>, pipeline: GenerationPipeline) -> Self {
        Self {
            store,
            pipeline: Arc::new(pipeline),
        }
    }
}

/**
 * \brief 启动 HTTP 服务。
 * \param addr 监听地址，如 "0.0.0.0:8080"
 */
pub async fn run(config: &GatewayConfig, addr: &str) -> Result<()> {
    let store = SqliteStore::open(&config.database.sqlite_path())?;
    let pipeline = GenerationPipeline::from_config(config)?;
    match pipeline.credential() {
        Some(cred) => tracing::info!(provider = %cred.kind, "LLM provider resolved"),
        None => tracing::warn!("no LLM provider API key configured; generation requests will fail"),
    }
    tracing::info!(
        database = %config.database.describe(),
        rag = %config.rag_service_url,
        timeout_secs = config.provider_timeout.map(|t| t.as_secs()),
        "gateway configured"
    );

    let app = router(AppState::new(Arc::new(store), pipeline));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 构造完整路由，受保护路由统一经过 API Key 鉴权。
 */
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{id}", delete(delete_key))
        .route("/context", get(get_context))
        .route("/generate", post(generate))
        .route("/chat/completions", post(chat_completions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let v1 = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .merge(protected);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("origin"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static(API_KEY_HEADER),
        ])
}

/** \brief JSON 解析失败统一按 400 返回。 */
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| GatewayError::Validation(rejection.body_text()))
}

fn with_context_status(status: ContextStatus, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response.headers_mut().insert(
        CONTEXT_STATUS_HEADER,
        HeaderValue::from_static(status.as_str()),
    );
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize, Debug)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Serialize, Debug)]
struct RegisterResponse {
    user: User,
    api_key: ApiKeyRecord,
}

#[derive(Deserialize, Debug)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize, Debug)]
struct LoginResponse {
    user: User,
    api_keys: Vec<ApiKeyRecord>,
}

/**
 * \brief 注册用户并签发第一把 API Key。
 */
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), GatewayError> {
    let input = json_body(payload)?;
    let username = input.username.trim();
    let email = input.email.trim();
    if username.is_empty() || email.is_empty() || input.password.is_empty() {
        return Err(GatewayError::Validation(
            "username, email and password are required".into(),
        ));
    }

    let user = state
        .store
        .create_user(username, email, &auth::hash_password(&input.password))?
        .ok_or_else(|| GatewayError::Validation("username or email already registered".into()))?;
    let api_key = state.store.create_key(user.id, &auth::generate_api_key())?;
    tracing::info!(user_id = user.id, "user registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { user, api_key })))
}

/**
 * \brief 用户名密码登录，返回其全部 API Key。
 */
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, GatewayError> {
    let input = json_body(payload)?;
    let stored = state
        .store
        .find_user_by_username(input.username.trim())?
        .filter(|s| auth::verify_password(&input.password, &s.password_hash))
        .ok_or_else(|| GatewayError::Auth(AuthError::BadCredentials))?;
    let api_keys = state.store.list_keys(stored.user.id)?;
    Ok(Json(LoginResponse {
        user: stored.user,
        api_keys,
    }))
}

async fn list_keys(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<Json<Vec<ApiKeyRecord>>, GatewayError> {
    Ok(Json(state.store.list_keys(caller.user_id)?))
}

async fn create_key(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<(StatusCode, Json<ApiKeyRecord>), GatewayError> {
    let record = state
        .store
        .create_key(caller.user_id, &auth::generate_api_key())?;
    tracing::info!(user_id = caller.user_id, key_id = record.id, "api key created");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_key(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let not_found = || GatewayError::NotFound("API key not found".into());
    let Path(id) = id.map_err(|_| not_found())?;
    if !state.store.delete_key(caller.user_id, id)? {
        return Err(not_found());
    }
    tracing::info!(user_id = caller.user_id, key_id = id, "api key deleted");
    Ok(Json(json!({ "message": "API key deleted successfully" })))
}

#[derive(Deserialize, Debug)]
struct ContextRequest {
    query: String,
    #[serde(default)]
    limit: u32,
}

/**
 * \brief 直接查询检索服务；与生成不同，这里的检索失败会返回错误。
 */
async fn get_context(
    State(state): State<AppState>,
    payload: Result<Json<ContextRequest>, JsonRejection>,
) -> Result<Json<ContextResponse>, GatewayError> {
    let input = json_body(payload)?;
    if input.query.trim().is_empty() {
        return Err(GatewayError::Validation("query is required".into()));
    }
    let results = state
        .pipeline
        .rag()
        .get_context(&input.query, input.limit)
        .await?;
    Ok(Json(ContextResponse { results }))
}

#[derive(Deserialize, Debug)]
struct GenerateRequest {
    prompt: String,
    /** \brief 可选的检索查询 */
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<i64>,
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let input = json_body(payload)?;
    if input.prompt.trim().is_empty() {
        return Err(GatewayError::Validation("prompt is required".into()));
    }
    let generation = state
        .pipeline
        .generate_for_query(
            &input.prompt,
            input.query.as_deref(),
            input.temperature,
            input.max_tokens,
        )
        .await?;
    Ok(with_context_status(
        generation.context_status,
        Json::<GenerationResult>(generation.result),
    ))
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let input = json_body(payload)?;
    let (completion, context_status) = state.pipeline.chat_completion(input).await?;
    Ok(with_context_status(context_status, Json(completion)))
}
