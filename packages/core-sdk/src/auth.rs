use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    db::KeyStore,
    error::{AuthError, GatewayError},
    server::AppState,
};

/** \brief 自定义 API Key 请求头，优先于 Authorization。 */
pub const API_KEY_HEADER: &str = "x-api-key";

/**
 * \brief 鉴权通过后挂到请求扩展上的调用方身份。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

/**
 * \brief 从两个请求头中取出调用方提交的 key：自定义头优先，其次 `Bearer` 前缀的 Authorization。
 */
pub fn presented_key<'a>(
    custom_header: Option<&'a str>,
    authorization: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(key) = custom_header.filter(|k| !k.is_empty()) {
        return Some(key);
    }
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|k| !k.is_empty())
}

/**
 * \brief 校验 key 并解析出所属用户；缺失或无效时拒绝。
 */
pub fn authenticate(
    store: &dyn KeyStore,
    custom_header: Option<&str>,
    authorization: Option<&str>,
) -> Result<i64, GatewayError> {
    let key = presented_key(custom_header, authorization).ok_or(AuthError::Missing)?;
    let record = store.find_key(key)?.ok_or(AuthError::Invalid)?;
    Ok(record.user_id)
}

/**
 * \brief axum 中间件：鉴权并注入 `AuthUser`。
 */
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let headers = request.headers();
    let user_id = authenticate(
        state.store.as_ref(),
        header_str(headers, API_KEY_HEADER),
        header_str(headers, AUTHORIZATION.as_str()),
    )
    .inspect_err(|err| tracing::warn!(error = %err, "rejected request"))?;
    request.extensions_mut().insert(AuthUser { user_id });
    Ok(next.run(request).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/** \brief 生成新的 API Key：`cg_` + 32 位十六进制。 */
pub fn generate_api_key() -> String {
    format!("cg_{}", Uuid::new_v4().simple())
}

/**
 * \brief 加盐 SHA-256 密码摘要，格式为 `salt$hex`。
 */
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, hash)) => digest(salt, password) == hash,
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}
