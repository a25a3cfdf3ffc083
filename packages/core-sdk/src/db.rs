use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    sync::{Mutex, MutexGuard},
    thread,
    time::Duration,
};
use time::OffsetDateTime;

use crate::models::{ApiKeyRecord, User};

/**
 * \brief 带密码摘要的用户记录，仅供登录校验使用。
 */
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user: User,
    pub password_hash: String,
}

/**
 * \brief 用户与 API Key 存储接口，在构造时注入鉴权与密钥管理处理器。
 * \details 并发安全由底层存储保证，调用方不加锁。
 */
pub trait KeyStore: Send + Sync {
    /** \brief 按 key 查找记录。 */
    fn find_key(&self, key: &str) -> Result<Option<ApiKeyRecord>>;
    /** \brief 列出用户拥有的全部 key。 */
    fn list_keys(&self, user_id: i64) -> Result<Vec<ApiKeyRecord>>;
    /** \brief 为用户写入一个新 key。 */
    fn create_key(&self, user_id: i64, key: &str) -> Result<ApiKeyRecord>;
    /** \brief 删除属于该用户的 key；不存在或不属于该用户时返回 false。 */
    fn delete_key(&self, user_id: i64, key_id: i64) -> Result<bool>;
    /** \brief 创建用户；用户名或邮箱重复时返回 None。 */
    fn create_user(&self, username: &str, email: &str, password_hash: &str)
        -> Result<Option<User>>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<StoredUser>>;
}

/**
 * \brief 基于 SQLite 的 `KeyStore` 实现。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /** \brief 内存数据库，主要用于测试。 */
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl KeyStore for SqliteStore {
    fn find_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        find_key(&*self.lock()?, key)
    }

    fn list_keys(&self, user_id: i64) -> Result<Vec<ApiKeyRecord>> {
        list_keys(&*self.lock()?, user_id)
    }

    fn create_key(&self, user_id: i64, key: &str) -> Result<ApiKeyRecord> {
        insert_key(&*self.lock()?, user_id, key)
    }

    fn delete_key(&self, user_id: i64, key_id: i64) -> Result<bool> {
        delete_key(&*self.lock()?, user_id, key_id)
    }

    fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Option<User>> {
        insert_user(&*self.lock()?, username, email, password_hash)
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        find_user_by_username(&*self.lock()?, username)
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            key TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);
        "#,
        )
    })?;
    Ok(())
}

fn map_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn find_key(conn: &Connection, key: &str) -> Result<Option<ApiKeyRecord>> {
    conn.query_row(
        "SELECT id, user_id, key, created_at FROM api_keys WHERE key=?1",
        params![key],
        map_key,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出用户的 key，按创建顺序。
 */
pub fn list_keys(conn: &Connection, user_id: i64) -> Result<Vec<ApiKeyRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, key, created_at FROM api_keys WHERE user_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_key)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 写入新 key，唯一性由表约束保证。
 */
pub fn insert_key(conn: &Connection, user_id: i64, key: &str) -> Result<ApiKeyRecord> {
    let created_at = OffsetDateTime::now_utc().unix_timestamp();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO api_keys (user_id, key, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, key, created_at],
        )
    })?;
    Ok(ApiKeyRecord {
        id: conn.last_insert_rowid(),
        user_id,
        key: key.to_string(),
        created_at,
    })
}

/**
 * \brief 仅删除属于 `user_id` 的 key。
 */
pub fn delete_key(conn: &Connection, user_id: i64, key_id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM api_keys WHERE id=?1 AND user_id=?2",
            params![key_id, user_id],
        )
    })?;
    Ok(rows > 0)
}

pub fn insert_user(
    conn: &Connection,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<Option<User>> {
    let inserted = retry_on_locked(|| {
        conn.execute(
            "INSERT INTO users (username, email, password_hash) VALUES (?1, ?2, ?3)",
            params![username, email, password_hash],
        )
    });
    match inserted {
        Ok(_) => Ok(Some(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
        })),
        Err(err) if is_constraint_violation(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<StoredUser>> {
    conn.query_row(
        "SELECT id, username, email, password_hash FROM users WHERE username=?1",
        params![username],
        |row| {
            Ok(StoredUser {
                user: User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                },
                password_hash: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最多重试 5 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
