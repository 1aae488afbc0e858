use std::path::Path;
use std::sync::{Arc, Mutex};
use std::{thread, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::history::MAX_HISTORY_ITEMS;
use crate::models::{Credential, HistoryEntry, ProviderDescriptor};
use crate::prompts::PromptTemplate;
use crate::store::SettingsStore;

/**
 * \brief 打开设置数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS credentials (
            provider_id TEXT PRIMARY KEY,
            secret TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS custom_providers (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            descriptor TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS custom_prompts (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            template TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            query TEXT NOT NULL,
            response TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 读取凭证；空值视为未配置。
 */
pub fn get_credential(conn: &Connection, provider_id: &str) -> Result<Option<Credential>> {
    let secret: Option<String> = conn
        .query_row(
            "SELECT secret FROM credentials WHERE provider_id=?1",
            params![provider_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(secret.and_then(Credential::new))
}

pub fn set_credential(conn: &Connection, provider_id: &str, credential: &Credential) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO credentials (provider_id, secret) VALUES (?1, ?2)
         ON CONFLICT(provider_id) DO UPDATE SET secret=excluded.secret",
            params![provider_id, credential.expose()],
        )
    })?;
    Ok(())
}

pub fn remove_credential(conn: &Connection, provider_id: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "DELETE FROM credentials WHERE provider_id=?1",
            params![provider_id],
        )
    })?;
    Ok(())
}

/**
 * \brief 按保存顺序列出自定义 Provider。
 */
pub fn list_custom_providers(conn: &Connection) -> Result<Vec<ProviderDescriptor>> {
    let mut stmt = conn.prepare("SELECT descriptor FROM custom_providers ORDER BY position ASC")?;
    let raw = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|json| serde_json::from_str(json).map_err(Into::into))
        .collect()
}

/**
 * \brief 保存自定义 Provider；已存在则原位更新。
 */
pub fn save_custom_provider(conn: &Connection, descriptor: &ProviderDescriptor) -> Result<()> {
    let json = serde_json::to_string(descriptor)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO custom_providers (id, descriptor) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET descriptor=excluded.descriptor",
            params![descriptor.id, json],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除自定义 Provider 及其凭证。
 */
pub fn delete_custom_provider(conn: &Connection, provider_id: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM custom_providers WHERE id=?1",
            params![provider_id],
        )
    })?;
    if rows == 0 {
        return Ok(false);
    }
    remove_credential(conn, provider_id)?;
    if get_selected_provider(conn)?.as_deref() == Some(provider_id) {
        retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key='selected_provider'", []))?;
    }
    Ok(true)
}

/**
 * \brief 按保存顺序列出用户提示词。
 */
pub fn list_custom_prompts(conn: &Connection) -> Result<Vec<PromptTemplate>> {
    let mut stmt =
        conn.prepare("SELECT id, name, template FROM custom_prompts ORDER BY position ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PromptTemplate {
                id: row.get(0)?,
                name: row.get(1)?,
                template: row.get(2)?,
                builtin: false,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn save_custom_prompt(conn: &Connection, prompt: &PromptTemplate) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO custom_prompts (id, name, template) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name=excluded.name, template=excluded.template",
            params![prompt.id, prompt.name, prompt.template],
        )
    })?;
    Ok(())
}

pub fn delete_custom_prompt(conn: &Connection, prompt_id: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM custom_prompts WHERE id=?1",
            params![prompt_id],
        )
    })?;
    Ok(rows > 0)
}

pub fn get_selected_provider(conn: &Connection) -> Result<Option<String>> {
    get_config(conn, "selected_provider")
}

pub fn set_selected_provider(conn: &Connection, provider_id: &str) -> Result<()> {
    set_config(conn, "selected_provider", provider_id)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    Ok(get_config(conn, "telemetry_enabled")?
        .map(|s| s == "1")
        .unwrap_or(false))
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config(conn, "telemetry_enabled", if enabled { "1" } else { "0" })
}

/**
 * \brief 写入历史记录并裁剪到上限。
 */
pub fn insert_history(conn: &Connection, entry: &HistoryEntry) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO history (timestamp, provider_id, prompt, query, response) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.timestamp,
                entry.provider_id,
                entry.prompt,
                entry.query,
                entry.response
            ],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "DELETE FROM history WHERE id NOT IN (SELECT id FROM history ORDER BY id DESC LIMIT ?1)",
            params![MAX_HISTORY_ITEMS as i64],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取历史记录，最新在前。
 */
pub fn load_history(conn: &Connection) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, provider_id, prompt, query, response FROM history ORDER BY id DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(HistoryEntry {
                timestamp: row.get(0)?,
                provider_id: row.get(1)?,
                prompt: row.get(2)?,
                query: row.get(3)?,
                response: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn clear_history(conn: &Connection) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM history", []))?;
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

/**
 * \brief 基于 SQLite 的设置存储。
 */
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /**
     * \brief 打开并迁移数据库。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_db(path)?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("settings database lock poisoned"))?;
        f(&guard)
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_credential(&self, provider_id: &str) -> Result<Option<Credential>> {
        self.with_conn(|c| get_credential(c, provider_id))
    }

    async fn set_credential(&self, provider_id: &str, credential: &Credential) -> Result<()> {
        self.with_conn(|c| set_credential(c, provider_id, credential))
    }

    async fn remove_credential(&self, provider_id: &str) -> Result<()> {
        self.with_conn(|c| remove_credential(c, provider_id))
    }

    async fn list_custom_providers(&self) -> Result<Vec<ProviderDescriptor>> {
        self.with_conn(list_custom_providers)
    }

    async fn save_custom_provider(&self, descriptor: &ProviderDescriptor) -> Result<()> {
        self.with_conn(|c| save_custom_provider(c, descriptor))
    }

    async fn delete_custom_provider(&self, provider_id: &str) -> Result<bool> {
        self.with_conn(|c| delete_custom_provider(c, provider_id))
    }

    async fn list_custom_prompts(&self) -> Result<Vec<PromptTemplate>> {
        self.with_conn(list_custom_prompts)
    }

    async fn save_custom_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        self.with_conn(|c| save_custom_prompt(c, prompt))
    }

    async fn delete_custom_prompt(&self, prompt_id: &str) -> Result<bool> {
        self.with_conn(|c| delete_custom_prompt(c, prompt_id))
    }

    async fn selected_provider(&self) -> Result<Option<String>> {
        self.with_conn(get_selected_provider)
    }

    async fn set_selected_provider(&self, provider_id: &str) -> Result<()> {
        self.with_conn(|c| set_selected_provider(c, provider_id))
    }

    async fn telemetry_enabled(&self) -> Result<bool> {
        self.with_conn(get_telemetry_enabled)
    }

    async fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.with_conn(|c| set_telemetry_enabled(c, enabled))
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.with_conn(|c| insert_history(c, entry))
    }

    async fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.with_conn(load_history)
    }

    async fn clear_history(&self) -> Result<()> {
        self.with_conn(clear_history)
    }
}
