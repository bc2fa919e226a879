use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use uuid::Uuid;

use crate::session::{Message, Role};

/// Opens (creating if needed) the SQLite database and applies migrations.
pub async fn open_pool(database_url: Option<String>) -> anyhow::Result<Pool<Sqlite>> {
    let url = match database_url {
        Some(u) => u,
        None => resolve_default_db_url()?,
    };
    let options = url.parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = Pool::<Sqlite>::connect_with(options).await?;
    sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("fortune_teller");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("oracle.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

/// Append-only message log keyed by session id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;
    /// Atomically drops the session's history and stores `message` as its only entry.
    async fn replace(&self, session_id: &str, message: Message) -> anyhow::Result<()>;
    async fn clear(&self, session_id: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: Pool<Sqlite>,
}

impl SqliteHistoryStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        Ok(Self::new(open_pool(database_url).await?))
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

const INSERT_MESSAGE: &str = "INSERT INTO history_messages (id, session_id, seq, role, content, created_at) \
     VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM history_messages WHERE session_id = ?2), ?3, ?4, ?5)";

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query("SELECT role, content, created_at FROM history_messages WHERE session_id = ?1 ORDER BY seq ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let role_str: String = r.get("role");
            let role = Role::parse(&role_str).ok_or_else(|| anyhow::anyhow!("unknown role in history: {}", role_str))?;
            let created_at: String = r.get("created_at");
            out.push(Message {
                role,
                content: r.get("content"),
                created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }

    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for msg in messages {
            sqlx::query(INSERT_MESSAGE)
                .bind(Uuid::new_v4().to_string())
                .bind(session_id)
                .bind(msg.role.as_str())
                .bind(&msg.content)
                .bind(msg.created_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace(&self, session_id: &str, message: Message) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM history_messages WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(INSERT_MESSAGE)
            .bind(Uuid::new_v4().to_string())
            .bind(session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM history_messages WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
