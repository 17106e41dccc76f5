//! SQLite-backed persistent store for health logs, expenses, conversation
//! turns, embeddings, and user insights.
//!
//! The store owns a single connection behind a mutex. Every operation is
//! synchronous and short; async callers run them on the blocking pool.
//! File-backed databases use WAL; foreign keys are enforced on every
//! connection. Embedding BLOBs are opaque here — the codec lives in the
//! memory module.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

pub use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// A single health measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthLog {
    pub id: i64,
    pub metric: String,
    pub value: f64,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

/// A single expense entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Expense {
    pub id: i64,
    pub amount: f64,
    pub category: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// One recorded conversation turn (user or assistant).
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub model_used: String,
    pub latency_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Stored embedding attached to a conversation turn.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub id: i64,
    pub conversation_id: i64,
    pub text_content: String,
    pub embedding: Vec<u8>,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

/// Per-day aggregate for one health metric.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthDailyAgg {
    pub date: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

/// Expense total for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTotal {
    pub category: String,
    pub total: f64,
    pub count: i64,
}

/// Expense average for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryAverage {
    pub category: String,
    pub avg: f64,
    pub count: i64,
}

/// Durable store shared by all sessions.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a file-backed store. WAL is enabled for durability.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests and `DB_PATH=:memory:`).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Idempotent schema bootstrap: tables and indices are created if missing.
    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS health_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expenses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                amount REAL NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                model_used TEXT NOT NULL DEFAULT '',
                latency_ms INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                text_content TEXT NOT NULL DEFAULT '',
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                insight TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_health_metric_ts
                ON health_logs(metric, timestamp);
            CREATE INDEX IF NOT EXISTS idx_expenses_category_ts
                ON expenses(category, timestamp);
            CREATE INDEX IF NOT EXISTS idx_embeddings_conversation
                ON embeddings(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_insights_created
                ON user_insights(created_at);
            "#,
        )?;
        Ok(())
    }

    /// Insert a health measurement. `ts` defaults to now.
    pub fn log_health(
        &self,
        metric: &str,
        value: f64,
        notes: &str,
        ts: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        Self::insert_health(&conn, metric, value, notes, ts)
    }

    /// Insert form usable both standalone and inside a transaction.
    fn insert_health(
        conn: &Connection,
        metric: &str,
        value: f64,
        notes: &str,
        ts: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let ts = ts.unwrap_or_else(Utc::now);
        conn.execute(
            "INSERT INTO health_logs (metric, value, notes, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![metric, value, notes, ts.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert an expense. `ts` defaults to now.
    pub fn log_expense(
        &self,
        amount: f64,
        category: &str,
        description: &str,
        ts: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let ts = ts.unwrap_or_else(Utc::now);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO expenses (amount, category, description, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![amount, category, description, ts.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Query health rows filtered by optional metric and time range.
    pub fn query_health(
        &self,
        metric: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        desc: bool,
    ) -> StoreResult<Vec<HealthLog>> {
        let mut sql = String::from(
            "SELECT id, metric, value, notes, timestamp FROM health_logs WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(m) = metric {
            args.push(m.to_string());
            sql.push_str(&format!(" AND metric = ?{}", args.len()));
        }
        if let Some(f) = from {
            args.push(f.to_rfc3339());
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(t) = to {
            args.push(t.to_rfc3339());
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(if desc { " ORDER BY timestamp DESC" } else { " ORDER BY timestamp ASC" });

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(HealthLog {
                    id: row.get(0)?,
                    metric: row.get(1)?,
                    value: row.get(2)?,
                    notes: row.get(3)?,
                    timestamp: parse_ts(row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-day average/min/max/count for one metric in a time range.
    pub fn aggregate_health_by_date(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<HealthDailyAgg>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            r#"SELECT date(timestamp) AS day,
                      AVG(value), MIN(value), MAX(value), COUNT(*)
               FROM health_logs
               WHERE metric = ?1 AND timestamp >= ?2 AND timestamp <= ?3
               GROUP BY day
               ORDER BY day ASC"#,
        )?;
        let rows = stmt
            .query_map(params![metric, from.to_rfc3339(), to.to_rfc3339()], |row| {
                Ok(HealthDailyAgg {
                    date: row.get(0)?,
                    avg: row.get(1)?,
                    min: row.get(2)?,
                    max: row.get(3)?,
                    count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Expense totals grouped by category, largest total first.
    pub fn sum_expenses_by_category(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<CategoryTotal>> {
        let (clause, args) = range_clause(from, to);
        let sql = format!(
            "SELECT category, SUM(amount), COUNT(*) FROM expenses WHERE 1=1{}
             GROUP BY category ORDER BY SUM(amount) DESC",
            clause
        );
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(CategoryTotal {
                    category: row.get(0)?,
                    total: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Expense averages grouped by category.
    pub fn average_expenses_by_category(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<CategoryAverage>> {
        let (clause, args) = range_clause(from, to);
        let sql = format!(
            "SELECT category, AVG(amount), COUNT(*) FROM expenses WHERE 1=1{}
             GROUP BY category ORDER BY AVG(amount) DESC",
            clause
        );
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(CategoryAverage {
                    category: row.get(0)?,
                    avg: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Expenses filtered by optional category and time range, newest first.
    pub fn query_expenses(
        &self,
        category: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Expense>> {
        let mut sql = String::from(
            "SELECT id, amount, category, description, timestamp FROM expenses WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(c) = category {
            args.push(c.to_string());
            sql.push_str(&format!(" AND category = ?{}", args.len()));
        }
        if let Some(f) = from {
            args.push(f.to_rfc3339());
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(t) = to {
            args.push(t.to_rfc3339());
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(Expense {
                    id: row.get(0)?,
                    amount: row.get(1)?,
                    category: row.get(2)?,
                    description: row.get(3)?,
                    timestamp: parse_ts(row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record one conversation turn; returns the row id.
    pub fn record_conversation(
        &self,
        role: &str,
        content: &str,
        model: &str,
        latency_ms: i64,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            r#"INSERT INTO conversations (role, content, model_used, latency_ms, timestamp)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![role, content, model, latency_ms, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete a conversation turn; embeddings cascade.
    pub fn delete_conversation(&self, id: i64) -> StoreResult<()> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(id, "Deleted conversation (embeddings cascade)");
        Ok(())
    }

    /// Attach an opaque embedding blob to a conversation turn.
    /// A dangling `conversation_id` is an integrity violation.
    pub fn store_embedding(
        &self,
        conversation_id: i64,
        text: &str,
        embedding: &[u8],
        metadata: &str,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            r#"INSERT INTO embeddings (conversation_id, text_content, embedding, metadata, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![conversation_id, text, embedding, metadata, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All embeddings attached to one conversation turn.
    pub fn retrieve_embeddings(&self, conversation_id: i64) -> StoreResult<Vec<EmbeddingRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            r#"SELECT id, conversation_id, text_content, embedding, metadata, created_at
               FROM embeddings WHERE conversation_id = ?1 ORDER BY id ASC"#,
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok(EmbeddingRow {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    text_content: row.get(2)?,
                    embedding: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                    metadata: row.get(4)?,
                    created_at: parse_ts(row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append a user insight.
    pub fn save_insight(&self, insight: &str) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO user_insights (insight, created_at) VALUES (?1, ?2)",
            params![insight, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent insights, newest first.
    pub fn recent_insights(&self, limit: usize) -> StoreResult<Vec<(i64, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, insight FROM user_insights ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Completed assistant turns and their average latency, for `/api/status`.
    pub fn turn_stats(&self) -> StoreResult<(i64, f64)> {
        let conn = self.lock();
        let row: Option<(i64, Option<f64>)> = conn
            .query_row(
                "SELECT COUNT(*), AVG(latency_ms) FROM conversations WHERE role = 'assistant'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (count, avg) = row.unwrap_or((0, None));
        Ok((count, avg.unwrap_or(0.0)))
    }

    /// Run `f` atomically. Any error rolls the transaction back; no partial
    /// writes survive. Transactions do not nest.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&StoreTx { tx: &tx });
        match out {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                // Drop rolls back; make it explicit for the error path.
                tx.rollback()?;
                Err(e)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens if a writer panicked; the store never
        // panics on callable operations, so recover the guard.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Narrow write surface available inside `Store::transaction`.
pub struct StoreTx<'a> {
    tx: &'a Transaction<'a>,
}

impl StoreTx<'_> {
    pub fn log_health(
        &self,
        metric: &str,
        value: f64,
        notes: &str,
        ts: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        Store::insert_health(self.tx, metric, value, notes, ts)
    }

    pub fn save_insight(&self, insight: &str) -> StoreResult<i64> {
        self.tx.execute(
            "INSERT INTO user_insights (insight, created_at) VALUES (?1, ?2)",
            params![insight, Utc::now().to_rfc3339()],
        )?;
        Ok(self.tx.last_insert_rowid())
    }
}

fn range_clause(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> (String, Vec<String>) {
    let mut clause = String::new();
    let mut args = Vec::new();
    if let Some(f) = from {
        args.push(f.to_rfc3339());
        clause.push_str(&format!(" AND timestamp >= ?{}", args.len()));
    }
    if let Some(t) = to {
        args.push(t.to_rfc3339());
        clause.push_str(&format!(" AND timestamp <= ?{}", args.len()));
    }
    (clause, args)
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
