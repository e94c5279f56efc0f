use crate::error::AppError;
use crate::models::{UsageLogEntry, UsageSnapshot};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;

pub struct Storage {
    conn: Connection,
}

fn parse_ts(raw: &str, col: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

fn to_sql_count(n: u64) -> Result<i64, rusqlite::Error> {
    i64::try_from(n).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_sql_count(raw: i64, col: usize) -> Result<u64, rusqlite::Error> {
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Integer, Box::new(e)))
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS usage_logs (
                id INTEGER PRIMARY KEY,
                log_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fetch_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                fetched_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn replace_snapshot(&mut self, snapshot: &UsageSnapshot) -> Result<(), AppError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM usage_logs", [])?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO usage_logs
                 (log_id, user_id, input_tokens, output_tokens, total_tokens, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for r in &snapshot.logs {
                insert.execute(params![
                    r.id,
                    r.user_id,
                    to_sql_count(r.input_tokens)?,
                    to_sql_count(r.output_tokens)?,
                    to_sql_count(r.total_tokens)?,
                    r.created_at.to_rfc3339(),
                ])?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO fetch_meta (id, fetched_at) VALUES (1, ?)",
            [snapshot.fetched_at.to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::debug!(rows = snapshot.logs.len(), "usage cache replaced");
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<UsageSnapshot>, AppError> {
        let fetched_at: Option<String> = self
            .conn
            .query_row("SELECT fetched_at FROM fetch_meta WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(fetched_at) = fetched_at else {
            return Ok(None);
        };

        Ok(Some(UsageSnapshot {
            logs: self.load_logs()?,
            server_totals: None,
            fetched_at: parse_ts(&fetched_at, 0)?,
        }))
    }

    pub fn load_logs(&self) -> Result<Vec<UsageLogEntry>, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT log_id, user_id, input_tokens, output_tokens, total_tokens, created_at
             FROM usage_logs ORDER BY created_at DESC, id ASC",
        )?;

        let rows = stmt
            .query_map([], |r| {
                Ok(UsageLogEntry {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    input_tokens: from_sql_count(r.get(2)?, 2)?,
                    output_tokens: from_sql_count(r.get(3)?, 3)?,
                    total_tokens: from_sql_count(r.get(4)?, 4)?,
                    created_at: parse_ts(&r.get::<_, String>(5)?, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(&self.load_logs()?)?)
    }
}
