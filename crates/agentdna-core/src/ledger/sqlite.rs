//! Durable SQLite ledger.
//!
//! Rows are only ever inserted: triggers abort any `UPDATE` or `DELETE` on the records table.
//! History is returned in insertion (`seq`) order. All database work runs on the blocking
//! pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{AuditFilter, AuditLedger, AuditRecord, RecordId};
use crate::codec::format_timestamp;
use crate::error::{Error, Result};
use crate::hashing::Hash;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    envelope_hash TEXT NOT NULL,
    peer_did TEXT,
    agent_id TEXT NOT NULL,
    verified INTEGER NOT NULL,
    written_at TEXT NOT NULL,
    summary TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_records_peer ON audit_records(peer_did);
CREATE INDEX IF NOT EXISTS idx_audit_records_written_at ON audit_records(written_at);

CREATE TRIGGER IF NOT EXISTS audit_records_no_update
BEFORE UPDATE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit records are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
BEFORE DELETE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit records are append-only');
END;
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO audit_records
    (record_id, envelope_hash, peer_did, agent_id, verified, written_at, summary)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#;

const SELECT_RECORDS: &str = r#"
SELECT record_id, envelope_hash, written_at, summary
FROM audit_records
WHERE 1=1
"#;

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as usize)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| Error::LedgerUnavailable(format!("sqlite task failed: {e}")))?
    }
}

fn insert(conn: &Connection, mut record: AuditRecord) -> Result<RecordId> {
    let id = RecordId::generate();
    record.record_id = Some(id);
    let summary = serde_json::to_string(&record.trust_result_summary)?;
    let s = &record.trust_result_summary;
    conn.execute(
        INSERT_RECORD,
        params![
            id.to_string(),
            record.envelope_hash.to_string(),
            s.peer_did.as_ref().map(|d| d.to_string()),
            s.agent_id.to_string(),
            s.verified,
            format_timestamp(&record.written_at),
            summary,
        ],
    )
    .map_err(db_err)?;
    Ok(id)
}

fn select(
    conn: &Connection,
    filter: &AuditFilter,
    offset: usize,
    limit: usize,
) -> Result<Vec<AuditRecord>> {
    let mut sql = SELECT_RECORDS.to_string();
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(signer) = &filter.signer_id {
        sql.push_str(" AND peer_did = ?");
        params_vec.push(Box::new(signer.to_string()));
    }
    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND agent_id = ?");
        params_vec.push(Box::new(agent_id.to_string()));
    }
    if let Some(verified) = filter.verified {
        sql.push_str(" AND verified = ?");
        params_vec.push(Box::new(verified));
    }
    if let Some(since) = filter.since {
        sql.push_str(" AND written_at >= ?");
        params_vec.push(Box::new(format_timestamp(&since)));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND written_at < ?");
        params_vec.push(Box::new(format_timestamp(&until)));
    }
    sql.push_str(" ORDER BY seq ASC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
    params_vec.push(Box::new(i64::try_from(offset).unwrap_or(i64::MAX)));

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let mut rows = stmt.query(params_refs.as_slice()).map_err(db_err)?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let record_id: String = row.get(0).map_err(db_err)?;
        let envelope_hash: String = row.get(1).map_err(db_err)?;
        let written_at: String = row.get(2).map_err(db_err)?;
        let summary: String = row.get(3).map_err(db_err)?;

        records.push(AuditRecord {
            record_id: Some(record_id.parse()?),
            envelope_hash: Hash::from_hex(&envelope_hash)
                .map_err(|e| Error::LedgerUnavailable(format!("corrupt envelope_hash: {e}")))?,
            trust_result_summary: serde_json::from_str(&summary)
                .map_err(|e| Error::LedgerUnavailable(format!("corrupt summary: {e}")))?,
            written_at: DateTime::parse_from_rfc3339(&written_at)
                .map_err(|e| Error::LedgerUnavailable(format!("corrupt written_at: {e}")))?
                .with_timezone(&Utc),
        });
    }
    Ok(records)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::LedgerUnavailable(format!("sqlite: {e}"))
}

#[async_trait]
impl AuditLedger for SqliteLedger {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, record: AuditRecord) -> Result<RecordId> {
        self.blocking(move |conn| insert(conn, record)).await
    }

    async fn fetch_page(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let filter = filter.clone();
        self.blocking(move |conn| select(conn, &filter, offset, limit))
            .await
    }
}
