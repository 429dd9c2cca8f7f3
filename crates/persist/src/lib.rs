//! Keel persistence: sync history per application in SQLite.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One finished sync operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub app: String,
    pub op_id: String,
    pub revision: Option<String>,
    pub code: String,
    pub ts: i64,
    pub actions: u32,
    pub message: Option<String>,
    /// Rendered manifest, possibly zstd-compressed; see [`maybe_decompress`].
    #[serde(skip)]
    pub manifest: Vec<u8>,
}

pub trait HistoryStore: Send + Sync {
    fn append(&self, entry: HistoryEntry) -> Result<()>;
    /// Newest first.
    fn recent(&self, app: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>>;
}

fn history_limit() -> usize {
    std::env::var("KEEL_HISTORY_LIMIT").ok().and_then(|s| s.parse().ok()).filter(|n: &usize| *n > 0).unwrap_or(10)
}

/// SQLite-backed history. Simple, synchronous; writes happen once per sync pass.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS sync_history (
                app      TEXT NOT NULL,
                op_id    TEXT NOT NULL,
                revision TEXT,
                code     TEXT NOT NULL,
                ts       INTEGER NOT NULL,
                actions  INTEGER NOT NULL,
                message  TEXT,
                manifest BLOB NOT NULL
            )",
            [],
        ).context("creating sync_history table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_history_app_ts ON sync_history(app, ts DESC)",
            [],
        ).ok();
        let me = Self { db: std::sync::Mutex::new(db), keep: history_limit() };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, keep = me.keep, "persist: opened");
        Ok(me)
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("history db lock poisoned"))
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, e: HistoryEntry) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO sync_history(app, op_id, revision, code, ts, actions, message, manifest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![e.app, e.op_id, e.revision, e.code, e.ts, e.actions, e.message, e.manifest],
        )?;
        // Keep the latest rows per app (delete older rows by rowid)
        tx.execute(
            "DELETE FROM sync_history
             WHERE app = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM sync_history WHERE app = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            rusqlite::params![e.app, self.keep as i64],
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn recent(&self, app: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT op_id, revision, code, ts, actions, message, manifest FROM sync_history
             WHERE app = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(rusqlite::params![app, cap as i64])?;
        let mut out: Vec<HistoryEntry> = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(HistoryEntry {
                app: app.to_string(),
                op_id: row.get(0)?,
                revision: row.get(1)?,
                code: row.get(2)?,
                ts: row.get(3)?,
                actions: row.get(4)?,
                message: row.get(5)?,
                manifest: row.get(6)?,
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// History kept in memory; used when no database is configured.
#[derive(Default)]
pub struct MemoryHistory {
    rows: std::sync::Mutex<Vec<HistoryEntry>>,
    keep: usize,
}

impl MemoryHistory {
    pub fn new() -> Self { Self { rows: Default::default(), keep: history_limit() } }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, e: HistoryEntry) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        let app = e.app.clone();
        rows.push(e);
        let keep = self.keep.max(1);
        let count = rows.iter().filter(|r| r.app == app).count();
        if count > keep {
            let mut drop = count - keep;
            rows.retain(|r| {
                if drop > 0 && r.app == app {
                    drop -= 1;
                    return false;
                }
                true
            });
        }
        Ok(())
    }

    fn recent(&self, app: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let rows = self.rows.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        Ok(rows.iter().rev().filter(|r| r.app == app).take(limit.unwrap_or(usize::MAX)).cloned().collect())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "keel.db".to_string()
}

pub fn maybe_compress(yaml: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(yaml.as_bytes(), lvl).unwrap_or_else(|_| yaml.as_bytes().to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    yaml.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
