//! SQLite-backed lyrics cache.
//!
//! One row per track, keyed by `TrackId`. Rows are registered as `pending`
//! before a fetch and updated in batches by a single writer. Terminal rows
//! (`found`, `not_found`) are never moved back to a retryable status.

use crate::error::CacheError;
use crate::models::{FetchStatus, LyricsRecord, ProviderMeta, TrackId, TrackRef};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA temp_store=MEMORY;
    PRAGMA busy_timeout=5000;

    CREATE TABLE IF NOT EXISTS lyrics_records (
      track_id      TEXT PRIMARY KEY,
      artist        TEXT NOT NULL,
      album         TEXT NOT NULL,
      title         TEXT NOT NULL,
      status        TEXT NOT NULL
                    CHECK (status IN ('pending','found','not_found','error')),
      lyrics        TEXT,
      attempts      INTEGER NOT NULL DEFAULT 0,
      error         TEXT,
      provider_meta TEXT,
      fetched_at    TEXT,
      updated_at    TEXT NOT NULL,
      CHECK ((status = 'found') = (lyrics IS NOT NULL AND length(trim(lyrics)) > 0))
    );

    CREATE INDEX IF NOT EXISTS idx_lyrics_records_status ON lyrics_records(status);
"#;

const RECORD_COLUMNS: &str = "track_id, status, lyrics, attempts, error, provider_meta, fetched_at";

/// An `error` row for diagnostics.
#[derive(Debug, Clone)]
pub struct ErrorRow {
    pub track_id: String,
    pub artist: String,
    pub album: String,
    pub title: String,
    pub attempts: i64,
    pub error: Option<String>,
    pub updated_at: String,
}

pub struct CacheStore {
    conn: Connection,
    path: PathBuf,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl CacheStore {
    /// Open (creating if needed) the cache database and its schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Create {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Open cache db {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("Initialize cache schema in {}", path.display()))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing cache for reading. Runs no DDL and changes no
    /// pragmas, so it is safe to point at any SQLite file.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Cache database not found: {}", path.display());
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_context(|| format!("Open cache db {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let has_table: bool = conn
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type='table' AND name='lyrics_records')",
                [],
                |r| r.get(0),
            )
            .with_context(|| format!("Read schema of {}", path.display()))?;
        if !has_table {
            anyhow::bail!("Not a lyrics cache (no lyrics_records table): {}", path.display());
        }
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `pending` rows for tracks that have none. Existing rows are untouched.
    pub fn register_pending(&mut self, tracks: &[TrackRef<'_>]) -> Result<usize, CacheError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO lyrics_records (track_id, artist, album, title, status, attempts, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
                "#,
            )?;
            let now = now_rfc3339();
            for t in tracks {
                inserted += stmt.execute(params![
                    t.track.id.as_str(),
                    t.album.artist,
                    t.album.title,
                    t.track.title,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Apply record updates in one transaction. Returns how many rows changed.
    ///
    /// An update is applied when the current status is retryable, when the
    /// new status is `found`, or when it repeats the current status. So
    /// terminal rows never regress and `found` text is never dropped.
    pub fn commit_batch(&mut self, records: &[LyricsRecord]) -> Result<usize, CacheError> {
        let tx = self.conn.transaction()?;
        let mut applied = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE lyrics_records
                SET status=?2,
                    lyrics=?3,
                    attempts=attempts + ?4,
                    error=?5,
                    provider_meta=?6,
                    fetched_at=?7,
                    updated_at=?8
                WHERE track_id=?1
                  AND (status IN ('pending','error') OR ?2='found' OR status=?2)
                "#,
            )?;
            let now = now_rfc3339();
            for r in records {
                let meta = match &r.provider {
                    Some(m) => Some(serde_json::to_string(m).map_err(|e| CacheError::CorruptRecord {
                        track_id: r.track_id.to_string(),
                        message: e.to_string(),
                    })?),
                    None => None,
                };
                let changed = stmt.execute(params![
                    r.track_id.as_str(),
                    r.status.as_db(),
                    r.lyrics,
                    r.attempts,
                    r.error,
                    meta,
                    r.fetched_at.map(|t| t.to_rfc3339()),
                    now
                ])?;
                if changed == 0 {
                    tracing::debug!("Ignored {} update for {}", r.status, r.track_id);
                }
                applied += changed;
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    pub fn get(&self, id: &TrackId) -> Result<Option<LyricsRecord>, CacheError> {
        let sql = format!("SELECT {} FROM lyrics_records WHERE track_id=?1", RECORD_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt.query_row(params![id.as_str()], RawRow::read).optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    /// Status of every cached row.
    pub fn statuses(&self) -> Result<FxHashMap<TrackId, FetchStatus>, CacheError> {
        let mut stmt = self.conn.prepare("SELECT track_id, status FROM lyrics_records")?;
        let mut rows = stmt.query([])?;
        let mut out = FxHashMap::default();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let status = FetchStatus::from_db(&status).ok_or_else(|| CacheError::CorruptRecord {
                track_id: id.clone(),
                message: format!("unknown status '{}'", status),
            })?;
            out.insert(TrackId::new(id), status);
        }
        Ok(out)
    }

    /// Every cached record. Non-UTF-8 lyric text is reported as corruption.
    pub fn load_all(&self) -> Result<FxHashMap<TrackId, LyricsRecord>, CacheError> {
        let sql = format!("SELECT {} FROM lyrics_records", RECORD_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = FxHashMap::default();
        while let Some(row) = rows.next()? {
            let record = RawRow::read(row)?.into_record()?;
            out.insert(record.track_id.clone(), record);
        }
        Ok(out)
    }

    /// Row count per status, sorted by status name.
    pub fn status_counts(&self) -> Result<Vec<(String, i64)>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM lyrics_records GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recently updated `error` rows.
    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRow>, CacheError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT track_id, artist, album, title, attempts, error, updated_at
            FROM lyrics_records
            WHERE status='error'
            ORDER BY updated_at DESC, track_id
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(ErrorRow {
                track_id: r.get(0)?,
                artist: r.get(1)?,
                album: r.get(2)?,
                title: r.get(3)?,
                attempts: r.get(4)?,
                error: r.get(5)?,
                updated_at: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Row as stored, before validation.
struct RawRow {
    track_id: String,
    status: String,
    lyrics: Result<Option<String>, ()>,
    attempts: i64,
    error: Option<String>,
    provider_meta: Option<String>,
    fetched_at: Option<String>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let lyrics = match row.get_ref(2)? {
            ValueRef::Null => Ok(None),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                std::str::from_utf8(bytes).map(|s| Some(s.to_string())).map_err(|_| ())
            }
            _ => Err(()),
        };
        Ok(Self {
            track_id: row.get(0)?,
            status: row.get(1)?,
            lyrics,
            attempts: row.get(3)?,
            error: row.get(4)?,
            provider_meta: row.get(5)?,
            fetched_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<LyricsRecord, CacheError> {
        let corrupt = |message: String| CacheError::CorruptRecord {
            track_id: self.track_id.clone(),
            message,
        };
        let lyrics = self.lyrics.clone().map_err(|_| CacheError::CorruptLyrics {
            track_id: self.track_id.clone(),
        })?;
        let status =
            FetchStatus::from_db(&self.status).ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let provider = match &self.provider_meta {
            Some(json) => Some(
                serde_json::from_str::<ProviderMeta>(json).map_err(|e| corrupt(format!("provider meta: {}", e)))?,
            ),
            None => None,
        };
        let fetched_at = match &self.fetched_at {
            Some(ts) => Some(
                DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| corrupt(format!("fetched_at: {}", e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(LyricsRecord {
            track_id: TrackId::new(self.track_id.clone()),
            status,
            lyrics,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            error: self.error.clone(),
            provider,
            fetched_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Album, Track};

    fn album() -> Album {
        Album {
            artist: "Artist".into(),
            title: "Album".into(),
            year: None,
            folder: "Artist/Album".into(),
            tracks: vec![
                Track { id: TrackId::new("aaa"), number: 1, title: "One".into(), file: "Artist/Album/01 - One.md".into() },
                Track { id: TrackId::new("bbb"), number: 2, title: "Two".into(), file: "Artist/Album/02 - Two.md".into() },
            ],
        }
    }

    fn open_with_album(dir: &Path) -> CacheStore {
        let mut store = CacheStore::open(&dir.join("cache/lyrics.sqlite3")).unwrap();
        let a = album();
        let refs: Vec<TrackRef> = a.tracks.iter().map(|track| TrackRef { album: &a, track }).collect();
        assert_eq!(store.register_pending(&refs).unwrap(), 2);
        store
    }

    #[test]
    fn test_register_is_insert_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_album(dir.path());
        store
            .commit_batch(&[LyricsRecord::found(TrackId::new("aaa"), "words".into(), None, 1)])
            .unwrap();
        let a = album();
        let refs: Vec<TrackRef> = a.tracks.iter().map(|track| TrackRef { album: &a, track }).collect();
        assert_eq!(store.register_pending(&refs).unwrap(), 0);
        assert_eq!(store.get(&TrackId::new("aaa")).unwrap().unwrap().status, FetchStatus::Found);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_album(dir.path());
        let id = TrackId::new("aaa");
        store
            .commit_batch(&[LyricsRecord::found(id.clone(), "words".into(), None, 1)])
            .unwrap();

        let applied = store
            .commit_batch(&[
                LyricsRecord::error(id.clone(), "timeout", 3),
                LyricsRecord::pending(id.clone()),
                LyricsRecord::not_found(id.clone(), None, 1),
            ])
            .unwrap();
        assert_eq!(applied, 0);

        let r = store.get(&id).unwrap().unwrap();
        assert_eq!(r.status, FetchStatus::Found);
        assert_eq!(r.lyrics.as_deref(), Some("words"));
        assert_eq!(r.attempts, 1);
    }

    #[test]
    fn test_error_is_retryable_and_attempts_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_album(dir.path());
        let id = TrackId::new("bbb");
        store.commit_batch(&[LyricsRecord::error(id.clone(), "503", 3)]).unwrap();
        store.commit_batch(&[LyricsRecord::not_found(id.clone(), None, 1)]).unwrap();
        let r = store.get(&id).unwrap().unwrap();
        assert_eq!(r.status, FetchStatus::NotFound);
        assert_eq!(r.attempts, 4);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_check_constraint_rejects_found_without_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_album(dir.path());
        let result = store.connection().execute(
            "UPDATE lyrics_records SET status='found', lyrics=NULL WHERE track_id='aaa'",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_utf8_lyrics_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_album(dir.path());
        store
            .connection()
            .execute(
                "UPDATE lyrics_records SET status='found', lyrics=CAST(X'66FF6F' AS TEXT) WHERE track_id='aaa'",
                [],
            )
            .unwrap();
        match store.load_all() {
            Err(CacheError::CorruptLyrics { track_id }) => assert_eq!(track_id, "aaa"),
            other => panic!("expected corrupt lyrics, got {:?}", other.map(|m| m.len())),
        }
    }

    #[test]
    fn test_read_only_open_leaves_foreign_databases_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.sqlite3");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE notes (body TEXT);").unwrap();
        }
        assert!(CacheStore::open_read_only(&path).is_err());
        assert!(CacheStore::open_read_only(&dir.path().join("missing.sqlite3")).is_err());

        let conn = Connection::open(&path).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(mode, "delete");
        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name='lyrics_records'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_read_only_open_reads_a_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let store = open_with_album(dir.path());
            store.path().to_path_buf()
        };
        let store = CacheStore::open_read_only(&path).unwrap();
        assert_eq!(store.status_counts().unwrap(), vec![("pending".to_string(), 2)]);
        assert!(store.connection().execute("DELETE FROM lyrics_records", []).is_err());
    }

    #[test]
    fn test_counts_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_album(dir.path());
        store
            .commit_batch(&[LyricsRecord::error(TrackId::new("aaa"), "HTTP 500", 3)])
            .unwrap();
        let counts = store.status_counts().unwrap();
        assert_eq!(counts, vec![("error".to_string(), 1), ("pending".to_string(), 1)]);
        let errors = store.recent_errors(10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].title, "One");
        assert_eq!(errors[0].error.as_deref(), Some("HTTP 500"));
        assert_eq!(store.statuses().unwrap().get(&TrackId::new("bbb")), Some(&FetchStatus::Pending));
    }
}
