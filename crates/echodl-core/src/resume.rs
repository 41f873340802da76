//! Persistent resume store (SQLite via sqlx).
//!
//! One row per download job: URL, destination, size, resume validators
//! (ETag/Last-Modified), the coalesced set of completed byte ranges (JSON),
//! lifecycle state, priority, and a settings JSON column kept for forward
//! compatibility (unknown fields are ignored on read).
//!
//! A completed range is durable once `record_completed_range` returns: the
//! awaited transaction commit is the durability point, and workers only
//! report a range as done after that. Read-modify-write updates are
//! serialized by an internal lock so concurrent workers of the same job never
//! lose each other's ranges (range merging itself is commutative).

use crate::ranges::{ByteRange, RangeSet};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Job identifier.
pub type JobId = i64;

/// Job priority; higher values are admitted first.
pub type JobPriority = i32;

/// Lifecycle state stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "paused" => JobState::Paused,
            "completed" => JobState::Completed,
            "cancelled" => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }
}

/// Per-job settings, stored as JSON. Unknown fields from newer writers are
/// ignored so old engines can still read the record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct JobSettings {
    /// Free-form note, reserved for per-job tuning extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Summary view for `ListJobs`.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: JobId,
    pub url: String,
    pub destination: PathBuf,
    pub state: JobState,
    pub priority: JobPriority,
    pub total_size: Option<u64>,
    pub bytes_done: u64,
}

/// Full per-job record used by the job runner.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub url: String,
    pub destination: PathBuf,
    pub state: JobState,
    pub priority: JobPriority,
    pub total_size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub completed: RangeSet,
    pub retry_count: u32,
    pub created_at: i64,
}

/// Handle to the SQLite-backed resume store. Cloning shares the pool.
#[derive(Clone)]
pub struct ResumeStore {
    pool: Pool<Sqlite>,
    // Serializes read-modify-write updates (range merges, retry bumps).
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ResumeStore {
    /// Open (or create) the default store under the XDG state directory
    /// (`~/.local/state/echodl/jobs.db`) and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("echodl")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("jobs.db")).await
    }

    /// Open (or create) a store at an explicit path. Used by tests and the
    /// CLI's `--state-dir` override.
    pub async fn open_at(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("invalid db path {}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // FULL so an awaited commit is durable, which is what lets
            // workers treat "record returned" as "range is safe".
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = ResumeStore {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                total_size INTEGER,
                etag TEXT,
                last_modified TEXT,
                completed_ranges TEXT NOT NULL DEFAULT '[]',
                state TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                settings_json TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a new queued job. Size and validators are filled in after the
    /// first probe.
    pub async fn add_job(
        &self,
        url: &str,
        destination: &Path,
        priority: JobPriority,
        settings: &JobSettings,
    ) -> Result<JobId> {
        let now = unix_timestamp();
        let settings_json = serde_json::to_string(settings)?;
        let row_id = sqlx::query(
            r#"
            INSERT INTO jobs (
                url, destination, total_size, etag, last_modified,
                completed_ranges, state, priority, retry_count,
                created_at, updated_at, settings_json
            ) VALUES (?1, ?2, NULL, NULL, NULL, '[]', ?3, ?4, 0, ?5, ?5, ?6)
            "#,
        )
        .bind(url)
        .bind(destination.to_string_lossy().as_ref())
        .bind(JobState::Queued.as_str())
        .bind(priority)
        .bind(now)
        .bind(settings_json)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(row_id)
    }

    /// Full record for one job, or `None` if it does not exist.
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, url, destination, state, priority, total_size,
                   etag, last_modified, completed_ranges, retry_count, created_at
            FROM jobs WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let ranges_json: String = row.get("completed_ranges");
        let completed = RangeSet::from_json(&ranges_json)
            .with_context(|| format!("corrupt completed_ranges for job {}", id))?;
        let state_str: String = row.get("state");
        let total_size: Option<i64> = row.get("total_size");
        let retry_count: i64 = row.get("retry_count");
        Ok(Some(JobRecord {
            id: row.get("id"),
            url: row.get("url"),
            destination: PathBuf::from(row.get::<String, _>("destination")),
            state: JobState::parse(&state_str),
            priority: row.get("priority"),
            total_size: total_size.map(|n| n as u64),
            etag: row.get("etag"),
            last_modified: row.get("last_modified"),
            completed,
            retry_count: retry_count as u32,
            created_at: row.get("created_at"),
        }))
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, destination, state, priority, total_size, completed_ranges
            FROM jobs
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.get("state");
            let total_size: Option<i64> = row.get("total_size");
            let ranges_json: String = row.get("completed_ranges");
            let bytes_done = RangeSet::from_json(&ranges_json)
                .map(|s| s.bytes_done())
                .unwrap_or(0);
            out.push(JobSummary {
                id: row.get("id"),
                url: row.get("url"),
                destination: PathBuf::from(row.get::<String, _>("destination")),
                state: JobState::parse(&state_str),
                priority: row.get("priority"),
                total_size: total_size.map(|n| n as u64),
                bytes_done,
            });
        }
        Ok(out)
    }

    /// Next job eligible for admission: highest priority first, FIFO within
    /// a priority tier (creation time, then id). Deterministic by design.
    pub async fn next_eligible_job(&self) -> Result<Option<JobId>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state = 'queued'
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Update lifecycle state.
    pub async fn set_state(&self, id: JobId, state: JobState) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update priority; the scheduler re-reads admission order each pass.
    pub async fn set_priority(&self, id: JobId, priority: JobPriority) -> Result<()> {
        sqlx::query("UPDATE jobs SET priority = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(priority)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve the destination to a concrete file path (directory + derived
    /// filename happens after the first probe).
    pub async fn set_destination(&self, id: JobId, destination: &Path) -> Result<()> {
        sqlx::query("UPDATE jobs SET destination = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(destination.to_string_lossy().as_ref())
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store probe metadata (size and resume validators).
    pub async fn set_metadata(
        &self,
        id: JobId,
        total_size: Option<u64>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET total_size = ?1, etag = ?2, last_modified = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(total_size.map(|n| n as i64))
        .bind(etag)
        .bind(last_modified)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merge a completed range into the job's record. Durable once this
    /// returns; safe to call from many workers of the same job concurrently.
    pub async fn record_completed_range(&self, id: JobId, range: ByteRange) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query("SELECT completed_ranges FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", id))?;
        let ranges_json: String = row.get("completed_ranges");
        let mut set = RangeSet::from_json(&ranges_json)
            .with_context(|| format!("corrupt completed_ranges for job {}", id))?;
        set.insert(range);
        sqlx::query("UPDATE jobs SET completed_ranges = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(set.to_json()?)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Discard recorded progress and metadata (remote changed; restart).
    pub async fn clear_progress(&self, id: JobId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE jobs
            SET completed_ranges = '[]', total_size = NULL, etag = NULL,
                last_modified = NULL, retry_count = 0, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record retries spent on the job (for status display and tests).
    pub async fn add_retries(&self, id: JobId, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE jobs SET retry_count = retry_count + ?1, updated_at = ?2 WHERE id = ?3")
            .bind(n as i64)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a job row. Atomic; file cleanup is handled by the caller.
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Demote jobs left `Running` by a crash back to `Paused` so their
    /// recorded progress is resumed rather than believed in-flight.
    pub async fn recover_running_jobs(&self) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'paused', updated_at = ?1 WHERE state = 'running'")
            .bind(unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
