use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;
use tracing::{error, info};

use super::entities::{ActivityEvent, ActivityRow, ProgramRow, Scope};

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

const RECORD_TABLES: [&str; 9] = [
    "daily_records",
    "hourly_records",
    "minute_records",
    "foreground_daily_records",
    "foreground_hourly_records",
    "foreground_minute_records",
    "background_daily_records",
    "background_hourly_records",
    "background_minute_records",
];

/// The schema is created table-by-table with IF NOT EXISTS so running it
/// against an existing database is a no-op. Unique indexes carry the
/// identity tuples; the increment operations rely on them for their
/// single-statement upserts.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS daily_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      title TEXT NOT NULL DEFAULT '',
      event TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS daily_records_timestamp_program_title_event_idx
      ON daily_records (timestamp, program, title, event);
    CREATE TABLE IF NOT EXISTS hourly_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      title TEXT NOT NULL DEFAULT '',
      event TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS hourly_records_timestamp_program_title_event_idx
      ON hourly_records (timestamp, program, title, event);
    CREATE TABLE IF NOT EXISTS minute_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      title TEXT NOT NULL DEFAULT '',
      event TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS minute_records_timestamp_program_title_event_idx
      ON minute_records (timestamp, program, title, event);

    CREATE TABLE IF NOT EXISTS foreground_daily_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS foreground_daily_records_timestamp_program_idx
      ON foreground_daily_records (timestamp, program);
    CREATE TABLE IF NOT EXISTS foreground_hourly_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS foreground_hourly_records_timestamp_program_idx
      ON foreground_hourly_records (timestamp, program);
    CREATE TABLE IF NOT EXISTS foreground_minute_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS foreground_minute_records_timestamp_program_idx
      ON foreground_minute_records (timestamp, program);

    CREATE TABLE IF NOT EXISTS background_daily_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS background_daily_records_timestamp_program_idx
      ON background_daily_records (timestamp, program);
    CREATE TABLE IF NOT EXISTS background_hourly_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS background_hourly_records_timestamp_program_idx
      ON background_hourly_records (timestamp, program);
    CREATE TABLE IF NOT EXISTS background_minute_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      timestamp INTEGER NOT NULL,
      seconds INTEGER NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS background_minute_records_timestamp_program_idx
      ON background_minute_records (timestamp, program);

    CREATE TABLE IF NOT EXISTS marked_programs (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      program TEXT NOT NULL,
      createdAt TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS marked_programs_program_idx
      ON marked_programs (program);
";

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Early databases stored timestamps as text (ISO strings or stringified
/// integers). Normalizes any text-typed timestamp to integer epoch
/// milliseconds, tolerating both representations in the same table.
fn migrate_timestamp_columns(conn: &Connection) -> rusqlite::Result<()> {
    for table in RECORD_TABLES {
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET timestamp = CASE
                   WHEN timestamp GLOB '*[^0-9]*'
                     THEN CAST(strftime('%s', timestamp) AS INTEGER) * 1000
                   ELSE CAST(timestamp AS INTEGER)
                 END
                 WHERE typeof(timestamp) = 'text'"
            ),
            [],
        )?;
    }
    Ok(())
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(e) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {e}");
            }
            if let Err(join_error) = handle.join() {
                error!("Failed to join store thread: {join_error:?}");
            }
        }
    }
}

/// The persistence layer. One worker thread owns the only connection; every
/// operation is shipped to it as a closure and answered over a oneshot.
/// Increments are single-statement upserts, so they are atomic per identity
/// no matter how ticks overlap.
#[derive(Clone)]
pub struct AggregationStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl AggregationStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("activetime-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(e) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(e).context("failed to open SQLite database")
                        ));
                        return;
                    }
                };

                // WAL lets a reporting CLI read while the daemon writes.
                if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {e}");
                }

                let init_result = ensure_schema(&conn)
                    .and_then(|_| migrate_timestamp_columns(&conn))
                    .map_err(|e| anyhow::Error::new(e).context("failed to prepare schema"));
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .context("failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|e| anyhow!("failed to send command to store thread: {e}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

    /// Adds `seconds` to the activity bucket identified by (scope,
    /// timestamp, program, title, event), creating the row when absent. The
    /// event label is written on every call, so the latest classification
    /// wins while the count stays additive.
    pub async fn increment_activity_record(
        &self,
        scope: Scope,
        timestamp_ms: i64,
        program: &str,
        title: &str,
        event: ActivityEvent,
        seconds: i64,
    ) -> Result<()> {
        let program = program.to_string();
        let title = title.to_string();
        self.execute(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (timestamp, program, title, event, seconds)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(timestamp, program, title, event) DO UPDATE SET
                       seconds = seconds + excluded.seconds,
                       event = excluded.event",
                    scope.activity_table()
                ),
                params![timestamp_ms, program, title, event.as_str(), seconds],
            )
            .with_context(|| "failed to upsert activity record")?;
            Ok(())
        })
        .await
    }

    pub async fn increment_foreground_record(
        &self,
        scope: Scope,
        timestamp_ms: i64,
        program: &str,
        seconds: i64,
    ) -> Result<()> {
        self.increment_program_record(scope.foreground_table(), timestamp_ms, program, seconds)
            .await
    }

    pub async fn increment_background_record(
        &self,
        scope: Scope,
        timestamp_ms: i64,
        program: &str,
        seconds: i64,
    ) -> Result<()> {
        self.increment_program_record(scope.background_table(), timestamp_ms, program, seconds)
            .await
    }

    async fn increment_program_record(
        &self,
        table: &'static str,
        timestamp_ms: i64,
        program: &str,
        seconds: i64,
    ) -> Result<()> {
        let program = program.to_string();
        self.execute(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (timestamp, program, seconds)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(timestamp, program) DO UPDATE SET
                       seconds = seconds + excluded.seconds"
                ),
                params![timestamp_ms, program, seconds],
            )
            .with_context(|| format!("failed to upsert into {table}"))?;
            Ok(())
        })
        .await
    }

    /// Drops every table and rebuilds the schema from scratch, reclaiming
    /// disk space. Only ever triggered by an explicit user action.
    pub async fn clean_data(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS daily_records;
                 DROP TABLE IF EXISTS hourly_records;
                 DROP TABLE IF EXISTS minute_records;
                 DROP TABLE IF EXISTS foreground_daily_records;
                 DROP TABLE IF EXISTS foreground_hourly_records;
                 DROP TABLE IF EXISTS foreground_minute_records;
                 DROP TABLE IF EXISTS background_daily_records;
                 DROP TABLE IF EXISTS background_hourly_records;
                 DROP TABLE IF EXISTS background_minute_records;
                 DROP TABLE IF EXISTS marked_programs;
                 VACUUM;",
            )
            .with_context(|| "failed to drop tables")?;
            ensure_schema(conn).with_context(|| "failed to recreate schema")?;
            Ok(())
        })
        .await
    }

    /// Every program ever aggregated as foreground, across all three
    /// resolutions. Seeds the background-eligibility set at startup.
    pub async fn list_foreground_programs(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut statement = conn.prepare(
                "SELECT DISTINCT program FROM foreground_minute_records
                 UNION
                 SELECT DISTINCT program FROM foreground_hourly_records
                 UNION
                 SELECT DISTINCT program FROM foreground_daily_records",
            )?;
            let mut rows = statement.query([])?;
            let mut programs = Vec::new();
            while let Some(row) = rows.next()? {
                let program: String = row.get(0)?;
                let trimmed = program.trim();
                if !trimmed.is_empty() {
                    programs.push(trimmed.to_string());
                }
            }
            Ok(programs)
        })
        .await
    }

    pub async fn add_marked_program(&self, program: &str) -> Result<()> {
        let trimmed = program.trim().to_string();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO marked_programs (program) VALUES (?1)",
                params![trimmed],
            )
            .with_context(|| "failed to add marked program")?;
            Ok(())
        })
        .await
    }

    pub async fn remove_marked_program(&self, program: &str) -> Result<()> {
        let trimmed = program.trim().to_string();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM marked_programs WHERE program = ?1",
                params![trimmed],
            )
            .with_context(|| "failed to remove marked program")?;
            Ok(())
        })
        .await
    }

    pub async fn list_marked_programs(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut statement =
                conn.prepare("SELECT DISTINCT program FROM marked_programs ORDER BY program")?;
            let mut rows = statement.query([])?;
            let mut programs = Vec::new();
            while let Some(row) = rows.next()? {
                programs.push(row.get::<_, String>(0)?);
            }
            Ok(programs)
        })
        .await
    }

    pub async fn activity_records_since(
        &self,
        scope: Scope,
        cutoff_ms: i64,
    ) -> Result<Vec<ActivityRow>> {
        self.execute(move |conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT program, title, event, timestamp, seconds FROM {}
                 WHERE timestamp >= ?1 ORDER BY timestamp",
                scope.activity_table()
            ))?;
            let mut rows = statement.query(params![cutoff_ms])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(ActivityRow {
                    program: row.get(0)?,
                    title: row.get(1)?,
                    event: row.get(2)?,
                    timestamp: row.get(3)?,
                    seconds: row.get(4)?,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn foreground_records_since(
        &self,
        scope: Scope,
        cutoff_ms: i64,
    ) -> Result<Vec<ProgramRow>> {
        self.program_records_since(scope.foreground_table(), cutoff_ms)
            .await
    }

    pub async fn background_records_since(
        &self,
        scope: Scope,
        cutoff_ms: i64,
    ) -> Result<Vec<ProgramRow>> {
        self.program_records_since(scope.background_table(), cutoff_ms)
            .await
    }

    async fn program_records_since(
        &self,
        table: &'static str,
        cutoff_ms: i64,
    ) -> Result<Vec<ProgramRow>> {
        self.execute(move |conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT program, timestamp, seconds FROM {table}
                 WHERE timestamp >= ?1 ORDER BY timestamp"
            ))?;
            let mut rows = statement.query(params![cutoff_ms])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(ProgramRow {
                    program: row.get(0)?,
                    timestamp: row.get(1)?,
                    seconds: row.get(2)?,
                });
            }
            Ok(records)
        })
        .await
    }

    /// Size of the database file on disk.
    pub async fn file_size(&self) -> Result<u64> {
        Ok(tokio::fs::metadata(self.db_path.as_path()).await?.len())
    }
}
