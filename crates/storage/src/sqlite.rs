use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::{sync::oneshot, task};
use tracing::{debug, info};

use crate::{ConfirmationLog, ConfirmationStatus, StorageError, StoredConfirmation};

#[derive(Debug)]
pub struct SqliteConfirmationLog {
    path: PathBuf,
    writer: Sender<LogCommand>,
}

enum LogCommand {
    Append {
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
        response: oneshot::Sender<Result<StoredConfirmation, StorageError>>,
    },
    Pending {
        limit: usize,
        response: oneshot::Sender<Result<Vec<StoredConfirmation>, StorageError>>,
    },
    RecordAttempt {
        id: i64,
        at: DateTime<Utc>,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    MarkSent {
        id: i64,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    PurgeSent {
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
    PendingCount {
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
}

enum WriterState {
    Ready(Connection),
    Failed(String),
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_outbound_confirmations.sql"),
}];

fn query_error(error: rusqlite::Error) -> StorageError {
    StorageError::QueryFailed(error.to_string())
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let failed = |reason: String| StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| failed(error.to_string()))?;
    }

    let connection = Connection::open(path).map_err(|error| failed(error.to_string()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| failed(error.to_string()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| failed(error.to_string()))?;
    connection
        .pragma_update(None, "synchronous", "FULL")
        .map_err(|error| failed(error.to_string()))?;
    Ok(connection)
}

fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        let failed = |reason: String| StorageError::MigrationFailed {
            version: migration.version,
            reason,
        };

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| failed(format!("failed to begin transaction: {error}")))?;
        tx.execute_batch(migration.sql)
            .map_err(|error| failed(error.to_string()))?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| failed(format!("failed to record migration: {error}")))?;
        tx.commit()
            .map_err(|error| failed(format!("failed to commit migration: {error}")))?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| StorageError::QueryFailed(format!("bad timestamp '{value}': {error}")))
}

type RawRow = (i64, Vec<u8>, String, i64, Option<String>, String);

fn decode_row(raw: RawRow) -> Result<StoredConfirmation, StorageError> {
    let (id, payload, created_at, attempts, last_attempt_at, status) = raw;
    Ok(StoredConfirmation {
        id,
        payload,
        created_at: parse_timestamp(&created_at)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_attempt_at: last_attempt_at.as_deref().map(parse_timestamp).transpose()?,
        status: ConfirmationStatus::parse(&status)?,
    })
}

fn append(
    connection: &Connection,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
) -> Result<StoredConfirmation, StorageError> {
    connection
        .execute(
            "INSERT INTO outbound_confirmations (payload, created_at, status) VALUES (?1, ?2, 'pending')",
            params![payload, created_at.to_rfc3339()],
        )
        .map_err(query_error)?;

    Ok(StoredConfirmation {
        id: connection.last_insert_rowid(),
        payload,
        created_at,
        attempts: 0,
        last_attempt_at: None,
        status: ConfirmationStatus::Pending,
    })
}

fn pending(connection: &Connection, limit: usize) -> Result<Vec<StoredConfirmation>, StorageError> {
    let mut statement = connection
        .prepare(
            "SELECT id, payload, created_at, attempts, last_attempt_at, status
             FROM outbound_confirmations
             WHERE status = 'pending'
             ORDER BY id ASC
             LIMIT ?1",
        )
        .map_err(query_error)?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = statement
        .query_map(params![limit], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .map_err(query_error)?;

    let mut output = Vec::new();
    for row in rows {
        output.push(decode_row(row.map_err(query_error)?)?);
    }
    Ok(output)
}

fn update_one(connection: &Connection, id: i64, sql: &str, at: Option<String>) -> Result<(), StorageError> {
    let changed = match at {
        Some(at) => connection.execute(sql, params![id, at]),
        None => connection.execute(sql, params![id]),
    }
    .map_err(query_error)?;

    if changed == 0 {
        return Err(StorageError::NotFound(id));
    }
    Ok(())
}

fn pending_count(connection: &Connection) -> Result<u64, StorageError> {
    let count: Option<i64> = connection
        .query_row(
            "SELECT COUNT(*) FROM outbound_confirmations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(query_error)?;
    Ok(count.map_or(0, |count| u64::try_from(count).unwrap_or(0)))
}

fn handle_command(connection: &Connection, command: LogCommand) {
    match command {
        LogCommand::Append {
            payload,
            created_at,
            response,
        } => {
            let _ = response.send(append(connection, payload, created_at));
        }
        LogCommand::Pending { limit, response } => {
            let _ = response.send(pending(connection, limit));
        }
        LogCommand::RecordAttempt { id, at, response } => {
            let _ = response.send(update_one(
                connection,
                id,
                "UPDATE outbound_confirmations SET attempts = attempts + 1, last_attempt_at = ?2 WHERE id = ?1",
                Some(at.to_rfc3339()),
            ));
        }
        LogCommand::MarkSent { id, response } => {
            let _ = response.send(update_one(
                connection,
                id,
                "UPDATE outbound_confirmations SET status = 'sent' WHERE id = ?1",
                None,
            ));
        }
        LogCommand::PurgeSent { response } => {
            let result = connection
                .execute("DELETE FROM outbound_confirmations WHERE status = 'sent'", [])
                .map(|removed| removed as u64)
                .map_err(query_error);
            let _ = response.send(result);
        }
        LogCommand::PendingCount { response } => {
            let _ = response.send(pending_count(connection));
        }
    }
}

fn fail_command(command: LogCommand, error: StorageError) {
    match command {
        LogCommand::Append { response, .. } => {
            let _ = response.send(Err(error));
        }
        LogCommand::Pending { response, .. } => {
            let _ = response.send(Err(error));
        }
        LogCommand::RecordAttempt { response, .. } | LogCommand::MarkSent { response, .. } => {
            let _ = response.send(Err(error));
        }
        LogCommand::PurgeSent { response } | LogCommand::PendingCount { response } => {
            let _ = response.send(Err(error));
        }
    }
}

fn run_writer(path: PathBuf, receiver: Receiver<LogCommand>) {
    let state = match open_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    while let Ok(command) = receiver.recv() {
        match &state {
            WriterState::Ready(connection) => handle_command(connection, command),
            WriterState::Failed(reason) => fail_command(
                command,
                StorageError::ConnectionFailed {
                    path: path.clone(),
                    reason: reason.clone(),
                },
            ),
        }
    }

    debug!(path = %path.display(), "confirmation log writer stopped");
}

impl SqliteConfirmationLog {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_connection(&setup_path)?;
            run_migrations(&connection)
        })
        .await
        .map_err(|error| StorageError::ConnectionFailed {
            path: path.clone(),
            reason: format!("failed to join storage setup task: {error}"),
        })??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("confirmation_log_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| StorageError::ConnectionFailed {
                path: path.clone(),
                reason: format!("failed to spawn confirmation_log_writer: {error}"),
            })?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StorageError>>) -> LogCommand,
    ) -> Result<T, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.writer.send(build(response_tx)).map_err(|_| {
            StorageError::Unavailable("confirmation log writer is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::Unavailable(
                "confirmation log writer terminated before responding".to_string(),
            )
        })?
    }
}

impl ConfirmationLog for SqliteConfirmationLog {
    async fn append(&self, payload: Vec<u8>) -> Result<StoredConfirmation, StorageError> {
        let created_at = Utc::now();
        self.request(|response| LogCommand::Append {
            payload,
            created_at,
            response,
        })
        .await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<StoredConfirmation>, StorageError> {
        self.request(|response| LogCommand::Pending { limit, response })
            .await
    }

    async fn record_attempt(&self, id: i64) -> Result<(), StorageError> {
        let at = Utc::now();
        self.request(|response| LogCommand::RecordAttempt { id, at, response })
            .await
    }

    async fn mark_sent(&self, id: i64) -> Result<(), StorageError> {
        self.request(|response| LogCommand::MarkSent { id, response })
            .await
    }

    async fn purge_sent(&self) -> Result<u64, StorageError> {
        self.request(|response| LogCommand::PurgeSent { response })
            .await
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        self.request(|response| LogCommand::PendingCount { response })
            .await
    }
}
