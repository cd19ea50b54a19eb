//! Local SQLite database layer backing the durable store.
//!
//! Uses rusqlite with WAL mode. The schema is a partition registry plus a
//! single `records` table keyed by `(partition, record_key)`; partitions are
//! rows in the registry, so creating one never touches existing data.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::SyncResult;

/// Shared database handle. Each store call locks the connection for the
/// duration of one transaction.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// File name of the durable store inside the data directory.
pub const DB_FILE_NAME: &str = "water-admin-offline.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// A named partition and the record field used as its primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: &'static str,
    pub key_path: &'static str,
}

pub const CARGAS: PartitionSpec = PartitionSpec { name: "cargas", key_path: "id" };
pub const PAGOS: PartitionSpec = PartitionSpec { name: "pagos", key_path: "id" };
pub const CONDUCTORES: PartitionSpec = PartitionSpec { name: "conductores", key_path: "id" };
pub const USUARIOS: PartitionSpec = PartitionSpec { name: "usuarios", key_path: "id" };
pub const DASHBOARD: PartitionSpec = PartitionSpec { name: "dashboard", key_path: "key" };
pub const PERFIL: PartitionSpec = PartitionSpec { name: "perfil", key_path: "id" };
pub const SYNC_QUEUE: PartitionSpec = PartitionSpec { name: "syncQueue", key_path: "id" };
pub const SYNC_REQUESTS: PartitionSpec = PartitionSpec { name: "syncRequests", key_path: "id" };
pub const CACHE: PartitionSpec = PartitionSpec { name: "cache", key_path: "key" };

/// Every partition the app expects to exist after open.
pub const APP_PARTITIONS: &[PartitionSpec] = &[
    CARGAS,
    PAGOS,
    CONDUCTORES,
    USUARIOS,
    DASHBOARD,
    PERFIL,
    SYNC_QUEUE,
    SYNC_REQUESTS,
    CACHE,
];

/// Initialize the database at `{data_dir}/water-admin-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, runs
/// pending migrations and creates any missing partition from `partitions`.
/// On open failure, deletes the file and retries once.
pub fn init(data_dir: &Path, partitions: &[PartitionSpec]) -> SyncResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening durable store at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Durable store open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;
    for spec in partitions {
        ensure_partition(&conn, spec)?;
    }

    info!(
        partitions = partitions.len(),
        "Durable store initialized (schema v{CURRENT_SCHEMA_VERSION})"
    );

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a throwaway in-memory store. Used by tests and by ephemeral sessions.
pub fn init_in_memory(partitions: &[PartitionSpec]) -> SyncResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    run_migrations(&conn)?;
    for spec in partitions {
        ensure_partition(&conn, spec)?;
    }
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Durable store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating durable store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: partition registry and record table.
fn migrate_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS partitions (
            name TEXT PRIMARY KEY,
            key_path TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS records (
            partition TEXT NOT NULL REFERENCES partitions(name) ON DELETE CASCADE,
            record_key TEXT NOT NULL,
            value TEXT NOT NULL,
            seq INTEGER NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (partition, record_key)
        );

        CREATE INDEX IF NOT EXISTS idx_records_partition_seq ON records(partition, seq);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Create the partition if it does not exist. Existing partitions keep their
/// records and their original key path.
pub fn ensure_partition(conn: &Connection, spec: &PartitionSpec) -> SyncResult<()> {
    let existing = partition_key_path(conn, spec.name)?;
    match existing {
        Some(key_path) if key_path != spec.key_path => {
            warn!(
                partition = spec.name,
                stored = %key_path,
                requested = spec.key_path,
                "Partition already exists with a different key path; keeping stored one"
            );
        }
        Some(_) => {}
        None => {
            conn.execute(
                "INSERT INTO partitions (name, key_path) VALUES (?1, ?2)",
                params![spec.name, spec.key_path],
            )?;
            info!(partition = spec.name, key_path = spec.key_path, "Created partition");
        }
    }
    Ok(())
}

/// Key path of a registered partition, or `None` when it was never created.
pub fn partition_key_path(conn: &Connection, name: &str) -> SyncResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT key_path FROM partitions WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}
