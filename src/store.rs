use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::{info, warn};

use crate::error::UploadError;

// Compared verbatim against `sqlite_master`.
pub const RUN_TABLE_SCHEMA: &str =
    "CREATE TABLE run (local text primary key, remote text unique, uploaded int)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMapping {
    pub remote: String,
    pub uploaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    Current,
    Created,
    Recreated,
}

pub struct RunStore {
    path: Option<Utf8PathBuf>,
    conn: Option<Connection>,
    read_only: bool,
}

impl RunStore {
    pub fn open(path: &Utf8Path, read_only: bool) -> Result<Self, UploadError> {
        let mut store = Self {
            path: None,
            conn: None,
            read_only,
        };
        store.reload(path)?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, UploadError> {
        let mut conn = Connection::open_in_memory().map_err(db_err)?;
        reconcile_schema(&mut conn, false, ":memory:")?;
        Ok(Self {
            path: None,
            conn: Some(conn),
            read_only: false,
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn reload(&mut self, path: &Utf8Path) -> Result<bool, UploadError> {
        if self.path.as_deref() == Some(path) && self.conn.is_some() {
            return Ok(false);
        }
        if !self.read_only {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| UploadError::Filesystem(err.to_string()))?;
            }
        }
        let mut conn = Connection::open(path.as_std_path()).map_err(db_err)?;
        let state = reconcile_schema(&mut conn, self.read_only, path.as_str())?;

        if let Some(previous) = self.conn.replace(conn) {
            if !previous.is_autocommit() {
                if let Err(err) = previous.execute_batch("ROLLBACK") {
                    warn!(error = %err, "rollback of previous run database failed");
                }
            }
            if let Err((_, err)) = previous.close() {
                warn!(error = %err, "closing previous run database failed");
            }
        }
        info!(path = %path, schema = ?state, "run database opened");
        self.path = Some(path.to_owned());
        Ok(true)
    }

    pub fn get(&mut self, local_id: &str) -> Result<Option<RunMapping>, UploadError> {
        let conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT remote, uploaded FROM run WHERE local = ?1",
                params![local_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        tx.rollback().map_err(db_err)?;
        row.map(|(remote, uploaded)| {
            Ok(RunMapping {
                remote,
                uploaded: counter(uploaded)?,
            })
        })
        .transpose()
    }

    pub fn create(&mut self, local_id: &str, remote_id: &str) -> Result<(), UploadError> {
        self.ensure_writable()?;
        let conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO run (local, remote, uploaded) VALUES (?1, ?2, 0)",
            params![local_id, remote_id],
        )
        .map_err(|err| insert_err(err, local_id))?;
        tx.commit().map_err(db_err)
    }

    pub fn increment(&mut self, local_id: &str) -> Result<u64, UploadError> {
        self.ensure_writable()?;
        let conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE run SET uploaded = uploaded + 1 WHERE local = ?1",
                params![local_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(UploadError::RunNotFound(local_id.to_string()));
        }
        let uploaded: i64 = tx
            .query_row(
                "SELECT uploaded FROM run WHERE local = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        counter(uploaded)
    }

    pub fn delete(&mut self, local_id: &str) -> Result<bool, UploadError> {
        self.ensure_writable()?;
        let conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute("DELETE FROM run WHERE local = ?1", params![local_id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(changed > 0)
    }

    fn ensure_writable(&self) -> Result<(), UploadError> {
        if self.read_only {
            return Err(UploadError::ReadOnly);
        }
        Ok(())
    }

    fn conn(&mut self) -> Result<&mut Connection, UploadError> {
        self.conn
            .as_mut()
            .ok_or_else(|| UploadError::Store("run database is not open".to_string()))
    }
}

fn reconcile_schema(
    conn: &mut Connection,
    read_only: bool,
    label: &str,
) -> Result<SchemaState, UploadError> {
    let tx = conn.transaction().map_err(db_err)?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = ?1 AND name = ?2",
            params!["table", "run"],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let state = match existing {
        Some(sql) if sql == RUN_TABLE_SCHEMA => return Ok(SchemaState::Current),
        Some(sql) => {
            if read_only {
                return Err(UploadError::SchemaMismatch(label.to_string()));
            }
            warn!(path = label, found = %sql, "run table schema mismatch, recreating");
            tx.execute_batch("DROP TABLE run").map_err(db_err)?;
            SchemaState::Recreated
        }
        // A missing table is created even for read-only stores.
        None => SchemaState::Created,
    };
    tx.execute_batch(RUN_TABLE_SCHEMA).map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    Ok(state)
}

fn counter(value: i64) -> Result<u64, UploadError> {
    u64::try_from(value)
        .map_err(|_| UploadError::Store(format!("negative upload counter: {value}")))
}

fn insert_err(err: rusqlite::Error, local_id: &str) -> UploadError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            UploadError::DuplicateRun(local_id.to_string())
        }
        _ => db_err(err),
    }
}

fn db_err(err: rusqlite::Error) -> UploadError {
    UploadError::Store(err.to_string())
}
