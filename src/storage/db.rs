use redb::{Database as RedbDatabase, ReadTransaction, WriteTransaction};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::{Table, ROW_EXPIRY};
use crate::clock::{Clock, SystemClock};

/// Physical store failure. Surfaced to callers unchanged; the engine never
/// retries on its own.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
}

/// Handle to the partitioned row store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        Self::open_with_clock(data_dir, Arc::new(SystemClock))
    }

    /// Open or create a database whose TTL bookkeeping reads time from `clock`
    pub fn open_with_clock<P: AsRef<Path>>(
        data_dir: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("identity-store.redb");
        let db = RedbDatabase::create(db_path)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let _ = write_txn.open_table(table.definition())?;
            }
            let _ = write_txn.open_table(ROW_EXPIRY)?;
        }
        write_txn.commit()?;

        tracing::debug!(tables = Table::ALL.len(), "Database opened");

        Ok(Self {
            db: Arc::new(db),
            clock,
        })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}
