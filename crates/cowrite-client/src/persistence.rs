//! `SQLite` journal of applied operation records.
//!
//! Every record the session applies is appended to `op_journal`. A periodic
//! checkpoint stores the encoded document in `doc_snapshots` together with
//! the journal sequence it covers and drops the journal rows it subsumes.
//! On start the session restores the latest snapshot and replays the rows
//! written after it.

use chrono::Utc;
use cowrite_core::{codec, CodecError, Document, OperationRecord};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// `SQLite`-backed journal store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS doc_snapshots (
                doc_name TEXT PRIMARY KEY,
                snapshot_bytes BLOB NOT NULL,
                journal_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS op_journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                op_bytes BLOB NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_op_journal_doc ON op_journal(doc_name, seq);
            ",
        )?;

        Ok(())
    }

    /// Append an applied record; returns its journal sequence.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the insert fails.
    pub fn append_op(&self, doc_name: &str, op: &OperationRecord) -> Result<i64, StoreError> {
        let mut op_bytes = Vec::new();
        ciborium::into_writer(op, &mut op_bytes)
            .map_err(|e| StoreError::Record(e.to_string()))?;

        self.conn.execute(
            r"
            INSERT INTO op_journal (doc_name, kind, op_bytes, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (doc_name, op.kind(), op_bytes, Utc::now().to_rfc3339()),
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Records journaled for `doc_name` after sequence `after`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a row does not decode.
    pub fn ops_after(
        &self,
        doc_name: &str,
        after: i64,
    ) -> Result<Vec<(i64, OperationRecord)>, StoreError> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT seq, op_bytes FROM op_journal
            WHERE doc_name = ?1 AND seq > ?2
            ORDER BY seq ASC
            ",
        )?;

        let rows = stmt
            .query_map((doc_name, after), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, bytes)| {
                ciborium::from_reader(bytes.as_slice())
                    .map(|op| (seq, op))
                    .map_err(|e| StoreError::Record(format!("journal row {seq}: {e}")))
            })
            .collect()
    }

    /// Highest journal sequence recorded for `doc_name`, counting the rows
    /// already folded into its checkpoint; 0 if none.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn last_seq(&self, doc_name: &str) -> Result<i64, StoreError> {
        let journal: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM op_journal WHERE doc_name = ?1",
            [doc_name],
            |row| row.get(0),
        )?;
        let checkpoint = self.snapshot(doc_name)?.map_or(0, |(_, seq)| seq);
        Ok(journal.max(checkpoint))
    }

    /// Store a checkpoint of `doc` covering the journal through `journal_seq`
    /// and drop the rows it subsumes.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or a statement fails. The previous snapshot
    /// and journal are kept in that case.
    pub fn checkpoint(
        &mut self,
        doc_name: &str,
        doc: &Document,
        journal_seq: i64,
    ) -> Result<usize, StoreError> {
        let snapshot = codec::encode(doc)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r"
            INSERT OR REPLACE INTO doc_snapshots (doc_name, snapshot_bytes, journal_seq, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (doc_name, snapshot, journal_seq, Utc::now().to_rfc3339()),
        )?;
        let compacted = tx.execute(
            "DELETE FROM op_journal WHERE doc_name = ?1 AND seq <= ?2",
            (doc_name, journal_seq),
        )?;
        tx.commit()?;

        tracing::debug!(doc_name, journal_seq, compacted, "Journal checkpoint written");
        Ok(compacted)
    }

    /// Latest snapshot bytes and the journal sequence they cover.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn snapshot(&self, doc_name: &str) -> Result<Option<(Vec<u8>, i64)>, StoreError> {
        let result = self
            .conn
            .query_row(
                "SELECT snapshot_bytes, journal_seq FROM doc_snapshots WHERE doc_name = ?1",
                [doc_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(result)
    }

    /// Rebuild the document from the latest snapshot plus the journal.
    ///
    /// Returns `None` when nothing was ever recorded for `doc_name`.
    /// Journal rows the document rejects are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot is corrupt or the database fails.
    pub fn restore(&self, doc_name: &str) -> Result<Option<Document>, StoreError> {
        let snapshot = self.snapshot(doc_name)?;
        let found = snapshot.is_some();
        let (mut doc, after) = match snapshot {
            Some((bytes, seq)) => (codec::decode(&bytes)?, seq),
            None => (Document::new(), 0),
        };

        let ops = self.ops_after(doc_name, after)?;
        if !found && ops.is_empty() {
            return Ok(None);
        }

        let replayed = ops.len();
        for (seq, op) in ops {
            if let Err(err) = doc.remote_apply(&op) {
                tracing::warn!(seq, error = %err, "Skipping journal row");
            }
        }

        tracing::info!(
            doc_name,
            snapshot_seq = after,
            replayed,
            "Restored document from journal"
        );
        Ok(Some(doc))
    }
}

/// Errors for the journal store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Snapshot could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A journal row could not be encoded or decoded
    #[error("bad journal record: {0}")]
    Record(String),
}
