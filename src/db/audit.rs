//! Append-only, hash-chained audit ledger
//!
//! Every accepted mutation appends one entry. Chains are maintained per
//! table: an entry stores the sha256 of the row's canonical serialization
//! (`content_hash`) and the chain hash of the previous entry for the same
//! table (`prev_hash`). The chain hash of an entry is
//! `sha256(content_hash || prev_hash)`, so altering any persisted entry
//! breaks the linkage of every later entry in that table.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, Result};

/// Mutation kinds recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "Insert"),
            Operation::Update => write!(f, "Update"),
            Operation::Delete => write!(f, "Delete"),
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(Operation::Insert),
            "Update" => Ok(Operation::Update),
            "Delete" => Ok(Operation::Delete),
            _ => Err(format!("Unknown operation: {}", s)),
        }
    }
}

/// Hex sha256 of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Chain hash of an entry: sha256 over content hash then previous chain hash
fn chain_hash(content_hash: &str, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(prev_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of a successful full-ledger verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Number of distinct table chains replayed
    pub tables: usize,
    /// Total entries checked
    pub entries: usize,
}

/// Owns the committed per-table chain heads.
///
/// Heads are reconstructed from the persisted ledger when a store opens and
/// advance only when a write transaction commits; a rolled-back transaction
/// discards its pending heads.
#[derive(Debug)]
pub struct AuditLedger {
    heads: HashMap<String, String>,
}

impl AuditLedger {
    /// Rebuild chain heads from the last persisted entry of each table
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut heads = HashMap::new();

        let mut stmt = conn.prepare(
            "SELECT table_name, content_hash, prev_hash FROM audit_log
             WHERE id IN (SELECT MAX(id) FROM audit_log GROUP BY table_name)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        for row in rows {
            let (table, content, prev) = row?;
            heads.insert(table, chain_hash(&content, &prev));
        }

        Ok(Self { heads })
    }

    /// Snapshot the committed heads for use inside a write transaction
    pub fn begin(&self) -> LedgerTxn {
        LedgerTxn {
            heads: self.heads.clone(),
        }
    }

    /// Adopt the pending heads of a committed transaction
    pub fn commit(&mut self, txn: LedgerTxn) {
        self.heads = txn.heads;
    }

    /// Replay every table's chain from its first entry.
    ///
    /// Never mutates state. Returns the first `(table, entry)` whose stored
    /// previous-hash disagrees with the recomputed chain.
    pub fn verify(&self, conn: &Connection) -> Result<VerifyReport> {
        let mut tables: Vec<String> = Vec::new();
        {
            let mut stmt =
                conn.prepare("SELECT DISTINCT table_name FROM audit_log ORDER BY table_name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                tables.push(row?);
            }
        }

        let mut entries = 0usize;
        for table in &tables {
            let mut stmt = conn.prepare(
                "SELECT id, row_id, content_hash, prev_hash FROM audit_log
                 WHERE table_name = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![table], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut running = String::new();
            for row in rows {
                let (entry_id, row_id, content, prev) = row?;
                if prev != running {
                    return Err(Error::Integrity {
                        table: table.clone(),
                        entry_id,
                        row_id,
                        expected: running,
                        actual: prev,
                    });
                }
                running = chain_hash(&content, &prev);
                entries += 1;
            }

            // The cached head must agree with the replayed chain.
            if let Some(cached) = self.heads.get(table) {
                if *cached != running {
                    return Err(Error::Integrity {
                        table: table.clone(),
                        entry_id: -1,
                        row_id: -1,
                        expected: running,
                        actual: cached.clone(),
                    });
                }
            }
        }

        Ok(VerifyReport {
            tables: tables.len(),
            entries,
        })
    }
}

/// Pending chain heads for one write transaction
#[derive(Debug)]
pub struct LedgerTxn {
    heads: HashMap<String, String>,
}

impl LedgerTxn {
    /// Append one entry for a mutation of `table`/`row_id`.
    ///
    /// `snapshot` is the canonical serialization of the affected row. The
    /// insert happens inside the caller's transaction; the pending head
    /// advances immediately and becomes committed only via
    /// [`AuditLedger::commit`].
    pub fn append(
        &mut self,
        conn: &Connection,
        table: &str,
        op: Operation,
        row_id: i64,
        snapshot: &str,
    ) -> Result<i64> {
        let content_hash = sha256_hex(snapshot.as_bytes());
        let prev_hash = self.heads.get(table).cloned().unwrap_or_default();

        conn.execute(
            "INSERT INTO audit_log (timestamp, operation, table_name, row_id, content_hash, prev_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                op.to_string(),
                table,
                row_id,
                content_hash,
                prev_hash
            ],
        )?;
        let entry_id = conn.last_insert_rowid();

        self.heads
            .insert(table.to_string(), chain_hash(&content_hash, &prev_hash));

        Ok(entry_id)
    }
}

/// Number of ledger entries for one table
pub fn chain_len(conn: &Connection, table: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Total ledger length across all tables
pub fn total_len(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
    Ok(count)
}

/// Dump the full ledger as CSV, one record per entry
pub fn export_csv<W: Write>(conn: &Connection, writer: W) -> Result<u64> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record([
        "id",
        "timestamp",
        "operation",
        "table_name",
        "row_id",
        "content_hash",
        "prev_hash",
    ])
    .map_err(|e| Error::Validation(format!("csv export failed: {e}")))?;

    let mut stmt = conn.prepare(
        "SELECT id, timestamp, operation, table_name, row_id, content_hash, prev_hash
         FROM audit_log ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok([
            row.get::<_, i64>(0)?.to_string(),
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?.to_string(),
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ])
    })?;

    let mut written = 0u64;
    for row in rows {
        out.write_record(&row?)
            .map_err(|e| Error::Validation(format!("csv export failed: {e}")))?;
        written += 1;
    }
    out.flush()?;

    Ok(written)
}
