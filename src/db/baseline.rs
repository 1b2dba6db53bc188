//! Baseline (snapshot) management
//!
//! A baseline is an immutable logical copy of the working dataset, realized
//! in place: every `"Working"` row is cloned with its `baseline` column set
//! to the new label. The clones are frozen by the store's tag check; the
//! originals stay editable. Baseline clones are bookkeeping, not edits, so
//! they do not appear in the audit ledger (the `baseline_metadata` table
//! records them instead).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::info;

use crate::core::error::{Error, Result};
use crate::core::identity::{HierId, Kind};
use crate::db::store::{fetch_all, fetch_children, try_fetch_by_hierarchy, EntityStore};
use crate::entities::{Entity, WORKING_BASELINE};

/// Policy when creating a baseline under a label that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCollision {
    /// Clear and replace the prior snapshot
    Overwrite,
    /// Abort with no change at all
    Cancel,
}

/// Snapshot bookkeeping record
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineInfo {
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub row_count: i64,
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 64
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn label_exists(conn: &Connection, label: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM baseline_metadata WHERE label = ?1",
        params![label],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn clone_rows(conn: &Connection, label: &str) -> Result<i64> {
    let mut cloned = 0i64;
    for kind in Kind::all() {
        let table = kind.table();
        cloned += conn.execute(
            &format!(
                "INSERT INTO {table} (type_tag, hierarchy, baseline, parent_id, system_id,
                     name, description, criticality,
                     confidentiality, confidentiality_rationale,
                     integrity, integrity_rationale,
                     availability, availability_rationale,
                     authenticity, authenticity_rationale,
                     props, created_at, updated_at)
                 SELECT type_tag, hierarchy, ?1, parent_id, system_id,
                     name, description, criticality,
                     confidentiality, confidentiality_rationale,
                     integrity, integrity_rationale,
                     availability, availability_rationale,
                     authenticity, authenticity_rationale,
                     props, created_at, updated_at
                 FROM {table} WHERE baseline = ?2"
            ),
            params![label, WORKING_BASELINE],
        )? as i64;
    }
    conn.execute(
        "INSERT INTO requirement_trace (child_id, parent_id, baseline)
         SELECT child_id, parent_id, ?1 FROM requirement_trace WHERE baseline = ?2",
        params![label, WORKING_BASELINE],
    )?;
    Ok(cloned)
}

fn remove_rows(conn: &Connection, label: &str) -> Result<i64> {
    let mut removed = 0i64;
    for kind in Kind::all() {
        removed += conn.execute(
            &format!("DELETE FROM {} WHERE baseline = ?1", kind.table()),
            params![label],
        )? as i64;
    }
    conn.execute(
        "DELETE FROM requirement_trace WHERE baseline = ?1",
        params![label],
    )?;
    conn.execute(
        "DELETE FROM baseline_metadata WHERE label = ?1",
        params![label],
    )?;
    Ok(removed)
}

impl EntityStore {
    /// Snapshot the entire working dataset under `label`.
    ///
    /// Runs as one transaction: either the whole snapshot exists afterwards
    /// or nothing changed. `OnCollision::Cancel` on an existing label leaves
    /// row counts and chain lengths untouched.
    pub fn create_baseline(&mut self, label: &str, on_collision: OnCollision) -> Result<BaselineInfo> {
        if !valid_label(label) {
            return Err(Error::Validation(format!(
                "invalid baseline label '{label}': use letters, numbers, '_', '-', '.'"
            )));
        }
        if label == WORKING_BASELINE {
            return Err(Error::Validation(
                "the working dataset cannot be snapshotted under its own label".into(),
            ));
        }

        self.write_session(|tx, _ledger| {
            if label_exists(tx, label)? {
                match on_collision {
                    OnCollision::Cancel => {
                        return Err(Error::Validation(format!(
                            "baseline '{label}' already exists"
                        )));
                    }
                    OnCollision::Overwrite => {
                        remove_rows(tx, label)?;
                    }
                }
            }

            let row_count = clone_rows(tx, label)?;
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO baseline_metadata (label, created_at, row_count) VALUES (?1, ?2, ?3)",
                params![label, created_at.to_rfc3339(), row_count],
            )?;

            info!(label, row_count, "created baseline");
            Ok(BaselineInfo {
                label: label.to_string(),
                created_at,
                row_count,
            })
        })
    }

    /// Read-only view over one snapshot
    pub fn load_baseline(&self, label: &str) -> Result<BaselineView<'_>> {
        if !label_exists(self.connection(), label)? {
            return Err(Error::not_found("baseline", label));
        }
        Ok(BaselineView {
            store: self,
            label: label.to_string(),
        })
    }

    /// Remove a snapshot's rows and metadata in one transaction
    pub fn delete_baseline(&mut self, label: &str) -> Result<i64> {
        if label == WORKING_BASELINE {
            return Err(Error::Validation(
                "the working dataset is not a snapshot".into(),
            ));
        }
        self.write_session(|tx, _ledger| {
            if !label_exists(tx, label)? {
                return Err(Error::not_found("baseline", label));
            }
            let removed = remove_rows(tx, label)?;
            info!(label, removed, "deleted baseline");
            Ok(removed)
        })
    }

    /// All snapshots, newest first
    pub fn list_baselines(&self) -> Result<Vec<BaselineInfo>> {
        let mut stmt = self.connection().prepare(
            "SELECT label, created_at, row_count FROM baseline_metadata ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (label, created_at, row_count) = row?;
            out.push(BaselineInfo {
                label,
                created_at: crate::db::store::parse_datetime(&created_at),
                row_count,
            });
        }
        Ok(out)
    }
}

/// Read-only accessor over one baseline's rows.
///
/// Only queries are exposed; the underlying rows additionally refuse
/// mutation through the store because their tag is not `"Working"`.
#[derive(Debug)]
pub struct BaselineView<'a> {
    store: &'a EntityStore,
    label: String,
}

impl BaselineView<'_> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn list(&self, kind: Kind) -> Result<Vec<Entity>> {
        fetch_all(self.store.connection(), kind, &self.label)
    }

    pub fn find_by_hierarchy(&self, id: &HierId) -> Result<Entity> {
        try_fetch_by_hierarchy(self.store.connection(), id, &self.label)?
            .ok_or_else(|| Error::not_found("entity", id.to_string()))
    }

    pub fn children_of(&self, parent: &Entity) -> Result<Vec<Entity>> {
        fetch_children(self.store.connection(), parent)
    }
}
