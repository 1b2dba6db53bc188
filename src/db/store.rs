//! Transactional entity store
//!
//! All mutation goes through [`EntityStore`]: identifiers are allocated from
//! persistent per-sibling-group counters, baseline immutability is checked at
//! every mutating entry point, and each accepted mutation appends an audit
//! ledger entry inside the same transaction. Mutations take `&mut self`, so
//! the borrow checker serializes writers; reads run against the last
//! committed state.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::debug;

use crate::core::error::{Error, Result};
use crate::core::identity::{HierId, Kind};
use crate::db::audit::{self, AuditLedger, LedgerTxn, Operation, VerifyReport};
use crate::db::schema::init_schema;
use crate::entities::{
    CriticalAttributes, Criticality, Entity, NewEntity, Props, SecurityFlag, WORKING_BASELINE,
};

/// Shared SELECT column list for every entity table
const ENTITY_COLUMNS: &str = "id, type_tag, hierarchy, baseline, parent_id, system_id, \
     name, description, criticality, \
     confidentiality, confidentiality_rationale, \
     integrity, integrity_rationale, \
     availability, availability_rationale, \
     authenticity, authenticity_rationale, \
     props, created_at, updated_at";

/// SQLite-backed store for one dataset (main project or branch)
#[derive(Debug)]
pub struct EntityStore {
    conn: Connection,
    ledger: AuditLedger,
    path: PathBuf,
}

impl EntityStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        let ledger = AuditLedger::load(&conn)?;

        Ok(Self { conn, ledger, path })
    }

    /// Open a throwaway in-memory store (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        let ledger = AuditLedger::load(&conn)?;

        Ok(Self {
            conn,
            ledger,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Filesystem location of this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one write transaction.
    ///
    /// The audit chain heads advance only if both the transaction and the
    /// ledger snapshot commit; an error rolls back the row changes and
    /// discards the pending heads together.
    pub(crate) fn write_session<T>(
        &mut self,
        f: impl FnOnce(&Transaction, &mut LedgerTxn) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction()?;
        let mut ledger = self.ledger.begin();
        let out = f(&tx, &mut ledger)?;
        tx.commit()?;
        self.ledger.commit(ledger);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Create a new `"Working"` entity; the identifier is allocated here
    pub fn create(&mut self, draft: NewEntity) -> Result<Entity> {
        self.write_session(|tx, ledger| create_in(tx, ledger, &draft))
    }

    /// Fetch a row by kind and rowid, any baseline
    pub fn get(&self, kind: Kind, row_id: i64) -> Result<Entity> {
        fetch_entity(&self.conn, kind, row_id)
    }

    /// Fetch a row by hierarchical identifier within a baseline
    pub fn find_by_hierarchy(&self, id: &HierId, baseline: &str) -> Result<Entity> {
        try_fetch_by_hierarchy(&self.conn, id, baseline)?
            .ok_or_else(|| Error::not_found("entity", id.to_string()))
    }

    /// All rows of one kind within a baseline, in rowid order
    pub fn list(&self, kind: Kind, baseline: &str) -> Result<Vec<Entity>> {
        fetch_all(&self.conn, kind, baseline)
    }

    /// Same-kind children of a recursive entity, within its baseline
    pub fn children_of(&self, parent: &Entity) -> Result<Vec<Entity>> {
        fetch_children(&self.conn, parent)
    }

    /// Trace parents of a requirement row (many-to-many)
    pub fn trace_parents(&self, requirement: &Entity) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT parent_id FROM requirement_trace WHERE child_id = ?1 AND baseline = ?2",
        )?;
        let ids = stmt.query_map(
            params![requirement.row_id, requirement.baseline],
            |row| row.get::<_, i64>(0),
        )?;
        for id in ids {
            out.push(fetch_entity(&self.conn, Kind::Requirement, id?)?);
        }
        Ok(out)
    }

    /// Update a `"Working"` row's mutable fields.
    ///
    /// Hierarchy and baseline are derived/managed and cannot change here; a
    /// system's tree parent is fixed at creation. Requirement re-parenting
    /// is cycle-checked.
    pub fn update(&mut self, entity: &Entity) -> Result<Entity> {
        self.write_session(|tx, ledger| update_in(tx, ledger, entity))
    }

    /// Delete a `"Working"` row.
    ///
    /// Systems must have no remaining descendants of any kind; requirements
    /// must have no tree children (trace links are detached).
    pub fn delete(&mut self, kind: Kind, row_id: i64) -> Result<()> {
        self.write_session(|tx, ledger| delete_in(tx, ledger, kind, row_id))
    }

    /// Attach a many-to-many trace parent to a requirement, cycle-checked
    pub fn attach_trace_link(&mut self, child_row_id: i64, parent_row_id: i64) -> Result<()> {
        self.write_session(|tx, ledger| attach_trace_in(tx, ledger, child_row_id, parent_row_id))
    }

    /// Compact sequence numbers of the sibling groups directly under a
    /// system, preserving relative order and carrying each moved system's
    /// subtree (all kinds) along. Starts a fresh allocation generation for
    /// the compacted groups.
    pub fn renumber(&mut self, root: &HierId) -> Result<()> {
        self.write_session(|tx, ledger| renumber_in(tx, ledger, root))
    }

    // ------------------------------------------------------------------
    // Ledger access
    // ------------------------------------------------------------------

    /// Replay and verify every audit chain; never mutates state
    pub fn verify(&self) -> Result<VerifyReport> {
        self.ledger.verify(&self.conn)
    }

    /// Ledger length for one table
    pub fn audit_len(&self, kind: Kind) -> Result<i64> {
        audit::chain_len(&self.conn, kind.table())
    }

    /// Total ledger length
    pub fn audit_total(&self) -> Result<i64> {
        audit::total_len(&self.conn)
    }

    /// Dump the ledger as CSV
    pub fn audit_export<W: std::io::Write>(&self, writer: W) -> Result<u64> {
        audit::export_csv(&self.conn, writer)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn flag(asserted: i64, rationale: String) -> SecurityFlag {
    SecurityFlag {
        asserted: asserted != 0,
        rationale,
    }
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let hierarchy: String = row.get(2)?;
    let hierarchy = HierId::parse(&hierarchy).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let criticality: String = row.get(8)?;
    let props_text: String = row.get(17)?;
    let created: String = row.get(18)?;
    let updated: String = row.get(19)?;

    Ok(Entity {
        row_id: row.get(0)?,
        hierarchy,
        baseline: row.get(3)?,
        parent_id: row.get(4)?,
        system_id: row.get(5)?,
        name: row.get(6)?,
        description: row.get(7)?,
        attrs: CriticalAttributes {
            criticality: criticality.parse().unwrap_or(Criticality::NonCritical),
            confidentiality: flag(row.get(9)?, row.get(10)?),
            integrity: flag(row.get(11)?, row.get(12)?),
            availability: flag(row.get(13)?, row.get(14)?),
            authenticity: flag(row.get(15)?, row.get(16)?),
        },
        props: serde_json::from_str::<Props>(&props_text).unwrap_or_default(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

pub(crate) fn fetch_entity(conn: &Connection, kind: Kind, row_id: i64) -> Result<Entity> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE id = ?1",
        kind.table()
    );
    conn.query_row(&sql, params![row_id], row_to_entity)
        .optional()?
        .ok_or_else(|| Error::not_found("entity", format!("{}#{row_id}", kind.table())))
}

pub(crate) fn try_fetch_by_hierarchy(
    conn: &Connection,
    id: &HierId,
    baseline: &str,
) -> Result<Option<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE hierarchy = ?1 AND baseline = ?2",
        id.kind().table()
    );
    Ok(conn
        .query_row(&sql, params![id.to_string(), baseline], row_to_entity)
        .optional()?)
}

pub(crate) fn fetch_all(conn: &Connection, kind: Kind, baseline: &str) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE baseline = ?1 ORDER BY id",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![baseline], row_to_entity)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn fetch_children(conn: &Connection, parent: &Entity) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE parent_id = ?1 AND baseline = ?2 ORDER BY id",
        parent.kind().table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![parent.row_id, parent.baseline], row_to_entity)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ----------------------------------------------------------------------
// Canonical snapshots
// ----------------------------------------------------------------------

/// Canonical, storage-independent serialization of a row. Tree references
/// appear as hierarchy strings (not rowids), so hashes are comparable across
/// stores; trace parents are included sorted so link changes alter the hash.
#[derive(Serialize)]
struct RowSnapshot<'a> {
    hierarchy: String,
    baseline: &'a str,
    parent: Option<String>,
    system: Option<String>,
    name: &'a str,
    description: &'a str,
    attrs: &'a CriticalAttributes,
    props: &'a Props,
    trace_parents: Vec<String>,
}

fn hierarchy_of(conn: &Connection, table: &str, row_id: i64) -> Result<Option<String>> {
    let sql = format!("SELECT hierarchy FROM {table} WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![row_id], |row| row.get(0))
        .optional()?)
}

pub(crate) fn snapshot_json(conn: &Connection, entity: &Entity) -> Result<String> {
    let parent = match entity.parent_id {
        Some(pid) => hierarchy_of(conn, entity.kind().table(), pid)?,
        None => None,
    };
    let system = match entity.system_id {
        Some(sid) => hierarchy_of(conn, Kind::System.table(), sid)?,
        None => None,
    };

    let mut trace_parents = Vec::new();
    if entity.kind() == Kind::Requirement {
        let mut stmt = conn.prepare(
            "SELECT p.hierarchy FROM requirement_trace t
             JOIN requirements p ON p.id = t.parent_id
             WHERE t.child_id = ?1 AND t.baseline = ?2",
        )?;
        let rows = stmt.query_map(params![entity.row_id, entity.baseline], |row| {
            row.get::<_, String>(0)
        })?;
        for row in rows {
            trace_parents.push(row?);
        }
        trace_parents.sort();
    }

    let snapshot = RowSnapshot {
        hierarchy: entity.hierarchy.to_string(),
        baseline: &entity.baseline,
        parent,
        system,
        name: &entity.name,
        description: &entity.description,
        attrs: &entity.attrs,
        props: &entity.props,
        trace_parents,
    };

    Ok(serde_json::to_string(&snapshot)?)
}

// ----------------------------------------------------------------------
// Identifier allocation
// ----------------------------------------------------------------------

fn group_key(path: &[u32]) -> String {
    path.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Highest sequence number currently present in a sibling group
fn max_existing_seq(conn: &Connection, kind: Kind, base_path: &[u32]) -> Result<u32> {
    let rows = fetch_all(conn, kind, WORKING_BASELINE)?;
    Ok(rows
        .iter()
        .filter(|e| {
            e.hierarchy.depth() == base_path.len() + 1 && e.hierarchy.descends_from(base_path)
        })
        .map(|e| e.hierarchy.seq())
        .max()
        .unwrap_or(0))
}

/// Allocate the next sequence number in a sibling group.
///
/// Counters are persistent and monotonic: a number freed by deletion is not
/// reissued within the same generation.
pub(crate) fn allocate_id(conn: &Connection, kind: Kind, base_path: &[u32]) -> Result<HierId> {
    let key = group_key(base_path);
    let counter: Option<i64> = conn
        .query_row(
            "SELECT next_seq FROM id_counters WHERE type_tag = ?1 AND parent_path = ?2",
            params![kind.tag(), key],
            |row| row.get(0),
        )
        .optional()?;

    let seq = match counter {
        Some(n) => n as u32,
        // First allocation in this group: seed past any pre-existing rows.
        None => max_existing_seq(conn, kind, base_path)? + 1,
    };

    conn.execute(
        "INSERT INTO id_counters (type_tag, parent_path, next_seq) VALUES (?1, ?2, ?3)
         ON CONFLICT (type_tag, parent_path) DO UPDATE SET next_seq = excluded.next_seq",
        params![kind.tag(), key, (seq + 1) as i64],
    )?;

    let mut path = base_path.to_vec();
    path.push(seq);
    Ok(HierId::new(kind, path)?)
}

/// Advance a group counter past an adopted sequence number (imports/merges)
pub(crate) fn bump_counter(conn: &Connection, kind: Kind, base_path: &[u32], seq: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO id_counters (type_tag, parent_path, next_seq) VALUES (?1, ?2, ?3)
         ON CONFLICT (type_tag, parent_path) DO UPDATE
         SET next_seq = MAX(next_seq, excluded.next_seq)",
        params![kind.tag(), group_key(base_path), (seq + 1) as i64],
    )?;
    Ok(())
}

/// Overwrite a group counter (renumber starts a new generation)
fn reset_counter(conn: &Connection, kind: Kind, base_path: &[u32], next_seq: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO id_counters (type_tag, parent_path, next_seq) VALUES (?1, ?2, ?3)
         ON CONFLICT (type_tag, parent_path) DO UPDATE SET next_seq = excluded.next_seq",
        params![kind.tag(), group_key(base_path), next_seq as i64],
    )?;
    Ok(())
}

// ----------------------------------------------------------------------
// Mutation internals (run inside a write session)
// ----------------------------------------------------------------------

pub(crate) fn insert_row(conn: &Connection, entity: &Entity, preserve_rowid: bool) -> Result<i64> {
    let table = entity.kind().table();
    let props = serde_json::to_string(&entity.props)?;
    let a = &entity.attrs;

    if preserve_rowid {
        let sql = format!(
            "INSERT INTO {table} ({ENTITY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        );
        conn.execute(
            &sql,
            params![
                entity.row_id,
                entity.kind().tag(),
                entity.hierarchy.to_string(),
                entity.baseline,
                entity.parent_id,
                entity.system_id,
                entity.name,
                entity.description,
                a.criticality.to_string(),
                a.confidentiality.asserted,
                a.confidentiality.rationale,
                a.integrity.asserted,
                a.integrity.rationale,
                a.availability.asserted,
                a.availability.rationale,
                a.authenticity.asserted,
                a.authenticity.rationale,
                props,
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(entity.row_id)
    } else {
        let sql = format!(
            "INSERT INTO {table} (type_tag, hierarchy, baseline, parent_id, system_id,
                 name, description, criticality,
                 confidentiality, confidentiality_rationale,
                 integrity, integrity_rationale,
                 availability, availability_rationale,
                 authenticity, authenticity_rationale,
                 props, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        );
        conn.execute(
            &sql,
            params![
                entity.kind().tag(),
                entity.hierarchy.to_string(),
                entity.baseline,
                entity.parent_id,
                entity.system_id,
                entity.name,
                entity.description,
                a.criticality.to_string(),
                a.confidentiality.asserted,
                a.confidentiality.rationale,
                a.integrity.asserted,
                a.integrity.rationale,
                a.availability.asserted,
                a.availability.rationale,
                a.authenticity.asserted,
                a.authenticity.rationale,
                props,
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

pub(crate) fn create_in(
    conn: &Connection,
    ledger: &mut LedgerTxn,
    draft: &NewEntity,
) -> Result<Entity> {
    if draft.name.trim().is_empty() {
        return Err(Error::Validation("entity name must not be empty".into()));
    }

    // Resolve the path base from the tree position.
    let base_path: Vec<u32> = match draft.kind {
        Kind::System => match draft.parent {
            Some(pid) => {
                let parent = fetch_entity(conn, Kind::System, pid)?;
                require_editable(&parent)?;
                parent.hierarchy.path().to_vec()
            }
            None => Vec::new(),
        },
        _ => {
            let sid = draft.system.ok_or_else(|| {
                Error::Validation(format!(
                    "a {} entity requires an owning system",
                    draft.kind.table()
                ))
            })?;
            let system = fetch_entity(conn, Kind::System, sid)?;
            require_editable(&system)?;
            system.hierarchy.path().to_vec()
        }
    };

    // Requirement tree parent is optional and path-neutral.
    let parent_id = match draft.kind {
        Kind::System => draft.parent,
        Kind::Requirement => {
            if let Some(pid) = draft.parent {
                let parent = fetch_entity(conn, Kind::Requirement, pid)?;
                require_editable(&parent)?;
                Some(pid)
            } else {
                None
            }
        }
        _ => {
            if draft.parent.is_some() {
                return Err(Error::Validation(format!(
                    "{} entities do not form a tree",
                    draft.kind.table()
                )));
            }
            None
        }
    };

    let hierarchy = allocate_id(conn, draft.kind, &base_path)?;
    let now = Utc::now();

    let mut entity = Entity {
        row_id: 0,
        hierarchy,
        baseline: WORKING_BASELINE.to_string(),
        parent_id,
        system_id: if draft.kind == Kind::System {
            None
        } else {
            draft.system
        },
        name: draft.name.clone(),
        description: draft.description.clone(),
        attrs: draft.attrs.clone(),
        props: draft.props.clone(),
        created_at: now,
        updated_at: now,
    };

    entity.row_id = insert_row(conn, &entity, false)?;

    let snapshot = snapshot_json(conn, &entity)?;
    ledger.append(
        conn,
        entity.kind().table(),
        Operation::Insert,
        entity.row_id,
        &snapshot,
    )?;

    debug!(id = %entity.hierarchy, table = entity.kind().table(), "created entity");
    Ok(entity)
}

fn require_editable(entity: &Entity) -> Result<()> {
    if entity.editable() {
        Ok(())
    } else {
        Err(Error::ImmutableRecord {
            hierarchy: entity.hierarchy.to_string(),
            baseline: entity.baseline.clone(),
        })
    }
}

fn write_mutable_fields(conn: &Connection, entity: &Entity, now: &DateTime<Utc>) -> Result<()> {
    let a = &entity.attrs;
    let sql = format!(
        "UPDATE {} SET parent_id = ?1, name = ?2, description = ?3, criticality = ?4,
             confidentiality = ?5, confidentiality_rationale = ?6,
             integrity = ?7, integrity_rationale = ?8,
             availability = ?9, availability_rationale = ?10,
             authenticity = ?11, authenticity_rationale = ?12,
             props = ?13, updated_at = ?14
         WHERE id = ?15",
        entity.kind().table()
    );
    conn.execute(
        &sql,
        params![
            entity.parent_id,
            entity.name,
            entity.description,
            a.criticality.to_string(),
            a.confidentiality.asserted,
            a.confidentiality.rationale,
            a.integrity.asserted,
            a.integrity.rationale,
            a.availability.asserted,
            a.availability.rationale,
            a.authenticity.asserted,
            a.authenticity.rationale,
            serde_json::to_string(&entity.props)?,
            now.to_rfc3339(),
            entity.row_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn update_in(
    conn: &Connection,
    ledger: &mut LedgerTxn,
    entity: &Entity,
) -> Result<Entity> {
    let current = fetch_entity(conn, entity.kind(), entity.row_id)?;
    require_editable(&current)?;

    if entity.baseline != current.baseline {
        return Err(Error::Validation(
            "the baseline tag is managed by the baseline manager".into(),
        ));
    }
    if entity.hierarchy != current.hierarchy {
        return Err(Error::Validation(
            "the hierarchical id is derived from the tree; use renumber".into(),
        ));
    }
    if entity.system_id != current.system_id {
        return Err(Error::Validation(
            "the owning system is fixed at creation".into(),
        ));
    }
    if entity.parent_id != current.parent_id {
        match entity.kind() {
            Kind::Requirement => {
                if let Some(pid) = entity.parent_id {
                    let parent = fetch_entity(conn, Kind::Requirement, pid)?;
                    require_editable(&parent)?;
                    if creates_cycle(conn, entity.row_id, pid)? {
                        return Err(Error::Validation("circular requirement".into()));
                    }
                }
            }
            _ => {
                return Err(Error::Validation(
                    "the tree parent is fixed at creation".into(),
                ));
            }
        }
    }

    let now = Utc::now();
    write_mutable_fields(conn, entity, &now)?;

    let mut updated = entity.clone();
    updated.updated_at = now;
    updated.created_at = current.created_at;

    let snapshot = snapshot_json(conn, &updated)?;
    ledger.append(
        conn,
        updated.kind().table(),
        Operation::Update,
        updated.row_id,
        &snapshot,
    )?;

    debug!(id = %updated.hierarchy, table = updated.kind().table(), "updated entity");
    Ok(updated)
}

/// Any row of any kind strictly below this path (its descendants)?
fn has_descendants(conn: &Connection, path: &HierId) -> Result<bool> {
    let prefix = path.numeric_path();
    for kind in Kind::all() {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE baseline = ?1 AND hierarchy LIKE ?2",
            kind.table()
        );
        let count: i64 = conn.query_row(
            &sql,
            params![WORKING_BASELINE, format!("{}-{}.%", kind.tag(), prefix)],
            |row| row.get(0),
        )?;
        if count > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn delete_in(
    conn: &Connection,
    ledger: &mut LedgerTxn,
    kind: Kind,
    row_id: i64,
) -> Result<()> {
    let current = fetch_entity(conn, kind, row_id)?;
    require_editable(&current)?;

    match kind {
        Kind::System => {
            if has_descendants(conn, &current.hierarchy)? {
                return Err(Error::Validation(format!(
                    "system {} still has descendants; delete or renumber them first",
                    current.hierarchy
                )));
            }
        }
        Kind::Requirement => {
            let children = fetch_children(conn, &current)?;
            if !children.is_empty() {
                return Err(Error::Validation(format!(
                    "requirement {} still has child requirements",
                    current.hierarchy
                )));
            }
            conn.execute(
                "DELETE FROM requirement_trace
                 WHERE (child_id = ?1 OR parent_id = ?1) AND baseline = ?2",
                params![row_id, WORKING_BASELINE],
            )?;
        }
        _ => {}
    }

    let snapshot = snapshot_json(conn, &current)?;
    let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
    conn.execute(&sql, params![row_id])?;

    ledger.append(conn, kind.table(), Operation::Delete, row_id, &snapshot)?;

    debug!(id = %current.hierarchy, table = kind.table(), "deleted entity");
    Ok(())
}

/// Would making `candidate_parent` an ancestor of `child` close a loop?
///
/// Walks upward from the candidate through both tree parents and trace
/// links, bounded by a visited set.
pub(crate) fn creates_cycle(conn: &Connection, child: i64, candidate_parent: i64) -> Result<bool> {
    let mut visited = std::collections::HashSet::new();
    let mut queue = vec![candidate_parent];

    while let Some(node) = queue.pop() {
        if node == child {
            return Ok(true);
        }
        if !visited.insert(node) {
            continue;
        }

        let tree_parent: Option<i64> = conn
            .query_row(
                "SELECT parent_id FROM requirements WHERE id = ?1",
                params![node],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if let Some(p) = tree_parent {
            queue.push(p);
        }

        let mut stmt = conn.prepare(
            "SELECT parent_id FROM requirement_trace WHERE child_id = ?1 AND baseline = ?2",
        )?;
        let rows = stmt.query_map(params![node, WORKING_BASELINE], |row| row.get::<_, i64>(0))?;
        for row in rows {
            queue.push(row?);
        }
    }

    Ok(false)
}

pub(crate) fn attach_trace_in(
    conn: &Connection,
    ledger: &mut LedgerTxn,
    child_row_id: i64,
    parent_row_id: i64,
) -> Result<()> {
    let child = fetch_entity(conn, Kind::Requirement, child_row_id)?;
    let parent = fetch_entity(conn, Kind::Requirement, parent_row_id)?;
    require_editable(&child)?;
    require_editable(&parent)?;

    if creates_cycle(conn, child_row_id, parent_row_id)? {
        return Err(Error::Validation("circular requirement".into()));
    }

    conn.execute(
        "INSERT OR IGNORE INTO requirement_trace (child_id, parent_id, baseline)
         VALUES (?1, ?2, ?3)",
        params![child_row_id, parent_row_id, WORKING_BASELINE],
    )?;

    // Link changes surface in the child's canonical snapshot.
    let snapshot = snapshot_json(conn, &child)?;
    ledger.append(
        conn,
        Kind::Requirement.table(),
        Operation::Update,
        child_row_id,
        &snapshot,
    )?;

    debug!(child = %child.hierarchy, parent = %parent.hierarchy, "attached trace link");
    Ok(())
}

// ----------------------------------------------------------------------
// Renumbering
// ----------------------------------------------------------------------

fn rewrite_hierarchy(
    conn: &Connection,
    ledger: &mut LedgerTxn,
    entity: &Entity,
    new_id: &HierId,
) -> Result<()> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE {} SET hierarchy = ?1, updated_at = ?2 WHERE id = ?3",
        entity.kind().table()
    );
    conn.execute(
        &sql,
        params![new_id.to_string(), now.to_rfc3339(), entity.row_id],
    )?;

    let mut moved = entity.clone();
    moved.hierarchy = new_id.clone();
    moved.updated_at = now;

    let snapshot = snapshot_json(conn, &moved)?;
    ledger.append(
        conn,
        moved.kind().table(),
        Operation::Update,
        moved.row_id,
        &snapshot,
    )?;
    Ok(())
}

/// Move counter groups when a subtree prefix changes
fn move_counters(conn: &Connection, old_prefix: &str, new_prefix: &str) -> Result<()> {
    let mut moves: Vec<(String, String, String)> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT type_tag, parent_path FROM id_counters
             WHERE parent_path = ?1 OR parent_path LIKE ?2",
        )?;
        let rows = stmt.query_map(
            params![old_prefix, format!("{old_prefix}.%")],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        for row in rows {
            let (tag, path) = row?;
            let rest = &path[old_prefix.len()..];
            moves.push((tag, path.clone(), format!("{new_prefix}{rest}")));
        }
    }
    for (tag, old, new) in moves {
        conn.execute(
            "UPDATE OR REPLACE id_counters SET parent_path = ?1
             WHERE type_tag = ?2 AND parent_path = ?3",
            params![new, tag, old],
        )?;
    }
    Ok(())
}

pub(crate) fn renumber_in(conn: &Connection, ledger: &mut LedgerTxn, root: &HierId) -> Result<()> {
    if root.kind() != Kind::System {
        return Err(Error::Validation(
            "renumbering is rooted at a system".into(),
        ));
    }
    let root_entity = try_fetch_by_hierarchy(conn, root, WORKING_BASELINE)?
        .ok_or_else(|| Error::not_found("system", root.to_string()))?;
    require_editable(&root_entity)?;

    let root_path = root.path().to_vec();

    for kind in Kind::all() {
        // Direct children of the root for this kind, in sequence order.
        let mut group: Vec<Entity> = fetch_all(conn, *kind, WORKING_BASELINE)?
            .into_iter()
            .filter(|e| {
                e.hierarchy.depth() == root_path.len() + 1
                    && e.hierarchy.descends_from(&root_path)
            })
            .collect();
        group.sort_by_key(|e| e.hierarchy.seq());

        let n = group.len() as u32;
        for (i, entity) in group.iter().enumerate() {
            let new_seq = i as u32 + 1;
            if new_seq == entity.hierarchy.seq() {
                continue;
            }

            let new_id = HierId::new(*kind, {
                let mut p = root_path.clone();
                p.push(new_seq);
                p
            })?;

            if *kind == Kind::System {
                // A moved system carries its whole subtree along.
                let old_path = entity.hierarchy.path().to_vec();
                let old_prefix = entity.hierarchy.numeric_path();
                let new_prefix = new_id.numeric_path();

                rewrite_hierarchy(conn, ledger, entity, &new_id)?;

                for sub_kind in Kind::all() {
                    let descendants: Vec<Entity> =
                        fetch_all(conn, *sub_kind, WORKING_BASELINE)?
                            .into_iter()
                            .filter(|e| {
                                e.hierarchy.depth() > old_path.len()
                                    && e.hierarchy.descends_from(&old_path)
                            })
                            .collect();
                    for descendant in descendants {
                        let mut path = new_id.path().to_vec();
                        path.extend_from_slice(&descendant.hierarchy.path()[old_path.len()..]);
                        let moved_id = HierId::new(*sub_kind, path)?;
                        rewrite_hierarchy(conn, ledger, &descendant, &moved_id)?;
                    }
                }

                move_counters(conn, &old_prefix, &new_prefix)?;
            } else {
                rewrite_hierarchy(conn, ledger, entity, &new_id)?;
            }
        }

        if n > 0 {
            // New allocation generation for the compacted group.
            reset_counter(conn, *kind, &root_path, n + 1)?;
        }
    }

    debug!(root = %root, "renumbered subtree");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntityStore {
        EntityStore::open_in_memory().unwrap()
    }

    fn add_system(store: &mut EntityStore, name: &str, parent: Option<i64>) -> Entity {
        let mut draft = NewEntity::new(Kind::System, name);
        draft.parent = parent;
        store.create(draft).unwrap()
    }

    #[test]
    fn test_create_allocates_sequential_ids() {
        let mut store = store();
        let a = add_system(&mut store, "Aircraft", None);
        let b = add_system(&mut store, "Ground Station", None);
        assert_eq!(a.hierarchy.to_string(), "S-1");
        assert_eq!(b.hierarchy.to_string(), "S-2");

        let child = add_system(&mut store, "Avionics", Some(a.row_id));
        assert_eq!(child.hierarchy.to_string(), "S-1.1");
        assert_eq!(child.baseline, WORKING_BASELINE);
    }

    #[test]
    fn test_sibling_ids_never_collide_and_never_reused() {
        let mut store = store();
        let root = add_system(&mut store, "Root", None);
        let c1 = add_system(&mut store, "One", Some(root.row_id));
        let c2 = add_system(&mut store, "Two", Some(root.row_id));
        assert_ne!(c1.hierarchy, c2.hierarchy);

        store.delete(Kind::System, c2.row_id).unwrap();
        let c3 = add_system(&mut store, "Three", Some(root.row_id));
        // S-1.2 was freed but is not reissued.
        assert_eq!(c3.hierarchy.to_string(), "S-1.3");
    }

    #[test]
    fn test_non_system_requires_owner() {
        let mut store = store();
        let err = store
            .create(NewEntity::new(Kind::Function, "Navigate"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let sys = add_system(&mut store, "Aircraft", None);
        let func = store
            .create(NewEntity::new(Kind::Function, "Navigate").system(sys.row_id))
            .unwrap();
        assert_eq!(func.hierarchy.to_string(), "F-1.1");
        assert_eq!(func.system_id, Some(sys.row_id));
    }

    #[test]
    fn test_every_mutation_appends_audit_entry() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);
        assert_eq!(store.audit_len(Kind::System).unwrap(), 1);

        let mut renamed = sys.clone();
        renamed.name = "Aircraft v2".into();
        store.update(&renamed).unwrap();
        assert_eq!(store.audit_len(Kind::System).unwrap(), 2);

        store.delete(Kind::System, sys.row_id).unwrap();
        assert_eq!(store.audit_len(Kind::System).unwrap(), 3);

        store.verify().unwrap();
    }

    #[test]
    fn test_failed_create_leaves_no_trace() {
        let mut store = store();
        let before = store.audit_total().unwrap();
        let err = store.create(NewEntity::new(Kind::System, "   ")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.audit_total().unwrap(), before);
        assert!(store.list(Kind::System, WORKING_BASELINE).unwrap().is_empty());
    }

    #[test]
    fn test_update_rejects_identity_changes() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);

        let mut moved = sys.clone();
        moved.hierarchy = HierId::parse("S-9").unwrap();
        assert!(matches!(
            store.update(&moved).unwrap_err(),
            Error::Validation(_)
        ));

        let mut retagged = sys.clone();
        retagged.baseline = "2024-01-01".into();
        assert!(matches!(
            store.update(&retagged).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_delete_system_with_descendants_fails() {
        let mut store = store();
        let root = add_system(&mut store, "Root", None);
        store
            .create(NewEntity::new(Kind::Function, "Fly").system(root.row_id))
            .unwrap();

        let err = store.delete(Kind::System, root.row_id).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_requirement_self_ancestor_rejected() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);
        let req = store
            .create(NewEntity::new(Kind::Requirement, "Shall fly").system(sys.row_id))
            .unwrap();

        let chain_before = store.audit_len(Kind::Requirement).unwrap();
        let err = store
            .attach_trace_link(req.row_id, req.row_id)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.audit_len(Kind::Requirement).unwrap(), chain_before);
    }

    #[test]
    fn test_requirement_trace_cycle_rejected() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);
        let r1 = store
            .create(NewEntity::new(Kind::Requirement, "R one").system(sys.row_id))
            .unwrap();
        let r2 = store
            .create(NewEntity::new(Kind::Requirement, "R two").system(sys.row_id))
            .unwrap();
        let r3 = store
            .create(NewEntity::new(Kind::Requirement, "R three").system(sys.row_id))
            .unwrap();

        store.attach_trace_link(r2.row_id, r1.row_id).unwrap();
        store.attach_trace_link(r3.row_id, r2.row_id).unwrap();

        // r1 -> r3 would close the loop r1 -> r3 -> r2 -> r1.
        let err = store.attach_trace_link(r1.row_id, r3.row_id).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        store.verify().unwrap();
    }

    #[test]
    fn test_requirement_parent_cycle_rejected() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);
        let r1 = store
            .create(NewEntity::new(Kind::Requirement, "Parent").system(sys.row_id))
            .unwrap();
        let mut child_draft = NewEntity::new(Kind::Requirement, "Child").system(sys.row_id);
        child_draft.parent = Some(r1.row_id);
        let r2 = store.create(child_draft).unwrap();

        let mut reparented = store.get(Kind::Requirement, r1.row_id).unwrap();
        reparented.parent_id = Some(r2.row_id);
        let err = store.update(&reparented).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_find_by_hierarchy() {
        let mut store = store();
        let sys = add_system(&mut store, "Aircraft", None);
        let found = store
            .find_by_hierarchy(&sys.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(found.row_id, sys.row_id);

        let missing = HierId::parse("S-99").unwrap();
        assert!(matches!(
            store.find_by_hierarchy(&missing, WORKING_BASELINE).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_renumber_compacts_and_moves_subtrees() {
        let mut store = store();
        let root = add_system(&mut store, "Root", None);
        let _a = add_system(&mut store, "A", Some(root.row_id)); // S-1.1
        let b = add_system(&mut store, "B", Some(root.row_id)); // S-1.2
        let c = add_system(&mut store, "C", Some(root.row_id)); // S-1.3
        let leaf = add_system(&mut store, "C leaf", Some(c.row_id)); // S-1.3.1
        let func = store
            .create(NewEntity::new(Kind::Function, "C func").system(c.row_id))
            .unwrap(); // F-1.3.1

        store.delete(Kind::System, b.row_id).unwrap();
        store.renumber(&root.hierarchy).unwrap();

        let c_after = store.get(Kind::System, c.row_id).unwrap();
        assert_eq!(c_after.hierarchy.to_string(), "S-1.2");
        let leaf_after = store.get(Kind::System, leaf.row_id).unwrap();
        assert_eq!(leaf_after.hierarchy.to_string(), "S-1.2.1");
        let func_after = store.get(Kind::Function, func.row_id).unwrap();
        assert_eq!(func_after.hierarchy.to_string(), "F-1.2.1");

        // New generation: the next child continues after the compacted range.
        let d = add_system(&mut store, "D", Some(root.row_id));
        assert_eq!(d.hierarchy.to_string(), "S-1.3");

        store.verify().unwrap();
    }

    #[test]
    fn test_renumber_does_not_drag_sibling_functions() {
        let mut store = store();
        let root = add_system(&mut store, "Root", None); // S-1
        let _f1 = store
            .create(NewEntity::new(Kind::Function, "F one").system(root.row_id))
            .unwrap(); // F-1.1
        let f2 = store
            .create(NewEntity::new(Kind::Function, "F two").system(root.row_id))
            .unwrap(); // F-1.2
        let f3 = store
            .create(NewEntity::new(Kind::Function, "F three").system(root.row_id))
            .unwrap(); // F-1.3

        let _child = add_system(&mut store, "Child", Some(root.row_id)); // S-1.1
        store.delete(Kind::Function, f2.row_id).unwrap();
        store.renumber(&root.hierarchy).unwrap();

        let f3_after = store.get(Kind::Function, f3.row_id).unwrap();
        assert_eq!(f3_after.hierarchy.to_string(), "F-1.2");
        store.verify().unwrap();
    }
}
