//! Branch merge: conflict analysis and resolution application
//!
//! Merging reconciles a branch store back into the main store. Analysis
//! pairs branch rows with main rows by hierarchical id; a pair whose
//! significant fields differ is a conflict, a branch row absent from main
//! is a pure insert, and an identical pair is ignored. Application consumes
//! one resolution per conflict and runs as a single transaction on main —
//! a `CancelAll` anywhere aborts the whole merge before any write.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{debug, info};
use ulid::Ulid;

use crate::core::error::{Error, Result};
use crate::core::identity::{HierId, Kind};
use crate::db::audit::Operation;
use crate::db::store::{
    bump_counter, creates_cycle, fetch_all, insert_row, snapshot_json, try_fetch_by_hierarchy,
    update_in, EntityStore,
};
use crate::entities::{Entity, WORKING_BASELINE};

/// Per-conflict decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the main row's non-key fields with the branch row's
    Overwrite,
    /// Drop the branch row; main keeps its version
    Reject,
    /// Abort the entire merge, leaving main untouched
    CancelAll,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Overwrite => write!(f, "overwrite"),
            Resolution::Reject => write!(f, "reject"),
            Resolution::CancelAll => write!(f, "cancel"),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "overwrite" => Ok(Resolution::Overwrite),
            "reject" => Ok(Resolution::Reject),
            "cancel" | "cancel-all" | "cancelall" => Ok(Resolution::CancelAll),
            _ => Err(format!(
                "Unknown resolution: {} (valid: overwrite, reject, cancel)",
                s
            )),
        }
    }
}

/// Whether rejecting a conflicting system also drops branch inserts that
/// descend from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Drop only the conflicting row; its descendants still merge
    #[default]
    SingleRow,
    /// Drop the conflicting row and every insert under its path
    WithDescendants,
}

/// Merge lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Analyzing,
    NoConflicts,
    ConflictsFound,
    AwaitingResolution,
    Resolved,
    Applying,
    Committed,
    Cancelled,
}

/// A pair of `"Working"` rows sharing one hierarchical id
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub hierarchy: HierId,
    pub main: Entity,
    pub branch: Entity,
}

impl MergeConflict {
    /// Key used to address this conflict in a resolution map
    pub fn id(&self) -> String {
        self.hierarchy.to_string()
    }
}

/// Outcome of analysis: what conflicts, what inserts cleanly
#[derive(Debug)]
pub struct MergeReport {
    pub merge_id: String,
    pub timestamp: DateTime<Utc>,
    pub conflicts: Vec<MergeConflict>,
    pub inserts: Vec<Entity>,
    pub state: MergeState,
}

/// Outcome of a finished apply
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merge_id: String,
    pub state: MergeState,
    pub applied_count: usize,
    pub rejected_count: usize,
}

/// Reconciles a branch store back into the main store
pub struct MergeCoordinator;

impl MergeCoordinator {
    /// Pair every branch entity against main by hierarchical id.
    ///
    /// Read-only against both stores.
    pub fn analyze(main: &EntityStore, branch: &EntityStore) -> Result<MergeReport> {
        debug!(state = ?MergeState::Analyzing, "pairing branch entities against main");
        let mut conflicts = Vec::new();
        let mut inserts = Vec::new();

        for kind in Kind::all() {
            for branch_row in fetch_all(branch.connection(), *kind, WORKING_BASELINE)? {
                match try_fetch_by_hierarchy(
                    main.connection(),
                    &branch_row.hierarchy,
                    WORKING_BASELINE,
                )? {
                    Some(main_row) => {
                        let main_snap = snapshot_json(main.connection(), &main_row)?;
                        let branch_snap = snapshot_json(branch.connection(), &branch_row)?;
                        if main_snap != branch_snap {
                            conflicts.push(MergeConflict {
                                hierarchy: branch_row.hierarchy.clone(),
                                main: main_row,
                                branch: branch_row,
                            });
                        }
                    }
                    None => inserts.push(branch_row),
                }
            }
        }

        let state = if conflicts.is_empty() {
            MergeState::NoConflicts
        } else {
            MergeState::ConflictsFound
        };
        debug!(
            conflicts = conflicts.len(),
            inserts = inserts.len(),
            "merge analysis complete"
        );

        Ok(MergeReport {
            merge_id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            conflicts,
            inserts,
            state,
        })
    }

    /// Apply a merge report under the given resolutions.
    ///
    /// Any `CancelAll` aborts the whole merge before a single write; a
    /// conflict without a resolution is an error. Everything else runs as
    /// one transaction on `main`.
    pub fn apply(
        main: &mut EntityStore,
        branch: &EntityStore,
        report: &MergeReport,
        resolutions: &HashMap<String, Resolution>,
        policy: RejectPolicy,
    ) -> Result<MergeOutcome> {
        if resolutions.values().any(|r| *r == Resolution::CancelAll) {
            info!(merge_id = %report.merge_id, "merge cancelled; main store untouched");
            return Ok(MergeOutcome {
                merge_id: report.merge_id.clone(),
                state: MergeState::Cancelled,
                applied_count: 0,
                rejected_count: 0,
            });
        }

        let mut state = MergeState::AwaitingResolution;
        debug!(merge_id = %report.merge_id, ?state, "resolving conflicts");

        let unresolved: Vec<String> = report
            .conflicts
            .iter()
            .map(MergeConflict::id)
            .filter(|id| !resolutions.contains_key(id))
            .collect();
        if !unresolved.is_empty() {
            return Err(Error::Conflict(unresolved.join(", ")));
        }
        state = MergeState::Resolved;
        debug!(merge_id = %report.merge_id, ?state, "all conflicts resolved");

        // Inserts dropped by WithDescendants rejections.
        let mut dropped: HashSet<String> = HashSet::new();
        if policy == RejectPolicy::WithDescendants {
            for conflict in &report.conflicts {
                if resolutions[&conflict.id()] == Resolution::Reject
                    && conflict.hierarchy.kind() == Kind::System
                {
                    let path = conflict.hierarchy.path().to_vec();
                    for insert in &report.inserts {
                        if insert.hierarchy.depth() > path.len()
                            && insert.hierarchy.descends_from(&path)
                        {
                            dropped.insert(insert.hierarchy.to_string());
                        }
                    }
                }
            }
        }

        state = MergeState::Applying;
        debug!(merge_id = %report.merge_id, ?state, "applying merge");

        let branch_conn = branch.connection();
        let outcome = main.write_session(|tx, ledger| {
            let mut applied = 0usize;
            let mut rejected = 0usize;

            // Conflicts first: overwrites touch rows that already exist.
            for conflict in &report.conflicts {
                match resolutions[&conflict.id()] {
                    Resolution::Overwrite => {
                        let mut candidate = conflict.main.clone();
                        candidate.name = conflict.branch.name.clone();
                        candidate.description = conflict.branch.description.clone();
                        candidate.attrs = conflict.branch.attrs.clone();
                        candidate.props = conflict.branch.props.clone();

                        // A requirement's tree parent and trace links travel
                        // with the branch edit, re-resolved by hierarchy.
                        // Links sync first so the audited snapshot sees them.
                        if conflict.hierarchy.kind() == Kind::Requirement {
                            candidate.parent_id = resolve_reference(
                                tx,
                                branch_conn,
                                conflict.branch.parent_id,
                                Kind::Requirement,
                            )?;
                            sync_trace_links(
                                tx,
                                branch_conn,
                                conflict.branch.row_id,
                                candidate.row_id,
                                &candidate.hierarchy,
                            )?;
                        }

                        update_in(tx, ledger, &candidate)?;
                        applied += 1;
                    }
                    Resolution::Reject => {
                        rejected += 1;
                    }
                    Resolution::CancelAll => unreachable!("checked above"),
                }
            }

            // Pure inserts, parents before children.
            let mut ordered: Vec<&Entity> = report
                .inserts
                .iter()
                .filter(|e| !dropped.contains(&e.hierarchy.to_string()))
                .collect();
            rejected += report.inserts.len() - ordered.len();
            ordered.sort_by_key(|e| (e.hierarchy.depth(), e.hierarchy.path().to_vec()));

            // Requirement tree parents that are themselves inserts may not
            // exist yet at insert time; they are patched afterwards.
            let mut deferred: Vec<(i64, HierId)> = Vec::new();
            let mut inserted_requirements: Vec<(i64, Entity)> = Vec::new();

            for entity in ordered {
                let mut incoming = entity.clone();
                incoming.baseline = WORKING_BASELINE.to_string();

                incoming.system_id =
                    resolve_reference(tx, branch_conn, entity.system_id, Kind::System)?;
                if entity.kind() != Kind::System && incoming.system_id.is_none() {
                    return Err(Error::Validation(format!(
                        "cannot merge {}: owning system not present in main",
                        entity.hierarchy
                    )));
                }

                incoming.parent_id = match entity.parent_id {
                    Some(branch_parent) => {
                        let parent_hier =
                            hierarchy_in(branch_conn, entity.kind(), branch_parent)?;
                        match try_fetch_by_hierarchy(tx, &parent_hier, WORKING_BASELINE)? {
                            Some(main_parent) => Some(main_parent.row_id),
                            None if entity.kind() == Kind::Requirement => {
                                // Patched once the parent row lands.
                                None
                            }
                            None => {
                                return Err(Error::Validation(format!(
                                    "cannot merge {}: parent {} not present in main",
                                    entity.hierarchy, parent_hier
                                )));
                            }
                        }
                    }
                    None => None,
                };

                let row_id = insert_row(tx, &incoming, false)?;
                incoming.row_id = row_id;

                let base: Vec<u32> =
                    incoming.hierarchy.path()[..incoming.hierarchy.depth() - 1].to_vec();
                bump_counter(tx, incoming.kind(), &base, incoming.hierarchy.seq())?;

                if let Some(branch_parent) = entity.parent_id {
                    if incoming.parent_id.is_none() {
                        deferred.push((
                            row_id,
                            hierarchy_in(branch_conn, entity.kind(), branch_parent)?,
                        ));
                    }
                }

                if incoming.kind() == Kind::Requirement {
                    inserted_requirements.push((entity.row_id, incoming.clone()));
                }

                let snapshot = snapshot_json(tx, &incoming)?;
                ledger.append(
                    tx,
                    incoming.kind().table(),
                    Operation::Insert,
                    row_id,
                    &snapshot,
                )?;
                applied += 1;
            }

            // Patch deferred requirement parents.
            for (row_id, parent_hier) in deferred {
                let parent = try_fetch_by_hierarchy(tx, &parent_hier, WORKING_BASELINE)?
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "cannot merge: parent {parent_hier} not present after merge"
                        ))
                    })?;
                tx.execute(
                    "UPDATE requirements SET parent_id = ?1 WHERE id = ?2",
                    params![parent.row_id, row_id],
                )?;
            }

            // Trace links of inserted requirements arrive after the rows
            // themselves; a late link shows up as one audited Update.
            for (branch_row_id, main_entity) in &inserted_requirements {
                let added = sync_trace_links(
                    tx,
                    branch_conn,
                    *branch_row_id,
                    main_entity.row_id,
                    &main_entity.hierarchy,
                )?;
                if added > 0 {
                    let snapshot = snapshot_json(tx, main_entity)?;
                    ledger.append(
                        tx,
                        Kind::Requirement.table(),
                        Operation::Update,
                        main_entity.row_id,
                        &snapshot,
                    )?;
                }
            }

            // Merge log row.
            let chosen: HashMap<&String, String> = resolutions
                .iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect();
            tx.execute(
                "INSERT INTO merge_log (merge_id, timestamp, resolutions, applied_count, rejected_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    report.merge_id,
                    Utc::now().to_rfc3339(),
                    serde_json::to_string(&chosen)?,
                    applied as i64,
                    rejected as i64,
                ],
            )?;

            Ok(MergeOutcome {
                merge_id: report.merge_id.clone(),
                state: MergeState::Committed,
                applied_count: applied,
                rejected_count: rejected,
            })
        })?;

        info!(
            merge_id = %outcome.merge_id,
            applied = outcome.applied_count,
            rejected = outcome.rejected_count,
            "merge committed"
        );
        Ok(outcome)
    }
}

/// Replace a main-side requirement's working trace links with the branch
/// row's links, re-resolved by hierarchy. Links whose parent is not present
/// in main are skipped; a link that would close a loop fails the merge.
/// Returns the number of links written.
fn sync_trace_links(
    main_conn: &rusqlite::Connection,
    branch_conn: &rusqlite::Connection,
    branch_child_id: i64,
    main_child_id: i64,
    child_hier: &HierId,
) -> Result<usize> {
    main_conn.execute(
        "DELETE FROM requirement_trace WHERE child_id = ?1 AND baseline = ?2",
        params![main_child_id, WORKING_BASELINE],
    )?;

    let mut parents = Vec::new();
    {
        let mut stmt = branch_conn.prepare(
            "SELECT p.hierarchy FROM requirement_trace t
             JOIN requirements p ON p.id = t.parent_id
             WHERE t.child_id = ?1 AND t.baseline = ?2",
        )?;
        let rows = stmt.query_map(params![branch_child_id, WORKING_BASELINE], |row| {
            row.get::<_, String>(0)
        })?;
        for row in rows {
            parents.push(HierId::parse(&row?)?);
        }
    }

    let mut written = 0usize;
    for parent_hier in parents {
        if let Some(main_parent) =
            try_fetch_by_hierarchy(main_conn, &parent_hier, WORKING_BASELINE)?
        {
            if creates_cycle(main_conn, main_child_id, main_parent.row_id)? {
                return Err(Error::Validation(format!(
                    "merging trace link {child_hier} -> {parent_hier} would create a circular requirement"
                )));
            }
            main_conn.execute(
                "INSERT OR IGNORE INTO requirement_trace (child_id, parent_id, baseline)
                 VALUES (?1, ?2, ?3)",
                params![main_child_id, main_parent.row_id, WORKING_BASELINE],
            )?;
            written += 1;
        }
    }
    Ok(written)
}

/// Map a branch-side rowid reference to the main-side rowid of the row with
/// the same hierarchical id
fn resolve_reference(
    main_conn: &rusqlite::Connection,
    branch_conn: &rusqlite::Connection,
    branch_row_id: Option<i64>,
    kind: Kind,
) -> Result<Option<i64>> {
    let Some(branch_row_id) = branch_row_id else {
        return Ok(None);
    };
    let hier = hierarchy_in(branch_conn, kind, branch_row_id)?;
    Ok(try_fetch_by_hierarchy(main_conn, &hier, WORKING_BASELINE)?.map(|e| e.row_id))
}

fn hierarchy_in(conn: &rusqlite::Connection, kind: Kind, row_id: i64) -> Result<HierId> {
    let text: String = conn.query_row(
        &format!("SELECT hierarchy FROM {} WHERE id = ?1", kind.table()),
        params![row_id],
        |row| row.get(0),
    )?;
    Ok(HierId::parse(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::branch::BranchManager;
    use crate::entities::NewEntity;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        main: EntityStore,
        branch: EntityStore,
        root: Entity,
    }

    /// Main with one system `S-1` ("Aircraft"), branched at `S-1`
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut main = EntityStore::open(tmp.path().join("main.db")).unwrap();
        let root = main
            .create(NewEntity::new(Kind::System, "Aircraft"))
            .unwrap();
        let manager = BranchManager::new(tmp.path().join("branches"));
        let (branch, _info) = manager.create(&main, &root.hierarchy, "work").unwrap();
        Fixture {
            _tmp: tmp,
            main,
            branch,
            root,
        }
    }

    #[test]
    fn test_unedited_branch_analyzes_clean() {
        let fx = fixture();
        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        assert_eq!(report.state, MergeState::NoConflicts);
        assert!(report.conflicts.is_empty());
        assert!(report.inserts.is_empty());
    }

    #[test]
    fn test_rename_yields_one_conflict_and_overwrite_applies() {
        let mut fx = fixture();

        let mut edited = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Aircraft v2".into();
        fx.branch.update(&edited).unwrap();

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        assert_eq!(report.state, MergeState::ConflictsFound);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].id(), "S-1");

        let chain_before = fx.main.audit_len(Kind::System).unwrap();
        let resolutions =
            HashMap::from([("S-1".to_string(), Resolution::Overwrite)]);
        let outcome = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &resolutions,
            RejectPolicy::default(),
        )
        .unwrap();

        assert_eq!(outcome.state, MergeState::Committed);
        assert_eq!(outcome.applied_count, 1);
        assert_eq!(outcome.rejected_count, 0);

        let merged = fx
            .main
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(merged.name, "Aircraft v2");
        // Exactly one audit entry for the systems table.
        assert_eq!(fx.main.audit_len(Kind::System).unwrap(), chain_before + 1);
        fx.main.verify().unwrap();
    }

    #[test]
    fn test_cancel_all_leaves_main_untouched() {
        let mut fx = fixture();

        let mut edited = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Aircraft v2".into();
        fx.branch.update(&edited).unwrap();
        fx.branch
            .create(NewEntity::new(Kind::Hazard, "New hazard").system(edited.row_id))
            .unwrap();

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        let rows_before = fx.main.list(Kind::System, WORKING_BASELINE).unwrap().len()
            + fx.main.list(Kind::Hazard, WORKING_BASELINE).unwrap().len();
        let chain_before = fx.main.audit_total().unwrap();

        let resolutions = HashMap::from([("S-1".to_string(), Resolution::CancelAll)]);
        let outcome = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &resolutions,
            RejectPolicy::default(),
        )
        .unwrap();

        assert_eq!(outcome.state, MergeState::Cancelled);
        let rows_after = fx.main.list(Kind::System, WORKING_BASELINE).unwrap().len()
            + fx.main.list(Kind::Hazard, WORKING_BASELINE).unwrap().len();
        assert_eq!(rows_before, rows_after);
        assert_eq!(fx.main.audit_total().unwrap(), chain_before);
        let main_row = fx
            .main
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(main_row.name, "Aircraft");
    }

    #[test]
    fn test_unresolved_conflict_is_an_error() {
        let mut fx = fixture();
        let mut edited = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Aircraft v2".into();
        fx.branch.update(&edited).unwrap();

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        let err = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &HashMap::new(),
            RejectPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_inserts_remap_parents_across_stores() {
        let mut fx = fixture();

        // Branch grows a new subsystem with a function inside it.
        let branch_root = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        let mut draft = NewEntity::new(Kind::System, "New subsystem");
        draft.parent = Some(branch_root.row_id);
        let sub = fx.branch.create(draft).unwrap(); // S-1.1
        fx.branch
            .create(NewEntity::new(Kind::Function, "New function").system(sub.row_id))
            .unwrap(); // F-1.1.1

        // Main concurrently allocates rowids of its own.
        fx.main
            .create(NewEntity::new(Kind::System, "Unrelated"))
            .unwrap(); // S-2

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        assert_eq!(report.state, MergeState::NoConflicts);
        assert_eq!(report.inserts.len(), 2);

        let outcome = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &HashMap::new(),
            RejectPolicy::default(),
        )
        .unwrap();
        assert_eq!(outcome.applied_count, 2);

        let merged_sub = fx
            .main
            .find_by_hierarchy(&sub.hierarchy, WORKING_BASELINE)
            .unwrap();
        let merged_func = fx
            .main
            .find_by_hierarchy(&HierId::parse("F-1.1.1").unwrap(), WORKING_BASELINE)
            .unwrap();
        // The function's owner is the merged subsystem's main-side rowid.
        assert_eq!(merged_func.system_id, Some(merged_sub.row_id));
        // And the subsystem hangs under main's S-1.
        let main_root = fx
            .main
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(merged_sub.parent_id, Some(main_root.row_id));
        fx.main.verify().unwrap();

        // Future allocations in main skip the adopted numbers.
        let mut draft = NewEntity::new(Kind::System, "After merge");
        draft.parent = Some(main_root.row_id);
        let next = fx.main.create(draft).unwrap();
        assert_eq!(next.hierarchy.to_string(), "S-1.2");
    }

    #[test]
    fn test_reject_single_row_keeps_descendant_inserts() {
        let mut fx = fixture();

        let mut edited = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Aircraft v2".into();
        fx.branch.update(&edited).unwrap();
        fx.branch
            .create(NewEntity::new(Kind::Hazard, "New hazard").system(edited.row_id))
            .unwrap(); // H-1.1

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        let resolutions = HashMap::from([("S-1".to_string(), Resolution::Reject)]);
        let outcome = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &resolutions,
            RejectPolicy::SingleRow,
        )
        .unwrap();

        assert_eq!(outcome.applied_count, 1);
        assert_eq!(outcome.rejected_count, 1);
        // The rejected rename never reached main; the hazard did.
        let main_root = fx
            .main
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(main_root.name, "Aircraft");
        assert_eq!(fx.main.list(Kind::Hazard, WORKING_BASELINE).unwrap().len(), 1);
    }

    #[test]
    fn test_reject_with_descendants_drops_subtree_inserts() {
        let mut fx = fixture();

        let mut edited = fx
            .branch
            .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Aircraft v2".into();
        fx.branch.update(&edited).unwrap();
        fx.branch
            .create(NewEntity::new(Kind::Hazard, "New hazard").system(edited.row_id))
            .unwrap();

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        let resolutions = HashMap::from([("S-1".to_string(), Resolution::Reject)]);
        let outcome = MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &resolutions,
            RejectPolicy::WithDescendants,
        )
        .unwrap();

        assert_eq!(outcome.applied_count, 0);
        assert_eq!(outcome.rejected_count, 2);
        assert!(fx.main.list(Kind::Hazard, WORKING_BASELINE).unwrap().is_empty());
    }

    #[test]
    fn test_merge_log_row_written() {
        let mut fx = fixture();
        fx.branch
            .create(
                NewEntity::new(Kind::Hazard, "New hazard").system(
                    fx.branch
                        .find_by_hierarchy(&fx.root.hierarchy, WORKING_BASELINE)
                        .unwrap()
                        .row_id,
                ),
            )
            .unwrap();

        let report = MergeCoordinator::analyze(&fx.main, &fx.branch).unwrap();
        MergeCoordinator::apply(
            &mut fx.main,
            &fx.branch,
            &report,
            &HashMap::new(),
            RejectPolicy::default(),
        )
        .unwrap();

        let count: i64 = fx
            .main
            .connection()
            .query_row("SELECT COUNT(*) FROM merge_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
