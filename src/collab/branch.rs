//! Branch extraction for offline collaboration
//!
//! A branch is a fully self-contained store holding one system sub-tree:
//! the root system, every descendant row of any kind, the trace links whose
//! endpoints both came along, and the sibling-group counters for the copied
//! groups. Divergence from the source is tracked purely through the shared
//! hierarchical identifiers; the branch keeps no live reference back.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::core::error::{Error, Result};
use crate::core::identity::{HierId, Kind};
use crate::db::audit::Operation;
use crate::db::store::{bump_counter, fetch_all, insert_row, snapshot_json, EntityStore};
use crate::entities::{Entity, WORKING_BASELINE};

/// Database filename inside a branch directory
const BRANCH_DB: &str = "strata.db";
/// Metadata filename inside a branch directory
const BRANCH_META: &str = "branch.json";

/// Branch metadata, persisted as `branch.json` next to the branch database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub branch_id: String,
    pub name: String,
    /// Hierarchical id of the extracted sub-tree root
    pub root_id: String,
    pub created_at: DateTime<Utc>,
    /// Path of the store this branch was extracted from
    pub source_identifier: String,
    pub row_count: i64,
}

/// Creates, opens, lists and deletes branches under one directory
pub struct BranchManager {
    branches_dir: PathBuf,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

impl BranchManager {
    pub fn new(branches_dir: impl Into<PathBuf>) -> Self {
        Self {
            branches_dir: branches_dir.into(),
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.branches_dir.join(name)
    }

    /// Extract the sub-tree rooted at `root` into a new, independent store.
    ///
    /// Read-only against the source. The copies land tagged `"Working"` and
    /// are recorded as Inserts in the branch's own audit ledger.
    pub fn create(
        &self,
        source: &EntityStore,
        root: &HierId,
        name: &str,
    ) -> Result<(EntityStore, BranchInfo)> {
        if !valid_name(name) {
            return Err(Error::Validation(format!(
                "invalid branch name '{name}': use letters, numbers, '_', '-'"
            )));
        }
        if root.kind() != Kind::System {
            return Err(Error::Validation(
                "branches are rooted at a system".into(),
            ));
        }
        let dir = self.dir(name);
        if dir.exists() {
            return Err(Error::Validation(format!("branch '{name}' already exists")));
        }

        // Root must exist in the working set before any file is created.
        source.find_by_hierarchy(root, WORKING_BASELINE)?;
        let root_path = root.path().to_vec();

        // Systems: the root and everything below it. Other kinds: strictly
        // below the root (an equal-length row of another kind is a sibling
        // of the root, not a member of its sub-tree).
        let mut rows: Vec<Entity> = Vec::new();
        for kind in Kind::all() {
            let members = fetch_all(source.connection(), *kind, WORKING_BASELINE)?
                .into_iter()
                .filter(|e| match kind {
                    Kind::System => e.hierarchy.descends_from(&root_path),
                    _ => {
                        e.hierarchy.depth() > root_path.len()
                            && e.hierarchy.descends_from(&root_path)
                    }
                });
            rows.extend(members);
        }
        // Parents resolve before children when snapshots are taken.
        rows.sort_by_key(|e| (e.hierarchy.depth(), e.hierarchy.path().to_vec()));

        let copied_rowids: std::collections::HashSet<(Kind, i64)> =
            rows.iter().map(|e| (e.kind(), e.row_id)).collect();

        // Trace links where both requirement endpoints came along.
        let mut links: Vec<(i64, i64)> = Vec::new();
        {
            let mut stmt = source.connection().prepare(
                "SELECT child_id, parent_id FROM requirement_trace WHERE baseline = ?1",
            )?;
            let found = stmt.query_map(params![WORKING_BASELINE], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for link in found {
                let (child, parent) = link?;
                if copied_rowids.contains(&(Kind::Requirement, child))
                    && copied_rowids.contains(&(Kind::Requirement, parent))
                {
                    links.push((child, parent));
                }
            }
        }

        // Sibling-group counters for the copied groups, so a freed sequence
        // number stays retired inside the branch too.
        let mut counters: Vec<(String, String, i64)> = Vec::new();
        {
            let mut stmt = source
                .connection()
                .prepare("SELECT type_tag, parent_path, next_seq FROM id_counters")?;
            let found = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for counter in found {
                let (tag, parent_path, next_seq) = counter?;
                let segments: Option<Vec<u32>> = parent_path
                    .split('.')
                    .map(|p| p.parse::<u32>().ok())
                    .collect();
                if let Some(segments) = segments {
                    if segments.len() >= root_path.len()
                        && segments[..root_path.len()] == root_path[..]
                    {
                        counters.push((tag, parent_path, next_seq));
                    }
                }
            }
        }

        fs::create_dir_all(&dir)?;
        let mut branch = EntityStore::open(dir.join(BRANCH_DB))?;
        let row_count = rows.len() as i64;

        branch.write_session(|tx, ledger| {
            // Links first: requirement snapshots then include them.
            for (child, parent) in &links {
                tx.execute(
                    "INSERT INTO requirement_trace (child_id, parent_id, baseline)
                     VALUES (?1, ?2, ?3)",
                    params![child, parent, WORKING_BASELINE],
                )?;
            }

            for entity in &rows {
                insert_row(tx, entity, true)?;
            }

            for (tag, parent_path, next_seq) in &counters {
                tx.execute(
                    "INSERT INTO id_counters (type_tag, parent_path, next_seq)
                     VALUES (?1, ?2, ?3)",
                    params![tag, parent_path, next_seq],
                )?;
            }

            for entity in &rows {
                let snapshot = snapshot_json(tx, entity)?;
                ledger.append(
                    tx,
                    entity.kind().table(),
                    Operation::Insert,
                    entity.row_id,
                    &snapshot,
                )?;
                let base: Vec<u32> =
                    entity.hierarchy.path()[..entity.hierarchy.depth() - 1].to_vec();
                bump_counter(tx, entity.kind(), &base, entity.hierarchy.seq())?;
            }

            Ok(())
        })?;

        let info = BranchInfo {
            branch_id: Ulid::new().to_string(),
            name: name.to_string(),
            root_id: root.to_string(),
            created_at: Utc::now(),
            source_identifier: source.path().display().to_string(),
            row_count,
        };
        fs::write(dir.join(BRANCH_META), serde_json::to_string_pretty(&info)?)?;

        info!(branch = name, root = %root, rows = row_count, "created branch");
        Ok((branch, info))
    }

    /// Open an existing branch
    pub fn open(&self, name: &str) -> Result<(EntityStore, BranchInfo)> {
        let dir = self.dir(name);
        let meta_path = dir.join(BRANCH_META);
        if !meta_path.exists() {
            return Err(Error::not_found("branch", name));
        }
        let info: BranchInfo = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
        let store = EntityStore::open(dir.join(BRANCH_DB))?;
        Ok((store, info))
    }

    /// All branches under the managed directory, newest first
    pub fn list(&self) -> Result<Vec<BranchInfo>> {
        let mut out = Vec::new();
        if !self.branches_dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.branches_dir)? {
            let entry = entry?;
            let meta_path = entry.path().join(BRANCH_META);
            if meta_path.exists() {
                if let Ok(info) =
                    serde_json::from_str::<BranchInfo>(&fs::read_to_string(meta_path)?)
                {
                    out.push(info);
                }
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Remove a branch directory and everything in it
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.dir(name);
        if !dir.exists() {
            return Err(Error::not_found("branch", name));
        }
        fs::remove_dir_all(&dir)?;
        info!(branch = name, "deleted branch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewEntity;
    use std::path::Path;
    use tempfile::TempDir;

    fn seeded_store(dir: &Path) -> (EntityStore, Entity, Entity) {
        let mut store = EntityStore::open(dir.join("main.db")).unwrap();
        let root = store
            .create(NewEntity::new(Kind::System, "Aircraft"))
            .unwrap(); // S-1
        let sub = {
            let mut draft = NewEntity::new(Kind::System, "Avionics");
            draft.parent = Some(root.row_id);
            store.create(draft).unwrap() // S-1.1
        };
        store
            .create(NewEntity::new(Kind::Function, "Navigate").system(sub.row_id))
            .unwrap(); // F-1.1.1
        store
            .create(NewEntity::new(Kind::Hazard, "CFIT").system(root.row_id))
            .unwrap(); // H-1.1
        (store, root, sub)
    }

    #[test]
    fn test_branch_copies_exact_subtree() {
        let tmp = TempDir::new().unwrap();
        let (store, _root, sub) = seeded_store(tmp.path());

        let manager = BranchManager::new(tmp.path().join("branches"));
        let (branch, info) = manager.create(&store, &sub.hierarchy, "avionics-work").unwrap();

        // S-1.1 and F-1.1.1 come along; S-1 and H-1.1 do not.
        assert_eq!(info.row_count, 2);
        assert_eq!(branch.list(Kind::System, WORKING_BASELINE).unwrap().len(), 1);
        assert_eq!(branch.list(Kind::Function, WORKING_BASELINE).unwrap().len(), 1);
        assert!(branch.list(Kind::Hazard, WORKING_BASELINE).unwrap().is_empty());

        let copied = branch
            .find_by_hierarchy(&sub.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(copied.name, "Avionics");
        assert_eq!(copied.row_id, sub.row_id);

        branch.verify().unwrap();
    }

    #[test]
    fn test_branch_is_prefix_aware() {
        let tmp = TempDir::new().unwrap();
        let mut store = EntityStore::open(tmp.path().join("main.db")).unwrap();
        let root = store
            .create(NewEntity::new(Kind::System, "Root"))
            .unwrap();
        let mut children = Vec::new();
        for i in 0..12 {
            let mut draft = NewEntity::new(Kind::System, format!("Child {i}"));
            draft.parent = Some(root.row_id);
            children.push(store.create(draft).unwrap());
        }
        // Children S-1.2 and S-1.12 now both exist.
        let second = &children[1];
        store
            .create(NewEntity::new(Kind::Function, "Inside").system(second.row_id))
            .unwrap(); // F-1.2.1
        store
            .create(NewEntity::new(Kind::Function, "Outside").system(children[11].row_id))
            .unwrap(); // F-1.12.1

        let manager = BranchManager::new(tmp.path().join("branches"));
        let (branch, info) = manager.create(&store, &second.hierarchy, "narrow").unwrap();

        assert_eq!(info.row_count, 2); // S-1.2 + F-1.2.1 only
        assert!(branch
            .find_by_hierarchy(&HierId::parse("F-1.12.1").unwrap(), WORKING_BASELINE)
            .is_err());
    }

    #[test]
    fn test_branch_is_independent_of_source() {
        let tmp = TempDir::new().unwrap();
        let (mut store, _root, sub) = seeded_store(tmp.path());
        let manager = BranchManager::new(tmp.path().join("branches"));
        let (mut branch, _info) = manager.create(&store, &sub.hierarchy, "indep").unwrap();

        let mut edited = branch
            .find_by_hierarchy(&sub.hierarchy, WORKING_BASELINE)
            .unwrap();
        edited.name = "Avionics v2".into();
        branch.update(&edited).unwrap();

        // The source still sees the original name.
        let source_row = store
            .find_by_hierarchy(&sub.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(source_row.name, "Avionics");

        // And edits in the source do not reach the branch.
        let mut renamed = source_row.clone();
        renamed.name = "Main edit".into();
        store.update(&renamed).unwrap();
        let branch_row = branch
            .find_by_hierarchy(&sub.hierarchy, WORKING_BASELINE)
            .unwrap();
        assert_eq!(branch_row.name, "Avionics v2");
    }

    #[test]
    fn test_branch_inherits_retired_sequence_numbers() {
        let tmp = TempDir::new().unwrap();
        let mut store = EntityStore::open(tmp.path().join("main.db")).unwrap();
        let root = store.create(NewEntity::new(Kind::System, "Root")).unwrap();
        let mut draft = NewEntity::new(Kind::System, "Gone");
        draft.parent = Some(root.row_id);
        let doomed = store.create(draft).unwrap(); // S-1.1
        store.delete(Kind::System, doomed.row_id).unwrap();

        let manager = BranchManager::new(tmp.path().join("branches"));
        let (mut branch, _info) = manager.create(&store, &root.hierarchy, "counters").unwrap();

        let mut draft = NewEntity::new(Kind::System, "Fresh");
        draft.parent = Some(root.row_id);
        let fresh = branch.create(draft).unwrap();
        // S-1.1 was retired in the source before branching.
        assert_eq!(fresh.hierarchy.to_string(), "S-1.2");
    }

    #[test]
    fn test_list_open_delete_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (store, root, _sub) = seeded_store(tmp.path());
        let manager = BranchManager::new(tmp.path().join("branches"));
        manager.create(&store, &root.hierarchy, "one").unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "one");
        assert_eq!(listed[0].root_id, root.hierarchy.to_string());

        let (reopened, info) = manager.open("one").unwrap();
        assert_eq!(info.name, "one");
        assert_eq!(
            reopened.list(Kind::System, WORKING_BASELINE).unwrap().len(),
            2
        );

        manager.delete("one").unwrap();
        assert!(matches!(
            manager.open("one").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_duplicate_branch_name_rejected() {
        let tmp = TempDir::new().unwrap();
        let (store, root, _sub) = seeded_store(tmp.path());
        let manager = BranchManager::new(tmp.path().join("branches"));
        manager.create(&store, &root.hierarchy, "dup").unwrap();
        let err = manager.create(&store, &root.hierarchy, "dup").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
