//! Command implementations

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;
use console::style;
use dialoguer::{Confirm, Select};
use miette::{bail, IntoDiagnostic, Result};
use tabled::{Table, Tabled};

use crate::cli::args::{AuditCommands, BaselineCommands, BranchCommands, Cli, MergeCommands};
use crate::collab::{BranchManager, MergeCoordinator, MergeState, RejectPolicy, Resolution};
use crate::core::{Config, HierId, Kind, Project};
use crate::db::{EntityStore, OnCollision};
use crate::entities::{Entity, NewEntity, WORKING_BASELINE};

fn parse_kind(input: &str) -> Result<Kind> {
    if let Ok(kind) = input.parse::<Kind>() {
        return Ok(kind);
    }
    match input.to_lowercase().replace(['_', '-', ' '], "").as_str() {
        "system" => Ok(Kind::System),
        "function" => Ok(Kind::Function),
        "interface" => Ok(Kind::Interface),
        "asset" => Ok(Kind::Asset),
        "requirement" => Ok(Kind::Requirement),
        "hazard" => Ok(Kind::Hazard),
        "loss" => Ok(Kind::Loss),
        "controlstructure" => Ok(Kind::ControlStructure),
        "controller" => Ok(Kind::Controller),
        "controlaction" => Ok(Kind::ControlAction),
        "feedback" => Ok(Kind::Feedback),
        _ => bail!("unknown entity kind: '{input}'"),
    }
}

fn parse_id(input: &str) -> Result<HierId> {
    HierId::parse(input).into_diagnostic()
}

fn open_project() -> Result<(Project, Config)> {
    let project = Project::discover().into_diagnostic()?;
    let config = Config::load(&project);
    Ok((project, config))
}

fn open_store() -> Result<(Project, Config, EntityStore)> {
    let (project, config) = open_project()?;
    let store = EntityStore::open(project.db_path(config.database_file())).into_diagnostic()?;
    Ok((project, config, store))
}

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Criticality")]
    criticality: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
}

impl From<&Entity> for EntityRow {
    fn from(e: &Entity) -> Self {
        Self {
            id: e.hierarchy.to_string(),
            name: e.name.clone(),
            criticality: e.attrs.criticality.to_string(),
            baseline: e.baseline.clone(),
        }
    }
}

pub fn init(path: Option<PathBuf>) -> Result<()> {
    let target = match path {
        Some(p) => {
            std::fs::create_dir_all(&p).into_diagnostic()?;
            p
        }
        None => std::env::current_dir().into_diagnostic()?,
    };
    let project = Project::init(&target).into_diagnostic()?;
    let config = Config::load(&project);
    EntityStore::open(project.db_path(config.database_file())).into_diagnostic()?;

    println!(
        "{} Initialized Strata project at {}",
        style("✓").green(),
        project.root().display()
    );
    Ok(())
}

pub fn new_entity(
    kind: String,
    name: String,
    parent: Option<String>,
    system: Option<String>,
    description: String,
    criticality: Option<String>,
) -> Result<()> {
    let (_project, _config, mut store) = open_store()?;
    let kind = parse_kind(&kind)?;

    let mut draft = NewEntity::new(kind, name).description(description);

    if let Some(parent) = parent {
        let id = parse_id(&parent)?;
        let row = store
            .find_by_hierarchy(&id, WORKING_BASELINE)
            .into_diagnostic()?;
        draft.parent = Some(row.row_id);
    }
    if let Some(system) = system {
        let id = parse_id(&system)?;
        let row = store
            .find_by_hierarchy(&id, WORKING_BASELINE)
            .into_diagnostic()?;
        draft.system = Some(row.row_id);
    }
    if let Some(criticality) = criticality {
        draft.attrs.criticality = criticality
            .parse()
            .map_err(|e: String| miette::miette!(e))?;
    }

    let entity = store.create(draft).into_diagnostic()?;
    println!(
        "{} Created {} ({})",
        style("✓").green(),
        style(&entity.hierarchy).cyan(),
        entity.name
    );
    Ok(())
}

pub fn show(id: String, baseline: String) -> Result<()> {
    let (_project, _config, store) = open_store()?;
    let id = parse_id(&id)?;
    let entity = store.find_by_hierarchy(&id, &baseline).into_diagnostic()?;

    println!("{}  {}", style(&entity.hierarchy).cyan().bold(), entity.name);
    println!("  baseline:    {}", entity.baseline);
    println!("  criticality: {}", entity.attrs.criticality);
    if !entity.description.is_empty() {
        println!("  description: {}", entity.description);
    }
    if let Some(parent_id) = entity.parent_id {
        let parent = store.get(entity.kind(), parent_id).into_diagnostic()?;
        println!("  parent:      {}", parent.hierarchy);
    }
    if let Some(system_id) = entity.system_id {
        let system = store.get(Kind::System, system_id).into_diagnostic()?;
        println!("  system:      {}", system.hierarchy);
    }
    if entity.kind() == Kind::Requirement {
        let parents = store.trace_parents(&entity).into_diagnostic()?;
        if !parents.is_empty() {
            let ids: Vec<String> = parents.iter().map(|p| p.hierarchy.to_string()).collect();
            println!("  traces:      {}", ids.join(", "));
        }
    }
    if !entity.props.is_empty() {
        println!(
            "  props:       {}",
            serde_json::to_string(&entity.props).into_diagnostic()?
        );
    }
    Ok(())
}

pub fn list(kind: String, baseline: String) -> Result<()> {
    let (_project, _config, store) = open_store()?;
    let kind = parse_kind(&kind)?;
    let entities = store.list(kind, &baseline).into_diagnostic()?;

    if entities.is_empty() {
        println!("No {} entities in baseline '{}'", kind.table(), baseline);
        return Ok(());
    }
    let rows: Vec<EntityRow> = entities.iter().map(EntityRow::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

pub fn delete(id: String) -> Result<()> {
    let (_project, _config, mut store) = open_store()?;
    let id = parse_id(&id)?;
    let entity = store
        .find_by_hierarchy(&id, WORKING_BASELINE)
        .into_diagnostic()?;
    store.delete(entity.kind(), entity.row_id).into_diagnostic()?;
    println!("{} Deleted {}", style("✓").green(), id);
    Ok(())
}

pub fn renumber(root: String) -> Result<()> {
    let (_project, _config, mut store) = open_store()?;
    let root = parse_id(&root)?;
    store.renumber(&root).into_diagnostic()?;
    println!("{} Renumbered children of {}", style("✓").green(), root);
    Ok(())
}

pub fn baseline(cmd: BaselineCommands) -> Result<()> {
    match cmd {
        BaselineCommands::Create {
            label,
            overwrite,
            yes,
        } => {
            let (_project, _config, mut store) = open_store()?;

            let exists = store
                .list_baselines()
                .into_diagnostic()?
                .iter()
                .any(|b| b.label == label);

            let policy = if exists {
                if overwrite {
                    OnCollision::Overwrite
                } else if yes {
                    OnCollision::Cancel
                } else {
                    let confirmed = Confirm::new()
                        .with_prompt(format!("Baseline '{label}' exists. Overwrite it?"))
                        .default(false)
                        .interact()
                        .into_diagnostic()?;
                    if confirmed {
                        OnCollision::Overwrite
                    } else {
                        println!("Cancelled; nothing changed.");
                        return Ok(());
                    }
                }
            } else {
                OnCollision::Cancel
            };

            let info = store.create_baseline(&label, policy).into_diagnostic()?;
            println!(
                "{} Created baseline {} ({} rows)",
                style("✓").green(),
                style(&info.label).cyan(),
                info.row_count
            );
            Ok(())
        }
        BaselineCommands::List => {
            let (_project, _config, store) = open_store()?;
            let baselines = store.list_baselines().into_diagnostic()?;
            if baselines.is_empty() {
                println!("No baselines");
                return Ok(());
            }

            #[derive(Tabled)]
            struct BaselineRow {
                #[tabled(rename = "Label")]
                label: String,
                #[tabled(rename = "Created")]
                created: String,
                #[tabled(rename = "Rows")]
                rows: i64,
            }
            let rows: Vec<BaselineRow> = baselines
                .iter()
                .map(|b| BaselineRow {
                    label: b.label.clone(),
                    created: b.created_at.to_rfc3339(),
                    rows: b.row_count,
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
        BaselineCommands::Delete { label } => {
            let (_project, _config, mut store) = open_store()?;
            let removed = store.delete_baseline(&label).into_diagnostic()?;
            println!(
                "{} Deleted baseline {} ({} rows removed)",
                style("✓").green(),
                label,
                removed
            );
            Ok(())
        }
    }
}

pub fn branch(cmd: BranchCommands) -> Result<()> {
    match cmd {
        BranchCommands::Create { root, name } => {
            let (project, _config, store) = open_store()?;
            let root = parse_id(&root)?;
            let manager = BranchManager::new(project.branches_dir());
            let (_branch_store, info) = manager.create(&store, &root, &name).into_diagnostic()?;
            println!(
                "{} Created branch {} from {} ({} rows)",
                style("✓").green(),
                style(&info.name).cyan(),
                info.root_id,
                info.row_count
            );
            Ok(())
        }
        BranchCommands::List => {
            let (project, _config) = open_project()?;
            let manager = BranchManager::new(project.branches_dir());
            let branches = manager.list().into_diagnostic()?;
            if branches.is_empty() {
                println!("No branches");
                return Ok(());
            }

            #[derive(Tabled)]
            struct BranchRow {
                #[tabled(rename = "Name")]
                name: String,
                #[tabled(rename = "Root")]
                root: String,
                #[tabled(rename = "Created")]
                created: String,
                #[tabled(rename = "Rows")]
                rows: i64,
            }
            let rows: Vec<BranchRow> = branches
                .iter()
                .map(|b| BranchRow {
                    name: b.name.clone(),
                    root: b.root_id.clone(),
                    created: b.created_at.to_rfc3339(),
                    rows: b.row_count,
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
        BranchCommands::Delete { name } => {
            let (project, _config) = open_project()?;
            let manager = BranchManager::new(project.branches_dir());
            manager.delete(&name).into_diagnostic()?;
            println!("{} Deleted branch {}", style("✓").green(), name);
            Ok(())
        }
    }
}

pub fn merge(cmd: MergeCommands) -> Result<()> {
    match cmd {
        MergeCommands::Analyze { branch } => {
            let (project, _config, store) = open_store()?;
            let manager = BranchManager::new(project.branches_dir());
            let (branch_store, info) = manager.open(&branch).into_diagnostic()?;

            let report = MergeCoordinator::analyze(&store, &branch_store).into_diagnostic()?;
            println!(
                "Branch {} (root {}): {} conflict(s), {} clean insert(s)",
                style(&info.name).cyan(),
                info.root_id,
                report.conflicts.len(),
                report.inserts.len()
            );
            for conflict in &report.conflicts {
                println!(
                    "  {} {}: main='{}' branch='{}'",
                    style("conflict").yellow(),
                    conflict.id(),
                    conflict.main.name,
                    conflict.branch.name
                );
            }
            for insert in &report.inserts {
                println!("  {} {} '{}'", style("insert").green(), insert.hierarchy, insert.name);
            }
            Ok(())
        }
        MergeCommands::Apply {
            branch,
            resolutions,
            cancel,
            yes,
        } => {
            let (project, config, mut store) = open_store()?;
            let manager = BranchManager::new(project.branches_dir());
            let (branch_store, _info) = manager.open(&branch).into_diagnostic()?;

            let report = MergeCoordinator::analyze(&store, &branch_store).into_diagnostic()?;

            let mut chosen: HashMap<String, Resolution> = HashMap::new();
            if cancel {
                for conflict in &report.conflicts {
                    chosen.insert(conflict.id(), Resolution::CancelAll);
                }
                if report.conflicts.is_empty() {
                    println!("Merge cancelled; nothing changed.");
                    return Ok(());
                }
            } else {
                for spec in &resolutions {
                    let (id, resolution) = spec.split_once('=').ok_or_else(|| {
                        miette::miette!("invalid --resolve '{spec}': expected ID=RESOLUTION")
                    })?;
                    let resolution: Resolution = resolution
                        .parse()
                        .map_err(|e: String| miette::miette!(e))?;
                    chosen.insert(id.to_string(), resolution);
                }

                for conflict in &report.conflicts {
                    if chosen.contains_key(&conflict.id()) {
                        continue;
                    }
                    if yes {
                        bail!("no resolution given for conflict {}", conflict.id());
                    }
                    let options = ["overwrite", "reject", "cancel"];
                    let pick = Select::new()
                        .with_prompt(format!(
                            "Conflict {}: main='{}' branch='{}'",
                            conflict.id(),
                            conflict.main.name,
                            conflict.branch.name
                        ))
                        .items(&options)
                        .default(0)
                        .interact()
                        .into_diagnostic()?;
                    chosen.insert(
                        conflict.id(),
                        options[pick].parse().map_err(|e: String| miette::miette!(e))?,
                    );
                }
            }

            let policy: RejectPolicy = config.reject_policy();
            let outcome =
                MergeCoordinator::apply(&mut store, &branch_store, &report, &chosen, policy)
                    .into_diagnostic()?;

            match outcome.state {
                MergeState::Cancelled => println!("Merge cancelled; nothing changed."),
                _ => println!(
                    "{} Merge {} committed: {} applied, {} rejected",
                    style("✓").green(),
                    outcome.merge_id,
                    outcome.applied_count,
                    outcome.rejected_count
                ),
            }
            Ok(())
        }
    }
}

pub fn verify() -> Result<()> {
    let (_project, _config, store) = open_store()?;
    let report = store.verify().into_diagnostic()?;
    println!(
        "{} Audit ledger verified: {} entries across {} table chain(s)",
        style("✓").green(),
        report.entries,
        report.tables
    );
    Ok(())
}

pub fn audit(cmd: AuditCommands) -> Result<()> {
    match cmd {
        AuditCommands::Export { output } => {
            let (_project, _config, store) = open_store()?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path).into_diagnostic()?;
                    let written = store.audit_export(file).into_diagnostic()?;
                    println!(
                        "{} Exported {} ledger entries to {}",
                        style("✓").green(),
                        written,
                        path.display()
                    );
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    store.audit_export(&mut lock).into_diagnostic()?;
                    lock.flush().into_diagnostic()?;
                }
            }
            Ok(())
        }
    }
}

pub fn completions(shell: clap_complete::Shell) -> Result<()> {
    clap_complete::generate(shell, &mut Cli::command(), "strata", &mut std::io::stdout());
    Ok(())
}
