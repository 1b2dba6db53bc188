//! CLI argument definitions

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Strata Analysis Toolkit
#[derive(Debug, Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize a new project in the current (or given) directory
    Init {
        /// Directory to initialize (defaults to the current directory)
        path: Option<PathBuf>,
    },

    /// Create a new entity in the working dataset
    New {
        /// Entity kind (tag or name, e.g. "S", "system", "requirement")
        kind: String,

        /// Entity name
        name: String,

        /// Parent entity id for recursive kinds (e.g. "S-1")
        #[arg(long)]
        parent: Option<String>,

        /// Owning system id for non-system kinds (e.g. "S-1")
        #[arg(long)]
        system: Option<String>,

        /// Description text
        #[arg(long, default_value = "")]
        description: String,

        /// Criticality classification
        #[arg(long)]
        criticality: Option<String>,
    },

    /// Show one entity
    Show {
        /// Hierarchical id (e.g. "S-1.2")
        id: String,

        /// Baseline to read from
        #[arg(long, default_value = "Working")]
        baseline: String,
    },

    /// List entities of one kind
    List {
        /// Entity kind (tag or name)
        kind: String,

        /// Baseline to read from
        #[arg(long, default_value = "Working")]
        baseline: String,
    },

    /// Delete an entity from the working dataset
    Delete {
        /// Hierarchical id (e.g. "F-1.2.1")
        id: String,
    },

    /// Compact sequence numbers under a system after structural edits
    Renumber {
        /// Root system id (e.g. "S-1")
        root: String,
    },

    /// Manage immutable snapshots of the working dataset
    #[command(subcommand)]
    Baseline(BaselineCommands),

    /// Manage branches for offline collaboration
    #[command(subcommand)]
    Branch(BranchCommands),

    /// Analyze or apply a branch merge
    #[command(subcommand)]
    Merge(MergeCommands),

    /// Verify the audit ledger hash chains
    Verify,

    /// Audit ledger utilities
    #[command(subcommand)]
    Audit(AuditCommands),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum BaselineCommands {
    /// Snapshot the working dataset under a label
    Create {
        /// Baseline label (e.g. an ISO date)
        label: String,

        /// Replace an existing snapshot with the same label
        #[arg(long)]
        overwrite: bool,

        /// Skip the interactive collision prompt
        #[arg(long)]
        yes: bool,
    },

    /// List snapshots
    List,

    /// Delete a snapshot and its metadata
    Delete {
        /// Baseline label
        label: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum BranchCommands {
    /// Extract a system sub-tree into an independent branch store
    Create {
        /// Root system id (e.g. "S-1.2")
        root: String,

        /// Branch name
        name: String,
    },

    /// List branches
    List,

    /// Delete a branch directory
    Delete {
        /// Branch name
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum MergeCommands {
    /// Report conflicts and pure inserts for a branch
    Analyze {
        /// Branch name
        branch: String,
    },

    /// Apply a branch merge with conflict resolutions
    Apply {
        /// Branch name
        branch: String,

        /// Resolution per conflict, e.g. "S-1=overwrite" (repeatable)
        #[arg(long = "resolve", value_name = "ID=RESOLUTION")]
        resolutions: Vec<String>,

        /// Abort the whole merge regardless of other resolutions
        #[arg(long)]
        cancel: bool,

        /// Fail instead of prompting for missing resolutions
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum AuditCommands {
    /// Export the full ledger as CSV
    Export {
        /// Output file (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}
