use clap::Parser;
use miette::Result;
use strata::cli::{commands, Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Reset SIGPIPE so piping into `head` or `grep -q` terminates quietly
    // instead of panicking on a broken pipe.
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .build(),
        )
    }))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => commands::init(path),
        Commands::New {
            kind,
            name,
            parent,
            system,
            description,
            criticality,
        } => commands::new_entity(kind, name, parent, system, description, criticality),
        Commands::Show { id, baseline } => commands::show(id, baseline),
        Commands::List { kind, baseline } => commands::list(kind, baseline),
        Commands::Delete { id } => commands::delete(id),
        Commands::Renumber { root } => commands::renumber(root),
        Commands::Baseline(cmd) => commands::baseline(cmd),
        Commands::Branch(cmd) => commands::branch(cmd),
        Commands::Merge(cmd) => commands::merge(cmd),
        Commands::Verify => commands::verify(),
        Commands::Audit(cmd) => commands::audit(cmd),
        Commands::Completions { shell } => commands::completions(shell),
    }
}
