use anyhow::{anyhow, Context, Result};
use apimend::backup::BackupRecord;
use apimend::capability::{PytestRunner, Workspace};
use apimend::cleanup::cleanup_generated;
use apimend::config::Config;
use apimend::coverage::{detect_gaps, Catalog, CoverageIndex};
use apimend::engine::OpenRouterEngine;
use apimend::workflow::{run_workflow, RunOptions};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "apimend",
    about = "Self-healing API test agent: repairs failing tests and fills coverage gaps",
    version
)]
struct Cli {
    /// Project root holding apimend.toml and the test tree
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run tests, heal failures, generate missing tests, verify
    Run(RunArgs),
    /// Print the ordered coverage gap queue
    Gaps,
    /// Remove every generated test carrying the marker
    Cleanup(CleanupArgs),
    /// Inspect or restore file snapshots
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Skip test generation, only heal failures
    #[arg(long, conflicts_with = "generate_only")]
    heal_only: bool,

    /// Skip healing, only generate tests for coverage gaps
    #[arg(long)]
    generate_only: bool,

    /// Show what would be done without changing any file
    #[arg(long)]
    dry_run: bool,

    /// Do not run the suite before collecting failure records
    #[arg(long)]
    skip_suite: bool,

    /// Override the generation quota for this run
    #[arg(long)]
    max_generations: Option<usize>,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    /// List what would be removed without writing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// List snapshots, newest first
    List {
        /// Only snapshots whose original file name contains this
        #[arg(long)]
        file: Option<String>,
    },
    /// Copy a snapshot back over its original file
    Restore {
        /// Snapshot file name or path, as shown by `backups list`
        backup: String,
    },
    /// Delete every snapshot and the index
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project = cli
        .project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", cli.project.display()))?;
    let mut config = Config::load(&project);

    match cli.command {
        Commands::Run(args) => {
            if let Some(n) = args.max_generations {
                config.max_generations = n;
            }
            run(&project, &config, args).await
        }
        Commands::Gaps => print_gaps(&project, &config),
        Commands::Cleanup(args) => cleanup(&project, &config, args.dry_run),
        Commands::Backups { command } => backups(&project, &config, command),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn open_workspace(project: &Path, config: &Config) -> Result<Workspace<PytestRunner>> {
    let runner = PytestRunner::new(project, &config.test_command, &config.test_args);
    Workspace::open(project, config, runner)
}

fn load_catalog(project: &Path, config: &Config) -> Result<Catalog> {
    let path = config.catalog.as_ref().map(|p| project.join(p));
    Catalog::load(path.as_deref())
}

async fn run(project: &Path, config: &Config, args: RunArgs) -> Result<()> {
    let api_key = Config::api_key().ok_or_else(|| {
        anyhow!("No OpenRouter API key found. Set OPENROUTER_API_KEY or store one in the system keychain.")
    })?;
    let engine = OpenRouterEngine::new(api_key, &config.model);
    let catalog = load_catalog(project, config)?;
    let mut workspace = open_workspace(project, config)?;

    eprintln!("apimend: {}", project.display());
    let options = RunOptions {
        heal_only: args.heal_only,
        generate_only: args.generate_only,
        dry_run: args.dry_run,
        skip_suite: args.skip_suite,
    };
    let summary = run_workflow(&engine, &mut workspace, config, &catalog, options).await;
    println!("{}", summary.render());

    if !summary.heal_failures.is_empty() || summary.final_suite_passed == Some(false) {
        println!("Backups are kept in {}", workspace.backups().store_dir().display());
    }
    Ok(())
}

fn print_gaps(project: &Path, config: &Config) -> Result<()> {
    let catalog = load_catalog(project, config)?;
    let workspace = open_workspace(project, config)?;
    let index = CoverageIndex::scan(&workspace, &config.api_base_url);
    let gaps = detect_gaps(&catalog, &index);

    println!("{} endpoint pattern(s) covered", index.patterns().len());
    if gaps.is_empty() {
        println!("No critical gaps found");
        return Ok(());
    }
    println!("{} gap(s), quota {}:", gaps.len(), config.max_generations);
    for (i, gap) in gaps.iter().enumerate() {
        let within = if i < config.max_generations { "*" } else { " " };
        println!(
            " {} [tier {}] {}  {} -> {}",
            within, gap.tier, gap.describe(), gap.canonical_name, gap.target_file
        );
    }
    Ok(())
}

fn cleanup(project: &Path, config: &Config, dry_run: bool) -> Result<()> {
    let mut workspace = open_workspace(project, config)?;
    let cleaned = cleanup_generated(&mut workspace, &config.generated_marker, dry_run)?;
    let total: usize = cleaned.iter().map(|c| c.removed).sum();
    if cleaned.is_empty() {
        println!("No generated tests found");
    } else if dry_run {
        println!("Would remove {} generated test(s) from {} file(s)", total, cleaned.len());
    } else {
        println!("Removed {} generated test(s) from {} file(s)", total, cleaned.len());
    }
    Ok(())
}

fn backups(project: &Path, config: &Config, command: BackupCommands) -> Result<()> {
    let mut workspace = open_workspace(project, config)?;
    match command {
        BackupCommands::List { file } => {
            let records: Vec<&BackupRecord> = workspace
                .backups()
                .records()
                .iter()
                .rev()
                .filter(|r| match &file {
                    Some(needle) => r
                        .original
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().contains(needle.as_str())),
                    None => true,
                })
                .collect();
            if records.is_empty() {
                println!("No backups found");
            }
            for record in records {
                let name = match &record.backup_path {
                    Some(path) => path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string()),
                    None => "(created; restoring deletes the file)".to_string(),
                };
                println!(
                    "{}  {}  {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    display_relative(project, &record.original),
                    name
                );
            }
        }
        BackupCommands::Restore { backup } => {
            let record = workspace.restore_backup(&backup)?;
            println!("Restored {}", display_relative(project, &record.original));
        }
        BackupCommands::Prune => {
            let removed = workspace.backups_mut().prune()?;
            println!("Removed {} backup file(s)", removed);
        }
    }
    Ok(())
}

fn display_relative(project: &Path, path: &Path) -> String {
    path.strip_prefix(project)
        .unwrap_or(path)
        .display()
        .to_string()
}
