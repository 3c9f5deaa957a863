//! `prj`: run declarative project actions.
//!
//! Actions live in `.prj/actions/<name>.toml`; scripts they reference live in
//! `.prj/steps/`. Runs leave their logs and `metadata.json` under
//! `.prj/artifacts/<project>/<run-id>-<action>/`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prj::core::arguments::parse_assignments;
use prj::core::types::ExecutionResult;
use prj::engine::{Collaborators, Engine};
use prj::error::EngineError;
use prj::exit_codes;
use prj::io::artifacts::FsArtifactStore;
use prj::io::config::{EngineConfig, ProjectPaths, load_config, write_config};
use prj::io::definitions::{DefinitionSource, TomlDefinitionSource};
use prj::io::events::JsonlEventStore;
use prj::io::git::Git;
use prj::logging;

#[derive(Parser)]
#[command(name = "prj", version, about = "Local workflow orchestrator")]
struct Cli {
    /// Project directory. Defaults to the enclosing git repository, else the
    /// current directory.
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    /// Debug-level diagnostics on stderr (ignored when `RUST_LOG` is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.prj/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run an action.
    Run {
        /// Action name (file stem under `.prj/actions/`).
        action: String,
        /// Action argument as `key=value`. Repeatable.
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
        /// Print the plan without provisioning or executing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// List available actions.
    List,
    /// Show recent runs, most recent first.
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Show recent runs, worktrees and tmux sessions.
    Status {
        /// Recent runs to show.
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },
    /// Delete run artifacts older than a number of days.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = project_root(cli.project.as_deref())?;
    let paths = ProjectPaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Run {
            action,
            args,
            dry_run,
        } => cmd_run(&paths, &action, &args, dry_run),
        Command::List => cmd_list(&paths),
        Command::History { limit } => cmd_history(&paths, limit),
        Command::Status { limit } => cmd_status(&paths, limit),
        Command::Cleanup { days } => cmd_cleanup(&paths, days),
    }
}

fn project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return dir
            .canonicalize()
            .with_context(|| format!("project directory {}", dir.display()));
    }
    let cwd = std::env::current_dir().context("read current directory")?;
    let git = Git::new(&cwd, Duration::from_secs(10));
    if git.is_repository() {
        if let Ok(top) = git.toplevel() {
            return Ok(top);
        }
    }
    Ok(cwd)
}

fn cmd_init(paths: &ProjectPaths, force: bool) -> Result<i32> {
    for dir in [&paths.actions_dir, &paths.steps_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &EngineConfig::default())?;
    }
    println!("initialized {}", paths.prj_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &ProjectPaths, action: &str, args: &[String], dry_run: bool) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let source = TomlDefinitionSource::new(&paths.actions_dir);
    let outcome = parse_assignments(args)
        .map_err(EngineError::Definition)
        .and_then(|arguments| {
            let definition = source.load(action)?;
            let engine = Engine::new(config.clone(), Collaborators::for_project(paths, &config));
            if dry_run {
                engine.plan(&definition, &arguments)
            } else {
                engine.execute(&definition, &arguments, &paths.root)
            }
        });

    match outcome {
        Ok(result) => {
            report(&result);
            Ok(if result.success {
                exit_codes::OK
            } else {
                exit_codes::FAILED
            })
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn report(result: &ExecutionResult) {
    if let Some(output) = &result.output {
        print!("{output}");
        return;
    }
    for step in &result.history {
        let mark = if step.error.is_none() { "ok" } else { "FAILED" };
        println!("[{}] {} {mark}", step.phase, step.name);
        let text = step.output.trim_end();
        if !text.is_empty() {
            for line in text.lines() {
                println!("    {line}");
            }
        }
    }
    if let Some(dir) = &result.artifact_dir {
        println!("artifacts: {}", dir.display());
    }
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(error) = &result.error {
        match &result.failed_step {
            Some(step) => eprintln!("run failed at '{step}': {error}"),
            None => eprintln!("run failed: {error}"),
        }
    }
}

fn cmd_list(paths: &ProjectPaths) -> Result<i32> {
    let source = TomlDefinitionSource::new(&paths.actions_dir);
    let listing = match source.list() {
        Ok(listing) => listing,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit_codes::INVALID);
        }
    };
    let width = listing.actions.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for summary in &listing.actions {
        println!(
            "{:<width$}  [{}] {}",
            summary.name, summary.category, summary.description
        );
    }
    for invalid in &listing.invalid {
        eprintln!("warning: skipped '{}': {}", invalid.name, invalid.error);
    }
    Ok(exit_codes::OK)
}

fn cmd_history(paths: &ProjectPaths, limit: usize) -> Result<i32> {
    let store = JsonlEventStore::new(&paths.events_path);
    for event in store.recent(limit)? {
        println!(
            "{}  {:<9} {}  {}",
            event.start_time.format("%Y-%m-%d %H:%M:%S"),
            event.status.to_string(),
            event.command,
            event.session_id
        );
        if let Some(error) = &event.error {
            println!("    {error}");
        }
    }
    Ok(exit_codes::OK)
}

/// Worktree and session lookups are best effort: a project outside git or a
/// machine without tmux still gets a report.
fn cmd_status(paths: &ProjectPaths, limit: usize) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let collaborators = Collaborators::for_project(paths, &config);

    println!("project: {} ({})", paths.project_name(), paths.root.display());
    if !paths.prj_dir.is_dir() {
        println!("not initialized, run 'prj init'");
    }

    println!("recent runs:");
    let events = JsonlEventStore::new(&paths.events_path).recent(limit)?;
    if events.is_empty() {
        println!("  none");
    }
    for event in &events {
        let duration = match event.end_time {
            Some(end) => {
                let millis = (end - event.start_time).num_milliseconds();
                format!("{:.1}s", millis as f64 / 1000.0)
            }
            None => "running".to_string(),
        };
        println!(
            "  {}  {:<9} {}  {duration}",
            event.start_time.format("%Y-%m-%d %H:%M:%S"),
            event.status.to_string(),
            event.command
        );
    }

    println!("worktrees:");
    match collaborators.workspaces.list() {
        Ok(worktrees) if worktrees.is_empty() => println!("  none"),
        Ok(worktrees) => {
            for worktree in worktrees {
                let branch = worktree.branch.as_deref().unwrap_or("(detached)");
                println!("  {branch}  {}", worktree.path.display());
            }
        }
        Err(err) => println!("  unavailable: {err}"),
    }

    println!("sessions:");
    match collaborators.sessions.list() {
        Ok(sessions) if sessions.is_empty() => println!("  none"),
        Ok(sessions) => {
            for session in sessions {
                let attached = if session.attached { " (attached)" } else { "" };
                println!(
                    "  {}  {}{attached}",
                    session.name,
                    session.path.as_deref().unwrap_or("-")
                );
            }
        }
        Err(err) => println!("  unavailable: {err}"),
    }
    Ok(exit_codes::OK)
}

fn cmd_cleanup(paths: &ProjectPaths, days: u64) -> Result<i32> {
    let age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
    let cutoff = SystemTime::now()
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let removed = FsArtifactStore::new(&paths.artifacts_dir).prune_before(cutoff)?;
    for dir in &removed {
        println!("removed {}", dir.display());
    }
    println!("pruned {} run(s) older than {days} day(s)", removed.len());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_repeated_arguments() {
        let cli = Cli::try_parse_from([
            "prj", "run", "deploy", "-a", "env=prod", "--arg", "region=eu", "--dry-run",
        ])
        .expect("parse");
        let Command::Run {
            action,
            args,
            dry_run,
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(action, "deploy");
        assert_eq!(args, vec!["env=prod", "region=eu"]);
        assert!(dry_run);
    }

    #[test]
    fn project_flag_is_global() {
        let cli = Cli::try_parse_from(["prj", "list", "-C", "/tmp/app"]).expect("parse");
        assert_eq!(cli.project.as_deref(), Some(Path::new("/tmp/app")));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn history_limit_defaults_to_ten() {
        let cli = Cli::try_parse_from(["prj", "history"]).expect("parse");
        assert!(matches!(cli.command, Command::History { limit: 10 }));
        assert!(!cli.verbose);
    }

    #[test]
    fn cleanup_defaults_to_thirty_days() {
        let cli = Cli::try_parse_from(["prj", "cleanup"]).expect("parse");
        assert!(matches!(cli.command, Command::Cleanup { days: 30 }));
        let cli = Cli::try_parse_from(["prj", "cleanup", "--days", "7"]).expect("parse");
        assert!(matches!(cli.command, Command::Cleanup { days: 7 }));
    }

    #[test]
    fn run_requires_an_action() {
        assert!(Cli::try_parse_from(["prj", "run"]).is_err());
    }
}
