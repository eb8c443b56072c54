#![forbid(unsafe_code)]

mod cmd;
mod output;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use arbor_core::config::{self, ArborConfig};
use arbor_core::{Store, StoreError, StoreOptions};
use clap::{Parser, Subcommand};
use output::OutputMode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cmd::status::Transition;

#[derive(Parser, Debug)]
#[command(author, version, about = "arbor: hierarchical task store", long_about = None)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Project root holding `.arbor/`. Defaults to the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Add a task",
        after_help = "EXAMPLES:\n    arbor add \"Plan trip\"\n    arbor add \"Book flights\" --parent 1"
    )]
    Add(cmd::add::AddArgs),

    #[command(
        about = "List tasks",
        after_help = "EXAMPLES:\n    arbor list\n    arbor list --scope completed\n    arbor list --under 1"
    )]
    List(cmd::list::ListArgs),

    #[command(about = "Show one task and its ancestry")]
    Show(cmd::show::ShowArgs),

    #[command(about = "Complete a task and its open descendants")]
    Done(cmd::status::StatusArgs),

    #[command(about = "Reopen a completed task and its completed descendants")]
    Reopen(cmd::status::StatusArgs),

    #[command(about = "Move a task (and its subtree) to the trash, or remove it with --hard")]
    Delete(cmd::status::DeleteArgs),

    #[command(about = "Bring a task back from the trash")]
    Restore(cmd::status::StatusArgs),

    #[command(name = "move", about = "Reparent a task")]
    Move(cmd::move_cmd::MoveArgs),

    #[command(about = "Permanently remove old trashed tasks")]
    Purge(cmd::purge::PurgeArgs),

    #[command(about = "Count tasks in a scope")]
    Count(cmd::count::CountArgs),

    #[command(about = "Print the resolved configuration")]
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let mode = cli.output_mode();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, mode);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let root = match cli.root.clone() {
        Some(root) => root,
        None => env::current_dir().context("Failed to determine the current directory")?,
    };
    let config = config::resolve_config(&root)?;
    let mode = cli.output_mode();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if matches!(cli.command, Commands::Config) {
        cmd::config::run_config(&config, mode, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    let store = open_store(&root, &config)?;
    execute(&cli.command, &store, &config, mode, &mut out).await?;
    out.flush()?;
    Ok(())
}

async fn execute(
    command: &Commands,
    store: &Store,
    config: &ArborConfig,
    mode: OutputMode,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Commands::Add(args) => cmd::add::run_add(args, store, mode, out).await,
        Commands::List(args) => cmd::list::run_list(args, store, mode, out).await,
        Commands::Show(args) => cmd::show::run_show(args, store, mode, out).await,
        Commands::Done(args) => {
            cmd::status::run_transition(args, Transition::Complete, store, mode, out).await
        }
        Commands::Reopen(args) => {
            cmd::status::run_transition(args, Transition::Reopen, store, mode, out).await
        }
        Commands::Restore(args) => {
            cmd::status::run_transition(args, Transition::Restore, store, mode, out).await
        }
        Commands::Delete(args) => cmd::status::run_delete(args, store, mode, out).await,
        Commands::Move(args) => cmd::move_cmd::run_move(args, store, mode, out).await,
        Commands::Purge(args) => {
            cmd::purge::run_purge(args, store, &config.store, mode, out).await
        }
        Commands::Count(args) => cmd::count::run_count(args, store, mode, out).await,
        Commands::Config => cmd::config::run_config(config, mode, out),
    }
}

fn open_store(root: &std::path::Path, config: &ArborConfig) -> anyhow::Result<Store> {
    let path = config.store.resolved_path(root);
    debug!(path = %path.display(), "opening store");
    let options = StoreOptions::default().with_busy_timeout(config.store.busy_timeout());
    Store::open(&path, options).with_context(|| format!("Failed to open {}", path.display()))
}

fn report_error(err: &anyhow::Error, mode: OutputMode) {
    let store_error = err.chain().find_map(|e| e.downcast_ref::<StoreError>());
    let code = store_error.map(StoreError::code);

    if mode.is_json() {
        let body = serde_json::json!({
            "ok": false,
            "error": format!("{err:#}"),
            "code": code.map(|c| c.code()),
            "hint": code.and_then(|c| c.hint()),
        });
        println!("{body}");
        return;
    }

    match code {
        Some(code) => eprintln!("error[{}]: {err:#}", code.code()),
        None => eprintln!("error: {err:#}"),
    }
    if let Some(hint) = code.and_then(|c| c.hint()) {
        eprintln!("hint: {hint}");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ARBOR_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "arbor=debug,info"
        } else {
            "arbor=info,warn"
        })
    });

    let format = env::var("ARBOR_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so --json output stays parseable.
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry.with(fmt::layer().compact().with_writer(io::stderr)).init();
        }
    }
}
