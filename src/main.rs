use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use orchestra::config::Config;
use orchestra::core::TaskGraph;
use orchestra::orchestration::{
    load_plan, BatchDriver, JsonLinesSink, LogSink, ProgressSink, TaskExecutor,
};
use orchestra::{olog, olog_error, olog_warn, Result};

/// Orchestra - run a dependency graph of agent tasks with review and retry
#[derive(Parser, Debug)]
#[command(name = "orchestra")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    ORCHESTRA_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.orchestra/orchestra.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.orchestra/orchestra.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan and print its execution batches
    Plan {
        /// Plan file (JSON, TOML or markdown)
        file: PathBuf,
    },

    /// Execute a plan
    Run {
        /// Plan file (JSON, TOML or markdown)
        file: PathBuf,

        /// Print progress events and the final report as JSON lines
        #[arg(long)]
        json: bool,

        /// Keep running independent tasks after a failure
        #[arg(long)]
        keep_going: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    orchestra::log::init(cli.debug);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            olog_error!("{}", e);
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    }
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    match cli.command {
        Command::Plan { file } => print_plan(&file),
        Command::Run {
            file,
            json,
            keep_going,
        } => run_plan(&config, &file, json, keep_going).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(true)
        }
    }
}

fn print_plan(file: &Path) -> Result<bool> {
    let graph = TaskGraph::new(load_plan(file)?)?;
    let plan = graph.batches()?;
    println!(
        "{} tasks, {} dependencies, {} batches",
        graph.task_count(),
        graph.dependency_count(),
        plan.len()
    );
    print!("{}", plan);
    Ok(true)
}

async fn run_plan(config: &Config, file: &Path, json: bool, keep_going: bool) -> Result<bool> {
    let graph = TaskGraph::new(load_plan(file)?)?;
    olog!("Loaded {} tasks from {}", graph.task_count(), file.display());

    let executor = TaskExecutor::new(Arc::new(config.command_service()?), config.executor_settings())
        .with_admission(Arc::new(config.admission_registry()?));
    let sink: Arc<dyn ProgressSink> = if json {
        Arc::new(JsonLinesSink)
    } else {
        Arc::new(LogSink)
    };
    let driver = BatchDriver::new(Arc::new(executor))
        .with_sink(sink)
        .with_fail_fast(config.executor.fail_fast && !keep_going);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            olog_warn!("Interrupt received; finishing in-flight tasks");
            eprintln!("Interrupted: waiting for in-flight tasks to finish...");
            signal_token.cancel();
        }
    });

    let report = driver.run(&graph, &cancel).await?;
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(report.is_success())
}
