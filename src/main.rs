//! Dockhand CLI
//!
//! Validates the Docker worker repositories named in a prompt, repairs the
//! failing ones and opens pull requests for the fixes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use dockhand::checkout::{GitHubCheckout, LocalCheckout, RepositoryCheckout};
use dockhand::{
    parse_prompt_with_org, AgentRepair, DockerCli, DockhandConfig, Error, FeatureAgent,
    GitHubPublisher, JsonFileStore, LLMRunner, Orchestrator, ParsedPrompt, Pipeline, PipelineOptions,
    RepairLoop, RunSummary, Validate,
};

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate and repair Docker worker repositories", long_about = None)]
struct Cli {
    /// Prompt naming repositories, as free text or `# PROMPT` / `# REPOS` sections
    #[arg(required_unless_present = "prompt_file")]
    prompt: Vec<String>,

    /// Read the prompt from a file
    #[arg(long, conflicts_with = "prompt")]
    prompt_file: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long, env = "DOCKHAND_CONFIG")]
    config: Option<PathBuf>,

    /// Directory repositories are checked out into
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Use existing checkouts under the workdir instead of cloning
    #[arg(long)]
    local: bool,

    /// Identifier for this run (default: random UUID)
    #[arg(long)]
    run_id: Option<String>,

    /// Parse the prompt and list repositories without doing anything
    #[arg(long)]
    dry_run: bool,

    /// Do not open pull requests
    #[arg(long)]
    no_pr: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Returns whether every repository ended passed or fixed.
async fn run(cli: Cli) -> dockhand::Result<bool> {
    let mut config = DockhandConfig::resolve(cli.config.as_deref())?;
    if let Some(workdir) = cli.workdir.clone() {
        config.workdir = workdir;
    }
    if cli.no_pr {
        config.create_pr = false;
    }
    config.validate().into_result()?;

    let text = match &cli.prompt_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => cli.prompt.join(" "),
    };
    let prompt = parse_prompt_with_org(&text, &config.default_org)?;

    if cli.dry_run {
        print_dry_run(&prompt, cli.json)?;
        return Ok(true);
    }

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let runner = dockhand::runner::runner_for(&config.runner)?;
    tracing::info!(runner = %runner.name(), run_id = %run_id, "using runner");

    let pipeline = Pipeline::new(
        DockerCli::with_cli_path(&config.docker_cli),
        PipelineOptions::from(&config),
    );
    let checkout: Arc<dyn RepositoryCheckout> = if cli.local {
        Arc::new(LocalCheckout::new(&config.workdir))
    } else {
        Arc::new(GitHubCheckout::new(&config.workdir))
    };
    let repair = AgentRepair::new(runner.clone())
        .with_model(config.model.clone())
        .with_timeout(config.agent_timeout())
        .with_max_attempts(config.max_repair_attempts);
    let feature = FeatureAgent::new(runner)
        .with_model(config.model.clone())
        .with_timeout(config.agent_timeout());

    let mut orchestrator = Orchestrator::new(
        pipeline,
        checkout,
        Arc::new(repair),
        Arc::new(JsonFileStore::new(&config.results_dir)),
    )
    .with_repair_loop(RepairLoop::new(config.max_repair_attempts))
    .with_feature(Arc::new(feature));

    if config.create_pr {
        orchestrator = orchestrator.with_publisher(Arc::new(GitHubPublisher::new(&config.base_branch)));
    }

    let summary = orchestrator.process(&prompt, &run_id).await;
    print_summary(&summary, cli.json)?;

    Ok(summary.all_succeeded())
}

fn print_dry_run(prompt: &ParsedPrompt, json: bool) -> Result<(), Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(prompt)?);
        return Ok(());
    }

    println!("Mode: {:?}", prompt.mode);
    if !prompt.action_intent.is_empty() {
        println!("Intent: {}", prompt.action_intent);
    }
    println!("Repositories:");
    for repo in &prompt.repositories {
        println!("  - {}", repo);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let width = summary
        .outcomes
        .iter()
        .map(|o| o.repository.full_name().len())
        .max()
        .unwrap_or(0)
        .max("REPOSITORY".len());

    println!("\n{}", "=".repeat(60));
    println!("Run: {}", summary.run_id);
    println!("{}", "=".repeat(60));
    println!(
        "{:<width$}  {:<10}  {:<8}  PR",
        "REPOSITORY",
        "STATUS",
        "ATTEMPTS",
        width = width
    );
    for outcome in &summary.outcomes {
        let pr = outcome
            .pull_request
            .as_ref()
            .map(|pr| pr.pr_url.clone().unwrap_or_else(|| pr.message.clone()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<width$}  {:<10}  {:<8}  {}",
            outcome.repository.full_name(),
            outcome.status,
            outcome.attempts(),
            pr,
            width = width
        );
    }

    for outcome in &summary.outcomes {
        println!();
        if let Some(report) = outcome.final_report() {
            print!("{}", report.report);
        } else if let Some(error) = &outcome.error {
            println!("{}: {}", outcome.repository, error);
        }
    }

    Ok(())
}
