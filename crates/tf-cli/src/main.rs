use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tf_pipeline::config::{TfConfig, discover_api_keys, load_dotenv};
use tf_pipeline::controller::{PipelineController, RunStatus};
use tf_pipeline::metrics::PipelineMetrics;

/// Generates and iteratively improves a pytest suite for a Python codebase.
#[derive(Debug, Parser)]
#[command(name = "tf-pipeline", version, about)]
struct Cli {
    /// Path to the codebase under test.
    codebase_path: PathBuf,

    /// Path to a tf-pipeline.toml config file. Defaults to
    /// `<codebase_path>/tf-pipeline.toml` if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to write generated test files and run artifacts into.
    #[arg(long, default_value = "tf-pipeline-out")]
    output_dir: PathBuf,

    /// Skip actually running pytest — useful for inspecting generated
    /// tests without a configured Python environment.
    #[arg(long)]
    no_run_tests: bool,

    /// Print the coverage/mutation gate outcome without writing artifacts.
    #[arg(long)]
    coverage: bool,

    /// Skip the interactive scenario-approval prompt and approve the
    /// identified scenario set automatically.
    #[arg(long)]
    auto_approve: bool,

    /// Override the configured model list with a single model name.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    load_dotenv(&cli.codebase_path.join(".env"));
    if discover_api_keys().is_empty() {
        anyhow::bail!("no *_API_KEY environment variable found; set one before running");
    }

    let config_path = cli
        .config
        .unwrap_or_else(|| cli.codebase_path.join("tf-pipeline.toml"));
    let mut config = if config_path.exists() {
        TfConfig::from_file(&config_path)?
    } else {
        toml::from_str("").expect("empty config always parses")
    };

    if cli.auto_approve {
        config.pipeline.auto_approve = true;
    }
    if let Some(model) = cli.model {
        config.llm.models = vec![model];
    }

    let llm = config.build_llm_client()?;
    let metrics = Arc::new(PipelineMetrics::new());
    let controller = PipelineController::new(config.pipeline, llm, metrics);

    let result = controller
        .run(&cli.codebase_path, &cli.output_dir, !cli.no_run_tests)
        .await?;

    if cli.coverage {
        println!("coverage: {:.1}%", result.best_coverage);
        if let Some(mutation) = result.best_mutation {
            println!("mutation: {mutation:.1}%");
        }
    }

    tracing::info!(
        status = ?result.status,
        iterations = result.iterations_run,
        coverage = result.best_coverage,
        "pipeline run finished"
    );

    std::process::exit(if result.status == RunStatus::Completed { 0 } else { 1 });
}
