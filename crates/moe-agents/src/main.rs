use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use moe_agents::images::load_image;
use moe_agents::{build_registry, init_logging, Overrides, PanelFile, ProgressReporter, ProviderEnv};
use moe_coordination::{Effort, Orchestrator, Provider, RunRequest, Verbosity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Ask a panel of expert models and stream the arbiter's synthesised answer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Question for the panel (read from stdin when omitted)
    prompt: Option<String>,

    /// Panel configuration file
    #[arg(long, short, default_value = "moe.toml")]
    config: PathBuf,

    /// Attach an image (repeatable)
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Override the arbiter provider
    #[arg(long)]
    arbiter_provider: Option<Provider>,

    /// Override the arbiter model
    #[arg(long)]
    arbiter_model: Option<String>,

    /// Arbiter answer length
    #[arg(long, value_enum)]
    verbosity: Option<Verbosity>,

    /// Arbiter reasoning effort
    #[arg(long, value_enum)]
    effort: Option<Effort>,

    /// Per-call provider timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print every completed draft to stderr before the answer
    #[arg(long, default_value_t = false)]
    show_drafts: bool,
}

async fn read_prompt(arg: Option<String>) -> Result<String> {
    let prompt = match arg {
        Some(prompt) => prompt,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut panel = PanelFile::load(&args.config)?;
    panel.apply(&Overrides {
        arbiter_provider: args.arbiter_provider,
        arbiter_model: args.arbiter_model.clone(),
        verbosity: args.verbosity,
        effort: args.effort,
        timeout_secs: args.timeout_secs,
    });
    panel.validate()?;

    let prompt = read_prompt(args.prompt.clone()).await?;
    let images = args
        .images
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>>>()?;

    let clients = build_registry(&panel.providers(), &ProviderEnv::from_env())?;
    let orchestrator = Orchestrator::new(clients, panel.orchestrator_config());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let started = Instant::now();
    let request = RunRequest {
        prompt,
        images,
        agents: panel.agents.clone(),
        arbiter: panel.arbiter.clone(),
    };
    let mut reporter = ProgressReporter::new(std::io::stderr(), args.show_drafts);
    let mut result = orchestrator.run(request, &mut reporter, &cancel).await?;

    let mut stdout = tokio::io::stdout();
    while let Some(fragment) = result.stream.next().await {
        let fragment = fragment.context("arbiter stream failed")?;
        stdout.write_all(fragment.as_bytes()).await?;
        stdout.flush().await?;
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    info!(
        arbiter = %result.arbiter_model,
        switched = result.switched_arbiter,
        prompt_tokens = result.prompt_tokens.tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    Ok(())
}
