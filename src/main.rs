//! grpo-forge: turn recorded agent trajectories into GRPO training data.
//!
//! Subcommands:
//!
//! - `convert`  -- Convert every trajectory and print the result as JSON
//! - `samples`  -- Extract supervised chat samples from recorded LLM calls
//! - `group`    -- Build one scored group and print it as JSON
//! - `train`    -- Run the local GRPO training loop with checkpoints
//! - `submit`   -- Register with the coordination service and push groups
//! - `rollout`  -- Judge fresh completions from the inference server and
//!                 push the scored groups
//! - `batch`    -- Fetch the next batch from the coordination service

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use grpo_forge::config::PipelineConfig;
use grpo_forge::model::{CoordinatorClient, InferenceClient, PolicyConfig};
use grpo_forge::training::{CandleTrainer, Pipeline, Trainer};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Convert recorded agent trajectories into scored GRPO groups, and train on
/// or submit them.
#[derive(Parser)]
#[command(name = "grpo-forge", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of trajectory JSON files (overrides the config).
    #[arg(long, global = true)]
    trajectories: Option<PathBuf>,

    /// HuggingFace tokenizer.json (overrides the config).
    #[arg(long, global = true)]
    tokenizer: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every trajectory and print messages, tokens, masks and scores.
    Convert {
        /// Thin a surplus of trajectories toward this count via dropout.
        #[arg(long)]
        target: Option<usize>,

        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Extract supervised chat samples from every recorded LLM call.
    Samples {
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Build one scored group from the next window.
    Group {
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run local GRPO training.
    Train {
        /// Override the configured number of optimizer steps.
        #[arg(long)]
        steps: Option<u64>,
    },

    /// Register with the coordination service and submit scored groups.
    Submit {
        /// Number of groups to submit.
        #[arg(long, default_value_t = 1)]
        groups: usize,
    },

    /// Score fresh completions from the inference server and submit them.
    Rollout {
        /// Number of groups to roll out.
        #[arg(long, default_value_t = 1)]
        groups: usize,
    },

    /// Fetch the next batch from the coordination service.
    Batch,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(dir) = cli.trajectories {
        config.data.source_dir = dir;
    }
    if let Some(path) = cli.tokenizer {
        config.model.tokenizer_path = Some(path);
    }

    match cli.command {
        Commands::Convert { target, output } => cmd_convert(config, target, output.as_deref()),
        Commands::Samples { output } => cmd_samples(config, output.as_deref()),
        Commands::Group { output } => cmd_group(config, output.as_deref()),
        Commands::Train { steps } => cmd_train(config, steps),
        Commands::Submit { groups } => cmd_submit(config, groups).await,
        Commands::Rollout { groups } => cmd_rollout(config, groups).await,
        Commands::Batch => cmd_batch(config).await,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_convert(config: PipelineConfig, target: Option<usize>, output: Option<&Path>) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;
    let converted = pipeline
        .convert_all(target)
        .context("Failed to convert trajectories")?;
    write_json(&converted, output)?;
    tracing::info!(count = converted.len(), "Conversion finished");
    Ok(())
}

fn cmd_samples(config: PipelineConfig, output: Option<&Path>) -> Result<()> {
    let pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;
    let samples = pipeline.sft_samples().context("Failed to extract samples")?;
    write_json(&samples, output)
}

fn cmd_group(config: PipelineConfig, output: Option<&Path>) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;
    match pipeline.next_group().context("Failed to build group")? {
        Some(group) => {
            tracing::info!(
                size = group.len(),
                rejected = group.stats.rejected,
                dropped = group.stats.dropped,
                "Built scored group"
            );
            write_json(&group, output)
        }
        None => {
            anyhow::bail!(
                "no window in {} produced a valid group",
                pipeline.config().data.source_dir.display()
            )
        }
    }
}

fn cmd_train(mut config: PipelineConfig, steps: Option<u64>) -> Result<()> {
    if let Some(steps) = steps {
        config.grpo.training_steps = steps;
    }
    let backend = config.model.backend.resolve();
    let grpo = config.grpo.clone();
    let tokenizer_file = config.model.tokenizer_path.clone();
    let mut policy = PolicyConfig {
        vocab_size: config.model.vocab_size,
        hidden_size: config.model.hidden_size,
        num_layers: config.model.num_layers,
    };

    let mut pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;
    let tokenizer = pipeline
        .tokenizer()
        .context("Training needs a tokenizer: pass --tokenizer or set model.tokenizer_path")?;
    policy.vocab_size = policy.vocab_size.max(tokenizer.vocab_size());

    let mut trainer = CandleTrainer::new(backend, policy, &grpo, tokenizer_file)
        .context("Failed to initialize trainer")?;
    let summary = pipeline.train(&mut trainer).context("Training failed")?;

    tracing::info!(
        backend = ?trainer.backend(),
        steps_run = summary.steps_run,
        final_step = summary.final_step,
        mean_loss = summary.mean_loss,
        checkpoints = summary.checkpoints.len(),
        "Training complete"
    );
    Ok(())
}

async fn cmd_submit(config: PipelineConfig, groups: usize) -> Result<()> {
    let coordinator = CoordinatorClient::new(&config.coordinator)?;
    let mut pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;

    let trainer_id = coordinator
        .register(&pipeline.registration())
        .await
        .context("Failed to register with the coordination service")?;
    let sent = pipeline
        .submit(&coordinator, groups)
        .await
        .context("Failed to submit scored groups")?;
    let status = coordinator.get_status().await?;

    tracing::info!(%trainer_id, sent, %status, "Submission finished");
    Ok(())
}

async fn cmd_rollout(config: PipelineConfig, groups: usize) -> Result<()> {
    let coordinator = CoordinatorClient::new(&config.coordinator)?;
    let inference = InferenceClient::new(&config.inference)?;
    let mut pipeline = Pipeline::from_config(config).context("Failed to build pipeline")?;

    let trainer_id = coordinator
        .register(&pipeline.registration())
        .await
        .context("Failed to register with the coordination service")?;
    let sent = pipeline
        .rollout(&inference, &coordinator, groups)
        .await
        .context("Rollout failed")?;

    tracing::info!(
        %trainer_id,
        sent,
        skipped = pipeline.skipped_groups(),
        "Rollout finished"
    );
    Ok(())
}

async fn cmd_batch(config: PipelineConfig) -> Result<()> {
    let coordinator = CoordinatorClient::new(&config.coordinator)?;
    match coordinator
        .get_batch()
        .await
        .context("Failed to fetch a batch")?
    {
        Some(batch) => write_json(&batch, None),
        None => {
            tracing::info!("No batch ready");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Wrote output");
        }
        None => println!("{json}"),
    }
    Ok(())
}
