//! Deltavox CLI
//!
//! Runs one generation and prints the response to stdout. Flags override
//! values from `--config`; logs go to stderr, filtered by `RUST_LOG`.

use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use deltavox::{DeltavoxError, Engine, Result, RuntimeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Quantized transformer inference with an optional delta voice
#[derive(Parser, Debug)]
#[command(name = "deltavox")]
#[command(version, about, long_about = None)]
struct Cli {
    /// GGUF weight file
    #[arg(long, value_name = "PATH")]
    weights: Option<PathBuf>,

    /// Delta archive (.npz with A.npy and B.npy)
    #[arg(long, value_name = "PATH")]
    delta: Option<PathBuf>,

    /// Delta blend strength, clamped to [0, 1]
    #[arg(long)]
    alpha: Option<f32>,

    /// Prompt text (read from stdin if omitted)
    #[arg(long)]
    prompt: Option<String>,

    /// Tokens to generate before the grace window
    #[arg(long = "max", value_name = "N")]
    max_tokens: Option<usize>,

    /// Sampling temperature (0 = deterministic)
    #[arg(long = "temp")]
    temperature: Option<f32>,

    /// Nucleus threshold (1 = top-k)
    #[arg(long)]
    top_p: Option<f32>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// JSON runtime configuration
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Field command script
    #[arg(long, value_name = "PATH")]
    field_script: Option<PathBuf>,

    /// Append each exchange to this JSON-lines file
    #[arg(long, value_name = "PATH")]
    memory_log: Option<PathBuf>,
}

impl Cli {
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_json_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(weights) = &self.weights {
            config.weights_path.clone_from(weights);
        }
        if self.delta.is_some() {
            config.delta_path.clone_from(&self.delta);
        }
        if self.field_script.is_some() {
            config.field_script.clone_from(&self.field_script);
        }
        if self.memory_log.is_some() {
            config.memory_log.clone_from(&self.memory_log);
        }
        config.alpha = self.alpha.unwrap_or(config.alpha);
        config.max_tokens = self.max_tokens.unwrap_or(config.max_tokens);
        config.temperature = self.temperature.unwrap_or(config.temperature);
        config.top_p = self.top_p.unwrap_or(config.top_p);
        config.seed = self.seed.or(config.seed);
        config.validate()
    }

    fn prompt(&self) -> Result<String> {
        if let Some(prompt) = &self.prompt {
            return Ok(prompt.clone());
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|source| DeltavoxError::Io {
                path: PathBuf::from("<stdin>"),
                source,
            })?;
        Ok(buf.trim().to_string())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deltavox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.runtime_config()?;
    let prompt = cli.prompt()?;

    let engine = Engine::new(config)?;
    let output = engine.generate(&prompt)?;
    tracing::info!(
        tokens = output.tokens.len(),
        stop = ?output.stop_reason,
        "done"
    );
    println!("{}", output.text.trim());
    Ok(())
}
