use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use chunk_relay::chunker::ChunkError;
use chunk_relay::config::{self, CliOverrides, ConfigError};
use chunk_relay::io::FileError;
use chunk_relay::llm::OpenAiClient;
use chunk_relay::pipeline::{self, RunOptions};
use chunk_relay::render;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "chunk-relay",
    version,
    about = "Process text using the OpenAI API, one token-bounded chunk at a time",
    long_about = None
)]
struct Cli {
    /// Input file path
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output file path
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Log file path
    #[arg(short = 'l', long = "log")]
    log: PathBuf,

    /// Model to use [default: gpt-3.5-turbo-0301]
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Maximum tokens per chunk [default: 500]
    #[arg(short = 'c', long = "chunksize", value_parser = clap::value_parser!(u64).range(1..))]
    chunksize: Option<u64>,

    /// Maximum tokens per API call [default: 200]
    #[arg(short = 't', long = "tokens")]
    tokens: Option<u32>,

    /// Variability (temperature) for the model [default: 0.5]
    #[arg(short = 'v', long = "temperature")]
    temperature: Option<f32>,

    /// System prompt sent with every chunk
    #[arg(short = 'p', long = "prompt")]
    prompt: String,

    /// Write responses in chunk order instead of arrival order
    #[arg(long = "preserve-order")]
    preserve_order: bool,

    /// Config file (TOML) with default settings
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Timeout (seconds) for each API request
    #[arg(long = "timeout")]
    timeout_secs: Option<u64>,

    /// Output JSON instead of human-readable text
    #[arg(long = "json")]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            input: self.input.clone(),
            output: self.output.clone(),
            log: self.log.clone(),
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            chunk_size: self.chunksize.map(|c| c as usize),
            max_tokens: self.tokens,
            temperature: self.temperature,
            timeout_secs: self.timeout_secs,
            preserve_order: self.preserve_order,
            config_path: self.config.clone(),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let settings = config::load_settings(cli.overrides())?;
    tracing::debug!(?settings, "resolved settings");
    let client = OpenAiClient::new(settings.api_key.clone(), settings.api_base.clone(), settings.timeout)?;
    let opts = RunOptions { interactive: !cli.json, ..RunOptions::default() };
    let summary = pipeline::process_chunks(&settings, Arc::new(client), &opts).await?;
    render::render_summary(&summary, cli.json);
    Ok(())
}

fn classify_error(e: &anyhow::Error) -> (&'static str, Option<&'static str>) {
    if let Some(c) = e.downcast_ref::<ConfigError>() {
        return match c {
            ConfigError::MissingApiKey => ("missing_api_key", Some("set OPENAI_KEY in env or .env")),
            _ => ("config_error", None),
        };
    }
    if let Some(ChunkError::UnsupportedModel(_)) = e.downcast_ref::<ChunkError>() {
        return ("unsupported_model", Some("pass a model known to tiktoken with --model"));
    }
    if e.chain().any(|c| c.downcast_ref::<ChunkError>().is_some()) {
        return ("chunking_failed", None);
    }
    if e.downcast_ref::<FileError>().is_some() {
        return ("file_error", Some("check the input, output and log paths"));
    }
    ("unknown", None)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        tracing::error!("{e:#}");
        if cli.json {
            let (code, hint) = classify_error(&e);
            render::print_json_error(code, &format!("{e:#}"), hint);
        }
        std::process::exit(1);
    }
}
