use anyhow::{Context, Result};
use std::sync::Arc;

use crate::chunker::{self, TokenEncoding};
use crate::config::Settings;
use crate::dispatch::{Dispatcher, RequestTemplate, ResultSet};
use crate::io::{self, RunLog, chunk_count_line};
use crate::llm::CompletionBackend;
use crate::render::RunSummary;
use crate::retry::RetryPolicy;

/// Knobs that shape how a run reports itself, not what it computes.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Print `N chunks.` and draw the progress bar.
    pub interactive: bool,
    pub policy: RetryPolicy,
    /// Worker count; `None` uses one per available core.
    pub workers: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { interactive: true, policy: RetryPolicy::default(), workers: None }
    }
}

/// Chunk the input with the encoding registered for `settings.model` and run it.
pub async fn process_chunks(
    settings: &Settings,
    backend: Arc<dyn CompletionBackend>,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let encoding = chunker::encoding_for_model(&settings.model)?;
    process_with_encoding(settings, &encoding, backend, opts).await
}

pub async fn process_with_encoding<E: TokenEncoding + ?Sized>(
    settings: &Settings,
    encoding: &E,
    backend: Arc<dyn CompletionBackend>,
    opts: &RunOptions,
) -> Result<RunSummary> {
    io::initialize_files(&settings.output, &settings.log).await?;

    let text = io::load_text(&settings.input).await?;
    let chunks = chunker::split_with_encoding(encoding, &text, settings.chunk_size)
        .with_context(|| format!("splitting {} into chunks", settings.input.display()))?;
    let total = chunks.len();
    if opts.interactive {
        println!("{} chunks.", total);
    }
    tracing::info!(chunks = total, model = %settings.model, "dispatching chunks");

    let mut log = RunLog::open(&settings.log).await?;
    log.append(&chunk_count_line(total)).await?;

    let template = RequestTemplate {
        model: settings.model.clone(),
        prompt: settings.prompt.clone(),
        max_tokens: settings.max_tokens,
        temperature: settings.temperature,
    };
    let mut dispatcher = Dispatcher::new(backend, template)
        .with_policy(opts.policy)
        .with_progress(opts.interactive);
    if let Some(w) = opts.workers {
        dispatcher = dispatcher.with_workers(w);
    }
    let outcomes = dispatcher.dispatch(&chunks, &mut log).await?;

    let results = ResultSet::from_outcomes(outcomes, settings.order);
    io::save_to_file(&results.responses, &settings.output).await?;

    if results.failed > 0 {
        tracing::warn!(failed = results.failed, total, "some chunks produced no output");
    }
    tracing::info!(succeeded = results.responses.len(), total, "run complete");

    Ok(RunSummary {
        model: settings.model.clone(),
        chunks: total,
        succeeded: results.responses.len(),
        failed: results.failed,
        output: settings.output.clone(),
        log: settings.log.clone(),
    })
}
