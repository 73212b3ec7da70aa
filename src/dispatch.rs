use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

use crate::chunker::Chunk;
use crate::io::{FileError, RunLog, outcome_line};
use crate::llm::{CompletionBackend, CompletionRequest, complete_chunk};
use crate::retry::RetryPolicy;

/// What one chunk produced. `response` is `None` when the call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub index: usize,
    pub response: Option<String>,
}

impl ChunkOutcome {
    pub fn succeeded(&self) -> bool {
        self.response.is_some()
    }
}

/// Request parameters shared by every chunk of a run.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl RequestTemplate {
    pub fn for_chunk(&self, chunk: &Chunk) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            chunk: chunk.text.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Receives outcomes one at a time, in completion order, from the aggregator.
#[async_trait]
pub trait OutcomeSink: Send {
    async fn record(&mut self, outcome: &ChunkOutcome) -> Result<(), FileError>;
}

#[async_trait]
impl OutcomeSink for RunLog {
    async fn record(&mut self, outcome: &ChunkOutcome) -> Result<(), FileError> {
        self.append(&outcome_line(outcome.index, outcome.succeeded())).await
    }
}

#[async_trait]
impl OutcomeSink for Vec<ChunkOutcome> {
    async fn record(&mut self, outcome: &ChunkOutcome) -> Result<(), FileError> {
        self.push(outcome.clone());
        Ok(())
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

pub struct Dispatcher {
    backend: Arc<dyn CompletionBackend>,
    template: RequestTemplate,
    policy: RetryPolicy,
    workers: usize,
    progress: bool,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn CompletionBackend>, template: RequestTemplate) -> Self {
        Self {
            backend,
            template,
            policy: RetryPolicy::default(),
            workers: default_workers(),
            progress: true,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Send every chunk to the backend and gather outcomes as they arrive.
    ///
    /// Each chunk runs as its own task; at most `workers` are calling the
    /// backend at once. Tasks only send `(index, outcome)` over a channel, so
    /// the sink and the returned vector are touched by this task alone. The
    /// returned outcomes are in completion order.
    pub async fn dispatch<S: OutcomeSink + ?Sized>(
        &self,
        chunks: &[Chunk],
        sink: &mut S,
    ) -> Result<Vec<ChunkOutcome>, FileError> {
        let total = chunks.len();
        let (tx, mut rx) = mpsc::channel::<ChunkOutcome>(total.max(1));
        let permits = Arc::new(Semaphore::new(self.workers));

        for chunk in chunks {
            let tx = tx.clone();
            let permits = Arc::clone(&permits);
            let backend = Arc::clone(&self.backend);
            let policy = self.policy;
            let req = self.template.for_chunk(chunk);
            let index = chunk.index;
            tokio::spawn(async move {
                let response = match permits.acquire_owned().await {
                    Ok(_permit) => complete_chunk(backend.as_ref(), &req, &policy).await,
                    Err(_) => None,
                };
                let _ = tx.send(ChunkOutcome { index, response }).await;
            });
        }
        drop(tx);

        let bar = self.progress_bar(total);
        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            sink.record(&outcome).await?;
            bar.inc(1);
            tracing::debug!(
                chunk = outcome.index,
                ok = outcome.succeeded(),
                done = outcomes.len() + 1,
                total,
                "chunk finished"
            );
            outcomes.push(outcome);
        }
        bar.finish_and_clear();

        if outcomes.len() != total {
            // A task panicked before reporting; count it as a failed chunk.
            let mut seen = vec![false; total];
            for o in &outcomes {
                if let Some(slot) = seen.get_mut(o.index) {
                    *slot = true;
                }
            }
            for chunk in chunks {
                if !seen.get(chunk.index).copied().unwrap_or(true) {
                    tracing::error!(chunk = chunk.index, "worker exited without a result");
                    let outcome = ChunkOutcome { index: chunk.index, response: None };
                    sink.record(&outcome).await?;
                    outcomes.push(outcome);
                }
            }
        }
        Ok(outcomes)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template("Processing chunks {bar:40} {pos}/{len} [{elapsed}]") {
            bar.set_style(style);
        }
        bar
    }
}

/// Order in which successful responses are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputOrder {
    /// As completions arrive.
    #[default]
    Arrival,
    /// By chunk index.
    Chunk,
}

/// The successful responses of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultSet {
    pub responses: Vec<String>,
    pub failed: usize,
}

impl ResultSet {
    pub fn from_outcomes(mut outcomes: Vec<ChunkOutcome>, order: OutputOrder) -> Self {
        if order == OutputOrder::Chunk {
            outcomes.sort_by_key(|o| o.index);
        }
        let mut set = ResultSet::default();
        for o in outcomes {
            match o.response {
                Some(text) => set.responses.push(text),
                None => set.failed += 1,
            }
        }
        set
    }
}
