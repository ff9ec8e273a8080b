//! The per-question chain: select pages, assemble their records, synthesize.
//!
//! Modelled as an explicit state machine so every transition is visible in one
//! place. Each run is independent; nothing is cached between questions.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::assembler::assemble;
use crate::completion::CompletionBackend;
use crate::config::AppConfig;
use crate::corpus::CorpusStore;
use crate::error::{CompletionError, MalformedSelectionError, PipelineError};
use crate::models::{AssembledContext, RelevanceSelection};
use crate::selector::RelevanceSelector;
use crate::synthesizer::AnswerSynthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Selecting,
    Assembling,
    Synthesizing,
}

#[derive(Debug)]
enum PipelineState {
    Selecting,
    Assembling(RelevanceSelection),
    Synthesizing {
        selection: RelevanceSelection,
        context: AssembledContext,
    },
    Done(PipelineRun),
    Failed(PipelineError),
}

impl PipelineState {
    fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineState::Selecting => Some(PipelineStage::Selecting),
            PipelineState::Assembling(_) => Some(PipelineStage::Assembling),
            PipelineState::Synthesizing { .. } => Some(PipelineStage::Synthesizing),
            PipelineState::Done(_) | PipelineState::Failed(_) => None,
        }
    }
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::MalformedSelection(_) => PipelineStage::Selecting,
            PipelineError::SynthesisUnavailable(_) => PipelineStage::Synthesizing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub selection: RelevanceSelection,
    pub context: AssembledContext,
    pub answer: String,
    pub latency_ms: u128,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub completion_timeout: Duration,
    pub selection_attempts: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    corpus: Arc<CorpusStore>,
    selector: RelevanceSelector,
    synthesizer: AnswerSynthesizer,
    options: PipelineOptions,
    completion_limit: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        corpus: Arc<CorpusStore>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        let selector = RelevanceSelector::new(
            backend.clone(),
            config.models.selector_model.clone(),
            config.models.selector_temperature,
            config.book_title.clone(),
        );
        let synthesizer = AnswerSynthesizer::new(
            backend,
            config.models.answer_model.clone(),
            config.models.answer_temperature,
            config.models.max_output_tokens,
            config.book_title.clone(),
        );
        let options = PipelineOptions {
            completion_timeout: config.completion.timeout(),
            selection_attempts: config.completion.selection_attempts,
        };

        Self::from_parts(
            corpus,
            selector,
            synthesizer,
            options,
            Arc::new(Semaphore::new(config.completion.max_concurrent)),
        )
    }

    pub fn from_parts(
        corpus: Arc<CorpusStore>,
        selector: RelevanceSelector,
        synthesizer: AnswerSynthesizer,
        options: PipelineOptions,
        completion_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            corpus,
            selector,
            synthesizer,
            options,
            completion_limit,
        }
    }

    pub fn corpus(&self) -> &Arc<CorpusStore> {
        &self.corpus
    }

    pub async fn run(&self, question: &str) -> Result<PipelineRun, PipelineError> {
        let started = Instant::now();
        let mut state = PipelineState::Selecting;

        loop {
            state = match state {
                PipelineState::Done(run) => return Ok(run),
                PipelineState::Failed(err) => {
                    tracing::warn!(stage = ?err.stage(), kind = err.kind(), "pipeline failed: {err}");
                    return Err(err);
                }
                active => {
                    tracing::debug!(stage = ?active.stage(), "pipeline step");
                    self.advance(question, active, started).await
                }
            };
        }
    }

    async fn advance(&self, question: &str, state: PipelineState, started: Instant) -> PipelineState {
        match state {
            PipelineState::Selecting => match self.select_with_retry(question).await {
                Ok(selection) => PipelineState::Assembling(selection),
                Err(err) => PipelineState::Failed(err.into()),
            },
            PipelineState::Assembling(selection) => {
                let context = assemble(&selection, &self.corpus);
                tracing::debug!(
                    chapters = context.chapter_results.len(),
                    pages = context.page_results.len(),
                    "context assembled"
                );
                PipelineState::Synthesizing { selection, context }
            }
            PipelineState::Synthesizing { selection, context } => {
                let answer = self
                    .bounded(self.synthesizer.synthesize(
                        question,
                        &context,
                        self.corpus.book_summary(),
                    ))
                    .await;
                match answer {
                    Ok(answer) => PipelineState::Done(PipelineRun {
                        selection,
                        context,
                        answer,
                        latency_ms: started.elapsed().as_millis(),
                    }),
                    Err(err) => PipelineState::Failed(err.into()),
                }
            }
            terminal => terminal,
        }
    }

    async fn select_with_retry(
        &self,
        question: &str,
    ) -> Result<RelevanceSelection, MalformedSelectionError> {
        let attempts = self.options.selection_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .bounded(self.selector.select(
                    question,
                    self.corpus.chapters(),
                    self.corpus.book_summary(),
                ))
                .await;

            match result {
                Ok(selection) => return Ok(selection),
                Err(err) if attempt < attempts => {
                    tracing::warn!(attempt, attempts, "relevance selection failed, retrying: {err}");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs one completion-backed step under the shared permit pool and the
    /// per-request timeout.
    async fn bounded<T, E>(&self, step: impl Future<Output = Result<T, E>>) -> Result<T, E>
    where
        E: From<CompletionError>,
    {
        let _permit = self
            .completion_limit
            .acquire()
            .await
            .map_err(|_| CompletionError::Network("completion limiter closed".to_string()))?;

        match tokio::time::timeout(self.options.completion_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(self.options.completion_timeout.as_secs()).into()),
        }
    }
}
