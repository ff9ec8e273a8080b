//! Error taxonomy for corpus loading and the per-turn pipeline.
//!
//! Corpus errors are fatal at start-up. Selection and synthesis errors abort a
//! single turn and leave the conversation history untouched.

use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the completion capability.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("completion request timed out after {0}s")]
    Timeout(u64),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("rate limited by completion provider")]
    RateLimited,

    #[error("completion provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("completion rejected by content policy: {0}")]
    Rejected(String),

    #[error("failed to decode completion response: {0}")]
    Decode(String),

    #[error("completion provider returned an empty reply")]
    Empty,
}

#[derive(Debug, Error)]
pub enum CorpusLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate {field} {value} in {path}")]
    DuplicateKey {
        path: PathBuf,
        field: &'static str,
        value: u32,
    },

    #[error("book summary at {0} is empty")]
    EmptySummary(PathBuf),
}

/// The relevance selector's reply did not fit the `{"chapters": [...], "pages": [...]}`
/// contract, or the selection request never produced a reply.
#[derive(Debug, Clone, Error)]
pub enum MalformedSelectionError {
    #[error("selection request failed: {0}")]
    Unavailable(#[from] CompletionError),

    #[error("selection reply is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("selection reply has no `pages` list")]
    MissingPages,

    #[error("`{field}` entry {value} is not a non-negative integer")]
    InvalidEntry { field: &'static str, value: String },

    #[error("`{field}` entry {value} is a range, expected explicit integers")]
    RangeNotation { field: &'static str, value: String },
}

#[derive(Debug, Clone, Error)]
#[error("answer synthesis unavailable: {0}")]
pub struct SynthesisUnavailableError(#[from] pub CompletionError);

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    MalformedSelection(#[from] MalformedSelectionError),

    #[error(transparent)]
    SynthesisUnavailable(#[from] SynthesisUnavailableError),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedSelection(_) => "malformed_selection",
            PipelineError::SynthesisUnavailable(_) => "synthesis_unavailable",
        }
    }

    /// Message shown to the reader in place of an answer for the failed turn.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::MalformedSelection(_) => {
                "I couldn't work out which pages to read for that question. Please try again."
            }
            PipelineError::SynthesisUnavailable(_) => {
                "The answer service is unavailable right now. Please try again in a moment."
            }
        }
    }
}
