use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    ChapterSummary,
    Page,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::ChapterSummary => "chapter_summary",
            RecordType::Page => "page",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterSummaryRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub chapter_number: u32,
    pub chapter_name: String,
    pub start_page: u32,
    pub end_page: u32,
    pub content: Vec<String>,
}

/// Page records label their chapter either numerically or with the heading
/// text printed in the book ("CHAPTER 19").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChapterLabel {
    Number(u32),
    Text(String),
}

impl fmt::Display for ChapterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterLabel::Number(n) => write!(f, "{n}"),
            ChapterLabel::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub page_number: u32,
    pub chapter_number: ChapterLabel,
    pub chapter_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelevanceSelection {
    pub pages: BTreeSet<u32>,
    #[serde(default)]
    pub chapters: BTreeSet<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssembledContext {
    pub chapter_results: Vec<ChapterSummaryRecord>,
    pub page_results: Vec<PageRecord>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.chapter_results.is_empty() && self.page_results.is_empty()
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        let chapters = self.chapter_results.iter().map(|record| SourceRef {
            kind: RecordType::ChapterSummary,
            number: record.chapter_number,
            chapter_name: record.chapter_name.clone(),
        });
        let pages = self.page_results.iter().map(|record| SourceRef {
            kind: RecordType::Page,
            number: record.page_number,
            chapter_name: record.chapter_name.clone(),
        });
        chapters.chain(pages).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A record the answer was grounded on, for citation links in the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub kind: RecordType,
    pub number: u32,
    pub chapter_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub answer_markdown: String,
    pub selection: RelevanceSelection,
    pub sources: Vec<SourceRef>,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub chapters_hash: String,
    pub pages_hash: String,
    pub summary_hash: String,
    pub chapter_count: usize,
    pub page_count: usize,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: Option<String>,
    pub reset: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}
