use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::completion::{CompletionBackend, CompletionRequest, OutputMode};
use crate::error::MalformedSelectionError;
use crate::models::{ChapterSummaryRecord, RelevanceSelection};
use crate::text::strip_json_fence;

/// Asks the completion model which chapters and pages answer a question.
#[derive(Clone)]
pub struct RelevanceSelector {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    temperature: Option<f32>,
    book_title: String,
}

impl RelevanceSelector {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        temperature: Option<f32>,
        book_title: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature,
            book_title: book_title.into(),
        }
    }

    pub async fn select(
        &self,
        question: &str,
        chapter_summaries: &[ChapterSummaryRecord],
        book_summary: &str,
    ) -> Result<RelevanceSelection, MalformedSelectionError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            system: build_selector_system_prompt(&self.book_title, book_summary, chapter_summaries),
            user: build_selector_user_prompt(question),
            mode: OutputMode::Json,
            temperature: self.temperature,
            max_tokens: None,
        };

        let raw = self.backend.complete(request).await?;
        let selection = parse_selection(&raw)?;
        tracing::debug!(
            pages = ?selection.pages,
            chapters = ?selection.chapters,
            "relevance selection parsed"
        );
        Ok(selection)
    }
}

fn build_selector_system_prompt(
    book_title: &str,
    book_summary: &str,
    chapter_summaries: &[ChapterSummaryRecord],
) -> String {
    let chapters = serde_json::to_string_pretty(chapter_summaries).unwrap_or_default();
    format!(
        "ROLE:\n\
         You locate the pages of the novel {book_title} that a reader should read to answer their question.\n\
         First read the full book summary to understand the main themes, characters and plot.\n\
         Then use the chapter summaries, with their start and end pages, to narrow the search down to specific pages.\n\n\
         FULL BOOK SUMMARY:\n{book_summary}\n\n\
         CHAPTER SUMMARIES:\n{chapters}\n\n\
         RESPONSE:\n\
         Respond with a single JSON object and nothing else.\n\
         It must have a \"chapters\" field and a \"pages\" field, each a list of specific integers.\n\
         Never give a range such as \"12-15\"; list every page number explicitly. Do not add prose.\n\
         Example response: {{\"chapters\": [1], \"pages\": [1, 2, 3, 4, 5]}}"
    )
}

fn build_selector_user_prompt(question: &str) -> String {
    format!(
        "Which pages would help answer the following question from a reader?\n{question}"
    )
}

/// Validates a selector reply against the `{"chapters": [...], "pages": [...]}` shape.
pub fn parse_selection(raw: &str) -> Result<RelevanceSelection, MalformedSelectionError> {
    let text = strip_json_fence(raw);
    let value: Value = serde_json::from_str(&text)
        .map_err(|_| MalformedSelectionError::NotAnObject(preview(&text)))?;
    let Value::Object(object) = value else {
        return Err(MalformedSelectionError::NotAnObject(preview(&text)));
    };

    let pages = match object.get("pages") {
        None | Some(Value::Null) => return Err(MalformedSelectionError::MissingPages),
        Some(value) => parse_id_list("pages", value)?,
    };
    let chapters = match object.get("chapters") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(value) => parse_id_list("chapters", value)?,
    };

    Ok(RelevanceSelection { pages, chapters })
}

fn parse_id_list(
    field: &'static str,
    value: &Value,
) -> Result<BTreeSet<u32>, MalformedSelectionError> {
    let Value::Array(items) = value else {
        return Err(entry_error(field, value));
    };

    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| entry_error(field, item))
        })
        .collect()
}

fn entry_error(field: &'static str, value: &Value) -> MalformedSelectionError {
    match value {
        Value::String(text) if is_range_notation(text) => MalformedSelectionError::RangeNotation {
            field,
            value: text.clone(),
        },
        other => MalformedSelectionError::InvalidEntry {
            field,
            value: other.to_string(),
        },
    }
}

fn is_range_notation(text: &str) -> bool {
    static RANGE: OnceLock<Option<Regex>> = OnceLock::new();
    RANGE
        .get_or_init(|| Regex::new(r"(?i)^\s*\d+\s*(-|–|—|\.\.|to|through)\s*\d+\s*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 120;
    let mut out: String = text.chars().take(MAX_CHARS).collect();
    if text.chars().count() > MAX_CHARS {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::ScriptedBackend;
    use crate::corpus::fixtures::{chapter, BOOK_SUMMARY};
    use crate::error::CompletionError;

    #[test]
    fn parses_pages_and_chapters() {
        let selection = parse_selection(r#"{"chapters":[39],"pages":[179, 180, 179]}"#).unwrap();
        assert_eq!(selection.chapters, BTreeSet::from([39]));
        assert_eq!(selection.pages, BTreeSet::from([179, 180]));
    }

    #[test]
    fn chapters_default_to_empty() {
        let selection = parse_selection(r#"{"pages":[12]}"#).unwrap();
        assert!(selection.chapters.is_empty());
        assert_eq!(selection.pages, BTreeSet::from([12]));
    }

    #[test]
    fn empty_pages_is_a_valid_selection() {
        let selection = parse_selection(r#"{"chapters":[],"pages":[]}"#).unwrap();
        assert!(selection.pages.is_empty());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let selection = parse_selection("```json\n{\"pages\":[7]}\n```").unwrap();
        assert_eq!(selection.pages, BTreeSet::from([7]));
    }

    #[test]
    fn missing_pages_is_malformed() {
        let err = parse_selection(r#"{"chapters":[3]}"#).unwrap_err();
        assert!(matches!(err, MalformedSelectionError::MissingPages));
    }

    #[test]
    fn prose_is_malformed() {
        let err = parse_selection("chapters: [1]\npages: [1, 2, 3]").unwrap_err();
        assert!(matches!(err, MalformedSelectionError::NotAnObject(_)));

        let err = parse_selection("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, MalformedSelectionError::NotAnObject(_)));
    }

    #[test]
    fn range_entries_are_rejected() {
        let err = parse_selection(r#"{"pages":[10, "12-15"]}"#).unwrap_err();
        match err {
            MalformedSelectionError::RangeNotation { field, value } => {
                assert_eq!(field, "pages");
                assert_eq!(value, "12-15");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse_selection(r#"{"pages":"100 to 104"}"#).unwrap_err();
        assert!(matches!(err, MalformedSelectionError::RangeNotation { .. }));
    }

    #[test]
    fn non_integer_entries_are_rejected() {
        for raw in [
            r#"{"pages":[1.5]}"#,
            r#"{"pages":[-3]}"#,
            r#"{"pages":["twelve"]}"#,
            r#"{"pages":[1],"chapters":[{"n":2}]}"#,
        ] {
            let err = parse_selection(raw).unwrap_err();
            assert!(
                matches!(err, MalformedSelectionError::InvalidEntry { .. }),
                "{raw} gave {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn select_sends_json_request_with_standing_context() {
        let backend = Arc::new(ScriptedBackend::replying(&[r#"{"chapters":[39],"pages":[179]}"#]));
        let selector =
            RelevanceSelector::new(backend.clone(), "gpt-4o-mini", None, "Ace of Spades");
        let chapters = vec![chapter(39, "Chiamaka", 344, 347)];

        let selection = selector
            .select("Who is Chiamaka?", &chapters, BOOK_SUMMARY)
            .await
            .unwrap();
        assert_eq!(selection.pages, BTreeSet::from([179]));

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].mode, OutputMode::Json);
        assert_eq!(requests[0].model, "gpt-4o-mini");
        assert!(requests[0].system.contains(BOOK_SUMMARY));
        assert!(requests[0].system.contains("\"chapter_name\": \"Chiamaka\""));
        assert!(requests[0].user.contains("Who is Chiamaka?"));
    }

    #[tokio::test]
    async fn transport_failure_is_reported_as_selection_failure() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(CompletionError::RateLimited)]));
        let selector = RelevanceSelector::new(backend, "gpt-4o-mini", None, "Ace of Spades");

        let err = selector.select("Who is Devon?", &[], BOOK_SUMMARY).await.unwrap_err();
        assert!(matches!(
            err,
            MalformedSelectionError::Unavailable(CompletionError::RateLimited)
        ));
    }
}
