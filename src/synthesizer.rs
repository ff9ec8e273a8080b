use std::sync::Arc;

use crate::completion::{CompletionBackend, CompletionRequest, OutputMode};
use crate::error::{CompletionError, SynthesisUnavailableError};
use crate::models::AssembledContext;
use crate::text::strip_code_fence;

const CHAPTER_SUMMARY_SHAPE: &str = r#"{
  "type": "chapter_summary",
  "chapter_number": 39,
  "chapter_name": "Chiamaka",
  "start_page": 344,
  "end_page": 347,
  "content": [
    "Chiamaka and Devon arrive at the back entrance of the school wearing masks.",
    "They plan to meet journalist Ms. Donovan and her crew in Morgan Library.",
    "Chiamaka retrieves a 1965 yearbook as proof for later.",
    "Terrell apologizes and reveals he helped the school spy on Devon."
  ]
}"#;

const PAGE_SHAPE: &str = r#"{
  "type": "page",
  "page_number": 179,
  "chapter_number": "CHAPTER 19",
  "chapter_name": "Part Two: X Marks the Spot - CHAPTER 19",
  "content": "I'm lost. Reason being, I decided to listen to Chiamaka Adebayo. After detention on Friday she forced her number into my phone, and then sent me a message this morning to meet her in lab 201 ..."
}"#;

const NO_PAGE_SUPPORT_NOTE: &str = "No specific pages were found for this question. \
     Answer from the book summary alone and say plainly that the answer is not backed by page-level quotes.";

/// Writes the final answer from the assembled context and the book summary.
#[derive(Clone)]
pub struct AnswerSynthesizer {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    book_title: String,
}

impl AnswerSynthesizer {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        temperature: f32,
        max_output_tokens: u32,
        book_title: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature,
            max_output_tokens,
            book_title: book_title.into(),
        }
    }

    pub async fn synthesize(
        &self,
        question: &str,
        context: &AssembledContext,
        book_summary: &str,
    ) -> Result<String, SynthesisUnavailableError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            system: build_answer_system_prompt(&self.book_title, book_summary),
            user: build_answer_user_prompt(question, context),
            mode: OutputMode::Text,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_output_tokens),
        };

        let reply = self.backend.complete(request).await?;
        let answer = strip_code_fence(&reply);
        if answer.is_empty() {
            return Err(CompletionError::Empty.into());
        }
        Ok(answer)
    }
}

fn build_answer_system_prompt(book_title: &str, book_summary: &str) -> String {
    format!(
        "ROLE:\n\
         You answer a reader's question about the novel {book_title}.\n\
         Give enough specific examples, with chapter and page references, that the reader can turn to those pages \
         and see the context of your answer for themselves.\n\n\
         CONTEXT:\n\
         You are given a summary of the whole book to orient you, and a detailed context holding the chapter summaries \
         and full page texts most relevant to the question. Use the summary to understand the question and to find \
         supporting facts in the detailed context, and support your answer with the detailed context.\n\n\
         Chapter summaries in the context look like this. Each gives the chapter number, name, start page and end page; \
         use them to place events in the book:\n{CHAPTER_SUMMARY_SHAPE}\n\n\
         Full page texts in the context look like this. Use them for details and direct quotes:\n{PAGE_SHAPE}\n\n\
         RESPONSE:\n\
         Give a concise, direct answer to the question.\n\
         Support it with direct quotes and cite the chapter and page each one comes from.\n\
         Do not invent quotes or page numbers that are not in the context.\n\n\
         SUMMARY OF {book_title}:\n{book_summary}"
    )
}

fn build_answer_user_prompt(question: &str, context: &AssembledContext) -> String {
    let serialized = serde_json::to_string_pretty(context).unwrap_or_default();
    let mut prompt = format!(
        "Detailed context - chapter summaries and full text pages:\n{serialized}\n\n"
    );
    if context.page_results.is_empty() {
        prompt.push_str(NO_PAGE_SUPPORT_NOTE);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Reader question: {question}"));
    prompt
}
