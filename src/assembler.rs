use crate::corpus::CorpusStore;
use crate::models::{AssembledContext, RelevanceSelection};

/// Expands a selection into the matching corpus records.
///
/// Exact-match membership only. Identifiers missing from the store are dropped,
/// and output order is the store's order rather than the selection's.
pub fn assemble(selection: &RelevanceSelection, store: &CorpusStore) -> AssembledContext {
    let chapter_results = store
        .chapters()
        .iter()
        .filter(|record| selection.chapters.contains(&record.chapter_number))
        .cloned()
        .collect();

    let page_results = store
        .pages()
        .iter()
        .filter(|record| selection.pages.contains(&record.page_number))
        .cloned()
        .collect();

    AssembledContext {
        chapter_results,
        page_results,
    }
}
