use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::CorpusPaths;
use crate::error::CorpusLoadError;
use crate::models::{ChapterSummaryRecord, CorpusManifest, PageRecord};

/// Read-only snapshot of the pre-built book corpus.
///
/// Records keep the order of their source files; that order is what the
/// context assembler iterates in.
#[derive(Debug, Clone)]
pub struct CorpusStore {
    chapters: Vec<ChapterSummaryRecord>,
    pages: Vec<PageRecord>,
    book_summary: String,
    chapter_index: HashMap<u32, usize>,
    page_index: HashMap<u32, usize>,
    manifest: CorpusManifest,
}

impl CorpusStore {
    pub async fn load(paths: &CorpusPaths) -> Result<Self, CorpusLoadError> {
        let chapter_bytes = read_source(&paths.chapter_metadata).await?;
        let page_bytes = read_source(&paths.page_metadata).await?;
        let summary_bytes = read_source(&paths.book_summary).await?;

        let chapters: Vec<ChapterSummaryRecord> =
            parse_records(&paths.chapter_metadata, &chapter_bytes)?;
        let pages: Vec<PageRecord> = parse_records(&paths.page_metadata, &page_bytes)?;
        let book_summary = String::from_utf8_lossy(&summary_bytes).trim().to_string();

        let mut store = Self::build(chapters, pages, book_summary, paths)?;
        store.manifest.chapters_hash = sha256_hex(&chapter_bytes);
        store.manifest.pages_hash = sha256_hex(&page_bytes);
        store.manifest.summary_hash = sha256_hex(&summary_bytes);

        tracing::info!(
            chapters = store.chapters.len(),
            pages = store.pages.len(),
            summary_chars = store.book_summary.len(),
            "loaded book corpus"
        );
        Ok(store)
    }

    /// Builds a store from records already in memory.
    pub fn from_records(
        chapters: Vec<ChapterSummaryRecord>,
        pages: Vec<PageRecord>,
        book_summary: impl Into<String>,
    ) -> Result<Self, CorpusLoadError> {
        let paths = CorpusPaths {
            chapter_metadata: PathBuf::from("<chapters>"),
            page_metadata: PathBuf::from("<pages>"),
            book_summary: PathBuf::from("<summary>"),
        };
        Self::build(chapters, pages, book_summary.into(), &paths)
    }

    fn build(
        chapters: Vec<ChapterSummaryRecord>,
        pages: Vec<PageRecord>,
        book_summary: String,
        paths: &CorpusPaths,
    ) -> Result<Self, CorpusLoadError> {
        if book_summary.trim().is_empty() {
            return Err(CorpusLoadError::EmptySummary(paths.book_summary.clone()));
        }

        let chapter_index = unique_index(
            chapters.iter().map(|c| c.chapter_number),
            &paths.chapter_metadata,
            "chapter_number",
        )?;
        let page_index = unique_index(
            pages.iter().map(|p| p.page_number),
            &paths.page_metadata,
            "page_number",
        )?;

        let manifest = CorpusManifest {
            chapters_hash: String::new(),
            pages_hash: String::new(),
            summary_hash: String::new(),
            chapter_count: chapters.len(),
            page_count: pages.len(),
            loaded_at: Utc::now(),
        };

        Ok(Self {
            chapters,
            pages,
            book_summary,
            chapter_index,
            page_index,
            manifest,
        })
    }

    pub fn chapters(&self) -> &[ChapterSummaryRecord] {
        &self.chapters
    }

    pub fn pages(&self) -> &[PageRecord] {
        &self.pages
    }

    pub fn book_summary(&self) -> &str {
        &self.book_summary
    }

    pub fn manifest(&self) -> &CorpusManifest {
        &self.manifest
    }

    pub fn chapter(&self, chapter_number: u32) -> Option<&ChapterSummaryRecord> {
        self.chapter_index
            .get(&chapter_number)
            .map(|&idx| &self.chapters[idx])
    }

    pub fn page(&self, page_number: u32) -> Option<&PageRecord> {
        self.page_index
            .get(&page_number)
            .map(|&idx| &self.pages[idx])
    }
}

async fn read_source(path: &Path) -> Result<Vec<u8>, CorpusLoadError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| CorpusLoadError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_records<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<Vec<T>, CorpusLoadError> {
    serde_json::from_slice(bytes).map_err(|source| CorpusLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn unique_index(
    keys: impl Iterator<Item = u32>,
    path: &Path,
    field: &'static str,
) -> Result<HashMap<u32, usize>, CorpusLoadError> {
    let mut index = HashMap::new();
    for (position, key) in keys.enumerate() {
        if index.insert(key, position).is_some() {
            return Err(CorpusLoadError::DuplicateKey {
                path: path.to_path_buf(),
                field,
                value: key,
            });
        }
    }
    Ok(index)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::{ChapterLabel, ChapterSummaryRecord, PageRecord, RecordType};

    pub fn chapter(number: u32, name: &str, start_page: u32, end_page: u32) -> ChapterSummaryRecord {
        ChapterSummaryRecord {
            record_type: RecordType::ChapterSummary,
            chapter_number: number,
            chapter_name: name.to_string(),
            start_page,
            end_page,
            content: vec![format!("{name} summary sentence.")],
        }
    }

    pub fn page(number: u32, chapter: &str, content: &str) -> PageRecord {
        PageRecord {
            record_type: RecordType::Page,
            page_number: number,
            chapter_number: ChapterLabel::Text(chapter.to_string()),
            chapter_name: format!("Part Two: X Marks the Spot - {chapter}"),
            content: content.to_string(),
        }
    }

    pub const BOOK_SUMMARY: &str =
        "Two Black students at Niveus Private Academy are targeted by an anonymous texter, Aces.";
}

#[cfg(test)]
mod tests {
    use super::fixtures::{chapter, page, BOOK_SUMMARY};
    use super::*;

    fn temp_corpus_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("book-companion-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn paths_in(dir: &Path) -> CorpusPaths {
        CorpusPaths {
            chapter_metadata: dir.join("chapters.json"),
            page_metadata: dir.join("pages.json"),
            book_summary: dir.join("summary.txt"),
        }
    }

    #[tokio::test]
    async fn loads_records_in_file_order() {
        let dir = temp_corpus_dir();
        let paths = paths_in(&dir);
        let chapters = vec![chapter(39, "Chiamaka", 344, 347), chapter(1, "Devon", 1, 9)];
        let pages = vec![page(179, "CHAPTER 19", "I'm lost."), page(2, "CHAPTER 1", "Dre.")];
        std::fs::write(&paths.chapter_metadata, serde_json::to_vec(&chapters).unwrap()).unwrap();
        std::fs::write(&paths.page_metadata, serde_json::to_vec(&pages).unwrap()).unwrap();
        std::fs::write(&paths.book_summary, format!("  {BOOK_SUMMARY}\n")).unwrap();

        let store = CorpusStore::load(&paths).await.expect("corpus loads");
        assert_eq!(store.chapters()[0].chapter_number, 39);
        assert_eq!(store.pages()[1].page_number, 2);
        assert_eq!(store.book_summary(), BOOK_SUMMARY);
        assert_eq!(store.page(179).map(|p| p.content.as_str()), Some("I'm lost."));
        assert_eq!(store.manifest().page_count, 2);
        assert_eq!(store.manifest().pages_hash.len(), 64);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn missing_source_is_fatal() {
        let dir = temp_corpus_dir();
        let paths = paths_in(&dir);

        let err = CorpusStore::load(&paths).await.expect_err("nothing on disk");
        assert!(matches!(err, CorpusLoadError::Read { .. }));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn corrupt_source_is_fatal() {
        let dir = temp_corpus_dir();
        let paths = paths_in(&dir);
        std::fs::write(&paths.chapter_metadata, b"{not json").unwrap();
        std::fs::write(&paths.page_metadata, b"[]").unwrap();
        std::fs::write(&paths.book_summary, BOOK_SUMMARY).unwrap();

        let err = CorpusStore::load(&paths).await.expect_err("corrupt chapters");
        assert!(matches!(err, CorpusLoadError::Parse { .. }));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn duplicate_page_numbers_are_rejected() {
        let err = CorpusStore::from_records(
            vec![],
            vec![page(5, "CHAPTER 1", "a"), page(5, "CHAPTER 1", "b")],
            BOOK_SUMMARY,
        )
        .expect_err("duplicate page");
        assert!(matches!(
            err,
            CorpusLoadError::DuplicateKey {
                field: "page_number",
                value: 5,
                ..
            }
        ));
    }

    #[test]
    fn empty_summary_is_rejected() {
        let err = CorpusStore::from_records(vec![], vec![], "   ").expect_err("empty summary");
        assert!(matches!(err, CorpusLoadError::EmptySummary(_)));
    }
}
