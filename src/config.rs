use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    OpenAi,
    Ollama,
}

impl BackendKind {
    fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => BackendKind::Ollama,
            _ => BackendKind::OpenAi,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CorpusPaths {
    pub chapter_metadata: PathBuf,
    pub page_metadata: PathBuf,
    pub book_summary: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub selector_model: String,
    pub answer_model: String,
    pub selector_temperature: Option<f32>,
    pub answer_temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct CompletionConfig {
    pub backend: BackendKind,
    pub openai_base_url: String,
    pub openai_api_key: String,
    pub ollama_base_url: String,
    pub timeout_secs: u64,
    pub selection_attempts: usize,
    pub max_concurrent: usize,
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub idle_ttl_secs: u64,
    pub max_live: usize,
}

impl SessionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 1_800,
            max_live: 1_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub book_title: String,
    pub corpus: CorpusPaths,
    pub models: ModelConfig,
    pub completion: CompletionConfig,
    pub sessions: SessionConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("BOOK_COMPANION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let corpus = CorpusPaths {
            chapter_metadata: env::var("CHAPTER_METADATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("book_vector_metadata_chapters.json")),
            page_metadata: env::var("PAGE_METADATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("book_vector_metadata_pages.json")),
            book_summary: env::var("BOOK_SUMMARY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("entire_book_summary.txt")),
        };

        Self {
            bind_addr: env::var("BOOK_COMPANION_BIND")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            book_title: env::var("BOOK_COMPANION_BOOK_TITLE")
                .unwrap_or_else(|_| "Ace of Spades".to_string()),
            data_dir,
            corpus,
            models: ModelConfig {
                selector_model: env::var("SELECTOR_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                answer_model: env::var("ANSWER_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
                selector_temperature: parsed_env("SELECTOR_TEMPERATURE"),
                answer_temperature: parsed_env("ANSWER_TEMPERATURE").unwrap_or(0.7),
                max_output_tokens: parsed_env("MAX_OUTPUT_TOKENS").unwrap_or(1_200),
            },
            completion: CompletionConfig {
                backend: BackendKind::from_env_value(
                    &env::var("COMPLETION_BACKEND").unwrap_or_default(),
                ),
                openai_base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                ollama_base_url: env::var("OLLAMA_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
                timeout_secs: parsed_env("COMPLETION_TIMEOUT_SECS").unwrap_or(120),
                selection_attempts: parsed_env::<usize>("SELECTION_ATTEMPTS")
                    .unwrap_or(2)
                    .max(1),
                max_concurrent: parsed_env::<usize>("MAX_CONCURRENT_COMPLETIONS")
                    .unwrap_or(4)
                    .max(1),
            },
            sessions: SessionConfig {
                idle_ttl_secs: parsed_env::<u64>("SESSION_IDLE_TTL_SECS")
                    .unwrap_or(1_800)
                    .max(1),
                max_live: parsed_env::<usize>("MAX_LIVE_SESSIONS")
                    .unwrap_or(1_000)
                    .max(1),
            },
        }
    }

    pub fn static_dir(&self) -> PathBuf {
        self.data_dir.join("static")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("transcripts.sqlite3").display()
        )
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
