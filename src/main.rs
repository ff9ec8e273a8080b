use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use book_companion::completion::backend_from_config;
use book_companion::corpus::CorpusStore;
use book_companion::db::Database;
use book_companion::pipeline::Pipeline;
use book_companion::session::SessionRegistry;
use book_companion::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let corpus = Arc::new(CorpusStore::load(&config.corpus).await?);
    let backend = backend_from_config(&config)?;
    let pipeline = Pipeline::new(&config, corpus, backend);

    let db = Database::new(&config).await?;
    let sessions = SessionRegistry::new(Some(db), config.sessions.clone());
    sessions.spawn_sweeper();

    run_server(config, pipeline, sessions).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
