use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use book_companion::completion::backend_from_config;
use book_companion::config::AppConfig;
use book_companion::corpus::CorpusStore;
use book_companion::models::RecordType;
use book_companion::pipeline::{Pipeline, PipelineRun};
use book_companion::session::{ConversationSession, TurnError};

#[derive(Parser, Debug)]
#[command(name = "ask")]
#[command(about = "Ask questions about the book from the terminal")]
struct Cli {
    /// Ask one question and exit instead of reading questions from stdin.
    #[arg(long)]
    question: Option<String>,
    #[arg(long, default_value_t = false)]
    show_selection: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let corpus = Arc::new(CorpusStore::load(&config.corpus).await?);
    let backend = backend_from_config(&config)?;
    let pipeline = Pipeline::new(&config, corpus, backend);
    let session = ConversationSession::new(format!("cli-{}", uuid::Uuid::new_v4()));

    if let Some(question) = cli.question {
        let run = session.ask(&pipeline, &question).await?;
        print_run(&run, cli.show_selection);
        return Ok(());
    }

    println!("Ask a question about {} (Ctrl-D to quit).", config.book_title);
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        match session.ask(&pipeline, question).await {
            Ok(run) => print_run(&run, cli.show_selection),
            Err(TurnError::Pipeline(err)) => eprintln!("{} ({err})", err.user_message()),
            Err(err) => return Err(err.into()),
        }
    }

    println!("{} turns this session.", session.len().await);
    Ok(())
}

fn print_run(run: &PipelineRun, show_selection: bool) {
    println!("{}", run.answer);

    let pages: Vec<String> = run
        .context
        .sources()
        .into_iter()
        .filter(|source| source.kind == RecordType::Page)
        .map(|source| source.number.to_string())
        .collect();
    if !pages.is_empty() {
        println!("Pages read: {}", pages.join(", "));
    }
    if show_selection {
        println!(
            "Selected pages={:?} chapters={:?} ({} ms)",
            run.selection.pages, run.selection.chapters, run.latency_ms
        );
    }
    println!();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
