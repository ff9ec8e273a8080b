use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use book_companion::completion::backend_from_config;
use book_companion::config::AppConfig;
use book_companion::corpus::CorpusStore;
use book_companion::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Run a question set through the selection/answer pipeline")]
struct Cli {
    #[arg(long, default_value = "eval/prompts.jsonl")]
    file: String,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct EvalPrompt {
    id: String,
    question: String,
    #[serde(default)]
    expect_pages: Vec<u32>,
    #[serde(default)]
    expect_contains: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let corpus = Arc::new(CorpusStore::load(&config.corpus).await?);
    let backend = backend_from_config(&config)?;
    let pipeline = Pipeline::new(&config, corpus, backend);

    let prompts = load_prompts(&cli.file)?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts found in {}", cli.file);
    }

    let mut total = 0usize;
    let mut failed_turns = 0usize;
    let mut pass_contains = 0usize;
    let mut expected_pages = 0usize;
    let mut recalled_pages = 0usize;
    let mut empty_selections = 0usize;

    for prompt in prompts {
        total += 1;

        let run = match pipeline.run(&prompt.question).await {
            Ok(run) => run,
            Err(err) => {
                failed_turns += 1;
                println!("--- {} --- FAILED [{}] {}", prompt.id, err.kind(), err);
                continue;
            }
        };

        if run.selection.pages.is_empty() {
            empty_selections += 1;
        }

        let expected: BTreeSet<u32> = prompt.expect_pages.iter().copied().collect();
        expected_pages += expected.len();
        recalled_pages += expected.intersection(&run.selection.pages).count();

        let answer_lower = run.answer.to_ascii_lowercase();
        if prompt
            .expect_contains
            .iter()
            .all(|needle| answer_lower.contains(&needle.to_ascii_lowercase()))
        {
            pass_contains += 1;
        }

        if cli.verbose {
            println!("--- {} ---", prompt.id);
            println!("Q: {}", prompt.question);
            println!("Pages: {:?}", run.selection.pages);
            println!("A: {}", run.answer.replace('\n', " "));
            println!();
        }
    }

    println!("Eval prompts: {}", total);
    println!("Failed turns: {}", failed_turns);
    println!("Contains accuracy: {:.1}%", ratio(pass_contains, total) * 100.0);
    println!("Empty selections: {:.1}%", ratio(empty_selections, total) * 100.0);
    if expected_pages > 0 {
        println!(
            "Page recall: {:.1}% ({}/{})",
            ratio(recalled_pages, expected_pages) * 100.0,
            recalled_pages,
            expected_pages
        );
    }

    Ok(())
}

fn load_prompts(path: &str) -> Result<Vec<EvalPrompt>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path))?;
    let reader = BufReader::new(file);
    let mut prompts = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: EvalPrompt = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path, idx + 1))?;
        prompts.push(parsed);
    }

    Ok(prompts)
}

fn ratio(n: usize, d: usize) -> f32 {
    if d == 0 {
        return 0.0;
    }
    n as f32 / d as f32
}
