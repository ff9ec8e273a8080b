pub mod assembler;
pub mod completion;
pub mod config;
pub mod corpus;
pub mod db;
pub mod error;
pub mod models;
pub mod ollama;
pub mod openai;
pub mod pipeline;
pub mod selector;
pub mod server;
pub mod session;
pub mod synthesizer;
pub mod text;

pub use config::AppConfig;
pub use server::run_server;
