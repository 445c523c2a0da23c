pub mod config;
pub mod database;
pub mod engine;
pub mod http_client;
pub mod llm_client;
pub mod prompt;
pub mod server;
pub mod state;
