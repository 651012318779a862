pub mod analyzer;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod db;
pub mod executor;
pub mod fixer;
pub mod gateway;
pub mod infra;
pub mod llm;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod reasoner;
pub mod types;
pub mod validator;
pub mod vcs;

pub use types::*;
