//! Linkflow: streaming link pipeline with rate-limit aware enrichment.

pub mod config;
pub mod enrich;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod sources;
pub mod workflow;
