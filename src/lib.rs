//! Invoice router: supplier invoice email ingestion and AP routing.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
