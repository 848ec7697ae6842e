//! Document-understanding service boundary.
//!
//! The pipeline only sees [`LlmProvider`]; [`AnthropicProvider`] is the
//! production implementation over the Anthropic Messages API.

mod anthropic;
pub mod json;
pub mod provider;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use retry::RetryPolicy;
