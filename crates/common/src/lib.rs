//! Common types for the Qwen OpenAI proxy workspace

mod error;
mod fs;
mod secret;

pub use error::{Error, Result};
pub use fs::write_atomic;
pub use secret::Secret;
