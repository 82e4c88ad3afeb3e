//! Account routing for the Qwen gateway
//!
//! Dispatches chat completions across OAuth accounts with sticky selection,
//! quota-driven rotation, refresh-and-retry on auth errors, and a streaming
//! relay that never retracts bytes already sent.
//!
//! Call lifecycle:
//! 1. Multimodal content is validated before any account is touched
//! 2. Account files are rescanned; none means single-account mode
//! 3. Starting at the default account, a valid token is obtained and the
//!    account's daily counter is incremented
//! 4. The upstream call is made; failures are classified and `state`
//!    decides whether to rotate, refresh and retry, or abort
//! 5. Streams are relayed chunk by chunk; a mid-stream failure ends the
//!    stream with an SSE error event

pub mod accounts;
pub mod auth_errors;
pub mod classify;
pub mod counter;
pub mod error;
pub mod relay;
pub mod router;
pub mod state;
mod telemetry;

#[cfg(test)]
mod testing;

pub use accounts::AccountSource;
pub use auth_errors::AuthErrorRegistry;
pub use classify::classify;
pub use counter::{RequestCounter, RequestCounts};
pub use error::{Error, Result};
pub use relay::{RelayStream, sse_error_frame};
pub use router::{AccountRouter, AccountUsage};
pub use state::{AUTH_ROTATION_THRESHOLD, Mode};
