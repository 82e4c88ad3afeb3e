//! Qwen OAuth authentication library
//!
//! Device-flow onboarding, token refresh and per-account credential files
//! for the Qwen gateway. Has no dependency on the proxy binary.
//!
//! Credential flow:
//! 1. `TokenManager::initiate_device_flow()` registers a device code with a
//!    fresh PKCE verifier and returns the user code to display
//! 2. `TokenManager::poll_for_token()` polls until the user authorizes and
//!    saves the tokens through `CredentialStore::save()`
//! 3. `TokenManager::get_valid_access_token()` serves cached tokens and
//!    refreshes them via `token::refresh_token()` once they near expiry

pub mod constants;
pub mod credentials;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod pkce;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, QwenCredentials, validate_account_id};
pub use device::{DeviceAuthorization, PollOutcome};
pub use error::{Error, Result};
pub use lifecycle::{DeviceFlowStart, TokenManager};
pub use token::TokenResponse;
