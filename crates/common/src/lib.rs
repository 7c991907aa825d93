//! Common types for the Messages gateway

mod error;
mod redact;
mod secret;

pub use error::{Error, Result};
pub use redact::mask_credential;
pub use secret::Secret;
