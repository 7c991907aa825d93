//! Secret wrapper for key material
//!
//! API keys and OAuth tokens travel through config and request state
//! wrapped in `Secret` so an accidental `{:?}` in a log line can never
//! print them. The backing memory is zeroized on drop.
//!
//! `Secret` implements neither `Serialize` nor `Deserialize`: key
//! material enters through env-var or key-file indirection, never by
//! decoding it out of a config document.

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value — redacted in Debug/Display, zeroized on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value. Call sites should be the actual request
    /// path, never a logging statement.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}
