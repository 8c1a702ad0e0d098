//! Integrations that rely on third-party services.
//!
//! Currently the advisory providers consulted by the last tier of the
//! cascade.

pub mod advisory;

pub use advisory::{AdvisoryError, AdvisoryProvider, AdvisoryRequest, AdvisoryVerdict, GeminiProvider};
