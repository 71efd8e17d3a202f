//! Client credentials and the in-memory credential registry
//!
//! Provides:
//! - Client identities, secrets and keys
//! - Lazy expiry and administrator blocking
//! - Per-client traffic accounting merged at session teardown
//! - Admin duration strings (`"24h"`, `"7d"`)

mod clock;
mod credential;
mod duration;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{ClientCredential, ClientId, ClientSummary, Secret, ID_LEN, SECRET_LEN};
pub use duration::parse_duration;
pub use store::CredentialStore;

use crate::crypto::CryptoError;
use thiserror::Error;

/// Authentication and credential errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown identity, wrong secret, blocked or expired. The reasons are
    /// deliberately indistinguishable.
    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Invalid client identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid client secret")]
    InvalidSecret,

    #[error("Credential file error: {0}")]
    File(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
