//! Credential handling for usbwarden.
//!
//! Two factors can unlock a pending device:
//! - a six-digit TOTP code from an enrolled authenticator app, or
//! - a single-use recovery code from the batch printed at enrollment.
//!
//! Secrets and recovery-code hashes live in SQLite; plaintext recovery
//! codes are shown once and never stored.

pub mod recovery;
pub mod store;
pub mod totp;
pub mod verifier;

pub use store::{CredentialStore, StoreError};
pub use totp::{generate_secret, Totp, TotpError};
pub use verifier::{CredentialVerifier, VerifiedMethod, VerifierError};
