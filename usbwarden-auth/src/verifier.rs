//! Verification of user-presented codes against the enrolled credential.

use crate::recovery;
use crate::store::{CredentialStore, StoreError};
use crate::totp::{Totp, TotpError};

/// Which credential satisfied a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedMethod {
    Totp,
    Recovery,
}

/// Errors from building a verifier out of the store.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored secret is unusable: {0}")]
    Totp(#[from] TotpError),
}

/// Checks presented codes, first as TOTP, then as recovery codes.
///
/// Holds mutable verification state (the TOTP replay guard), so the caller
/// is expected to own exactly one of these for the enrolled credential.
pub struct CredentialVerifier {
    totp: Totp,
    store: CredentialStore,
}

impl CredentialVerifier {
    /// Load the enrolled credential. `Ok(None)` means nothing is enrolled.
    pub async fn load(store: CredentialStore) -> Result<Option<Self>, VerifierError> {
        let Some(secret) = store.load_secret().await? else {
            return Ok(None);
        };
        let totp = Totp::from_secret(&secret)?;
        Ok(Some(Self { totp, store }))
    }

    /// Verify a code against the clock.
    pub async fn verify(&mut self, code: &str) -> Result<Option<VerifiedMethod>, StoreError> {
        self.verify_at(code, unix_now()).await
    }

    /// Verify a code at an explicit time (Unix seconds).
    ///
    /// TOTP is tried first; anything that fails as TOTP and looks like a
    /// recovery code is checked against the stored hashes. A matching
    /// recovery code is removed from the store before this returns, so the
    /// caller may report success knowing the code can never be used again.
    pub async fn verify_at(
        &mut self,
        code: &str,
        now: u64,
    ) -> Result<Option<VerifiedMethod>, StoreError> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }

        if self.totp.verify_at(code, now) {
            return Ok(Some(VerifiedMethod::Totp));
        }

        if !recovery::plausible(code) {
            return Ok(None);
        }
        let candidate = recovery::hash_code(code);
        for stored in self.store.recovery_hashes().await? {
            if stored == candidate {
                self.store.consume_recovery_code(&stored).await?;
                return Ok(Some(VerifiedMethod::Recovery));
            }
        }
        Ok(None)
    }

    /// Recovery codes not yet used.
    pub async fn remaining_recovery_codes(&self) -> Result<i64, StoreError> {
        self.store.remaining_recovery_codes().await
    }

    /// The underlying TOTP verifier, for enrollment display.
    pub fn totp(&self) -> &Totp {
        &self.totp
    }
}

fn unix_now() -> u64 {
    // Seconds since the epoch; negative timestamps cannot occur on a
    // running system.
    chrono::Utc::now().timestamp().max(0) as u64
}
