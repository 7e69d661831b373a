//! RFC 6238 time-based one-time passwords.
//!
//! Six digits, 30 second steps, HMAC-SHA1. Verification accepts the
//! previous, current, and next step to absorb clock drift, and refuses to
//! accept the same code twice within one step.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Length of one time step in seconds.
pub const STEP_SECONDS: u64 = 30;

/// Number of digits in a code.
pub const CODE_DIGITS: usize = 6;

/// Secret length in bytes (160 bits, the RFC 4226 recommendation).
const SECRET_BYTES: usize = 20;

/// Error produced when a stored secret cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("secret is not valid base32")]
    InvalidSecret,
}

/// Generate a fresh random secret, Base32-encoded without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

/// Verifier for one enrolled secret.
///
/// Holds the last accepted code so a captured code cannot be replayed
/// within its validity window.
#[derive(Debug)]
pub struct Totp {
    key: Vec<u8>,
    secret: String,
    last_code: Option<String>,
    last_accepted_at: u64,
}

impl Totp {
    /// Build a verifier from a Base32 secret (as printed at enrollment).
    pub fn from_secret(secret: &str) -> Result<Self, TotpError> {
        let normalized: String = secret
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let key = BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|_| TotpError::InvalidSecret)?;
        Ok(Self {
            key,
            secret: normalized,
            last_code: None,
            last_accepted_at: 0,
        })
    }

    /// The Base32 secret this verifier was built from.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The code for the step containing `now` (Unix seconds).
    pub fn code_at(&self, now: u64) -> String {
        format_code(hotp(&self.key, now / STEP_SECONDS))
    }

    /// Seconds until the current code rolls over.
    pub fn seconds_remaining(&self, now: u64) -> u64 {
        STEP_SECONDS - (now % STEP_SECONDS)
    }

    /// Verify `code` against the step containing `now` plus one step of
    /// drift in either direction.
    ///
    /// A code equal to the last accepted one is rejected if fewer than
    /// [`STEP_SECONDS`] have passed since it was accepted, even though it
    /// would still fall inside the drift window.
    pub fn verify_at(&mut self, code: &str, now: u64) -> bool {
        let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if code.len() != CODE_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if let Some(last) = &self.last_code {
            if *last == code && now.saturating_sub(self.last_accepted_at) < STEP_SECONDS {
                return false;
            }
        }

        let counter = now / STEP_SECONDS;
        let window = [counter.saturating_sub(1), counter, counter + 1];
        let accepted = window
            .iter()
            .any(|&c| format_code(hotp(&self.key, c)) == code);
        if accepted {
            self.last_code = Some(code);
            self.last_accepted_at = now;
        }
        accepted
    }

    /// `otpauth://` URI for provisioning an authenticator app.
    pub fn provisioning_uri(&self, account: &str, issuer: &str) -> String {
        format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&digits={digits}&period={period}",
            issuer = issuer,
            account = account,
            secret = self.secret,
            digits = CODE_DIGITS,
            period = STEP_SECONDS,
        )
    }
}

/// RFC 4226 dynamic truncation of an HMAC-SHA1 digest.
fn hotp(key: &[u8], counter: u64) -> u32 {
    // Hmac accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    bin % 1_000_000
}

fn format_code(value: u32) -> String {
    format!("{value:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test vectors use the ASCII secret "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_vectors() {
        let totp = Totp::from_secret(RFC_SECRET).unwrap();
        // (time, expected 6-digit suffix of the 8-digit RFC vector)
        let cases = [
            (59u64, "287082"),
            (1111111109, "081804"),
            (1111111111, "050471"),
            (1234567890, "005924"),
            (2000000000, "279037"),
        ];
        for (now, expected) in cases {
            assert_eq!(totp.code_at(now), expected, "at t={now}");
        }
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        let now = 1111111109;
        let current = totp.code_at(now);
        assert!(totp.verify_at(&current, now + STEP_SECONDS));

        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        let next = totp.code_at(now + STEP_SECONDS);
        assert!(totp.verify_at(&next, now));
    }

    #[test]
    fn verify_rejects_outside_window() {
        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        let now: u64 = 1111111109;
        let old = totp.code_at(now.saturating_sub(2 * STEP_SECONDS));
        assert!(!totp.verify_at(&old, now));
    }

    #[test]
    fn verify_rejects_replay_within_step() {
        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        let now = 1111111109;
        let code = totp.code_at(now);
        assert!(totp.verify_at(&code, now));
        assert!(!totp.verify_at(&code, now + 5));
        // After a full step the same digits are a fresh coincidence, not a
        // replay of a captured code.
        assert!(totp.verify_at(&code, now + STEP_SECONDS));
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        assert!(!totp.verify_at("", 59));
        assert!(!totp.verify_at("12345", 59));
        assert!(!totp.verify_at("1234567", 59));
        assert!(!totp.verify_at("abc123", 59));
    }

    #[test]
    fn verify_ignores_whitespace() {
        let mut totp = Totp::from_secret(RFC_SECRET).unwrap();
        assert!(totp.verify_at(" 287 082 ", 59));
    }

    #[test]
    fn generated_secret_roundtrips() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        let totp = Totp::from_secret(&secret).unwrap();
        assert_eq!(totp.secret(), secret);
    }

    #[test]
    fn lowercase_secret_accepted() {
        let totp = Totp::from_secret(&RFC_SECRET.to_ascii_lowercase()).unwrap();
        assert_eq!(totp.code_at(59), "287082");
    }

    #[test]
    fn invalid_secret_rejected() {
        assert!(Totp::from_secret("not base32 at all!!").is_err());
    }

    #[test]
    fn seconds_remaining_counts_down() {
        let totp = Totp::from_secret(RFC_SECRET).unwrap();
        assert_eq!(totp.seconds_remaining(60), 30);
        assert_eq!(totp.seconds_remaining(89), 1);
    }

    #[test]
    fn provisioning_uri_shape() {
        let totp = Totp::from_secret(RFC_SECRET).unwrap();
        let uri = totp.provisioning_uri("root@host", "usbwarden");
        assert!(uri.starts_with("otpauth://totp/usbwarden:root@host?"));
        assert!(uri.contains(&format!("secret={RFC_SECRET}")));
        assert!(uri.contains("period=30"));
    }
}
