//! Single-use recovery codes.
//!
//! Codes are 12 characters from the Base32 alphabet, displayed in groups of
//! four (`XXXX-XXXX-XXXX`). Only SHA-256 hashes are persisted; the plaintext
//! exists exactly once, at generation time.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Characters a recovery code is drawn from. Base32 avoids `0/O` and `1/I`
/// confusion when codes are read off paper.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Raw length of a code, separators excluded.
pub const CODE_LENGTH: usize = 12;

const GROUP_SIZE: usize = 4;

/// Bounds on how many codes one batch may hold.
pub const MIN_CODES: usize = 1;
pub const MAX_CODES: usize = 100;

/// Generate a batch of formatted recovery codes.
///
/// `count` is clamped to `[MIN_CODES, MAX_CODES]`.
pub fn generate_codes(count: usize) -> Vec<String> {
    let count = count.clamp(MIN_CODES, MAX_CODES);
    (0..count).map(|_| generate_code()).collect()
}

fn generate_code() -> String {
    let mut bytes = [0u8; CODE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    let raw: String = bytes
        .iter()
        .map(|&b| ALPHABET[b as usize % ALPHABET.len()] as char)
        .collect();
    group(&raw)
}

fn group(raw: &str) -> String {
    raw.as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

/// Hash a code the way it is stored.
///
/// Separators and case are stripped first, so `abcd-efgh-jk23` and
/// `ABCDEFGHJK23` hash identically.
pub fn hash_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// True if `code` even has the shape of a recovery code after
/// normalization. Used to skip a database lookup for obvious non-codes.
pub fn plausible(code: &str) -> bool {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    normalized.len() == CODE_LENGTH
        && normalized
            .chars()
            .all(|c| ALPHABET.contains(&(c.to_ascii_uppercase() as u8)))
}
