//! Canonical serialization and statement normalization for deterministic hashing.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: Struct fields serialize in declaration order
//! - Stable Vec order: Vectors serialize in index order
//! - No HashMap allowed: Use BTreeMap for maps in hashed data
//! - Stable text form: statements are newline-normalized and trimmed before
//!   entering any content hash
//!
//! Fingerprints, node ids, config hashes and snapshot hashes all flow through
//! this module, so a hash computed at any point in time is comparable with a
//! hash computed later against the same data.

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Version of the canonical statement normalization.
///
/// Increment when the normalization algorithm changes. Changes to this
/// version invalidate all existing content hashes.
pub const CANONICAL_STATEMENT_VERSION: &str = "1.0.0";

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("Canonical serialization failed")
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    let bytes = to_canonical_bytes(value);
    xxh64(&bytes, 0)
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

/// Normalize a statement to canonical form.
///
/// Transformations applied, in order:
/// 1. CRLF and isolated CR become LF
/// 2. Runs of spaces and tabs collapse to a single space
/// 3. Leading and trailing whitespace is trimmed
///
/// Two statements that normalize identically are treated as the same
/// semantic content by the incremental cache, so a formatting-only edit of
/// the proof source never invalidates an explanation.
pub fn normalize_statement(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut in_blank = false;
    for ch in unified.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_blank {
                out.push(' ');
            }
            in_blank = true;
        } else {
            in_blank = false;
            out.push(ch);
        }
    }

    out.trim().to_string()
}

/// Compute the canonical hash of a normalized statement as hex.
///
/// The hash covers [`CANONICAL_STATEMENT_VERSION`] alongside the normalized
/// text, so bumping the version invalidates every stored content hash.
pub fn statement_hash_hex(text: &str) -> String {
    let payload = format!(
        "{CANONICAL_STATEMENT_VERSION}\n{}",
        normalize_statement(text)
    );
    format!("{:016x}", xxh64(payload.as_bytes(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestStruct {
        name: String,
        value: i32,
    }

    #[test]
    fn test_determinism() {
        let s = TestStruct {
            name: "test".to_string(),
            value: 42,
        };

        let h1 = canonical_hash(&s);
        let h2 = canonical_hash(&s);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_normalize_newlines_and_spaces() {
        assert_eq!(normalize_statement("  a \t b\r\nc  "), "a b\nc");
    }

    #[test]
    fn test_statement_hash_ignores_formatting() {
        let a = statement_hash_hex("forall n,  n + 0 = n");
        let b = statement_hash_hex("forall n, n + 0 = n\r\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_statement_hash_detects_content_change() {
        let a = statement_hash_hex("forall n, n + 0 = n");
        let b = statement_hash_hex("forall n, 0 + n = n");
        assert_ne!(a, b);
    }

    #[test]
    fn test_statement_hash_is_version_bound() {
        let text = "forall n, n + 0 = n";
        let unversioned = format!("{:016x}", xxh64(normalize_statement(text).as_bytes(), 0));
        assert_ne!(statement_hash_hex(text), unversioned);
    }
}
