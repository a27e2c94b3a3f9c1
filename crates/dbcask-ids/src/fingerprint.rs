//! Deterministic state fingerprints.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::normalize::normalize_args;

/// A hex-encoded SHA-256 digest identifying a prepared state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Compute the fingerprint for a `(image_id, prepare_kind, prepare_args)`
/// tuple. Each field is length-prefixed before hashing so that no choice of
/// delimiter could let two distinguishable tuples collide.
pub fn fingerprint(image_id: &str, prepare_kind: &str, prepare_args: &[String]) -> Fingerprint {
    let normalized_args = normalize_args(prepare_args);

    let mut hasher = Sha256::new();
    hash_field(&mut hasher, image_id.as_bytes());
    hash_field(&mut hasher, prepare_kind.as_bytes());
    hash_field(&mut hasher, &(normalized_args.len() as u64).to_le_bytes());
    for arg in &normalized_args {
        hash_field(&mut hasher, arg.as_bytes());
    }

    let digest = hasher.finalize();
    Fingerprint(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = fingerprint("postgres:16", "psql", &["-f".to_string(), "init.sql".to_string()]);
        let b = fingerprint("postgres:16", "psql", &["-f".to_string(), "init.sql".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn normalization_is_idempotent_under_fingerprinting() {
        let args = vec!["-f".to_string(), "b.sql".to_string(), "-f".to_string(), "a.sql".to_string()];
        let normalized_once = normalize_args(&args);
        let normalized_twice = normalize_args(&normalized_once);
        let fp1 = fingerprint("img", "psql", &normalized_once);
        let fp2 = fingerprint("img", "psql", &normalized_twice);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn distinguishable_inputs_differ() {
        let a = fingerprint("postgres:16", "psql", &["-f".to_string(), "init.sql".to_string()]);
        let b = fingerprint("postgres:15", "psql", &["-f".to_string(), "init.sql".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn no_delimiter_collision_across_field_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collide just because a naive
        // join would produce the same string.
        let a = fingerprint("ab", "c", &[]);
        let b = fingerprint("a", "bc", &[]);
        assert_ne!(a, b);
    }
}
