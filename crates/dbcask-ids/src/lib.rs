//! Identifier validation and state fingerprinting for dbcask.
//!
//! Instance IDs are 32-character hex strings. State fingerprints are a
//! deterministic digest over a normalized `(image_id, prepare_kind,
//! prepare_args)` tuple, used as the cache key for prepared states.

mod fingerprint;
mod normalize;

pub use fingerprint::{fingerprint, Fingerprint};
pub use normalize::normalize_args;

/// Validate the 32-hex instance/state ID grammar: `^[0-9a-fA-F]{32}$`.
pub fn is_instance_id(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Generate a new 32-hex identifier suitable for a state or instance ID.
///
/// Built from a v4 UUID with its dashes stripped, which already satisfies
/// the 32-hex grammar and carries the same collision resistance.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_instance_ids() {
        assert!(is_instance_id("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(is_instance_id("0123456789abcdefABCDEF0123456789"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(!is_instance_id("aaaa"));
        assert!(!is_instance_id(&"a".repeat(33)));
        assert!(!is_instance_id(""));
    }

    #[test]
    fn rejects_non_hex_chars() {
        assert!(!is_instance_id("gggggggggggggggggggggggggggggggg"));
        assert!(!is_instance_id("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-"));
    }

    #[test]
    fn generated_ids_match_grammar() {
        let id = generate_id();
        assert!(is_instance_id(&id));
        assert_ne!(generate_id(), generate_id());
    }
}
