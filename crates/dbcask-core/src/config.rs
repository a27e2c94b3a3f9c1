//! Recognized configuration keys, validation, and merge semantics.
//!
//! `Config` wraps a `serde_json::Map` rather than a typed struct so unknown
//! top-level keys survive a round trip (forward compatibility) while the
//! handful of keys this crate actually reads are validated and exposed
//! through typed accessors.

use serde_json::{Map, Value};

const RECOGNIZED_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "off"];
const RECOGNIZED_SNAPSHOT_KINDS: &[&str] = &["", "copy", "btrfs", "overlay"];

/// A single, recognized configuration surface: `log.level`, `snapshot.kind`,
/// `snapshot.root`, `dbms.image`.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: Map<String, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Read a dotted path (`"log.level"`) out of the nested map.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = &self.values;
        let mut segments = path.split('.').peekable();
        loop {
            let segment = segments.next()?;
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Some(value);
            }
            current = value.as_object()?;
        }
    }

    /// Validate `value`, then write it at a dotted path, creating
    /// intermediate objects as needed.
    pub fn set_path(&mut self, path: &str, value: Value) -> crate::Result<()> {
        validate_value(path, &value)?;
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(crate::Error::validation(format!("empty config key: {path}")));
        };

        let mut current = &mut self.values;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry
                .as_object_mut()
                .ok_or_else(|| crate::Error::validation(format!("{segment} is not an object in {path}")))?;
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    /// Recursively merge `other` into `self`: nested objects merge key by
    /// key, scalars and arrays are replaced wholesale (last writer wins).
    pub fn merge(self, other: Config) -> Config {
        Config { values: merge_maps(self.values, other.values) }
    }

    pub fn log_level(&self) -> crate::Result<Option<String>> {
        match self.get_path("log.level") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                validate_value("log.level", value)?;
                Ok(Some(value.as_str().expect("validated above").trim().to_ascii_lowercase()))
            }
        }
    }

    pub fn snapshot_kind(&self) -> crate::Result<String> {
        match self.get_path("snapshot.kind") {
            None => Ok(String::new()),
            Some(value) => {
                validate_value("snapshot.kind", value)?;
                Ok(value.as_str().expect("validated above").trim().to_ascii_lowercase())
            }
        }
    }

    /// `snapshot.root`, required when `snapshot.kind` is `btrfs`.
    pub fn snapshot_root(&self) -> crate::Result<Option<String>> {
        let root = match self.get_path("snapshot.root") {
            None => None,
            Some(value) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| crate::Error::validation("snapshot.root must be a string"))?;
                Some(s.to_string())
            }
        };
        if self.snapshot_kind()? == "btrfs" && root.is_none() {
            return Err(crate::Error::validation("snapshot.root is required when snapshot.kind is btrfs"));
        }
        Ok(root)
    }

    pub fn dbms_image(&self) -> crate::Result<Option<String>> {
        match self.get_path("dbms.image") {
            None => Ok(None),
            Some(value) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| crate::Error::validation("dbms.image must be a string"))?;
                Ok(Some(s.to_string()))
            }
        }
    }
}

fn merge_maps(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, overlay_value) in overlay {
        match (base.remove(&key), overlay_value) {
            (Some(Value::Object(base_obj)), Value::Object(overlay_obj)) => {
                base.insert(key, Value::Object(merge_maps(base_obj, overlay_obj)));
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
    base
}

/// Validate a single candidate value against the recognized-option table,
/// without requiring a full `Config`. Unrecognized keys pass through
/// unvalidated — they're preserved in the map but never feed a typed
/// accessor.
pub fn validate_value(key: &str, value: &Value) -> crate::Result<()> {
    match key {
        "log.level" => {
            if value.is_null() {
                return Ok(());
            }
            let s = value
                .as_str()
                .ok_or_else(|| crate::Error::validation(format!("{key} must be a string, got {value}")))?;
            let normalized = s.trim().to_ascii_lowercase();
            if !RECOGNIZED_LOG_LEVELS.contains(&normalized.as_str()) {
                return Err(crate::Error::validation(format!("unrecognized log.level: {s}")));
            }
            Ok(())
        }
        "snapshot.kind" => {
            let s = value
                .as_str()
                .ok_or_else(|| crate::Error::validation(format!("{key} must be a string, got {value}")))?;
            let normalized = s.trim().to_ascii_lowercase();
            if !RECOGNIZED_SNAPSHOT_KINDS.contains(&normalized.as_str()) {
                return Err(crate::Error::validation(format!("unrecognized snapshot.kind: {s}")));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_level_accepts_case_insensitive_trimmed_values() {
        let mut config = Config::new();
        config.set_path("log.level", json!(" WARN ")).unwrap();
        assert_eq!(config.log_level().unwrap().as_deref(), Some("warn"));
    }

    #[test]
    fn log_level_rejects_unknown_value() {
        let mut config = Config::new();
        let err = config.set_path("log.level", json!("verbose")).unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn log_level_rejects_non_string() {
        let mut config = Config::new();
        let err = config.set_path("log.level", json!(5)).unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn log_level_rejects_trace() {
        assert!(validate_value("log.level", &json!("trace")).is_err());
    }

    #[test]
    fn log_level_accepts_null_as_unset() {
        assert!(validate_value("log.level", &json!(null)).is_ok());

        let mut config = Config::new();
        config.set_path("log.level", json!(null)).unwrap();
        assert_eq!(config.log_level().unwrap(), None);
    }

    #[test]
    fn snapshot_root_required_for_btrfs() {
        let mut config = Config::new();
        config.set_path("snapshot.kind", json!("btrfs")).unwrap();
        assert!(config.snapshot_root().is_err());

        config.set_path("snapshot.root", json!("/var/lib/dbcask")).unwrap();
        assert_eq!(config.snapshot_root().unwrap().as_deref(), Some("/var/lib/dbcask"));
    }

    #[test]
    fn snapshot_root_not_required_for_copy() {
        let mut config = Config::new();
        config.set_path("snapshot.kind", json!("copy")).unwrap();
        assert!(config.snapshot_root().unwrap().is_none());
    }

    #[test]
    fn merge_is_recursive_and_last_writer_wins_on_scalars() {
        let mut base = Config::new();
        base.set_path("log.level", json!("info")).unwrap();
        base.set_path("dbms.image", json!("postgres:15")).unwrap();

        let mut overlay = Config::new();
        overlay.set_path("log.level", json!("debug")).unwrap();

        let merged = base.merge(overlay);
        assert_eq!(merged.log_level().unwrap().as_deref(), Some("debug"));
        assert_eq!(merged.dbms_image().unwrap().as_deref(), Some("postgres:15"));
    }

    #[test]
    fn merge_replaces_arrays_rather_than_concatenating() {
        let mut base = Config::new();
        base.values.insert("tags".to_string(), json!(["a", "b"]));
        let mut overlay = Config::new();
        overlay.values.insert("tags".to_string(), json!(["c"]));

        let merged = base.merge(overlay);
        assert_eq!(merged.as_map().get("tags").unwrap(), &json!(["c"]));
    }

    #[test]
    fn unrecognized_keys_survive_round_trip() {
        let mut config = Config::new();
        config.values.insert("experimental".to_string(), json!({"flag": true}));
        assert_eq!(config.get_path("experimental.flag"), Some(&json!(true)));
    }

    #[test]
    fn path_segments_are_literal_keys_never_bracket_indices() {
        // This crate's recognized config surface (log.level, snapshot.kind,
        // snapshot.root, dbms.image) has no array-valued entries, so
        // `get_path`/`set_path` treat every dot-separated segment as an
        // opaque object key rather than parsing a `name[index]` grammar.
        // A segment that looks like a bracketed index (including one with
        // an overflowing numeric literal) is therefore never parsed as a
        // number and can't panic or error on overflow — it's stored and
        // read back as a literal key like any other.
        let mut config = Config::new();
        let key = "items[999999999999999999999999]";
        config.values.insert(key.to_string(), json!("whatever"));
        assert_eq!(config.get_path(key), Some(&json!("whatever")));
    }

    #[test]
    fn validate_value_checks_a_candidate_without_a_full_config() {
        assert!(validate_value("log.level", &json!("info")).is_ok());
        assert!(validate_value("log.level", &json!("verbose")).is_err());
        assert!(validate_value("snapshot.kind", &json!("zfs")).is_err());
        assert!(validate_value("unknown.key", &json!(42)).is_ok());
    }
}
