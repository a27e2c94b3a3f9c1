//! Listing wire-format selection.
//!
//! A pure helper with no HTTP server attached: given rows and an `Accept`
//! header value, produce either a single JSON array or newline-delimited
//! JSON. The HTTP layer that actually sends the returned content type is a
//! collaborator outside this crate.

use serde::Serialize;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Render `rows` as either a JSON array or NDJSON, selecting NDJSON when
/// `accept` contains `application/x-ndjson` case-insensitively. Returns the
/// encoded bytes plus the content type that should accompany them.
pub fn render_listing<T: Serialize>(
    rows: &[T],
    accept: Option<&str>,
) -> crate::Result<(Vec<u8>, &'static str)> {
    let wants_ndjson = accept
        .map(|h| h.to_ascii_lowercase().contains(CONTENT_TYPE_NDJSON))
        .unwrap_or(false);

    if wants_ndjson {
        let mut out = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut out, row)
                .map_err(|e| crate::Error::Generic(format!("ndjson encode: {e}")))?;
            out.push(b'\n');
        }
        Ok((out, CONTENT_TYPE_NDJSON))
    } else {
        let out = serde_json::to_vec(rows)
            .map_err(|e| crate::Error::Generic(format!("json encode: {e}")))?;
        Ok((out, CONTENT_TYPE_JSON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Row {
        id: u32,
    }

    #[test]
    fn defaults_to_json_array_without_an_accept_header() {
        let rows = vec![Row { id: 1 }, Row { id: 2 }];
        let (bytes, content_type) = render_listing(&rows, None).unwrap();
        assert_eq!(content_type, CONTENT_TYPE_JSON);
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(decoded.is_array());
        assert_eq!(decoded.as_array().unwrap().len(), 2);
    }

    #[test]
    fn selects_ndjson_case_insensitively() {
        let rows = vec![Row { id: 1 }, Row { id: 2 }, Row { id: 3 }];
        let (bytes, content_type) = render_listing(&rows, Some("Application/X-NDJSON")).unwrap();
        assert_eq!(content_type, CONTENT_TYPE_NDJSON);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 3);
        for line in text.lines() {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
    }

    #[test]
    fn ignores_ndjson_when_accept_header_matches_something_else() {
        let rows = vec![Row { id: 7 }];
        let (_, content_type) = render_listing(&rows, Some("text/html")).unwrap();
        assert_eq!(content_type, CONTENT_TYPE_JSON);
    }

    #[test]
    fn empty_rows_render_as_empty_array_or_zero_lines() {
        let rows: Vec<Row> = Vec::new();
        let (bytes, _) = render_listing(&rows, None).unwrap();
        assert_eq!(bytes, b"[]");
        let (bytes, _) = render_listing(&rows, Some("application/x-ndjson")).unwrap();
        assert!(bytes.is_empty());
    }
}
