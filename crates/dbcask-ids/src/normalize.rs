//! Normalization of prepare-step arguments prior to fingerprinting.

/// Normalize a list of prepare-step arguments into a canonical form.
///
/// - Trims surrounding whitespace from each argument.
/// - Normalizes path separators (`\` to `/`) so the same script referenced
///   with different separator conventions still fingerprints identically.
/// - Drops exact duplicate `flag` (or `flag=value`) entries, keeping the
///   first occurrence.
/// - Sorts the order-insensitive tail of flag/value pairs while preserving
///   the relative order of positional (non-flag) arguments, so
///   `["-f", "a.sql", "-f", "b.sql"]` and `["-f", "b.sql", "-f", "a.sql"]`
///   normalize to the same canonical form when they are genuinely
///   order-insensitive, but a leading positional argument keeps its place.
pub fn normalize_args(args: &[String]) -> Vec<String> {
    let trimmed: Vec<String> =
        args.iter().map(|a| a.trim().replace('\\', "/")).filter(|a| !a.is_empty()).collect();

    let mut positional = Vec::new();
    let mut flag_pairs: Vec<(String, Option<String>)> = Vec::new();

    let mut iter = trimmed.into_iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(rest) = arg.strip_prefix('-') {
            if let Some((k, v)) = rest.split_once('=') {
                flag_pairs.push((format!("-{k}"), Some(v.to_string())));
            } else if let Some(next) = iter.peek() {
                if next.starts_with('-') {
                    flag_pairs.push((arg, None));
                } else {
                    flag_pairs.push((arg, Some(iter.next().unwrap())));
                }
            } else {
                flag_pairs.push((arg, None));
            }
        } else {
            positional.push(arg);
        }
    }

    // Deduplicate exact flag+value pairs, keeping first occurrence.
    let mut seen = std::collections::HashSet::new();
    flag_pairs.retain(|pair| seen.insert(pair.clone()));

    flag_pairs.sort();

    let mut normalized = positional;
    for (flag, value) in flag_pairs {
        normalized.push(flag);
        if let Some(v) = value {
            normalized.push(v);
        }
    }
    normalized
}
