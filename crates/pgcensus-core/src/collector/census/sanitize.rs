//! Normalization of raw census fields into metric label values.

/// Placeholder for missing hosts, databases and commands.
pub const UNKNOWN: &str = "unknown";

/// Characters removed from label values.
const STRIPPED: [char; 6] = [';', ',', ':', '.', '(', ')'];

/// Characters replaced with `_`.
///
/// Must stay disjoint from [`STRIPPED`] and must not contain `_`, so the two
/// passes commute and a sanitized value is a fixed point.
const UNDERSCORED: [char; 2] = [' ', '-'];

/// Maps a raw state/command string to a label-safe token.
///
/// `"Waiting for table; metadata lock"` becomes
/// `"waiting_for_table_metadata_lock"`. Empty input, and input made only of
/// stripped punctuation, becomes [`UNKNOWN`].
pub fn sanitize_label(raw: &str) -> String {
    let raw = if raw.is_empty() { UNKNOWN } else { raw };

    let sanitized: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| !STRIPPED.contains(c))
        .map(|c| if UNDERSCORED.contains(&c) { '_' } else { c })
        .collect();

    if sanitized.is_empty() {
        UNKNOWN.to_string()
    } else {
        sanitized
    }
}

/// Drops a `:port` suffix from a client host; empty hosts become [`UNKNOWN`].
pub fn normalize_host(raw: &str) -> &str {
    if raw.is_empty() {
        return UNKNOWN;
    }
    raw.split_once(':').map_or(raw, |(host, _)| host)
}

pub fn normalize_database(raw: Option<&str>) -> &str {
    match raw {
        Some(db) if !db.is_empty() => db,
        _ => UNKNOWN,
    }
}
