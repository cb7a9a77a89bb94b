//! Tag set codec
//!
//! Tags travel as `key1:value1;key2:value2` strings in the counter files and
//! in the `EPMT_JOB_TAGS` environment variable. A key without a value gets
//! the default value `"1"`.

use crate::models::TagMap;
use tracing::warn;

/// Environment variable consulted as a fallback tag source at submission
pub const TAGS_ENV_VAR: &str = "EPMT_JOB_TAGS";

/// Default value assigned to a bare key
const DEFAULT_VALUE: &str = "1";

const PAIR_DELIMITER: char = ';';
const KEY_VALUE_SEPARATOR: char = ':';

/// Parse a tag string into a tag map
///
/// Blank segments are skipped; whitespace around keys and values is
/// trimmed. A segment with an empty key is dropped with a warning.
pub fn decode_tags(raw: &str) -> TagMap {
    let mut tags = TagMap::new();
    for pair in raw.split(PAIR_DELIMITER) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once(KEY_VALUE_SEPARATOR) {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (pair, DEFAULT_VALUE),
        };
        if key.is_empty() {
            warn!(segment = %pair, "Dropping tag segment with empty key");
            continue;
        }
        tags.insert(key.to_string(), value.to_string());
    }
    tags
}

/// Serialize a tag map back into its wire form
///
/// Keys are emitted in sorted order, so the encoding doubles as a stable
/// signature for a tag class.
pub fn encode_tags(tags: &TagMap) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}{}{}", k, KEY_VALUE_SEPARATOR, v))
        .collect::<Vec<_>>()
        .join(&PAIR_DELIMITER.to_string())
}

/// Read tags from the submitting process's environment, if set
pub fn tags_from_env() -> Option<TagMap> {
    std::env::var(TAGS_ENV_VAR).ok().map(|raw| decode_tags(&raw))
}
