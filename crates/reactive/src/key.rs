//! Query-key fingerprints: a canonical stable serialization (sorted object
//! keys, ignore-set dropped) hashed to a 128-bit hex string. Two keys with
//! equal canonical form are the same query.

use serde_json::Value as JsonValue;
use sha2::{
    Digest,
    Sha256,
};

pub type QueryKey = Vec<JsonValue>;

/// Canonical form of one key segment: object keys sorted, keys in `ignore`
/// dropped at any depth, arrays kept in order.
pub fn canonical_segment(value: &JsonValue, ignore: &[&str]) -> String {
    let mut out = String::new();
    write_canonical(value, ignore, &mut out);
    out
}

fn write_canonical(value: &JsonValue, ignore: &[&str], out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !ignore.contains(&k.as_str()))
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], ignore, out);
            }
            out.push('}');
        },
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, ignore, out);
            }
            out.push(']');
        },
        other => out.push_str(&other.to_string()),
    }
}

fn hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprint of a whole key.
pub fn hash_key(key: &QueryKey, ignore: &[&str]) -> String {
    let canonical: Vec<String> = key.iter().map(|v| canonical_segment(v, ignore)).collect();
    hash(&canonical.join("\u{1f}"))
}

/// Fingerprint of one segment, used for prefix matching.
pub fn hash_segment(value: &JsonValue, ignore: &[&str]) -> String {
    hash(&canonical_segment(value, ignore))
}

/// Partial-prefix match: every prefix segment must hash-equal the
/// corresponding segment of `key`.
pub fn prefix_matches(prefix: &QueryKey, key: &QueryKey, ignore: &[&str]) -> bool {
    if prefix.len() > key.len() {
        return false;
    }
    prefix
        .iter()
        .zip(key.iter())
        .all(|(p, k)| hash_segment(p, ignore) == hash_segment(k, ignore))
}
