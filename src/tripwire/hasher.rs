//! BLAKE3 hashing of strings and JSON documents.

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a JSON value in canonical form (object keys sorted at every depth),
/// so logically equal documents hash equally regardless of key order.
pub fn hash_json(value: &serde_json::Value) -> String {
    let mut hasher = blake3::Hasher::new();
    write_canonical(value, &mut hasher);
    format!("blake3:{}", hasher.finalize().to_hex())
}

fn write_canonical(value: &serde_json::Value, hasher: &mut blake3::Hasher) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                // Keys are JSON-escaped so a key cannot forge a separator.
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                if let Some(v) = map.get(key) {
                    write_canonical(v, hasher);
                }
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}
