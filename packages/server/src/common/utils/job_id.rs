use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derive the deterministic identifier for a job.
///
/// The id is the SHA256 of the canonical JSON encoding of
/// `{"payload": <payload>, "type": <job_type>}`. Canonicalization:
/// - Object keys are sorted (recursively)
/// - No insignificant whitespace
/// - Array order is preserved
///
/// Two submissions with the same logical content therefore always map to the
/// same id, regardless of how the client ordered the keys in its request.
pub fn derive_job_id(job_type: &str, payload: &Value) -> String {
    let mut canonical = String::new();
    canonical.push_str("{\"payload\":");
    write_canonical(payload, &mut canonical);
    canonical.push_str(",\"type\":");
    write_string(job_type, &mut canonical);
    canonical.push('}');

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `id` has the shape of a derived job id (64 lowercase hex chars).
pub fn is_job_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single serde_json encoding
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}
