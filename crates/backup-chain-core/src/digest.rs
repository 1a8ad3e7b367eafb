use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{BackupError, Metadata};

const READ_CHUNK: usize = 64 * 1024;

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stream a reader through SHA-256 without buffering it whole.
///
/// # Errors
/// Returns the underlying read error.
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Content hash of a file's raw bytes.
///
/// # Errors
/// Returns [`BackupError::Io`] when the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, BackupError> {
    let file = File::open(path).map_err(|err| BackupError::io(path, err))?;
    sha256_reader(BufReader::new(file)).map_err(|err| BackupError::io(path, err))
}

/// Serialize a JSON value with object keys sorted at every depth and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical form of a block metadata map.
#[must_use]
pub fn canonical_metadata(metadata: &Metadata) -> String {
    let mut out = String::from("{");
    for (index, (key, value)) in metadata.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(value, &mut out);
    }
    out.push('}');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, child)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, child) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(child, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sha256_of_empty_input_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn reader_and_slice_digests_agree() {
        let payload = vec![7_u8; READ_CHUNK * 2 + 13];
        let streamed = sha256_reader(payload.as_slice());
        assert!(matches!(streamed, Ok(ref digest) if *digest == sha256_hex(&payload)));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [true, null], "m": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":"x","z":[true,null]},"b":1}"#);
    }

    #[test]
    fn canonical_metadata_ignores_insertion_order() {
        let mut first = Metadata::new();
        first.insert("total_rows".to_string(), json!(10));
        first.insert("db_size".to_string(), json!({"pages": 2, "bytes": 8192}));

        let mut second = Metadata::new();
        second.insert("db_size".to_string(), json!({"bytes": 8192, "pages": 2}));
        second.insert("total_rows".to_string(), json!(10));

        assert_eq!(canonical_metadata(&first), canonical_metadata(&second));
        assert_eq!(
            canonical_metadata(&first),
            r#"{"db_size":{"bytes":8192,"pages":2},"total_rows":10}"#
        );
    }
}
