//! Manifest schema and per-entry validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{payload_path, ArchiveError, PAYLOAD_DIR};
use crate::descriptor::{extension_for, AudioFormat, DescriptorMeta, SynthesisDescriptor, DEFAULT_FORMAT};
use crate::key::CacheKey;

pub const MANIFEST_VERSION: u64 = 1;

/// `manifest.json` as written by export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub bytes: u64,
    pub meta: DescriptorMeta,
    pub file: String,
}

/// Manifest as read back on import. Entry fields stay untyped until
/// [`validate_entry`] checks them one rule at a time.
#[derive(Debug, Deserialize)]
pub(crate) struct RawManifest {
    #[serde(default)]
    pub entries: Vec<RawEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawEntry {
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub bytes: Option<Value>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub file: Option<Value>,
}

/// An entry that passed every check, paired with its payload.
#[derive(Debug)]
pub(crate) struct ValidatedEntry {
    pub key: CacheKey,
    pub meta: DescriptorMeta,
    pub payload: Vec<u8>,
}

/// Check the `version` field before anything else is interpreted.
pub(crate) fn check_version(manifest: &Value) -> Result<(), ArchiveError> {
    let version = manifest.get("version").and_then(Value::as_u64);
    if version != Some(MANIFEST_VERSION) {
        return Err(ArchiveError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Validate one entry against the payloads present in the archive. Checks run in a
/// fixed order and the first failure is returned.
pub(crate) fn validate_entry(
    index: usize,
    entry: &RawEntry,
    payloads: &HashMap<String, Vec<u8>>,
) -> Result<ValidatedEntry, ArchiveError> {
    let key = entry
        .key
        .as_ref()
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty() && !k.contains(['/', '\\']))
        .ok_or(ArchiveError::InvalidKey { index })?
        .to_string();

    let path = entry
        .file
        .as_ref()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !is_namespaced_path(&path) {
        return Err(ArchiveError::UnsafePath { index, key, path });
    }

    let Some(extension) = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rfind('.').map(|dot| &name[dot..]))
        .filter(|ext| AudioFormat::from_extension(ext).is_some())
    else {
        return Err(ArchiveError::UnsupportedExtension { index, key, path });
    };
    let extension = extension.to_string();

    let expected = payload_path(&key, &extension);
    if path != expected {
        return Err(ArchiveError::PathMismatch {
            index,
            key,
            path,
            expected,
        });
    }

    let format = entry
        .meta
        .as_ref()
        .and_then(|m| m.get("format"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_FORMAT)
        .to_string();
    if extension_for(&format) != extension {
        return Err(ArchiveError::FormatMismatch {
            index,
            key,
            format,
            extension,
        });
    }

    let Some(payload) = payloads.get(&path) else {
        return Err(ArchiveError::MissingPayload { index, key, path });
    };

    let declared = entry.bytes.as_ref().and_then(Value::as_i64).unwrap_or(0);
    if declared <= 0 || declared as u64 != payload.len() as u64 {
        return Err(ArchiveError::ByteLengthMismatch {
            index,
            key,
            declared,
            actual: payload.len() as u64,
        });
    }

    let meta = entry
        .meta
        .as_ref()
        .filter(|m| m.get("text").and_then(Value::as_str).is_some())
        .and_then(|m| serde_json::from_value::<SynthesisDescriptor>(m.clone()).ok())
        .map(|d| d.resolve())
        .filter(|m| !m.text.is_empty());
    let Some(meta) = meta else {
        return Err(ArchiveError::InvalidMetadata { index, key });
    };

    Ok(ValidatedEntry {
        key: CacheKey::from_raw(key),
        meta,
        payload: payload.clone(),
    })
}

/// `clips/...` with no empty, `.` or `..` segments, no backslashes, not absolute.
fn is_namespaced_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix(PAYLOAD_DIR).and_then(|r| r.strip_prefix('/')) else {
        return false;
    };
    !path.contains('\\')
        && !rest.is_empty()
        && rest
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "v1-0123456789abcdef";

    fn entry(value: Value) -> RawEntry {
        serde_json::from_value(value).unwrap()
    }

    fn good() -> Value {
        json!({
            "key": KEY,
            "bytes": 3,
            "meta": {"text": "Well done", "lang": "en-US", "voice": "nova", "model": "tts-1",
                     "rate": 1.0, "pitch": 0.0, "format": "mp3"},
            "file": format!("clips/{KEY}.mp3"),
        })
    }

    fn payloads() -> HashMap<String, Vec<u8>> {
        HashMap::from([(format!("clips/{KEY}.mp3"), vec![1, 2, 3])])
    }

    fn check(value: Value) -> Result<ValidatedEntry, ArchiveError> {
        validate_entry(0, &entry(value), &payloads())
    }

    #[test]
    fn accepts_well_formed_entry() {
        let validated = check(good()).unwrap();
        assert_eq!(validated.key.as_str(), KEY);
        assert_eq!(validated.meta.voice, "nova");
        assert_eq!(validated.payload, vec![1, 2, 3]);
    }

    #[test]
    fn version_must_be_supported() {
        assert!(check_version(&json!({"version": 1})).is_ok());
        assert!(matches!(
            check_version(&json!({"version": 2})),
            Err(ArchiveError::UnsupportedVersion(Some(2)))
        ));
        assert!(matches!(
            check_version(&json!({})),
            Err(ArchiveError::UnsupportedVersion(None))
        ));
    }

    #[test]
    fn rejects_keys_with_separators() {
        let mut v = good();
        v["key"] = json!("../evil");
        assert!(matches!(check(v), Err(ArchiveError::InvalidKey { index: 0 })));
        let mut v = good();
        v["key"] = json!(7);
        assert!(matches!(check(v), Err(ArchiveError::InvalidKey { .. })));
    }

    #[test]
    fn rejects_traversal_and_foreign_paths() {
        for path in ["clips/../manifest.json", "/clips/x.mp3", "other/x.mp3", "clips//x.mp3", "clips\\x.mp3"] {
            let mut v = good();
            v["file"] = json!(path);
            assert!(
                matches!(check(v), Err(ArchiveError::UnsafePath { .. })),
                "{path} accepted"
            );
        }
    }

    #[test]
    fn rejects_unknown_extension_then_mismatched_path() {
        let mut v = good();
        v["file"] = json!(format!("clips/{KEY}.exe"));
        assert!(matches!(check(v), Err(ArchiveError::UnsupportedExtension { .. })));

        let mut v = good();
        v["file"] = json!("clips/v1-ffffffffffffffff.mp3");
        assert!(matches!(check(v), Err(ArchiveError::PathMismatch { .. })));
    }

    #[test]
    fn rejects_format_that_disagrees_with_extension() {
        let mut v = good();
        v["meta"]["format"] = json!("wav");
        assert!(matches!(check(v), Err(ArchiveError::FormatMismatch { .. })));
    }

    #[test]
    fn rejects_missing_payload_and_wrong_length() {
        let mut v = good();
        v["key"] = json!("v1-1111111111111111");
        v["file"] = json!("clips/v1-1111111111111111.mp3");
        assert!(matches!(check(v), Err(ArchiveError::MissingPayload { .. })));

        let mut v = good();
        v["bytes"] = json!(4);
        assert!(matches!(
            check(v),
            Err(ArchiveError::ByteLengthMismatch { declared: 4, actual: 3, .. })
        ));
        let mut v = good();
        v["bytes"] = json!(0);
        assert!(matches!(check(v), Err(ArchiveError::ByteLengthMismatch { .. })));
    }

    #[test]
    fn rejects_metadata_without_text() {
        let mut v = good();
        v["meta"]["text"] = json!(12);
        assert!(matches!(check(v), Err(ArchiveError::InvalidMetadata { .. })));
        let mut v = good();
        v.as_object_mut().unwrap().remove("meta");
        assert!(matches!(check(v), Err(ArchiveError::InvalidMetadata { .. })));
    }
}
