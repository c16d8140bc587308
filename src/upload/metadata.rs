//! Upload-Metadata codec
//!
//! The wire form is a comma-separated list of `key base64(value)` pairs.
//! A key may appear without a value, which decodes to an empty value and
//! re-encodes as the bare key. Pair order is preserved in both directions.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Metadata parsing errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("empty metadata key")]
    EmptyKey,

    #[error("duplicate metadata key: {0}")]
    DuplicateKey(String),

    #[error("value for key {key:?} is not valid base64")]
    InvalidValue { key: String },

    #[error("malformed metadata pair: {0:?}")]
    MalformedPair(String),
}

impl From<MetadataError> for super::types::UploadError {
    fn from(e: MetadataError) -> Self {
        Self::InvalidMetadata(e.to_string())
    }
}

/// Ordered client metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value
    pub fn parse(header: &str) -> Result<Self, MetadataError> {
        let mut metadata = Self::new();

        if header.trim().is_empty() {
            return Ok(metadata);
        }

        for pair in header.split(',') {
            let pair = pair.trim();
            let mut parts = pair.split_whitespace();

            let key = parts.next().ok_or(MetadataError::EmptyKey)?;
            let value = match parts.next() {
                Some(encoded) => STANDARD
                    .decode(encoded)
                    .map_err(|_| MetadataError::InvalidValue { key: key.to_string() })?,
                None => Vec::new(),
            };

            if parts.next().is_some() {
                return Err(MetadataError::MalformedPair(pair.to_string()));
            }

            if metadata.contains_key(key) {
                return Err(MetadataError::DuplicateKey(key.to_string()));
            }

            metadata.entries.push((key.to_string(), value));
        }

        Ok(metadata)
    }

    /// Encode back to the header wire form
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Get a value as UTF-8, if it is valid UTF-8
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Renders as a JSON object in wire order, values as (lossy) UTF-8
impl Serialize for UploadMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, &String::from_utf8_lossy(value))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs_in_order() {
        let metadata = UploadMetadata::parse("filename YS50eHQ=,note,type dGV4dC9wbGFpbg==").unwrap();

        let keys: Vec<&str> = metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["filename", "note", "type"]);
        assert_eq!(metadata.get_str("filename"), Some("a.txt"));
        assert_eq!(metadata.get("note"), Some(&b""[..]));
        assert_eq!(metadata.get_str("type"), Some("text/plain"));
    }

    #[test]
    fn test_encode_is_identical_to_input() {
        let header = "filename YS50eHQ=,note";
        let metadata = UploadMetadata::parse(header).unwrap();
        assert_eq!(metadata.encode(), header);
    }

    #[test]
    fn test_key_without_value_is_kept() {
        let metadata = UploadMetadata::parse("filename YS50eHQ=,note").unwrap();
        assert!(metadata.contains_key("note"));
        assert_eq!(metadata.get("note"), Some(&b""[..]));
        assert!(!metadata.contains_key("missing"));
    }

    #[test]
    fn test_empty_header() {
        assert!(UploadMetadata::parse("").unwrap().is_empty());
        assert!(UploadMetadata::parse("   ").unwrap().is_empty());
        assert_eq!(UploadMetadata::new().encode(), "");
    }

    #[test]
    fn test_whitespace_around_pairs() {
        let metadata = UploadMetadata::parse(" filename YS50eHQ= , note ").unwrap();
        assert_eq!(metadata.encode(), "filename YS50eHQ=,note");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            UploadMetadata::parse("filename !!notbase64"),
            Err(MetadataError::InvalidValue { .. })
        ));
        assert!(matches!(
            UploadMetadata::parse("a YQ==,a Yg=="),
            Err(MetadataError::DuplicateKey(_))
        ));
        assert!(matches!(
            UploadMetadata::parse("a YQ== extra"),
            Err(MetadataError::MalformedPair(_))
        ));
        assert!(matches!(UploadMetadata::parse("a YQ==,,b"), Err(MetadataError::EmptyKey)));
    }

    #[test]
    fn test_serializes_as_ordered_object() {
        let metadata = UploadMetadata::parse("z eg==,a YQ==").unwrap();
        assert_eq!(serde_json::to_string(&metadata).unwrap(), r#"{"z":"z","a":"a"}"#);
    }
}
