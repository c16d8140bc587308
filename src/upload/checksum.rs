//! Chunk checksum verification
//!
//! Backs the tus checksum extension. The algorithm registry is fixed;
//! an unknown algorithm is reported separately from a digest mismatch so
//! the caller can pick the right status code.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use super::types::UploadError;

/// Checksum errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("{algorithm} checksum mismatch")]
    Mismatch { algorithm: ChecksumAlgorithm },

    #[error("malformed checksum header: {0}")]
    Malformed(String),
}

impl From<ChecksumError> for UploadError {
    fn from(e: ChecksumError) -> Self {
        match e {
            ChecksumError::UnsupportedAlgorithm(name) => Self::UnsupportedAlgorithm(name),
            ChecksumError::Mismatch { .. } => Self::ChecksumMismatch,
            ChecksumError::Malformed(msg) => Self::BadRequest(msg),
        }
    }
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Names of all supported algorithms, as advertised to clients
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|a| a.name()).collect()
    }

    /// Compute the raw digest of `data`
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Md5 => Md5::digest(data).to_vec(),
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| ChecksumError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Client-supplied checksum for one chunk
///
/// The algorithm is kept as the raw name so that an unsupported algorithm
/// is only rejected when the chunk is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: String,
    pub digest: Vec<u8>,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, digest: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: algorithm.into(),
            digest: digest.into(),
        }
    }

    /// Parse an `Upload-Checksum` header: `<algorithm> <base64 digest>`
    pub fn parse_header(value: &str) -> Result<Self, ChecksumError> {
        let mut parts = value.split_whitespace();

        let (Some(algorithm), Some(encoded), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ChecksumError::Malformed(format!(
                "expected \"<algorithm> <digest>\", got {:?}",
                value
            )));
        };

        let digest = STANDARD
            .decode(encoded)
            .map_err(|_| ChecksumError::Malformed("digest is not valid base64".to_string()))?;

        Ok(Self::new(algorithm, digest))
    }

    /// Verify `chunk` against this checksum
    pub fn verify(&self, chunk: &[u8]) -> Result<(), ChecksumError> {
        let algorithm: ChecksumAlgorithm = self.algorithm.parse()?;
        if verify(algorithm.name(), &self.digest, chunk)? {
            Ok(())
        } else {
            Err(ChecksumError::Mismatch { algorithm })
        }
    }
}

/// Check `chunk` against `expected` using the named algorithm
///
/// Returns `Ok(false)` on a digest mismatch and an error only for an
/// unsupported algorithm name.
pub fn verify(algorithm: &str, expected: &[u8], chunk: &[u8]) -> Result<bool, ChecksumError> {
    let algorithm: ChecksumAlgorithm = algorithm.parse()?;
    let actual = algorithm.digest(chunk);

    if actual != expected {
        tracing::debug!(
            algorithm = %algorithm,
            expected = %hex::encode(expected),
            actual = %hex::encode(&actual),
            "Chunk checksum mismatch"
        );
        return Ok(false);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sha256_vector() {
        let digest = ChecksumAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_known_md5_and_sha1_vectors() {
        assert_eq!(
            hex::encode(ChecksumAlgorithm::Md5.digest(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hex::encode(ChecksumAlgorithm::Sha1.digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_digest_lengths() {
        let lengths: Vec<usize> = ChecksumAlgorithm::ALL
            .iter()
            .map(|a| a.digest(b"data").len())
            .collect();
        assert_eq!(lengths, vec![16, 20, 28, 32, 48, 64]);
    }

    #[test]
    fn test_verify_match_and_mismatch() {
        let chunk = b"hello chunk";
        let digest = ChecksumAlgorithm::Sha512.digest(chunk);

        assert_eq!(verify("sha512", &digest, chunk), Ok(true));
        assert_eq!(verify("sha512", &digest, b"other chunk"), Ok(false));
    }

    #[test]
    fn test_unsupported_algorithm_is_distinct() {
        assert_eq!(
            verify("crc32", b"", b"data"),
            Err(ChecksumError::UnsupportedAlgorithm("crc32".to_string()))
        );
        assert!(matches!(
            UploadError::from(ChecksumError::UnsupportedAlgorithm("crc32".into())),
            UploadError::UnsupportedAlgorithm(_)
        ));
        assert!(matches!(
            UploadError::from(ChecksumError::Mismatch { algorithm: ChecksumAlgorithm::Md5 }),
            UploadError::ChecksumMismatch
        ));
    }

    #[test]
    fn test_parse_header() {
        let digest = ChecksumAlgorithm::Sha1.digest(b"x");
        let header = format!("sha1 {}", STANDARD.encode(&digest));

        let checksum = Checksum::parse_header(&header).unwrap();
        assert_eq!(checksum.algorithm, "sha1");
        assert_eq!(checksum.digest, digest);
        assert!(checksum.verify(b"x").is_ok());
        assert!(matches!(
            checksum.verify(b"y"),
            Err(ChecksumError::Mismatch { algorithm: ChecksumAlgorithm::Sha1 })
        ));
    }

    #[test]
    fn test_parse_header_rejects_malformed() {
        assert!(matches!(Checksum::parse_header("sha1"), Err(ChecksumError::Malformed(_))));
        assert!(matches!(
            Checksum::parse_header("sha1 !!!"),
            Err(ChecksumError::Malformed(_))
        ));
        assert!(matches!(
            Checksum::parse_header("sha1 YQ== extra"),
            Err(ChecksumError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_algorithm_parses_but_fails_verify() {
        let checksum = Checksum::parse_header("crc32 YQ==").unwrap();
        assert!(matches!(
            checksum.verify(b"a"),
            Err(ChecksumError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_names_advertised() {
        assert_eq!(
            ChecksumAlgorithm::names(),
            vec!["md5", "sha1", "sha224", "sha256", "sha384", "sha512"]
        );
    }
}
