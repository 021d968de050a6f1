//! Archive checksums
//!
//! The hash algorithm is inferred from the hex length of the expected
//! checksum: 32 is MD5, 40 is SHA-1, 64 is SHA-256 and 128 is SHA-512.
//! An empty checksum means no verification was requested.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Pick the algorithm matching a hex checksum's length
    pub fn for_checksum(checksum: &str) -> Option<Self> {
        match checksum.len() {
            32 => Some(Self::Md5),
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Lowercase hex digest of `data`
    pub fn digest_hex(self, data: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(data)),
            Self::Sha1 => hex::encode(Sha1::digest(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("No hash algorithm for {bits}bit checksums")]
    UnsupportedLength { bits: usize },

    #[error("{algorithm} mismatch (expected {expected}, got {actual})")]
    Mismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
}

/// Outcome of a successful verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// No checksum was supplied
    Skipped,
    Verified(ChecksumAlgorithm),
}

/// Verify `data` against a hex checksum
pub fn verify(data: &[u8], checksum: &str) -> Result<Verification, ChecksumError> {
    let checksum = checksum.trim();
    if checksum.is_empty() {
        return Ok(Verification::Skipped);
    }

    let algorithm =
        ChecksumAlgorithm::for_checksum(checksum).ok_or(ChecksumError::UnsupportedLength {
            bits: checksum.len() * 4,
        })?;
    let actual = algorithm.digest_hex(data);
    let expected = checksum.to_ascii_lowercase();

    tracing::debug!("Checksum result (data: {}, expected: {})", actual, expected);
    if actual != expected {
        return Err(ChecksumError::Mismatch {
            algorithm: algorithm.name(),
            expected,
            actual,
        });
    }
    Ok(Verification::Verified(algorithm))
}

/// A checksum is usable when it has a supported length and is all hex
pub fn is_valid_checksum(checksum: &str) -> bool {
    ChecksumAlgorithm::for_checksum(checksum).is_some()
        && checksum.chars().all(|c| c.is_ascii_hexdigit())
}

/// Strip everything but ASCII alphanumerics
pub fn normalize_checksum(checksum: &str) -> String {
    checksum
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Lowercase SHA-256 hex of a string, used for stable repository ids
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
