//! Block fingerprinting: MD5, SHA-1, SHA-256 and SHA-512 digests

use crate::error::DedupError;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

/// Longest digest any supported algorithm produces (SHA-512).
pub const MAX_DIGEST_LEN: usize = 64;

/// Hash algorithm used to fingerprint blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5, 16-byte digests
    Md5,
    /// SHA-1, 20-byte digests
    Sha1,
    /// SHA-256, 32-byte digests
    Sha256,
    /// SHA-512, 64-byte digests
    Sha512,
}

impl HashAlgorithm {
    /// Every supported algorithm, in ascending digest size.
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
    ];

    /// Digest length in bytes. Also the trail record length.
    pub const fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Upper-case display name (`MD5`, `SHA1`, `SHA256`, `SHA512`)
    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }
}

impl HashAlgorithm {
    /// Lower-case tag, as in namespace names and serialized configs
    pub const fn tag(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(DedupError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// A fixed-length block digest. Its length always equals the
/// `digest_size()` of the algorithm that produced it.
#[derive(Clone, Copy)]
pub struct Digest {
    bytes: [u8; MAX_DIGEST_LEN],
    len: usize,
}

impl Digest {
    /// Wrap raw digest bytes, e.g. a record read back from a trail file.
    /// Returns `None` if `bytes` is longer than any supported digest.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_DIGEST_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_DIGEST_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: buf,
            len: bytes.len(),
        })
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Digest length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True only for the degenerate zero-length digest
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Digest {}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute the digest of `data` with `algorithm`. Pure and deterministic.
pub fn digest(data: &[u8], algorithm: HashAlgorithm) -> Digest {
    let mut buf = [0u8; MAX_DIGEST_LEN];
    let len = algorithm.digest_size();
    match algorithm {
        HashAlgorithm::Md5 => buf[..len].copy_from_slice(&md5::Md5::digest(data)),
        HashAlgorithm::Sha1 => buf[..len].copy_from_slice(&sha1::Sha1::digest(data)),
        HashAlgorithm::Sha256 => buf[..len].copy_from_slice(&sha2::Sha256::digest(data)),
        HashAlgorithm::Sha512 => buf[..len].copy_from_slice(&sha2::Sha512::digest(data)),
    }
    Digest { bytes: buf, len }
}
