//! Digests and the streamed hasher.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnugError};

/// Fixed block size used by the streaming hasher. 64 KiB: large enough to
/// amortize syscall overhead, small enough to keep memory use flat
/// regardless of input size.
const STREAM_BLOCK_SIZE: usize = 64 * 1024;

/// The closed algorithm enumeration the core recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha1,
    Md5,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Sha256
    }
}

impl Algorithm {
    /// MD5 is accepted on parse for interoperability but an archiver must
    /// never choose it on its own; only `Sha256` and `Sha1` are valid
    /// *primary* write-time algorithms.
    pub fn is_valid_primary(&self) -> bool {
        matches!(self, Algorithm::Sha256 | Algorithm::Sha1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha1 => "sha1",
            Algorithm::Md5 => "md5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Algorithm::Sha256),
            "sha1" => Some(Algorithm::Sha1),
            "md5" => Some(Algorithm::Md5),
            _ => None,
        }
    }

    fn select_hasher(&self) -> Box<dyn sha2::digest::DynDigest> {
        match self {
            Algorithm::Sha256 => Box::new(sha2::Sha256::default()),
            Algorithm::Sha1 => Box::new(sha1::Sha1::default()),
            Algorithm::Md5 => Box::new(md5::Md5::default()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(algorithm, bytes)`. Two digests compare equal only if both the
/// algorithm and the bytes match.
#[derive(Clone, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: Algorithm,
    bytes: Vec<u8>,
}

impl Digest {
    pub fn new(algorithm: Algorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    /// Parses a canonical lowercase-hex digest string for the given
    /// algorithm.
    pub fn from_hex(algorithm: Algorithm, hex: &str) -> Result<Self> {
        let mut bytes = vec![0u8; hex.len() / 2];
        base16ct::lower::decode(hex.as_bytes(), &mut bytes).map_err(|_| SnugError::InvalidFormat {
            reason: format!("invalid hex digest: {hex}"),
        })?;
        Ok(Self { algorithm, bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Canonical form: lowercase hexadecimal of the digest bytes.
    pub fn to_hex(&self) -> String {
        base16ct::lower::encode_string(&self.bytes)
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.bytes == other.bytes
    }
}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.algorithm.hash(state);
        self.bytes.hash(state);
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streamed hash computation over bytes.
pub struct Hasher;

impl Hasher {
    /// Hashes an in-memory byte slice in one shot.
    pub fn hash_bytes(algorithm: Algorithm, bytes: &[u8]) -> Digest {
        let mut hasher = algorithm.select_hasher();
        hasher.update(bytes);
        Digest::new(algorithm, hasher.finalize().to_vec())
    }

    /// Hashes a reader without requiring the whole input in memory: reads
    /// fixed-size blocks and folds them into a running digest state.
    /// Propagates I/O errors from the reader unchanged.
    pub fn hash_stream(algorithm: Algorithm, mut reader: impl Read) -> std::io::Result<Digest> {
        let mut hasher = algorithm.select_hasher();
        let mut buf = vec![0u8; STREAM_BLOCK_SIZE];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Digest::new(algorithm, hasher.finalize().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_matches_known_vectors() {
        let digest = Hasher::hash_bytes(Algorithm::Sha256, b"hello");
        assert_eq!(
            digest.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hash_stream_matches_hash_bytes() {
        let bytes = b"the quick brown fox jumps over the lazy dog".repeat(10_000);
        let from_bytes = Hasher::hash_bytes(Algorithm::Sha256, &bytes);
        let from_stream = Hasher::hash_stream(Algorithm::Sha256, &bytes[..]).unwrap();
        assert_eq!(from_bytes, from_stream);
    }

    #[test]
    fn digest_equality_requires_matching_algorithm() {
        let a = Digest::new(Algorithm::Sha256, vec![1, 2, 3]);
        let b = Digest::new(Algorithm::Sha1, vec![1, 2, 3]);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trips() {
        let digest = Hasher::hash_bytes(Algorithm::Sha1, b"round trip me");
        let parsed = Digest::from_hex(Algorithm::Sha1, &digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
    }
}
