use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{varint, DecodeError};

/// Length of a SHA-1 digest in bytes.
pub const SHA1_DIGEST_LEN: usize = 20;

/// The hash functions a [`HashCode`] can be computed with. The numeric tag is part of the
/// binary encoding of every hash and must never change for an existing variant.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha1,
}

impl HashAlgorithm {
    /// The tag written in front of the digest by [`HashCode::encode`].
    pub const fn tag(self) -> u64 {
        match self {
            HashAlgorithm::Sha1 => 0,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(HashAlgorithm::Sha1),
            other => Err(DecodeError::UnsupportedAlgorithm(other)),
        }
    }

    pub const fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => SHA1_DIGEST_LEN,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
        }
    }

    /// Number of bytes taken by an encoded hash of this algorithm.
    pub const fn encoded_len(self) -> usize {
        varint::encoded_len(self.tag()) + self.digest_len()
    }

    /// Compute the hash of `data`.
    pub fn digest(self, data: &[u8]) -> HashCode {
        match self {
            HashAlgorithm::Sha1 => {
                let mut digest = [0u8; SHA1_DIGEST_LEN];
                digest.copy_from_slice(&Sha1::digest(data));
                HashCode {
                    algorithm: self,
                    digest,
                }
            },
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashAlgorithm::Sha1),
            _ => Err(DecodeError::Malformed(format!("unknown hash name {s:?}"))),
        }
    }
}

/// A content hash, used as the storage key for every chunk.
///
/// Two hash codes are equal iff they were produced by the same algorithm and have the same
/// digest bytes. The ordering (algorithm first, then digest) is the order used by the index
/// for range scans.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HashCode {
    algorithm: HashAlgorithm,
    digest: [u8; SHA1_DIGEST_LEN],
}

impl HashCode {
    /// Hash `data` with the default algorithm.
    pub fn of(data: &[u8]) -> Self {
        HashAlgorithm::default().digest(data)
    }

    /// Build a hash from raw digest bytes.
    pub fn from_digest(algorithm: HashAlgorithm, digest: &[u8]) -> Result<Self, DecodeError> {
        let expected = algorithm.digest_len();
        let digest: [u8; SHA1_DIGEST_LEN] =
            digest
                .try_into()
                .map_err(|_| DecodeError::InvalidDigestLength {
                    expected,
                    got: digest.len(),
                })?;
        Ok(Self { algorithm, digest })
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.algorithm.digest_len()]
    }

    /// Returns true if `data` hashes to this code.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == *self
    }

    /// Append the binary form (algorithm tag followed by the digest) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        varint::put_uint(buf, self.algorithm.tag());
        buf.extend_from_slice(self.digest());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.algorithm.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a hash from `bs` starting at `offset`. Returns the hash and the offset just past
    /// it.
    pub fn decode(bs: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let (tag, offset) = varint::get_uint(bs, offset)?;
        let algorithm = HashAlgorithm::from_tag(tag)?;
        let end = offset + algorithm.digest_len();
        if end > bs.len() {
            return Err(DecodeError::Truncated {
                offset,
                needed: end - bs.len(),
            });
        }
        let hash = Self::from_digest(algorithm, &bs[offset..end])?;
        Ok((hash, end))
    }

    /// Decode a buffer that holds exactly one encoded hash.
    pub fn decode_exact(bs: &[u8]) -> Result<Self, DecodeError> {
        let (hash, offset) = Self::decode(bs, 0)?;
        if offset != bs.len() {
            return Err(DecodeError::TrailingData {
                offset,
                extra: bs.len() - offset,
            });
        }
        Ok(hash)
    }

    /// Lowercase hex form of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest())
    }

    /// Parse the digest from its hex form.
    pub fn from_hex(algorithm: HashAlgorithm, s: &str) -> Result<Self, DecodeError> {
        let digest = hex::decode(s).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        Self::from_digest(algorithm, &digest)
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.to_hex())
    }
}

/// Accepts both the bare hex form and the `name:hex` form produced by `Debug`.
impl FromStr for HashCode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, hex)) => Self::from_hex(name.parse()?, hex),
            None => Self::from_hex(HashAlgorithm::default(), s),
        }
    }
}
