//! Hashing utilities.

use displaydoc::Display;
use serde::{de, ser, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreResult;

/// A content hash.
///
/// The canonical representation is a typed hex string, `sha256:<64 hex chars>`,
/// used both as the database key for blocks and as the on-disk shard key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentHash {
    /// A SHA-256 hash.
    Sha256([u8; 32]),
}

/// A hashing error.
#[derive(Debug, Display)]
pub enum Error {
    /// The string lacks a colon separator.
    NoColonSeparator,

    /// Hash algorithm {0} is not supported.
    UnsupportedHashAlgorithm(String),

    /// Invalid hex hash: {0}
    InvalidHexHash(hex::FromHexError),

    /// Invalid length for {typ} hex string: expected {expected}, got {actual}.
    InvalidHashStringLength {
        typ: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ContentHash {
    /// Hashes a byte slice.
    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Parses a typed hash string such as `sha256:<hex>`.
    pub fn from_typed(s: &str) -> CoreResult<Self> {
        let colon = s.find(':').ok_or(Error::NoColonSeparator)?;
        let (typ, rest) = s.split_at(colon);
        let hash = &rest[1..];

        match typ {
            "sha256" => {
                let v = decode_hex(hash, "SHA-256", 32)?;
                Ok(Self::Sha256(v.try_into().unwrap()))
            }
            _ => Err(Error::UnsupportedHashAlgorithm(typ.to_owned()).into()),
        }
    }

    /// Returns the typed hex representation, e.g. `sha256:abcd...`.
    pub fn to_typed_hex(&self) -> String {
        format!("{}:{}", self.algorithm(), hex::encode(self.data()))
    }

    /// Returns the bare hex digest, with no algorithm prefix.
    ///
    /// Used directly as the CAS shard filename.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data())
    }

    /// Returns the first `n` hex characters, used as the shard directory name.
    pub fn shard_prefix(&self, n: usize) -> String {
        let hex = self.to_hex();
        hex[..n].to_owned()
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Sha256(d) => d,
        }
    }

    /// Returns the raw digest bytes, used to derive a convergent block key.
    pub fn raw_bytes(&self) -> &[u8; 32] {
        match self {
            Self::Sha256(d) => d,
        }
    }

    fn algorithm(&self) -> &'static str {
        match self {
            Self::Sha256(_) => "sha256",
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        String::deserialize(deserializer)
            .and_then(|s| Self::from_typed(&s).map_err(|e| Error::custom(e.to_string())))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_typed_hex())
    }
}

fn decode_hex<'s>(s: &'s str, typ: &'static str, expected_bytes: usize) -> CoreResult<Vec<u8>> {
    let expected = expected_bytes * 2;

    if s.len() != expected {
        return Err(Error::InvalidHashStringLength {
            typ,
            expected,
            actual: s.len(),
        }
        .into());
    }

    let v = hex::decode(s).map_err(Error::InvalidHexHash)?;
    assert!(v.len() == expected_bytes);

    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_basic() {
        let hash = ContentHash::sha256_from_bytes(b"hello world");
        let expected = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert_eq!(expected, hash.to_typed_hex());
    }

    #[test]
    fn test_roundtrip() {
        let hash = ContentHash::sha256_from_bytes(b"roundtrip me");
        let typed = hash.to_typed_hex();
        assert_eq!(ContentHash::from_typed(&typed).unwrap(), hash);
    }

    #[test]
    fn test_shard_prefix() {
        let hash = ContentHash::sha256_from_bytes(b"shard me");
        let prefix = hash.shard_prefix(2);
        assert_eq!(prefix.len(), 2);
        assert!(hash.to_hex().starts_with(&prefix));
    }

    #[test]
    fn test_from_typed_errors() {
        assert!(matches!(
            ContentHash::from_typed("sha256"),
            Err(CoreError::HashError(Error::NoColonSeparator))
        ));

        assert!(matches!(
            ContentHash::from_typed("sha256:"),
            Err(CoreError::HashError(Error::InvalidHashStringLength { .. }))
        ));

        assert!(matches!(
            ContentHash::from_typed("md5:invalid"),
            Err(CoreError::HashError(Error::UnsupportedHashAlgorithm(alg))) if alg == "md5"
        ));
    }
}
