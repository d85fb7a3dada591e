//! Content identifiers.
//!
//! A `Cid` is laid out like an IPFS CIDv1:
//!
//! - version byte `0x01`
//! - codec: `0x71` (dag-cbor, structured blocks) or `0x55` (raw bytes)
//! - multihash: `0x12` (sha2-256), length `0x20`, then the 32-byte digest
//!
//! The text form is multibase base16 lowercase (`f` prefix), e.g.
//! `f01711220<64 hex digits>`. All codecs here fit in a single varint byte,
//! so no general varint support is needed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const CID_VERSION_1: u8 = 0x01;
pub const MULTIHASH_SHA2_256: u8 = 0x12;
pub const SHA2_256_LEN: u8 = 0x20;
pub const MULTIBASE_BASE16_LOWER: char = 'f';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    DagCbor,
    Raw,
}

impl Codec {
    pub const fn code(self) -> u8 {
        match self {
            Codec::DagCbor => 0x71,
            Codec::Raw => 0x55,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x71 => Some(Codec::DagCbor),
            0x55 => Some(Codec::Raw),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidParseError {
    #[error("missing multibase prefix `{MULTIBASE_BASE16_LOWER}` in `{0}`")]
    Multibase(String),
    #[error("invalid hex in `{0}`")]
    Hex(String),
    #[error("unsupported cid layout: {0}")]
    Layout(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    codec: Codec,
    digest: [u8; 32],
}

impl Cid {
    /// Hash `bytes` and address them under `codec`.
    pub fn for_bytes(codec: Codec, bytes: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        Self { codec, digest }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// True if `bytes` hash to this CID's digest.
    pub fn verifies(&self, bytes: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        digest == self.digest
    }

    /// Binary form: version, codec, multihash code, digest length, digest.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32);
        out.push(CID_VERSION_1);
        out.push(self.codec.code());
        out.push(MULTIHASH_SHA2_256);
        out.push(SHA2_256_LEN);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidParseError> {
        if bytes.len() != 36 {
            return Err(CidParseError::Layout(format!(
                "expected 36 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != CID_VERSION_1 {
            return Err(CidParseError::Layout(format!("version {:#04x}", bytes[0])));
        }
        let codec = Codec::from_code(bytes[1])
            .ok_or_else(|| CidParseError::Layout(format!("codec {:#04x}", bytes[1])))?;
        if bytes[2] != MULTIHASH_SHA2_256 || bytes[3] != SHA2_256_LEN {
            return Err(CidParseError::Layout("multihash is not sha2-256".to_string()));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[4..]);
        Ok(Self { codec, digest })
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MULTIBASE_BASE16_LOWER}")?;
        for b in self.to_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(MULTIBASE_BASE16_LOWER)
            .ok_or_else(|| CidParseError::Multibase(s.to_string()))?;
        if hex.len() % 2 != 0 {
            return Err(CidParseError::Hex(s.to_string()));
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte = hex
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| CidParseError::Hex(s.to_string()))?;
            bytes.push(byte);
        }
        Cid::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
