use image_hasher::ImageHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("incompatible codes: {left_method}/{left_size} bits vs {right_method}/{right_size} bits")]
    Incompatible {
        left_method: HashMethod,
        left_size: u32,
        right_method: HashMethod,
        right_size: u32,
    },

    #[error("code of {size} bits needs {expected} bytes, got {found}")]
    InvalidLength {
        size: u32,
        expected: usize,
        found: usize,
    },

    #[error("bits beyond position {size} are set")]
    PaddingBitsSet { size: u32 },

    #[error("code size must be at least one bit")]
    EmptyCode,

    #[error("malformed encoded hash: {0}")]
    Encoding(String),
}

/// Perceptual hash algorithms a code can be produced with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum HashMethod {
    /// Average (mean) hash
    Ahash,
    /// Horizontal difference (gradient) hash
    Dhash,
    /// Vertical difference (gradient) hash
    DhashVertical,
    /// Mean hash over a DCT-reduced image
    Phash,
    /// Blockhash.io algorithm
    Blockhash,
}

impl HashMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashMethod::Ahash => "ahash",
            HashMethod::Dhash => "dhash",
            HashMethod::DhashVertical => "dhash-vertical",
            HashMethod::Phash => "phash",
            HashMethod::Blockhash => "blockhash",
        }
    }

    /// Bit length of the codes this method yields for a `hash_size` x `hash_size` grid,
    /// rounded up to whole bytes. Blockhash grids grow to a multiple of 4 per side.
    pub fn code_bits(&self, hash_size: u32) -> u32 {
        let side = match self {
            HashMethod::Blockhash => hash_size.next_multiple_of(4),
            _ => hash_size,
        };
        (side * side).div_ceil(8) * 8
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-length binary fingerprint tagged with the method that produced it.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8`. Codes are only comparable
/// with codes of the same method and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EncodedCode", into = "EncodedCode")]
pub struct Code {
    method: HashMethod,
    size: u32,
    bytes: Box<[u8]>,
}

impl Code {
    pub fn new(method: HashMethod, size: u32, bytes: impl Into<Box<[u8]>>) -> Result<Self, CodeError> {
        let bytes = bytes.into();
        if size == 0 {
            return Err(CodeError::EmptyCode);
        }

        let expected = size.div_ceil(8) as usize;
        if bytes.len() != expected {
            return Err(CodeError::InvalidLength {
                size,
                expected,
                found: bytes.len(),
            });
        }

        let tail = size % 8;
        if tail != 0 {
            let mask = !((1u8 << tail) - 1);
            if bytes[expected - 1] & mask != 0 {
                return Err(CodeError::PaddingBitsSet { size });
            }
        }

        Ok(Self {
            method,
            size,
            bytes,
        })
    }

    /// Build a code of up to 64 bits from `value`, which must fit in `size` bits.
    pub fn from_u64(method: HashMethod, size: u32, value: u64) -> Result<Self, CodeError> {
        if size > 64 {
            return Err(CodeError::InvalidLength {
                size,
                expected: size.div_ceil(8) as usize,
                found: 8,
            });
        }
        if size < 64 && value >> size != 0 {
            return Err(CodeError::PaddingBitsSet { size });
        }
        let len = size.div_ceil(8) as usize;
        Self::new(method, size, value.to_le_bytes()[..len].to_vec())
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_compatible(&self, other: &Code) -> bool {
        self.method == other.method && self.size == other.size
    }

    pub fn check_compatible(&self, other: &Code) -> Result<(), CodeError> {
        if self.is_compatible(other) {
            Ok(())
        } else {
            Err(CodeError::Incompatible {
                left_method: self.method,
                left_size: self.size,
                right_method: other.method,
                right_size: other.size,
            })
        }
    }

    /// Hamming distance to `other`.
    pub fn distance(&self, other: &Code) -> Result<u32, CodeError> {
        self.check_compatible(other)?;
        Ok(self.hamming(other))
    }

    pub fn equals(&self, other: &Code) -> Result<bool, CodeError> {
        Ok(self.distance(other)? == 0)
    }

    /// Hamming distance without the compatibility check. Callers must have
    /// verified compatibility already.
    pub(crate) fn hamming(&self, other: &Code) -> u32 {
        debug_assert!(self.is_compatible(other));
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn to_base64(&self) -> String {
        ImageHash::<Box<[u8]>>::from_bytes(&self.bytes)
            .map(|hash| hash.to_base64())
            .unwrap_or_default()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.method, self.size, self.to_base64())
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedCode {
    method: HashMethod,
    size: u32,
    hash: String,
}

impl From<Code> for EncodedCode {
    fn from(code: Code) -> Self {
        Self {
            hash: code.to_base64(),
            method: code.method,
            size: code.size,
        }
    }
}

impl TryFrom<EncodedCode> for Code {
    type Error = CodeError;

    fn try_from(encoded: EncodedCode) -> Result<Self, Self::Error> {
        let hash = ImageHash::<Box<[u8]>>::from_base64(&encoded.hash)
            .map_err(|e| CodeError::Encoding(format!("{:?}", e)))?;
        Code::new(encoded.method, encoded.size, hash.as_bytes().to_vec())
    }
}
