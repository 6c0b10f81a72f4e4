use alloy_primitives::Address;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bitmap carries {bits} bits but the signer set has {signers} entries")]
    ShortBitmap { bits: usize, signers: usize },
    #[error("bitmap marks signer index {index} but the signer set has {signers} entries")]
    UnknownSigner { index: usize, signers: usize },
}

/// Consensus participation bits for one block, one bit per elected signer.
///
/// Bit `i` always refers to the signer at position `i` of the *current elected
/// signer* list, never to registration order. A set bit means the signer
/// contributed to the parent aggregated seal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureBitmap {
    // bit i lives at bytes[i / 8] >> (i % 8)
    bytes: Vec<u8>,
    len: usize,
}

impl SignatureBitmap {
    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut bytes = Vec::new();
        let mut len = 0;
        for bit in bits {
            if len % 8 == 0 {
                bytes.push(0);
            }
            if bit {
                bytes[len / 8] |= 1 << (len % 8);
            }
            len += 1;
        }
        Self { bytes, len }
    }

    /// Reads the big-endian integer stored in an aggregated seal as a bitmap of
    /// exactly `width` bits.
    ///
    /// The seal encodes the bitmap as an integer, so high bits that are zero are
    /// not transmitted and are zero by definition. A bit set at or beyond
    /// `width` refers to a signer that does not exist in the set.
    pub fn from_seal_integer(be_bytes: &[u8], width: usize) -> Result<Self, DecodeError> {
        let mut bytes: Vec<u8> = be_bytes.iter().rev().copied().collect();
        if let Some(index) = highest_set_bit(&bytes) {
            if index >= width {
                return Err(DecodeError::UnknownSigner {
                    index,
                    signers: width,
                });
            }
        }
        bytes.resize(width.div_ceil(8), 0);
        Ok(Self { bytes, len: width })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && (self.bytes[index / 8] >> (index % 8)) & 1 == 1
    }
}

fn highest_set_bit(le_bytes: &[u8]) -> Option<usize> {
    le_bytes
        .iter()
        .enumerate()
        .rev()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + 7 - byte.leading_zeros() as usize)
}

/// Returns the signers whose bit is clear, in signer-set order.
pub fn decode_unsigned(
    signers: &[Address],
    bitmap: &SignatureBitmap,
) -> Result<Vec<Address>, DecodeError> {
    if bitmap.len() < signers.len() {
        return Err(DecodeError::ShortBitmap {
            bits: bitmap.len(),
            signers: signers.len(),
        });
    }
    Ok(signers
        .iter()
        .enumerate()
        .filter(|(index, _)| !bitmap.is_set(*index))
        .map(|(_, signer)| *signer)
        .collect())
}
