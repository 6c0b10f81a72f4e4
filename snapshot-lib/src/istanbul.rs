//! Istanbul block extra data.
//!
//! `extraData` is 32 bytes of vanity followed by the RLP list
//! `[added_validators, added_public_keys, removed_validators, seal,
//! aggregated_seal, parent_aggregated_seal]`, where both aggregated seals are
//! `[bitmap, signature, round]` and the bitmap is a big-endian integer.

use alloy_rlp::Header;
use thiserror::Error;

const VANITY_LEN: usize = 32;
const PARENT_SEAL_FIELD: usize = 5;

#[derive(Debug, Error)]
pub enum ExtraDataError {
    #[error("extra data is {0} bytes, shorter than the vanity prefix")]
    TooShort(usize),
    #[error("malformed rlp: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("istanbul extra ends before field {0}")]
    MissingField(usize),
    #[error("expected an rlp {expected} for the {field}")]
    UnexpectedShape {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedSeal {
    pub bitmap: Vec<u8>,
    pub signature: Vec<u8>,
    pub round: Vec<u8>,
}

/// Extracts the seal over the parent block, whose bitmap records which elected
/// signers co-signed it.
pub fn parent_aggregated_seal(extra_data: &[u8]) -> Result<AggregatedSeal, ExtraDataError> {
    if extra_data.len() < VANITY_LEN {
        return Err(ExtraDataError::TooShort(extra_data.len()));
    }
    let mut buf = &extra_data[VANITY_LEN..];
    let mut fields = list_payload(&mut buf, "istanbul extra")?;
    for field in 0..PARENT_SEAL_FIELD {
        if fields.is_empty() {
            return Err(ExtraDataError::MissingField(field));
        }
        next_item(&mut fields)?;
    }
    if fields.is_empty() {
        return Err(ExtraDataError::MissingField(PARENT_SEAL_FIELD));
    }

    let mut seal = list_payload(&mut fields, "parent aggregated seal")?;
    Ok(AggregatedSeal {
        bitmap: string_payload(&mut seal, "seal bitmap")?.to_vec(),
        signature: string_payload(&mut seal, "seal signature")?.to_vec(),
        round: string_payload(&mut seal, "seal round")?.to_vec(),
    })
}

fn next_item<'a>(buf: &mut &'a [u8]) -> Result<(Header, &'a [u8]), ExtraDataError> {
    let header = Header::decode(buf)?;
    if buf.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort.into());
    }
    let (payload, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok((header, payload))
}

fn list_payload<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], ExtraDataError> {
    match next_item(buf)? {
        (header, payload) if header.list => Ok(payload),
        _ => Err(ExtraDataError::UnexpectedShape {
            field,
            expected: "list",
        }),
    }
}

fn string_payload<'a>(
    buf: &mut &'a [u8],
    field: &'static str,
) -> Result<&'a [u8], ExtraDataError> {
    match next_item(buf)? {
        (header, payload) if !header.list => Ok(payload),
        _ => Err(ExtraDataError::UnexpectedShape {
            field,
            expected: "string",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{istanbul_extra, rlp_list, rlp_string};

    #[test]
    fn reads_the_parent_seal_bitmap() {
        let extra = istanbul_extra(&[0x05, 0x01]);
        let seal = parent_aggregated_seal(&extra).unwrap();
        assert_eq!(seal.bitmap, vec![0x05, 0x01]);
        assert_eq!(seal.signature.len(), 48);
    }

    #[test]
    fn single_byte_and_empty_bitmaps() {
        assert_eq!(
            parent_aggregated_seal(&istanbul_extra(&[0x07])).unwrap().bitmap,
            vec![0x07]
        );
        assert!(parent_aggregated_seal(&istanbul_extra(&[]))
            .unwrap()
            .bitmap
            .is_empty());
    }

    #[test]
    fn rejects_truncated_extra_data() {
        assert!(matches!(
            parent_aggregated_seal(&[0u8; 10]),
            Err(ExtraDataError::TooShort(10))
        ));

        let mut extra = vec![0u8; VANITY_LEN];
        extra.extend(rlp_list(&[rlp_list(&[]), rlp_list(&[]), rlp_string(&[])]));
        assert!(matches!(
            parent_aggregated_seal(&extra),
            Err(ExtraDataError::MissingField(3))
        ));

        let full = istanbul_extra(&[0x01]);
        assert!(matches!(
            parent_aggregated_seal(&full[..full.len() - 4]),
            Err(ExtraDataError::Rlp(_))
        ));
    }

    #[test]
    fn rejects_a_seal_that_is_not_a_list() {
        let mut extra = vec![0u8; VANITY_LEN];
        extra.extend(rlp_list(&[
            rlp_list(&[]),
            rlp_list(&[]),
            rlp_string(&[]),
            rlp_string(&[0xaa; 65]),
            rlp_list(&[rlp_string(&[]), rlp_string(&[]), rlp_string(&[])]),
            rlp_string(&[0x01]),
        ]));
        assert!(matches!(
            parent_aggregated_seal(&extra),
            Err(ExtraDataError::UnexpectedShape {
                expected: "list",
                ..
            })
        ));
    }
}
