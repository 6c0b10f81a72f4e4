//! Just enough of the contract ABI to encode view calls and read their
//! return words.

use super::ChainError;
use alloy_primitives::{keccak256, Address, U256};

const WORD: usize = 32;

pub(crate) enum Token<'a> {
    Address(Address),
    Uint(U256),
    Str(&'a str),
}

pub(crate) fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub(crate) fn encode_call(signature: &str, args: &[Token<'_>]) -> Vec<u8> {
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    for arg in args {
        match arg {
            Token::Address(address) => head.extend_from_slice(address.into_word().as_slice()),
            Token::Uint(value) => head.extend_from_slice(&value.to_be_bytes::<WORD>()),
            Token::Str(value) => {
                let offset = args.len() * WORD + tail.len();
                head.extend_from_slice(&U256::from(offset).to_be_bytes::<WORD>());
                tail.extend_from_slice(&U256::from(value.len()).to_be_bytes::<WORD>());
                tail.extend_from_slice(value.as_bytes());
                tail.resize(tail.len().next_multiple_of(WORD), 0);
            }
        }
    }

    let mut data = selector(signature).to_vec();
    data.extend(head);
    data.extend(tail);
    data
}

/// Reads the return data of `call`. Indices are head positions, so a tuple
/// `(address[], uint256)` has the array offset at 0 and the integer at 1.
pub(crate) struct Decoder<'a> {
    call: &'static str,
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(call: &'static str, data: &'a [u8]) -> Self {
        Self { call, data }
    }

    fn error(&self, reason: String) -> ChainError {
        ChainError::Abi {
            call: self.call,
            reason,
        }
    }

    fn word_at(&self, offset: usize) -> Result<&'a [u8], ChainError> {
        offset
            .checked_add(WORD)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                self.error(format!(
                    "no word at byte {offset}, return data is {} bytes",
                    self.data.len()
                ))
            })
    }

    fn uint_at(&self, offset: usize) -> Result<U256, ChainError> {
        Ok(U256::from_be_slice(self.word_at(offset)?))
    }

    fn usize_at(&self, offset: usize) -> Result<usize, ChainError> {
        let value = self.uint_at(offset)?;
        usize::try_from(value).map_err(|_| self.error(format!("{value} is not a valid offset")))
    }

    fn address_at(&self, offset: usize) -> Result<Address, ChainError> {
        Ok(Address::from_slice(&self.word_at(offset)?[WORD - 20..]))
    }

    /// Start and element count of the dynamic value referenced from `index`.
    fn tail(&self, index: usize) -> Result<(usize, usize), ChainError> {
        let offset = self.usize_at(index * WORD)?;
        let len = self.usize_at(offset)?;
        Ok((offset + WORD, len))
    }

    pub fn uint(&self, index: usize) -> Result<U256, ChainError> {
        self.uint_at(index * WORD)
    }

    pub fn u64(&self, index: usize) -> Result<u64, ChainError> {
        let value = self.uint(index)?;
        u64::try_from(value).map_err(|_| self.error(format!("{value} does not fit in 64 bits")))
    }

    pub fn address(&self, index: usize) -> Result<Address, ChainError> {
        self.address_at(index * WORD)
    }

    pub fn bool(&self, index: usize) -> Result<bool, ChainError> {
        Ok(!self.uint(index)?.is_zero())
    }

    pub fn address_array(&self, index: usize) -> Result<Vec<Address>, ChainError> {
        let (start, len) = self.tail(index)?;
        (0..len)
            .map(|i| self.address_at(start + i * WORD))
            .collect()
    }

    pub fn uint_array(&self, index: usize) -> Result<Vec<U256>, ChainError> {
        let (start, len) = self.tail(index)?;
        (0..len).map(|i| self.uint_at(start + i * WORD)).collect()
    }

    pub fn string(&self, index: usize) -> Result<String, ChainError> {
        let (start, len) = self.tail(index)?;
        let bytes = start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| self.error(format!("string of {len} bytes overruns return data")))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: u64) -> [u8; WORD] {
        U256::from(value).to_be_bytes::<WORD>()
    }

    #[test]
    fn selectors_match_known_signatures() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
    }

    #[test]
    fn encodes_static_and_dynamic_arguments() {
        let account = Address::with_last_byte(0xce);
        let data = encode_call(
            "f(address,string)",
            &[Token::Address(account), Token::Str("Election")],
        );
        assert_eq!(data.len(), 4 + 4 * WORD);
        assert_eq!(&data[4 + 12..4 + WORD], account.as_slice());
        assert_eq!(&data[4 + WORD..4 + 2 * WORD], &word(64));
        assert_eq!(&data[4 + 2 * WORD..4 + 3 * WORD], &word(8));
        assert_eq!(&data[4 + 3 * WORD..4 + 3 * WORD + 8], b"Election");
        assert!(data[4 + 3 * WORD + 8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn decodes_arrays_strings_and_words() {
        // (address[] members, uint256 score, string name)
        let mut data = Vec::new();
        data.extend(word(96));
        data.extend(word(7));
        data.extend(word(192));
        data.extend(word(2));
        data.extend_from_slice(Address::with_last_byte(1).into_word().as_slice());
        data.extend_from_slice(Address::with_last_byte(2).into_word().as_slice());
        data.extend(word(5));
        let mut name = [0u8; WORD];
        name[..5].copy_from_slice(b"group");
        data.extend(name);

        let decoder = Decoder::new("test", &data);
        assert_eq!(
            decoder.address_array(0).unwrap(),
            vec![Address::with_last_byte(1), Address::with_last_byte(2)]
        );
        assert_eq!(decoder.u64(1).unwrap(), 7);
        assert_eq!(decoder.string(2).unwrap(), "group");
    }

    #[test]
    fn short_return_data_is_an_error() {
        let data = word(96);
        let decoder = Decoder::new("test", &data);
        assert!(matches!(
            decoder.address_array(0),
            Err(ChainError::Abi { call: "test", .. })
        ));
        assert!(decoder.uint(1).is_err());
    }
}
