use crate::ForkId;
use thiserror::Error;

/// Key of the fork entry in the node's discovery record.
pub const ENTRY_KEY: &str = "chain";

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("entry codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Discovery record entry advertising the local fork identifier.
///
/// Bytes following the encoded fork id are reserved for future fields.
/// Decoding keeps them in `rest` instead of failing, and re-encoding writes
/// them back untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkEntry {
    pub fork_id: ForkId,
    pub rest: Vec<u8>,
}

impl ForkEntry {
    pub fn new(fork_id: ForkId) -> Self {
        Self {
            fork_id,
            rest: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EntryError> {
        let mut out = bincode::serialize(&self.fork_id)?;
        out.extend_from_slice(&self.rest);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EntryError> {
        let fork_id: ForkId = bincode::deserialize(bytes)?;
        let consumed = bincode::serialized_size(&fork_id)? as usize;
        Ok(Self {
            fork_id,
            rest: bytes.get(consumed..).unwrap_or_default().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ForkId {
        ForkId {
            hash: [0xde, 0xad, 0xbe, 0xef],
            next: 1_150_000,
        }
    }

    #[test]
    fn decode_ignores_trailing_fields() {
        let mut bytes = ForkEntry::new(sample()).encode().expect("encode");
        bytes.extend_from_slice(&[1, 2, 3, 4, 5]);

        let decoded = ForkEntry::decode(&bytes).expect("decode with trailing data");
        assert_eq!(decoded.fork_id, sample());
        assert_eq!(decoded.rest, vec![1, 2, 3, 4, 5]);
        assert_eq!(decoded.encode().expect("re-encode"), bytes);
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        let bytes = ForkEntry::new(sample()).encode().expect("encode");
        assert!(ForkEntry::decode(&bytes[..6]).is_err());
    }
}
