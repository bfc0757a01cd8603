use crate::NetworkError;
use fork_id::{ENTRY_KEY, ForkEntry};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Record {
    seq: u64,
    entries: BTreeMap<String, Vec<u8>>,
}

/// The node's own discovery record: key/value entries plus a sequence
/// number that increases whenever an entry value changes.
#[derive(Default)]
pub struct LocalRecord {
    inner: RwLock<Record>,
}

impl LocalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entry. Returns `false` and leaves the sequence number alone
    /// when the value is unchanged.
    pub fn set(&self, key: &str, value: Vec<u8>) -> bool {
        let mut record = self.inner.write();
        if record.entries.get(key) == Some(&value) {
            return false;
        }
        record.entries.insert(key.to_string(), value);
        record.seq += 1;
        true
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn seq(&self) -> u64 {
        self.inner.read().seq
    }

    pub fn set_fork_entry(&self, entry: &ForkEntry) -> Result<bool, NetworkError> {
        Ok(self.set(ENTRY_KEY, entry.encode()?))
    }

    pub fn fork_entry(&self) -> Result<Option<ForkEntry>, NetworkError> {
        self.get(ENTRY_KEY)
            .map(|bytes| ForkEntry::decode(&bytes))
            .transpose()
            .map_err(NetworkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fork_id::ForkId;

    fn entry(next: u64) -> ForkEntry {
        ForkEntry::new(ForkId {
            hash: [1, 2, 3, 4],
            next,
        })
    }

    #[test]
    fn set_is_idempotent() {
        let record = LocalRecord::new();
        assert!(record.set_fork_entry(&entry(10)).expect("encode"));
        assert_eq!(record.seq(), 1);
        assert!(!record.set_fork_entry(&entry(10)).expect("encode"));
        assert_eq!(record.seq(), 1);
        assert!(record.set_fork_entry(&entry(20)).expect("encode"));
        assert_eq!(record.seq(), 2);
    }

    #[test]
    fn fork_entry_reads_back() {
        let record = LocalRecord::new();
        assert!(record.fork_entry().expect("empty record").is_none());
        record.set_fork_entry(&entry(7)).expect("encode");
        assert_eq!(record.fork_entry().expect("decode"), Some(entry(7)));
    }

    #[test]
    fn malformed_fork_entry_is_an_error() {
        let record = LocalRecord::new();
        record.set(ENTRY_KEY, vec![0xff]);
        assert!(matches!(record.fork_entry(), Err(NetworkError::Entry(_))));
    }
}
