use crate::CdpError;
use serde::{Deserialize, Serialize};

/// Prior state of one identity-store key, captured just before a write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    /// Encoded record that was visible before the write, `None` if the key was absent.
    #[serde(with = "serde_bytes")]
    pub previous: Option<Vec<u8>>,
}

/// Ordered rollback record for one transactional scope.
///
/// Appended to while the scope mutates the identity store; replayed in
/// reverse by [`crate::cache::CdpCache::undo`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Vec<u8>, previous: Option<Vec<u8>>) {
        self.entries.push(UndoEntry { key, previous });
    }

    pub fn entries(&self) -> &[UndoEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// CBOR encoding handed to the transaction engine alongside the block.
    pub fn encode(&self) -> Result<Vec<u8>, CdpError> {
        let mut buf = vec![];
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| CdpError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CdpError> {
        ciborium::de::from_reader(bytes).map_err(|e| CdpError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_exchange_preserves_order_and_absence() {
        let mut log = UndoLog::new();
        log.push(b"k1".to_vec(), None);
        log.push(b"k2".to_vec(), Some(vec![1, 2, 3]));
        log.push(b"k1".to_vec(), Some(vec![]));

        let decoded = UndoLog::decode(&log.encode().unwrap()).unwrap();
        assert_eq!(decoded, log);
        assert_eq!(decoded.entries()[0].previous, None);
        assert_eq!(decoded.entries()[2].previous, Some(vec![]));
    }

    #[test]
    fn empty_log_encodes() {
        let bytes = UndoLog::new().encode().unwrap();
        assert!(UndoLog::decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(UndoLog::decode(&[0xff, 0x00]), Err(CdpError::Decode(_))));
    }
}
