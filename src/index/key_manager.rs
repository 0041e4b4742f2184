use std::cmp::Ordering;
use std::fmt::Debug;

/// Serialization and ordering of index keys.
///
/// Keys live in tree pages as opaque blobs of exactly `key_size()` bytes. The
/// tree orders them only through `compare`.
pub trait KeyManager: Send + Sync {
    type Key: Clone + Debug;

    /// Width of every serialized key.
    fn key_size(&self) -> usize;

    /// Writes `key` into `out`, which is exactly `key_size()` bytes.
    fn serialize(&self, key: &Self::Key, out: &mut [u8]);

    fn deserialize(&self, bytes: &[u8]) -> Self::Key;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn to_bytes(&self, key: &Self::Key) -> Vec<u8> {
        let mut bytes = vec![0u8; self.key_size()];
        self.serialize(key, &mut bytes);
        bytes
    }
}

/// Signed 64-bit integer keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerKeyManager;

impl IntegerKeyManager {
    const KEY_SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> i64 {
        let mut raw = [0u8; Self::KEY_SIZE];
        raw.copy_from_slice(&bytes[..Self::KEY_SIZE]);
        i64::from_le_bytes(raw)
    }
}

impl KeyManager for IntegerKeyManager {
    type Key = i64;

    fn key_size(&self) -> usize {
        Self::KEY_SIZE
    }

    fn serialize(&self, key: &i64, out: &mut [u8]) {
        out[..Self::KEY_SIZE].copy_from_slice(&key.to_le_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> i64 {
        Self::decode(bytes)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::decode(a).cmp(&Self::decode(b))
    }
}

/// Fixed-width byte string keys compared lexicographically.
///
/// Shorter keys are zero padded and longer keys are truncated to `key_size`.
/// Deserialization strips the trailing zero padding again.
#[derive(Debug, Clone, Copy)]
pub struct BytewiseKeyManager {
    key_size: usize,
}

impl BytewiseKeyManager {
    pub fn new(key_size: usize) -> Self {
        assert!(key_size > 0, "key size must be positive");
        Self { key_size }
    }
}

impl KeyManager for BytewiseKeyManager {
    type Key = Vec<u8>;

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn serialize(&self, key: &Vec<u8>, out: &mut [u8]) {
        let len = key.len().min(self.key_size);
        out[..len].copy_from_slice(&key[..len]);
        out[len..self.key_size].fill(0);
    }

    fn deserialize(&self, bytes: &[u8]) -> Vec<u8> {
        let bytes = &bytes[..self.key_size];
        let len = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        bytes[..len].to_vec()
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a[..self.key_size].cmp(&b[..self.key_size])
    }
}
