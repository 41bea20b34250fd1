use std::collections::BTreeMap;

use crate::storage::Storage;

type Key = Vec<u8>;
type Value = Vec<u8>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InMemoryStorage {
    string_store: BTreeMap<Key, Value>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn write(&mut self, key: &[u8], value: &[u8]) {
        self.string_store.insert(key.to_vec(), value.to_vec());
    }

    fn read(&self, key: &[u8]) -> Option<&[u8]> {
        self.string_store.get(key).map(|value| &value[..])
    }

    fn remove(&mut self, key: &[u8]) -> u32 {
        match self.string_store.remove(key) {
            Some(_) => 1,
            None => 0, // key does not exist
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.string_store.contains_key(key)
    }

    fn size(&self) -> u64 {
        self.string_store.len() as u64
    }

    fn entries(&self) -> Vec<(&[u8], &[u8])> {
        self.string_store
            .iter()
            .map(|(key, value)| (&key[..], &value[..]))
            .collect()
    }

    fn clear(&mut self) {
        self.string_store.clear();
    }
}
