use log::warn;

use crate::consensus::StateMachine;
use crate::protocol::NOBODY;
use crate::storage::in_memory::InMemoryStorage;
use crate::storage::update::{Change, Update, UpdateBuilder};
use crate::storage::Storage;

/// Replicated key/value table applying committed [`Update`]s.
#[derive(Debug, Default, Clone)]
pub struct TableState<S = InMemoryStorage> {
    storage: S,
}

impl<S: Storage> TableState<S> {
    pub fn new(storage: S) -> Self {
        TableState { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn read(&self, key: &[u8]) -> Option<&[u8]> {
        self.storage.read(key)
    }
}

impl<S: Storage> StateMachine for TableState<S> {
    fn apply(&mut self, update: &[u8], snapshot: bool) {
        // a committed entry cannot be refused, only skipped
        let update = match Update::decode(update) {
            Ok(update) => update,
            Err(err) => {
                warn!("skipping malformed update: {}", err);
                return;
            }
        };

        if snapshot {
            self.storage.clear();
        }

        for change in update.changes {
            match change {
                Change::Write(key, value) => self.storage.write(key, value),
                Change::Remove(key) => {
                    let _ = self.storage.remove(key);
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.storage
            .entries()
            .into_iter()
            .fold(UpdateBuilder::new(NOBODY), |builder, (key, value)| {
                builder.write(key, value)
            })
            .build()
    }
}
