
pub mod in_memory;
pub mod state;
pub mod update;

pub use in_memory::InMemoryStorage;
pub use state::TableState;
pub use update::{Change, Update, UpdateBuilder};

pub trait Storage {
    fn write(&mut self, key: &[u8], value: &[u8]);
    fn read(&self, key: &[u8]) -> Option<&[u8]>;
    fn remove(&mut self, key: &[u8]) -> u32;
    fn contains(&self, key: &[u8]) -> bool;
    fn size(&self) -> u64;
    /// every key/value pair, ordered by key
    fn entries(&self) -> Vec<(&[u8], &[u8])>;
    fn clear(&mut self);
}
