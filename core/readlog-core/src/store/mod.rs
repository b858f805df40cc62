//! Local persistence: backends, key derivation, and the debounced cache.

mod debounced;
pub mod keys;
mod kv;

pub use debounced::{DebouncedStorage, FlushReport};
pub use keys::{scoped_key, KeyDeriver, UserSession};
pub use kv::{JsonFileStore, KeyValueStore, MemoryStore};
