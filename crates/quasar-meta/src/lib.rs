pub mod etcd;
pub mod keys;
pub mod memory;
pub mod state;
pub mod types;

pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;
pub use state::{MetaStateStore, StateStore};
pub use types::{KeyValueStore, KvEntry, KvEvent, KvStream};
