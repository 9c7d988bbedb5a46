pub mod memory;
pub mod table;

pub use memory::{InMemoryStorage, MemoryTransaction};
pub use table::{Table, TableSchema};
