pub mod memory;
pub mod opensearch;

pub use memory::MemoryIndexStore;
pub use opensearch::OpenSearchStore;
