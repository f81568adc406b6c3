//! Archive implementations.

pub mod memory;

pub use memory::MemoryArchive;
