//! Snapgraph Store - Reference storage collaborator
//!
//! Provides:
//! - `MemoryStorage`, an in-memory row source and transactional
//!   write-through sink driven by an entity mapping
//! - The art gallery sample mapping used across the integration tests

pub mod memory;
pub mod sample;

// Re-export key types
pub use memory::MemoryStorage;
pub use sample::{art_gallery, art_gallery_descriptors};
