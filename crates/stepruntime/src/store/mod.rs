//! Artifact store implementations

mod local;
mod memory;

pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;
