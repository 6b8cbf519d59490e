//! Buffers between the audio side and the streaming task

pub mod region;
pub mod reorder;

pub use region::{create_shared_buffer, ReadRegion, RegionBuffer, SharedRegionBuffer, WriteRegion};
pub use reorder::{InsertOutcome, ReorderBuffer, ReorderStats};
