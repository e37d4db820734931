//! Storage backends behind [`DocumentBackend`](traits::DocumentBackend).

pub mod memory;
pub mod sql;
pub mod traits;
