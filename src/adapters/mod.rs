//! Concrete adapter implementations for ports.

pub mod file_config_adapter;
pub mod memory_mapped_store;
pub mod observable_store;
pub mod snapshot;
