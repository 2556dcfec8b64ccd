//! Fact table and loader.

pub mod loader;
pub mod store;

pub use loader::{FactLoader, LoadCounts, LoadError};
pub use store::FactStore;
