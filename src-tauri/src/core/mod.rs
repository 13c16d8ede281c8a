//! PlugDock Core
//!
//! Coordination layer between plugins and the UI surfaces they open.
//! Handles plugin registration, call routing, the event bus, template windows
//! and the per-surface bridge.

pub mod bridge;
pub mod bus;
pub mod coordinator;
pub mod fs;
pub mod market;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod settings;
pub mod store;
pub mod surface;
pub mod template;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_destructive;
