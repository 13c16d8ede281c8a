//! IPC Commands Module
//!
//! Tauri IPC commands, organized by domain.
//!
//! ```text
//! commands/
//! ├── mod.rs        # Re-exports all command modules
//! ├── helpers.rs    # Coordinator access, shared error handling
//! ├── bridge.rs     # bridge_request / bridge_subscriptions
//! ├── plugins.rs    # overview, scan, unload
//! ├── templates.rs  # open/close/list template windows
//! └── settings.rs   # host settings
//! ```

pub mod helpers;

pub mod bridge;
pub mod plugins;
pub mod settings;
pub mod templates;

pub use bridge::*;
pub use plugins::*;
pub use settings::*;
pub use templates::*;
