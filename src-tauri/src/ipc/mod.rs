//! IPC (Inter-Process Communication) Module
//!
//! Handles communication between the host and plugin surfaces.
//! Tauri commands and the webview-backed surface host are compiled only with
//! the `gui` feature; DTOs and event names are always available.

pub mod dto;
pub mod events;

#[cfg(feature = "gui")]
mod commands;
#[cfg(feature = "gui")]
pub mod surface;

#[cfg(feature = "gui")]
pub use commands::*;
pub use dto::*;
pub use events::*;
