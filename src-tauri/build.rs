//! Build script for PlugDock
//!
//! Runs the standard Tauri build for GUI builds. Headless builds (the
//! library and the CLI) need no build-time steps.

fn main() {
    #[cfg(feature = "gui")]
    tauri_build::build();
}
