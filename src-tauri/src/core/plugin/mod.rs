//! WASM Plugins
//!
//! Plugins shipped as a directory holding a `plugin.json` manifest and a
//! WebAssembly module. Their exports become the plugin's function table.

pub mod host;
pub mod manifest;

pub use host::{WasmPlugin, WasmPluginHost, WasmRuntimeConfig};
pub use manifest::{PluginManifest, MANIFEST_FILE};
