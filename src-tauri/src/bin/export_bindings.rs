//! Writes `src/bindings.ts` for the surface shell and the main window.
//!
//! Usage: `cargo run --features gui --bin export_bindings`

use std::path::{Path, PathBuf};

use specta_typescript::{BigIntExportBehavior, Typescript};
use tauri_specta::Builder;

const HEADER: &str = "/* eslint-disable @typescript-eslint/no-explicit-any, @typescript-eslint/no-unused-vars */\n// @ts-nocheck\n";

/// Generated wrappers rethrow `Error` instances; surfaces expect every
/// command to resolve to `{ status: "error" }` instead.
const RETHROW: &str = "if(e instanceof Error) throw e;";

fn bindings_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("src")
        .join("bindings.ts")
}

/// Drops the rethrow line and the `else` that follows it. Line endings are
/// kept as generated.
fn strip_rethrow(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut after_rethrow = false;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(RETHROW) {
            after_rethrow = true;
            continue;
        }
        if after_rethrow {
            after_rethrow = false;
            if let Some(rest) = trimmed.strip_prefix("else ") {
                let indent = &line[..line.len() - trimmed.len()];
                out.push_str(indent);
                out.push_str(rest);
                continue;
            }
        }
        out.push_str(line);
    }
    out
}

fn main() {
    let builder = Builder::<tauri::Wry>::new()
        .commands(plugdock_lib::collect_commands!())
        // Delivered as webview events, not command results.
        .typ::<plugdock_lib::ipc::BridgeEventPayload>()
        .typ::<plugdock_lib::core::template::TemplateInit>();

    let path = bindings_path();
    let exporter = Typescript::new()
        .header(HEADER)
        .bigint(BigIntExportBehavior::Number);

    if let Err(e) = builder.export(exporter, &path) {
        eprintln!("Binding export failed: {e}");
        std::process::exit(1);
    }

    match std::fs::read_to_string(&path) {
        Ok(generated) => {
            let fixed = strip_rethrow(&generated);
            if fixed != generated {
                if let Err(e) = std::fs::write(&path, fixed) {
                    eprintln!("Could not rewrite {}: {e}", path.display());
                    std::process::exit(1);
                }
            }
        }
        Err(e) => eprintln!("Could not reread {}: {e}", path.display()),
    }

    println!("Wrote {}", path.display());
}
