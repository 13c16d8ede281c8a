//! `window-template` builtin plugin
//!
//! Exposes the orchestrator through the call router so plugins and surfaces
//! open template windows the same way they call each other.

use std::sync::Arc;

use serde_json::{json, Value};

use super::descriptor::{TemplateDescriptor, WindowMode};
use super::orchestrator::{TemplateOrchestrator, TEMPLATE_OPENED_EVENT};
use crate::core::registry::{
    arg, opt_arg, CallContext, EventDescriptor, FunctionTable, HandlerError, PluginRegistration,
};
use crate::core::{CoreResult, SurfaceId};

pub const TEMPLATE_PLUGIN_ID: &str = "window-template";

/// Explicit surface argument, else the calling surface.
fn target_surface(ctx: &CallContext, args: &[Value], index: usize) -> Result<SurfaceId, HandlerError> {
    if let Some(surface_id) = opt_arg::<SurfaceId>(args, index, "surfaceId")? {
        return Ok(surface_id);
    }
    ctx.caller
        .surface_id()
        .map(str::to_string)
        .ok_or_else(|| HandlerError::new("Missing argument 'surfaceId' and caller is not a surface"))
}

fn parse_descriptor(ctx: &CallContext, args: &[Value]) -> Result<TemplateDescriptor, HandlerError> {
    let raw = args
        .first()
        .ok_or_else(|| HandlerError::new("Missing argument 'descriptor' at position 0"))?;
    let mut descriptor = TemplateDescriptor::parse(raw)?;
    if descriptor.caller_plugin_id.is_none() {
        descriptor.caller_plugin_id = ctx.caller.plugin_id().map(str::to_string);
    }
    Ok(descriptor)
}

/// Builds the registration of the builtin plugin.
pub fn template_plugin(orchestrator: Arc<TemplateOrchestrator>) -> CoreResult<PluginRegistration> {
    let open = Arc::clone(&orchestrator);
    let close = Arc::clone(&orchestrator);
    let toggle = Arc::clone(&orchestrator);
    let mode = Arc::clone(&orchestrator);
    let focus = Arc::clone(&orchestrator);
    let update = Arc::clone(&orchestrator);
    let list = Arc::clone(&orchestrator);

    let functions = FunctionTable::builder()
        .function("open", move |ctx, args| {
            let orchestrator = Arc::clone(&open);
            async move {
                let descriptor = parse_descriptor(&ctx, &args)?;
                let opened = orchestrator.open(descriptor).await?;
                Ok(serde_json::to_value(opened)?)
            }
        })
        .function("close", move |_ctx, args| {
            let orchestrator = Arc::clone(&close);
            async move {
                let key: String = arg(&args, 0, "key")?;
                orchestrator.close(&key).await?;
                Ok(Value::Null)
            }
        })
        .function("toggleFullscreen", move |ctx, args| {
            let orchestrator = Arc::clone(&toggle);
            async move {
                let surface_id = target_surface(&ctx, &args, 0)?;
                let state = orchestrator.toggle_fullscreen(&surface_id).await?;
                Ok(serde_json::to_value(state)?)
            }
        })
        .function("setWindowMode", move |ctx, args| {
            let orchestrator = Arc::clone(&mode);
            async move {
                let raw: String = arg(&args, 0, "mode")?;
                let window_mode = WindowMode::parse(&raw)
                    .ok_or_else(|| HandlerError::new(format!("Unknown window mode: {raw}")))?;
                let surface_id = target_surface(&ctx, &args, 1)?;
                let capabilities = orchestrator.set_window_mode(&surface_id, window_mode).await?;
                Ok(serde_json::to_value(capabilities)?)
            }
        })
        .function("focus", move |ctx, args| {
            let orchestrator = Arc::clone(&focus);
            async move {
                let surface_id = target_surface(&ctx, &args, 0)?;
                orchestrator.focus(&surface_id).await?;
                Ok(Value::Null)
            }
        })
        .function("update", move |_ctx, args| {
            let orchestrator = Arc::clone(&update);
            async move {
                let key: String = arg(&args, 0, "key")?;
                let target: String = arg(&args, 1, "target")?;
                let value = args.get(2).cloned().unwrap_or(Value::Null);
                let delivered = orchestrator.push_update(&key, &target, value).await?;
                Ok(json!(delivered))
            }
        })
        .sync_function("list", move |_ctx, _args| {
            Ok(serde_json::to_value(list.records())?)
        })
        .build()?;

    Ok(PluginRegistration::new(TEMPLATE_PLUGIN_ID, functions)?.with_automation_events(vec![
        EventDescriptor {
            name: TEMPLATE_OPENED_EVENT.to_string(),
            label: Some("Template opened".to_string()),
            description: None,
        },
    ]))
}
