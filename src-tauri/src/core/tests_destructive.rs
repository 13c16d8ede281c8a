//! Destructive and Edge Case Tests for the Coordination Layer
//!
//! These tests drive the coordinator the way the shell and plugins do, through
//! the router and JSON arguments, and check that concurrent, failing and
//! misbehaving participants leave the registries consistent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::core::bus::{ChannelSink, FnSink};
use crate::core::coordinator::Coordinator;
use crate::core::registry::{FunctionTable, PluginRegistration};
use crate::core::settings::HostSettings;
use crate::core::surface::{HeadlessSurfaceHost, VisualState};
use crate::core::template::{TemplateDescriptor, WindowMode, TEMPLATE_OPENED_EVENT, TEMPLATE_PLUGIN_ID};
use crate::core::{CallerRef, CoreError, ErrorCode};

fn coordinator() -> (Coordinator, Arc<HeadlessSurfaceHost>) {
    Coordinator::headless(&HostSettings::default()).unwrap()
}

fn clock_descriptor(title: &str) -> Value {
    json!({
        "title": title,
        "eventChannel": "clock",
        "subscribeTopics": ["clock.tick"],
        "callerPluginId": "clock",
        "backgroundUrl": "plugins/clock/index.html"
    })
}

async fn open(coordinator: &Coordinator, descriptor: Value) -> Result<Value, (ErrorCode, String)> {
    coordinator
        .call(CallerRef::plugin("clock"), TEMPLATE_PLUGIN_ID, "open", vec![descriptor])
        .await
        .outcome
        .into_result()
}

#[tokio::test]
async fn test_destructive_concurrent_opens_share_one_window() {
    let (coordinator, host) = coordinator();
    host.set_load_delay(Duration::from_millis(30));
    let coordinator = Arc::new(coordinator);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            open(&coordinator, clock_descriptor(&format!("Clock {i}"))).await
        }));
    }

    let mut surfaces = Vec::new();
    for task in tasks {
        let opened = task.await.unwrap().unwrap();
        surfaces.push(opened["surfaceId"].as_str().unwrap().to_string());
    }
    surfaces.dedup();

    assert_eq!(surfaces.len(), 1);
    assert_eq!(host.created_count(), 1);
    assert_eq!(coordinator.templates().records().len(), 1);
}

#[tokio::test]
async fn test_destructive_open_reopen_close_cycle() {
    let (coordinator, host) = coordinator();

    let first = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    assert_eq!(first["reused"], false);
    let surface_id = first["surfaceId"].as_str().unwrap().to_string();

    let again = open(&coordinator, clock_descriptor("World Clock")).await.unwrap();
    assert_eq!(again["reused"], true);
    assert_eq!(again["surfaceId"], first["surfaceId"]);

    let snapshot = host.snapshot(&surface_id).unwrap();
    assert_eq!(snapshot.init_count, 2);
    assert_eq!(snapshot.fields["title"], "World Clock");
    assert_eq!(snapshot.focus_count, 1);

    coordinator
        .call(CallerRef::Host, TEMPLATE_PLUGIN_ID, "close", vec![json!("clock")])
        .await
        .outcome
        .into_result()
        .unwrap();
    assert!(host.live_surfaces().is_empty());
    assert!(coordinator.bridges().is_empty());

    let reopened = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    assert_eq!(reopened["reused"], false);
    assert_ne!(reopened["surfaceId"], first["surfaceId"]);
}

#[tokio::test]
async fn test_destructive_reopen_without_mode_keeps_fullscreen_window() {
    let (coordinator, host) = coordinator();

    let mut alpha = clock_descriptor("Alpha");
    alpha["id"] = json!("A");
    alpha["windowMode"] = json!("fullscreen_only");
    let first = open(&coordinator, alpha).await.unwrap();
    let surface_id = first["surfaceId"].as_str().unwrap().to_string();
    let before = coordinator.templates().record("A").unwrap();
    assert_eq!(
        host.snapshot(&surface_id).unwrap().visual_state,
        VisualState::Fullscreen
    );

    let mut renamed = clock_descriptor("Alpha-2");
    renamed["id"] = json!("A");
    let again = open(&coordinator, renamed).await.unwrap();
    assert_eq!(again["reused"], true);
    assert_eq!(again["surfaceId"], first["surfaceId"]);

    let after = coordinator.templates().record("A").unwrap();
    assert_eq!(after.snapshot.title, "Alpha-2");
    assert_eq!(after.snapshot.window_mode, WindowMode::FullscreenOnly);
    assert_eq!(after.snapshot.capabilities, before.snapshot.capabilities);
    assert!(!after.snapshot.capabilities.can_maximize);

    let surface = host.snapshot(&surface_id).unwrap();
    assert_eq!(surface.visual_state, VisualState::Fullscreen);
    assert!(!surface.spec.constraints.maximizable);
    assert_eq!(surface.fields["title"], "Alpha-2");
    assert_eq!(surface.fields["windowMode"], "fullscreen_only");
}

#[tokio::test]
async fn test_destructive_reopen_title_overrides_pushed_update() {
    let (coordinator, host) = coordinator();
    let opened = open(&coordinator, clock_descriptor("Initial")).await.unwrap();
    let surface_id = opened["surfaceId"].as_str().unwrap().to_string();

    coordinator
        .call(
            CallerRef::plugin("clock"),
            TEMPLATE_PLUGIN_ID,
            "update",
            vec![json!("clock"), json!("title"), json!("Interim")],
        )
        .await
        .outcome
        .into_result()
        .unwrap();
    assert_eq!(host.snapshot(&surface_id).unwrap().fields["title"], "Interim");

    open(&coordinator, clock_descriptor("Final")).await.unwrap();
    assert_eq!(host.snapshot(&surface_id).unwrap().fields["title"], "Final");
    assert_eq!(
        coordinator.templates().record("clock").unwrap().snapshot.title,
        "Final"
    );
}

#[tokio::test]
async fn test_destructive_bridge_used_while_loading_keeps_owner() {
    let (coordinator, host) = coordinator();
    host.set_load_delay(Duration::from_millis(100));
    let coordinator = Arc::new(coordinator);

    let pending = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { open(&coordinator, clock_descriptor("Clock")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let surface_id = host.live_surfaces().pop().unwrap();

    // The shell calls the bridge before its init arrives.
    let early = coordinator.attach_surface(&surface_id, None);
    assert!(early.owner().is_none());

    pending.await.unwrap().unwrap();
    let bridge = coordinator.bridges().get(&surface_id).unwrap();
    assert_eq!(bridge.owner().as_deref(), Some("clock"));
    bridge.config_set("format", json!("24h")).unwrap();
    assert_eq!(bridge.config_get("format").unwrap(), Some(json!("24h")));
    assert_eq!(bridge.subscriptions(), vec!["clock", "clock.tick"]);
}

#[tokio::test]
async fn test_destructive_open_publishes_template_opened() {
    let (coordinator, _host) = coordinator();
    let (sink, mut rx) = ChannelSink::new();
    let listener = coordinator.bus().register_listener(Arc::new(sink));
    coordinator
        .bus()
        .subscribe(TEMPLATE_OPENED_EVENT, &listener)
        .unwrap();

    let first = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    open(&coordinator, clock_descriptor("Clock")).await.unwrap();

    let (name, payload) = rx.try_recv().unwrap();
    assert_eq!(name, TEMPLATE_OPENED_EVENT);
    assert_eq!(payload["dedupKey"], "clock");
    assert_eq!(payload["surfaceId"], first["surfaceId"]);
    assert_eq!(payload["reused"], false);
    assert_eq!(payload["callerPluginId"], "clock");
    assert_eq!(rx.try_recv().unwrap().1["reused"], true);

    // Failed opens stay silent.
    let mut invalid = clock_descriptor("Broken");
    invalid["id"] = json!("broken");
    invalid["backgroundUrl"] = Value::Null;
    assert!(open(&coordinator, invalid).await.is_err());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_destructive_abandoned_open_closes_surface() {
    let (coordinator, host) = coordinator();
    host.set_load_delay(Duration::from_millis(200));

    let templates = Arc::clone(coordinator.templates());
    let descriptor = TemplateDescriptor::parse(&clock_descriptor("Clock")).unwrap();
    let pending = tokio::spawn(async move { templates.open(descriptor).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(host.live_surfaces().len(), 1);
    assert!(coordinator.templates().is_creating("clock"));

    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(host.live_surfaces().is_empty());
    assert!(!coordinator.templates().is_creating("clock"));
    assert!(coordinator.templates().records().is_empty());

    host.set_load_delay(Duration::ZERO);
    let reopened = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    assert_eq!(reopened["reused"], false);
}

#[tokio::test]
async fn test_destructive_creation_failure_then_retry() {
    let (coordinator, host) = coordinator();
    host.fail_next_creation("no display");

    let (code, message) = open(&coordinator, clock_descriptor("Clock")).await.unwrap_err();
    assert_eq!(code, ErrorCode::SurfaceCreationFailed);
    assert!(message.contains("no display"));
    assert!(coordinator.templates().records().is_empty());
    assert!(!coordinator.templates().is_creating("clock"));

    let opened = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    assert_eq!(opened["reused"], false);
    assert_eq!(host.live_surfaces().len(), 1);
}

#[tokio::test]
async fn test_destructive_user_close_during_creation() {
    let (coordinator, host) = coordinator();
    host.set_load_delay(Duration::from_millis(100));
    let coordinator = Arc::new(coordinator);

    let pending = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { open(&coordinator, clock_descriptor("Clock")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    for surface_id in host.live_surfaces() {
        assert!(host.user_close(&surface_id));
    }

    let (code, _) = pending.await.unwrap().unwrap_err();
    assert_eq!(code, ErrorCode::SurfaceCreationFailed);
    assert!(coordinator.templates().records().is_empty());
    assert!(coordinator.bridges().is_empty());
}

#[tokio::test]
async fn test_destructive_user_close_detaches_bridge() {
    let (coordinator, host) = coordinator();
    let opened = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    let surface_id = opened["surfaceId"].as_str().unwrap();
    assert!(coordinator.bridges().get(surface_id).is_ok());

    assert!(host.user_close(surface_id));

    assert!(matches!(
        coordinator.bridges().get(surface_id),
        Err(CoreError::SurfaceNotFound(_))
    ));
    assert!(coordinator.bus().subscribers("clock").is_empty());
    assert!(coordinator.templates().record("clock").is_none());
}

#[tokio::test]
async fn test_destructive_concurrent_calls_keep_correlation() {
    let (coordinator, _) = coordinator();
    let table = FunctionTable::builder()
        .function("slowEcho", |_, args| async move {
            let delay = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
        .build()
        .unwrap();
    coordinator
        .load_plugin(PluginRegistration::new("echo", table).unwrap())
        .await
        .unwrap();

    let router = Arc::clone(coordinator.router());
    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let router = Arc::clone(&router);
        tasks.push(tokio::spawn(async move {
            let delay = (32 - i) % 7;
            let response = router
                .call_with_id(
                    format!("corr-{i}"),
                    CallerRef::Host,
                    "echo",
                    "slowEcho",
                    vec![json!(delay)],
                )
                .await;
            (i, delay, response)
        }));
    }

    for task in tasks {
        let (i, delay, response) = task.await.unwrap();
        assert_eq!(response.correlation_id, format!("corr-{i}"));
        assert_eq!(response.outcome.result, Some(json!(delay)));
    }
    assert_eq!(router.pending_count(), 0);
}

#[tokio::test]
async fn test_destructive_panicking_handler_is_contained() {
    let (coordinator, _) = coordinator();
    let table = FunctionTable::builder()
        .sync_function("explode", |_, _| panic!("bad plugin"))
        .sync_function("ok", |_, _| Ok(json!(true)))
        .build()
        .unwrap();
    coordinator
        .load_plugin(PluginRegistration::new("fragile", table).unwrap())
        .await
        .unwrap();

    let response = coordinator
        .call(CallerRef::Host, "fragile", "explode", vec![])
        .await;
    let (code, message) = response.outcome.into_result().unwrap_err();
    assert_eq!(code, ErrorCode::HandlerFault);
    assert!(message.contains("bad plugin"));

    let response = coordinator.call(CallerRef::Host, "fragile", "ok", vec![]).await;
    assert_eq!(response.outcome.result, Some(json!(true)));
    assert_eq!(coordinator.router().pending_count(), 0);
}

#[tokio::test]
async fn test_destructive_unknown_targets() {
    let (coordinator, _) = coordinator();

    let response = coordinator.call(CallerRef::Host, "ghost", "run", vec![]).await;
    assert_eq!(response.outcome.code, Some(ErrorCode::UnknownPlugin));

    let response = coordinator
        .call(CallerRef::Host, TEMPLATE_PLUGIN_ID, "explode", vec![])
        .await;
    assert_eq!(response.outcome.code, Some(ErrorCode::UnknownFunction));
}

#[tokio::test]
async fn test_destructive_faulty_listener_does_not_block_others() {
    let (coordinator, _) = coordinator();
    let bus = coordinator.bus();
    let mut faults = bus.diagnostics();

    let attempts = Arc::new(AtomicUsize::new(0));
    let faulty = {
        let attempts = Arc::clone(&attempts);
        bus.register_listener(Arc::new(FnSink(move |_: &str, _: &Value| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("listener gone".to_string())
        })))
    };
    let (sink, mut rx) = ChannelSink::new();
    let healthy = bus.register_listener(Arc::new(sink));
    bus.subscribe("clock.tick", &faulty).unwrap();
    bus.subscribe("clock.tick", &healthy).unwrap();

    let targeted = coordinator.emit("clock.tick", &json!({"n": 1})).await.unwrap();
    assert_eq!(targeted, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(rx.try_recv().unwrap().1, json!({"n": 1}));

    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.listener, faulty.id());
    assert_eq!(fault.error, "listener gone");

    assert!(coordinator.emit("  ", &Value::Null).await.is_err());
}

#[tokio::test]
async fn test_destructive_duplicate_registration_keeps_first() {
    let (coordinator, _) = coordinator();
    let table = FunctionTable::builder()
        .sync_function("open", |_, _| Ok(json!("impostor")))
        .build()
        .unwrap();
    let err = coordinator
        .load_plugin(PluginRegistration::new(TEMPLATE_PLUGIN_ID, table).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateRegistration(_)));

    let opened = open(&coordinator, clock_descriptor("Clock")).await.unwrap();
    assert!(opened["surfaceId"].is_string());
}
