//! Call Router
//!
//! Routes typed calls to plugin functions and correlates each call with
//! exactly one structured outcome. Handlers run on their own tokio task, so
//! a handler error or panic becomes a `HandlerFault` outcome and never
//! reaches the caller as a panic.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;
use tracing::Instrument;

use crate::core::registry::{CallContext, PluginRegistry};
use crate::core::{
    new_correlation_id, CallerRef, CoreError, CoreResult, CorrelationId, ErrorCode,
    FunctionName, PluginId,
};

// =============================================================================
// Wire Types
// =============================================================================

/// Result of a routed call: success xor error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl CallOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn failure(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
            code: Some(code),
        }
    }

    pub fn from_error(err: &CoreError) -> Self {
        Self::failure(err.code(), err.wire_message())
    }

    pub fn from_result(result: CoreResult<Value>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Converts to a plain result. The error side carries code and message.
    pub fn into_result(self) -> Result<Value, (ErrorCode, String)> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err((
                self.code.unwrap_or(ErrorCode::Internal),
                self.error.unwrap_or_default(),
            ))
        }
    }
}

/// A call outcome tagged with its correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

/// An in-flight call.
#[derive(Clone, Debug, Serialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub correlation_id: CorrelationId,
    pub target_plugin_id: PluginId,
    pub function_name: FunctionName,
    pub args: Vec<Value>,
    pub caller: CallerRef,
    pub started_at: String,
}

// =============================================================================
// Router
// =============================================================================

type PendingTable = Mutex<HashMap<CorrelationId, CallEnvelope>>;

/// Removes a pending entry when the call completes or its future is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);
    }
}

pub struct CallRouter {
    registry: Arc<PluginRegistry>,
    pending: PendingTable,
}

impl CallRouter {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Routes a call under a fresh correlation id.
    pub async fn call(
        &self,
        caller: CallerRef,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CallResponse {
        self.call_with_id(new_correlation_id(), caller, target, function, args)
            .await
    }

    /// Routes a call under a caller-supplied correlation id. An id that is
    /// already pending is refused.
    pub async fn call_with_id(
        &self,
        correlation_id: CorrelationId,
        caller: CallerRef,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CallResponse {
        let span = tracing::info_span!(
            "call",
            correlation_id = %correlation_id,
            target = %target,
            function = %function
        );

        let guard = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(&correlation_id) {
                return CallResponse {
                    correlation_id: correlation_id.clone(),
                    outcome: CallOutcome::failure(
                        ErrorCode::InvalidRequest,
                        format!("Correlation id already pending: {correlation_id}"),
                    ),
                };
            }
            pending.insert(
                correlation_id.clone(),
                CallEnvelope {
                    correlation_id: correlation_id.clone(),
                    target_plugin_id: target.to_string(),
                    function_name: function.to_string(),
                    args: args.clone(),
                    caller: caller.clone(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                },
            );
            PendingGuard {
                pending: &self.pending,
                correlation_id: correlation_id.clone(),
            }
        };

        let outcome = self
            .dispatch(correlation_id.clone(), caller, target, function, args)
            .instrument(span)
            .await;
        drop(guard);

        CallResponse {
            correlation_id,
            outcome,
        }
    }

    async fn dispatch(
        &self,
        correlation_id: CorrelationId,
        caller: CallerRef,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CallOutcome {
        let registration = match self.registry.lookup(target) {
            Ok(reg) => reg,
            Err(err) => {
                tracing::warn!("Call to unknown plugin {}", target);
                return CallOutcome::from_error(&err);
            }
        };
        let Some(handler) = registration.functions.get(function) else {
            tracing::warn!("Call to unknown function {}.{}", target, function);
            return CallOutcome::from_error(&CoreError::UnknownFunction {
                plugin_id: target.to_string(),
                function: function.to_string(),
            });
        };

        let ctx = CallContext {
            correlation_id,
            caller,
        };
        let task = tokio::spawn(
            async move { handler.invoke(ctx, args).await }.in_current_span(),
        );

        match task.await {
            Ok(Ok(value)) => CallOutcome::success(value),
            Ok(Err(err)) => {
                tracing::warn!("Handler {}.{} failed: {}", target, function, err);
                CallOutcome::failure(ErrorCode::HandlerFault, err.message)
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "Handler task was cancelled".to_string()
                };
                tracing::warn!("Handler {}.{} panicked: {}", target, function, message);
                CallOutcome::failure(ErrorCode::HandlerFault, message)
            }
        }
    }

    /// Routes a call and converts the outcome back into a `CoreResult`.
    pub async fn call_value(
        &self,
        caller: CallerRef,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CoreResult<Value> {
        let response = self.call(caller, target, function, args).await;
        outcome_to_result(response.outcome, target, function)
    }

    /// Snapshot of in-flight calls.
    pub fn pending_calls(&self) -> Vec<CallEnvelope> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Maps a failed outcome back to the matching `CoreError`.
pub fn outcome_to_result(outcome: CallOutcome, target: &str, function: &str) -> CoreResult<Value> {
    outcome.into_result().map_err(|(code, message)| match code {
        ErrorCode::UnknownPlugin => CoreError::UnknownPlugin(target.to_string()),
        ErrorCode::UnknownFunction => CoreError::UnknownFunction {
            plugin_id: target.to_string(),
            function: function.to_string(),
        },
        ErrorCode::HandlerFault => CoreError::HandlerFault(message),
        ErrorCode::DuplicateRegistration => CoreError::DuplicateRegistration(message),
        ErrorCode::SurfaceCreationFailed => CoreError::SurfaceCreationFailed(message),
        ErrorCode::InvalidDescriptor => CoreError::InvalidDescriptor(message),
        ErrorCode::InvalidRequest => CoreError::InvalidOperation(message),
        ErrorCode::Internal => CoreError::Internal(message),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Handler panicked: {s}")
    } else {
        "Handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{arg, FunctionTable, HandlerError, PluginRegistration};
    use serde_json::json;
    use std::time::Duration;

    fn router_with(registrations: Vec<PluginRegistration>) -> CallRouter {
        let registry = Arc::new(PluginRegistry::new());
        for reg in registrations {
            registry.register(reg).unwrap();
        }
        CallRouter::new(registry)
    }

    fn math_plugin() -> PluginRegistration {
        let table = FunctionTable::builder()
            .sync_function("add", |_, args| {
                let a: i64 = arg(&args, 0, "a")?;
                let b: i64 = arg(&args, 1, "b")?;
                Ok(json!(a + b))
            })
            .sync_function("fail", |_, _| Err(HandlerError::new("division by zero")))
            .sync_function("explode", |_, _| panic!("kaboom"))
            .function("slowEcho", |_, args| async move {
                let delay: u64 = arg(&args, 0, "delay")?;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(args.get(1).cloned().unwrap_or(Value::Null))
            })
            .sync_function("whoami", |ctx, _| Ok(serde_json::to_value(&ctx.caller)?))
            .build()
            .unwrap();
        PluginRegistration::new("math", table).unwrap()
    }

    #[tokio::test]
    async fn test_successful_call() {
        let router = router_with(vec![math_plugin()]);
        let response = router
            .call(CallerRef::Host, "math", "add", vec![json!(2), json!(3)])
            .await;
        assert_eq!(response.outcome, CallOutcome::success(json!(5)));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_plugin_and_function() {
        let router = router_with(vec![math_plugin()]);

        let response = router.call(CallerRef::Host, "ghost", "add", vec![]).await;
        assert!(!response.outcome.ok);
        assert_eq!(response.outcome.code, Some(ErrorCode::UnknownPlugin));
        assert_eq!(response.outcome.error.as_deref(), Some("UnknownPlugin"));

        let response = router.call(CallerRef::Host, "math", "nope", vec![]).await;
        assert_eq!(response.outcome.code, Some(ErrorCode::UnknownFunction));
        assert_eq!(response.outcome.error.as_deref(), Some("UnknownFunction"));
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let router = router_with(vec![math_plugin()]);
        let response = router.call(CallerRef::Host, "math", "fail", vec![]).await;
        assert_eq!(
            response.outcome,
            CallOutcome::failure(ErrorCode::HandlerFault, "division by zero")
        );

        // Router keeps working after a fault.
        let response = router
            .call(CallerRef::Host, "math", "add", vec![json!(1), json!(1)])
            .await;
        assert!(response.outcome.ok);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let router = router_with(vec![math_plugin()]);
        let response = router.call(CallerRef::Host, "math", "explode", vec![]).await;
        assert_eq!(response.outcome.code, Some(ErrorCode::HandlerFault));
        assert!(response.outcome.error.unwrap().contains("kaboom"));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let router = Arc::new(router_with(vec![math_plugin()]));
        let mut handles = Vec::new();
        for i in 0..32u64 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(async move {
                let id = format!("call-{i}");
                let delay = (32 - i) % 7;
                let response = router
                    .call_with_id(
                        id.clone(),
                        CallerRef::Host,
                        "math",
                        "slowEcho",
                        vec![json!(delay), json!(i)],
                    )
                    .await;
                (id, i, response)
            }));
        }

        for handle in handles {
            let (id, i, response) = handle.await.unwrap();
            assert_eq!(response.correlation_id, id);
            assert_eq!(response.outcome.result, Some(json!(i)));
        }
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_calls_visible_while_in_flight() {
        let router = Arc::new(router_with(vec![math_plugin()]));
        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .call_with_id(
                        "slow-1".into(),
                        CallerRef::plugin("clock"),
                        "math",
                        "slowEcho",
                        vec![json!(200), json!("late")],
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = router.pending_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].function_name, "slowEcho");
        assert_eq!(pending[0].caller, CallerRef::plugin("clock"));

        // A second call reusing a pending id is refused.
        let dup = router
            .call_with_id("slow-1".into(), CallerRef::Host, "math", "add", vec![])
            .await;
        assert_eq!(dup.outcome.code, Some(ErrorCode::InvalidRequest));

        let response = task.await.unwrap();
        assert_eq!(response.outcome.result, Some(json!("late")));
        assert!(router.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_caller_is_passed_to_handler() {
        let router = router_with(vec![math_plugin()]);
        let value = router
            .call_value(CallerRef::plugin("clock"), "math", "whoami", vec![])
            .await
            .unwrap();
        assert_eq!(value["kind"], "plugin");
        assert_eq!(value["pluginId"], "clock");
    }

    #[tokio::test]
    async fn test_call_value_maps_errors() {
        let router = router_with(vec![math_plugin()]);
        let err = router
            .call_value(CallerRef::Host, "ghost", "f", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownPlugin(id) if id == "ghost"));

        let err = router
            .call_value(CallerRef::Host, "math", "fail", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HandlerFault(m) if m == "division by zero"));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok = serde_json::to_value(CallResponse {
            correlation_id: "c1".into(),
            outcome: CallOutcome::success(json!({"a": 1})),
        })
        .unwrap();
        assert_eq!(ok, json!({"correlationId": "c1", "ok": true, "result": {"a": 1}}));

        let err = serde_json::to_value(CallOutcome::failure(ErrorCode::UnknownPlugin, "UnknownPlugin"))
            .unwrap();
        assert_eq!(
            err,
            json!({"ok": false, "error": "UnknownPlugin", "code": "UnknownPlugin"})
        );
    }
}
