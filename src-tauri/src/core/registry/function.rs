//! Plugin Function Tables
//!
//! Typed handler tables. A plugin exposes a fixed set of named functions;
//! the table is validated once when it is built, so lookups never need to
//! reflect over the plugin.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::{CallerRef, CoreError, CoreResult, CorrelationId, FunctionName};

// =============================================================================
// Handler Types
// =============================================================================

/// Context passed to every handler invocation.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub correlation_id: CorrelationId,
    pub caller: CallerRef,
}

/// Error raised by a handler. Becomes a `HandlerFault` outcome at the
/// routing boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("Invalid value: {err}"))
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A callable function exposed by a plugin.
#[async_trait]
pub trait PluginFunction: Send + Sync {
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult;
}

/// Adapter for async closures.
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<F, Fut> PluginFunction for AsyncFn<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult {
        (self.0)(ctx, args).await
    }
}

/// Adapter for synchronous closures.
pub struct SyncFn<F>(pub F);

#[async_trait]
impl<F> PluginFunction for SyncFn<F>
where
    F: Fn(CallContext, Vec<Value>) -> HandlerResult + Send + Sync,
{
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult {
        (self.0)(ctx, args)
    }
}

// =============================================================================
// Argument Helpers
// =============================================================================

/// Deserializes the positional argument at `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, HandlerError> {
    let value = args
        .get(index)
        .ok_or_else(|| HandlerError::new(format!("Missing argument '{name}' at position {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| HandlerError::new(format!("Invalid argument '{name}': {e}")))
}

/// Deserializes an optional positional argument. Absent and `null` both map
/// to `None`.
pub fn opt_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<T>, HandlerError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| HandlerError::new(format!("Invalid argument '{name}': {e}"))),
    }
}

// =============================================================================
// Function Table
// =============================================================================

/// Immutable name → handler map.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<FunctionName, Arc<dyn PluginFunction>>,
}

impl FunctionTable {
    pub fn builder() -> FunctionTableBuilder {
        FunctionTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Function names in sorted order.
    pub fn names(&self) -> Vec<FunctionName> {
        self.functions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

#[derive(Default)]
pub struct FunctionTableBuilder {
    entries: Vec<(FunctionName, Arc<dyn PluginFunction>)>,
}

impl FunctionTableBuilder {
    /// Adds an async closure.
    pub fn function<F, Fut>(self, name: impl Into<FunctionName>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(name, Arc::new(AsyncFn(f)))
    }

    /// Adds a synchronous closure.
    pub fn sync_function<F>(self, name: impl Into<FunctionName>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler(name, Arc::new(SyncFn(f)))
    }

    /// Adds a prebuilt handler.
    pub fn handler(mut self, name: impl Into<FunctionName>, handler: Arc<dyn PluginFunction>) -> Self {
        self.entries.push((name.into(), handler));
        self
    }

    pub fn build(self) -> CoreResult<FunctionTable> {
        let mut functions = BTreeMap::new();
        for (name, handler) in self.entries {
            if name.trim().is_empty() {
                return Err(CoreError::InvalidRegistration(
                    "Function name cannot be empty".to_string(),
                ));
            }
            if functions.insert(name.clone(), handler).is_some() {
                return Err(CoreError::InvalidRegistration(format!(
                    "Duplicate function name: {name}"
                )));
            }
        }
        Ok(FunctionTable { functions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext {
            correlation_id: "c-1".into(),
            caller: CallerRef::Host,
        }
    }

    #[tokio::test]
    async fn test_sync_and_async_handlers_invoke_alike() {
        let table = FunctionTable::builder()
            .sync_function("double", |_ctx, args| {
                let n: i64 = arg(&args, 0, "n")?;
                Ok(json!(n * 2))
            })
            .function("greet", |_ctx, args| async move {
                let name: String = arg(&args, 0, "name")?;
                Ok(json!(format!("hello {name}")))
            })
            .build()
            .unwrap();

        let double = table.get("double").unwrap();
        assert_eq!(double.invoke(ctx(), vec![json!(21)]).await.unwrap(), json!(42));

        let greet = table.get("greet").unwrap();
        assert_eq!(
            greet.invoke(ctx(), vec![json!("ada")]).await.unwrap(),
            json!("hello ada")
        );
        assert_eq!(table.names(), vec!["double", "greet"]);
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let result = FunctionTable::builder()
            .sync_function("f", |_, _| Ok(Value::Null))
            .sync_function("f", |_, _| Ok(Value::Null))
            .build();
        assert!(matches!(result, Err(CoreError::InvalidRegistration(_))));
    }

    #[test]
    fn test_build_rejects_empty_names() {
        let result = FunctionTable::builder()
            .sync_function(" ", |_, _| Ok(Value::Null))
            .build();
        assert!(matches!(result, Err(CoreError::InvalidRegistration(_))));
    }

    #[test]
    fn test_arg_helpers() {
        let args = vec![json!("x"), Value::Null];
        assert_eq!(arg::<String>(&args, 0, "a").unwrap(), "x");
        assert!(arg::<i64>(&args, 0, "a").is_err());
        assert!(arg::<String>(&args, 5, "missing").is_err());
        assert_eq!(opt_arg::<String>(&args, 1, "b").unwrap(), None);
        assert_eq!(opt_arg::<String>(&args, 9, "c").unwrap(), None);
    }
}
