//! Market Catalog
//!
//! Client side of the plugin catalog service: browse categories and
//! entries, update a market listing and publish a development build. The
//! service is reached through [`CatalogService`]; [`HttpCatalogClient`] is
//! the HTTP implementation (feature `market`). The builtin `market` plugin
//! exposes the service through the call router.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use specta::Type;

use crate::core::registry::{arg, opt_arg, FunctionTable, PluginRegistration};
use crate::core::{CoreError, CoreResult};

#[cfg(feature = "market")]
use crate::core::settings::MarketSettings;

pub const MARKET_PLUGIN_ID: &str = "market";

// =============================================================================
// Catalog Types
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct MarketCategory {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One plugin listed in the catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Fields the host does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Catalog collaborator.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// `GET /categories`
    async fn categories(&self) -> CoreResult<Vec<MarketCategory>>;

    /// `GET /catalog`, optionally filtered by category
    async fn catalog(&self, category: Option<&str>) -> CoreResult<Vec<CatalogEntry>>;

    /// `PUT /market`
    async fn put_market(&self, listing: &Value) -> CoreResult<Value>;

    /// `POST /dev/publish`
    async fn publish(&self, package: &Value) -> CoreResult<Value>;
}

/// Accepts a bare array or an object wrapping it in `items`.
fn unwrap_list<T: serde::de::DeserializeOwned>(body: Value, what: &str) -> CoreResult<Vec<T>> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(mut map) => map.remove("items").ok_or_else(|| {
            CoreError::Market(format!("Unexpected {what} response: missing 'items'"))
        })?,
        other => {
            return Err(CoreError::Market(format!(
                "Unexpected {what} response: {other}"
            )))
        }
    };
    serde_json::from_value(list)
        .map_err(|e| CoreError::Market(format!("Failed to parse {what}: {e}")))
}

// =============================================================================
// HTTP Client
// =============================================================================

/// `CatalogService` over HTTP.
#[cfg(feature = "market")]
pub struct HttpCatalogClient {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "market")]
impl HttpCatalogClient {
    pub fn new(settings: &MarketSettings) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(u64::from(settings.timeout_secs)))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> CoreResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Market(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Market(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            return Err(CoreError::Market(format!("Catalog error ({}): {}", status, message)));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| CoreError::Market(format!("Failed to parse response: {}", e)))
    }
}

#[cfg(feature = "market")]
#[async_trait]
impl CatalogService for HttpCatalogClient {
    async fn categories(&self) -> CoreResult<Vec<MarketCategory>> {
        let body = self.send(self.client.get(self.url("categories"))).await?;
        unwrap_list(body, "categories")
    }

    async fn catalog(&self, category: Option<&str>) -> CoreResult<Vec<CatalogEntry>> {
        let mut request = self.client.get(self.url("catalog"));
        if let Some(category) = category {
            request = request.query(&[("category", category)]);
        }
        let body = self.send(request).await?;
        unwrap_list(body, "catalog")
    }

    async fn put_market(&self, listing: &Value) -> CoreResult<Value> {
        tracing::info!("Updating market listing");
        self.send(self.client.put(self.url("market")).json(listing))
            .await
    }

    async fn publish(&self, package: &Value) -> CoreResult<Value> {
        tracing::info!("Publishing development build");
        self.send(self.client.post(self.url("dev/publish")).json(package))
            .await
    }
}

// =============================================================================
// Builtin Plugin
// =============================================================================

/// Builds the `market` builtin plugin over a catalog service.
pub fn market_plugin(service: Arc<dyn CatalogService>) -> CoreResult<PluginRegistration> {
    let categories = Arc::clone(&service);
    let catalog = Arc::clone(&service);
    let put_market = Arc::clone(&service);
    let publish = service;

    let functions = FunctionTable::builder()
        .function("categories", move |_ctx, _args| {
            let service = Arc::clone(&categories);
            async move { Ok(serde_json::to_value(service.categories().await?)?) }
        })
        .function("catalog", move |_ctx, args| {
            let service = Arc::clone(&catalog);
            async move {
                let category: Option<String> = opt_arg(&args, 0, "category")?;
                Ok(serde_json::to_value(
                    service.catalog(category.as_deref()).await?,
                )?)
            }
        })
        .function("putMarket", move |_ctx, args| {
            let service = Arc::clone(&put_market);
            async move {
                let listing: Value = arg(&args, 0, "listing")?;
                Ok(service.put_market(&listing).await?)
            }
        })
        .function("publish", move |_ctx, args| {
            let service = Arc::clone(&publish);
            async move {
                let package: Value = arg(&args, 0, "package")?;
                Ok(service.publish(&package).await?)
            }
        })
        .build()?;

    PluginRegistration::new(MARKET_PLUGIN_ID, functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::PluginRegistry;
    use crate::core::router::CallRouter;
    use crate::core::{CallerRef, ErrorCode};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCatalog {
        published: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl CatalogService for FakeCatalog {
        async fn categories(&self) -> CoreResult<Vec<MarketCategory>> {
            Ok(vec![MarketCategory {
                id: "tools".into(),
                name: "Tools".into(),
                description: None,
            }])
        }

        async fn catalog(&self, category: Option<&str>) -> CoreResult<Vec<CatalogEntry>> {
            let body = json!([
                {"id": "clock", "name": "Clock", "version": "1.0.0", "category": "tools"},
                {"id": "roster", "name": "Roster", "version": "0.2.0", "category": "school", "stars": 4}
            ]);
            let entries: Vec<CatalogEntry> = unwrap_list(body, "catalog")?;
            Ok(entries
                .into_iter()
                .filter(|e| category.is_none() || e.category.as_deref() == category)
                .collect())
        }

        async fn put_market(&self, _listing: &Value) -> CoreResult<Value> {
            Err(CoreError::Market("Catalog error (403 Forbidden): denied".into()))
        }

        async fn publish(&self, package: &Value) -> CoreResult<Value> {
            self.published.lock().unwrap().push(package.clone());
            Ok(json!({"accepted": true}))
        }
    }

    fn router(service: Arc<FakeCatalog>) -> CallRouter {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(market_plugin(service).unwrap()).unwrap();
        CallRouter::new(registry)
    }

    #[test]
    fn test_unwrap_list_shapes() {
        let wrapped: Vec<MarketCategory> =
            unwrap_list(json!({"items": [{"id": "a", "name": "A"}]}), "categories").unwrap();
        assert_eq!(wrapped[0].id, "a");

        let err = unwrap_list::<MarketCategory>(json!("nope"), "categories").unwrap_err();
        assert!(matches!(err, CoreError::Market(_)));
        assert!(unwrap_list::<MarketCategory>(json!({"data": []}), "categories").is_err());
    }

    #[test]
    fn test_catalog_entry_keeps_unknown_fields() {
        let entry: CatalogEntry = serde_json::from_value(json!({
            "id": "clock", "name": "Clock", "version": "1.0.0", "stars": 5
        }))
        .unwrap();
        assert_eq!(entry.extra["stars"], json!(5));
        assert_eq!(serde_json::to_value(&entry).unwrap()["stars"], json!(5));
    }

    #[tokio::test]
    async fn test_market_plugin_functions() {
        let service = Arc::new(FakeCatalog::default());
        let router = router(Arc::clone(&service));

        let categories = router
            .call_value(CallerRef::Host, MARKET_PLUGIN_ID, "categories", vec![])
            .await
            .unwrap();
        assert_eq!(categories[0]["name"], "Tools");

        let filtered = router
            .call_value(CallerRef::Host, MARKET_PLUGIN_ID, "catalog", vec![json!("school")])
            .await
            .unwrap();
        assert_eq!(filtered.as_array().unwrap().len(), 1);
        assert_eq!(filtered[0]["id"], "roster");

        let all = router
            .call_value(CallerRef::Host, MARKET_PLUGIN_ID, "catalog", vec![])
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        router
            .call_value(
                CallerRef::plugin("clock"),
                MARKET_PLUGIN_ID,
                "publish",
                vec![json!({"id": "clock"})],
            )
            .await
            .unwrap();
        assert_eq!(service.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_market_errors_are_handler_faults() {
        let router = router(Arc::new(FakeCatalog::default()));
        let response = router
            .call(CallerRef::Host, MARKET_PLUGIN_ID, "putMarket", vec![json!({})])
            .await;
        assert_eq!(response.outcome.code, Some(ErrorCode::HandlerFault));
        assert!(response.outcome.error.unwrap().contains("403"));
    }

    #[cfg(feature = "market")]
    mod http {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Serves one canned response and returns the request head.
        async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}/api/", listener.local_addr().unwrap());
            let handle = tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let mut head = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    head.extend_from_slice(&buf[..n]);
                    if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
                String::from_utf8_lossy(&head).to_string()
            });
            (base_url, handle)
        }

        fn client(base_url: String) -> HttpCatalogClient {
            HttpCatalogClient::new(&MarketSettings {
                base_url,
                timeout_secs: 5,
            })
            .unwrap()
        }

        #[tokio::test]
        async fn test_categories_over_http() {
            let (base_url, server) = serve_once("200 OK", r#"[{"id":"tools","name":"Tools"}]"#).await;
            let client = client(base_url);
            assert!(!client.base_url().ends_with('/'));

            let categories = client.categories().await.unwrap();
            assert_eq!(categories[0].id, "tools");
            let head = server.await.unwrap();
            assert!(head.starts_with("GET /api/categories "));
        }

        #[tokio::test]
        async fn test_catalog_query_and_http_error() {
            let (base_url, server) =
                serve_once("404 Not Found", r#"{"error":"no such category"}"#).await;
            let err = client(base_url).catalog(Some("ghost")).await.unwrap_err();
            assert!(matches!(&err, CoreError::Market(m) if m.contains("no such category")));
            let head = server.await.unwrap();
            assert!(head.starts_with("GET /api/catalog?category=ghost "));
        }
    }
}
