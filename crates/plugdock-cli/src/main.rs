//! PlugDock CLI
//!
//! Headless plugin host for loading and driving plugins from a terminal.
//! Surfaces are simulated, so template windows can be exercised without a
//! display.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use plugdock_lib::core::coordinator::{plugin_directory, Coordinator};
use plugdock_lib::core::market::{CatalogService, HttpCatalogClient};
use plugdock_lib::core::settings::{HostSettings, SettingsManager};
use plugdock_lib::core::store::{ConfigStore, JsonConfigStore, MemoryConfigStore};
use plugdock_lib::core::surface::HeadlessSurfaceHost;
use plugdock_lib::core::template::{TemplateDescriptor, TEMPLATE_PLUGIN_ID};
use plugdock_lib::core::CallerRef;

#[derive(Parser)]
#[command(name = "plugdock-cli", version, about = "Headless PlugDock plugin host")]
struct Cli {
    /// Data directory holding settings.json and plugin config (defaults are
    /// used when omitted)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load every plugin under a directory and list the registry
    Plugins {
        /// Plugin directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Load plugins and route one call
    Call {
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Target plugin id
        plugin: String,
        /// Function name
        function: String,
        /// Arguments as a JSON array (a single value is wrapped)
        #[arg(long, default_value = "[]")]
        args: String,
    },
    /// Query the market catalog
    Catalog {
        /// Overrides the configured market URL
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// List categories instead of entries
        #[arg(long)]
        categories: bool,
    },
    /// Open a template window on the simulated host and print its state
    Template {
        #[arg(long)]
        title: String,
        /// Event channel the window listens on
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Plugin the window is opened for (also the dedup key)
        #[arg(long, default_value = "cli")]
        caller: String,
        #[arg(long, default_value = "about:blank")]
        background_url: String,
        /// Window mode (fullscreen_only, windowed_only, ...)
        #[arg(long)]
        mode: Option<String>,
    },
}

struct Host {
    coordinator: Coordinator,
    surfaces: Arc<HeadlessSurfaceHost>,
    settings: HostSettings,
    data_dir: Option<PathBuf>,
}

impl Host {
    fn start(data_dir: Option<PathBuf>) -> Result<Self> {
        let settings = match &data_dir {
            Some(dir) => SettingsManager::new(dir.clone()).load(),
            None => HostSettings::default(),
        };
        let config: Arc<dyn ConfigStore> = match &data_dir {
            Some(dir) => Arc::new(
                JsonConfigStore::open(&dir.join("config"))
                    .context("Failed to open plugin config store")?,
            ),
            None => Arc::new(MemoryConfigStore::new()),
        };
        let surfaces = Arc::new(HeadlessSurfaceHost::new());
        let coordinator = Coordinator::new(surfaces.clone(), config, &settings)
            .context("Failed to start plugin host")?;
        Ok(Self {
            coordinator,
            surfaces,
            settings,
            data_dir,
        })
    }

    fn plugin_dir(&self, explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir);
        }
        match &self.data_dir {
            Some(data_dir) => Ok(plugin_directory(data_dir, &self.settings)),
            None => bail!("No plugin directory: pass --dir or --data-dir"),
        }
    }

    async fn load_plugins(&self, dir: &Path) -> Value {
        let report = self.coordinator.load_wasm_plugins(dir).await;
        for failure in &report.failed {
            tracing::warn!("{}: {}", failure.path, failure.error);
        }
        json!(report)
    }
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--args must be JSON")?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let host = Host::start(cli.data_dir)?;

    match cli.command {
        Command::Plugins { dir } => {
            let dir = host.plugin_dir(dir)?;
            let report = host.load_plugins(&dir).await;
            print_json(&json!({
                "directory": dir.display().to_string(),
                "report": report,
                "plugins": host.coordinator.describe_plugins(),
            }))
        }
        Command::Call {
            dir,
            plugin,
            function,
            args,
        } => {
            let args = parse_args(&args)?;
            if let Some(dir) = dir.or_else(|| host.plugin_dir(None).ok()) {
                host.load_plugins(&dir).await;
            }
            let response = host
                .coordinator
                .call(CallerRef::Host, &plugin, &function, args)
                .await;
            let failed = !response.outcome.ok;
            print_json(&serde_json::to_value(&response)?)?;
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Catalog {
            base_url,
            category,
            categories,
        } => {
            let mut market = host.settings.market.clone();
            if let Some(url) = base_url {
                market.base_url = url;
            }
            let client = HttpCatalogClient::new(&market)?;
            if categories {
                print_json(&serde_json::to_value(client.categories().await?)?)
            } else {
                print_json(&serde_json::to_value(
                    client.catalog(category.as_deref()).await?,
                )?)
            }
        }
        Command::Template {
            title,
            channel,
            caller,
            background_url,
            mode,
        } => {
            let mut descriptor = json!({
                "title": title,
                "backgroundUrl": background_url,
                "eventChannel": channel,
                "subscribeTopics": [],
                "callerPluginId": caller,
            });
            if let Some(mode) = mode {
                descriptor["windowMode"] = json!(mode);
            }
            // Validate locally for a clearer message than a routed fault.
            TemplateDescriptor::parse(&descriptor)
                .and_then(|d| d.validate())
                .context("Invalid template options")?;

            let opened = host
                .coordinator
                .call(CallerRef::Host, TEMPLATE_PLUGIN_ID, "open", vec![descriptor])
                .await
                .outcome;
            let opened = match opened.into_result() {
                Ok(value) => value,
                Err((code, message)) => bail!("{}: {}", code, message),
            };
            let surface_id = opened["surfaceId"].as_str().unwrap_or_default();
            print_json(&json!({
                "opened": opened,
                "surface": host.surfaces.snapshot(surface_id),
            }))
        }
    }
}
