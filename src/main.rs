use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plugin_vault::config::{load_config, AppConfig, LoggingConfig};
use plugin_vault::live::InMemoryLiveRegistry;
use plugin_vault::model::state::PluginState;
use plugin_vault::model::version::{Page, VersionFilter};
use plugin_vault::server::{run_http_server, AppState};
use plugin_vault::store::{open_store, StateStore};
use plugin_vault::{ChainSettings, CommitRequest, ComparisonCache, RestoreRequest, VersionChain};

/// Plugin Vault: snapshot + patch version control for plugin code
#[derive(Parser)]
#[command(name = "plugin-vault")]
#[command(
    about = "Version control for database-stored plugins. Records snapshots and patches, compares and restores versions."
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(short, long, env = "PLUGIN_VAULT_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Walk through commit, tag, compare and restore on an in-memory store
    Demo,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Demo => run_demo().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn StateStore> =
        open_store(&config.storage).context("failed to open state store")?;
    let live = Arc::new(InMemoryLiveRegistry::new());
    let settings = ChainSettings::from_config(&config.versioning)?;
    let chain = Arc::new(VersionChain::new(store, live.clone(), live.clone(), settings));
    let compare = Arc::new(ComparisonCache::new(
        chain.clone(),
        config.versioning.comparison_ttl()?,
    ));
    Ok(AppState {
        chain,
        compare,
        live,
    })
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging)?;

    tracing::info!(
        backend = ?config.storage.backend,
        snapshot_threshold = config.versioning.snapshot_threshold,
        "starting plugin-vault"
    );

    let state = build_state(&config)?;
    run_http_server(&config.server, state).await?;
    Ok(())
}

fn order_plugin(controller: &str, with_refund_route: bool) -> PluginState {
    let mut state = PluginState::new()
        .with_manifest_field("name", json!("orders"))
        .with_source("controller:OrderController", controller)
        .with_component(
            "route:GET /orders",
            plugin_vault::ComponentValue::config(json!({"handler": "OrderController.list"})),
        );
    if with_refund_route {
        state.insert(
            "route:POST /orders/:id/refund",
            plugin_vault::ComponentValue::config(json!({"handler": "OrderController.refund"})),
        );
    }
    state
}

async fn run_demo() -> anyhow::Result<()> {
    let config = AppConfig::default();
    init_logging(&LoggingConfig {
        level: "warn".to_string(),
        json: false,
    })?;

    let state = build_state(&config)?;
    let chain = &state.chain;
    let plugin = "orders";

    println!("=== Plugin Vault Demo ===\n");

    let v1 = chain
        .commit(
            CommitRequest::new(
                plugin,
                order_plugin("fn list() {\n    query_all()\n}\n", false),
            )
            .with_message("Initial import")
            .with_author("demo"),
        )
        .await?;
    println!(
        "Committed {} ({}), {} files",
        v1.version.number, v1.kind, v1.version.stats.files_changed
    );

    let v2 = chain
        .commit(
            CommitRequest::new(
                plugin,
                order_plugin("fn list() {\n    query_all()\n}\n\nfn refund() {\n    issue_refund()\n}\n", true),
            )
            .with_message("Add refunds")
            .with_author("demo"),
        )
        .await?;
    println!(
        "Committed {} ({}), +{} -{} lines",
        v2.version.number, v2.kind, v2.version.stats.lines_added, v2.version.stats.lines_deleted
    );

    let tag = chain
        .tags()
        .add(plugin, "v1.0.1", &v2.version.id, Some("demo".to_string()))
        .await?;
    println!("Tagged {} as '{}'", tag.version_id, tag.name);

    let comparison = state
        .compare
        .compare(plugin, &v1.version.id, &v2.version.id)
        .await?;
    println!("\nCompare {} -> {}:", v1.version.number, v2.version.number);
    println!("  added:    {:?}", comparison.comparison.added);
    println!("  modified: {:?}", comparison.comparison.modified);
    println!("  deleted:  {:?}", comparison.comparison.deleted);

    state.live.set_state(plugin, order_plugin("fn list() {}\n", true)).await;
    let restored = chain
        .restore(RestoreRequest {
            plugin_id: plugin.to_string(),
            target: v1.version.id.clone(),
            create_backup: true,
            author: Some("demo".to_string()),
        })
        .await?;
    println!("\nRestored to {}", restored.restored.number);
    if let Some(backup) = &restored.backup {
        println!("  backup snapshot: {}", backup.version.number);
    }

    let history = chain
        .list_versions(plugin, VersionFilter::All, Page::unbounded())
        .await?;
    println!("\nHistory ({} versions):", history.total);
    for version in &history.versions {
        println!(
            "  {} {:<8} {}{}",
            version.number,
            version.kind.to_string(),
            version.message.as_deref().unwrap_or(""),
            if version.is_current { "  <- current" } else { "" }
        );
    }

    Ok(())
}
