//! CloudShop — storefront provisioning server.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cloudshop_core::CloudShopConfig;
use cloudshop_runtime::HttpCapability;
use cloudshop_store::DocumentStore;

mod error;
mod routes;
mod seed;
mod state;

use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("CLOUDSHOP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn open_store(config: &CloudShopConfig) -> anyhow::Result<Arc<DocumentStore>> {
    let store = DocumentStore::open(&config.db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let data_dir = resolve_data_dir();

    // Handle CLI subcommands
    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => {}
            "seed" => {
                if args.len() < 3 {
                    eprintln!("Usage: cloudshop seed <file.json>");
                    std::process::exit(1);
                }
                let config = CloudShopConfig::from_env(&data_dir)?;
                let store = open_store(&config)?;
                let report = seed::run_seed(&PathBuf::from(&args[2]), store);
                seed::print_report(&report);
                std::process::exit(if report.errors.is_empty() { 0 } else { 1 });
            }
            "--help" | "-h" | "help" => {
                println!("CloudShop — storefront provisioning server");
                println!();
                println!("Usage: cloudshop [command]");
                println!();
                println!("Commands:");
                println!("  serve (default)          Start the server");
                println!("  seed <file.json>         Load templates, builder entries and options");
                println!("  help                     Show this help message");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'cloudshop help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    info!("Data directory: {}", data_dir.display());

    let config = CloudShopConfig::from_env(&data_dir)?;
    let port = config.port;
    let store = open_store(&config)?;

    let capability = HttpCapability::new(config.capability_base_url.clone())?;
    info!(
        "Creation endpoints at {}, concurrency {}",
        capability.base_url(),
        config.orchestrator.concurrency
    );

    let state = Arc::new(AppState::new(config, store, Arc::new(capability)));
    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("CloudShop server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
