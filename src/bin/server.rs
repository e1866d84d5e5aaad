//! yrelay-server: relay Yjs documents between WebSocket clients.
//!
//! Every URL path names a room; clients connecting to the same path share
//! one document. Updates can be persisted per document to a directory of
//! append-only files or to a single SQLite database.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yrelay::api;
use yrelay::registry::{Registry, RegistryOptions, StoreFactory};
use yrelay::store::{FileStore, SqliteStore, UpdateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Keep documents in memory only
    None,
    /// One append-only file per document under --store-path
    File,
    /// One shared SQLite database at --store-path
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "yrelay-server", about = "Collaborative document relay")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "YRELAY_ADDR", default_value = "127.0.0.1:8037")]
    addr: String,

    /// Update persistence backend
    #[arg(long, value_enum, env = "YRELAY_STORE", default_value = "none")]
    store: StoreKind,

    /// Store root directory (file) or database file (sqlite)
    #[arg(long, env = "YRELAY_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Squash a document's history once its newest update is older than
    /// this many seconds (sqlite store only)
    #[arg(long, env = "YRELAY_DOCUMENT_TTL")]
    document_ttl: Option<f64>,

    /// Keep rooms alive after their last client disconnects
    #[arg(long)]
    keep_empty_rooms: bool,

    /// Restart a room's tasks after a handled error
    #[arg(long)]
    auto_restart: bool,
}

fn store_factory(args: &Args) -> Option<StoreFactory> {
    match args.store {
        StoreKind::None => None,
        StoreKind::File => {
            let root = args
                .store_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("yrelay-data"));
            Some(Arc::new(move |name: &str| {
                let file = root.join(name.trim_start_matches('/'));
                Arc::new(FileStore::new(file)) as Arc<dyn UpdateStore>
            }))
        }
        StoreKind::Sqlite => {
            let db_path = args
                .store_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("yrelay.db"));
            let ttl = args.document_ttl;
            Some(Arc::new(move |name: &str| {
                let mut store = SqliteStore::new(db_path.clone(), name);
                if let Some(ttl) = ttl {
                    store = store.with_document_ttl(ttl);
                }
                Arc::new(store) as Arc<dyn UpdateStore>
            }))
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = RegistryOptions {
        auto_clean_rooms: !args.keep_empty_rooms,
        auto_restart: args.auto_restart,
        exception_handler: Some(yrelay::exception_logger()),
        store_factory: store_factory(&args),
        ..RegistryOptions::default()
    };
    let registry = Arc::new(Registry::new(options));
    if let Err(e) = registry.start().await {
        tracing::error!("failed to start registry: {}", e);
        std::process::exit(1);
    }

    let app = api::router(registry.clone()).layer(TraceLayer::new_for_http());
    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("yrelay-server listening on ws://{}", args.addr);

    let registry_for_shutdown = registry.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = signal::ctrl_c().await;
        tracing::info!("shutting down");
    });
    if let Err(e) = serve.await {
        tracing::error!("server error: {}", e);
    }
    if let Err(e) = registry_for_shutdown.stop().await {
        tracing::error!("failed to stop registry: {}", e);
    }
}
