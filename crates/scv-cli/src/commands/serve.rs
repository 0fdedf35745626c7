use crate::config::ServerConfig;
use crate::logging;
use scv_session::{SessionService, StaticAuthenticator, serve_until};
use scv_store::{FsBlobStore, JsonlRecordStore};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{info, warn};

const BLOB_DIR: &str = "blobs";

pub fn run(config_path: String, bind: Option<String>) {
    logging::init_tracing();

    let mut config = ServerConfig::load(Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        process::exit(1);
    });
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        process::exit(1);
    }
    let bind_addr = config.bind_addr().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        process::exit(1);
    });

    println!("scv serve");
    println!("  Name: {}", config.name);
    println!("  Data dir: {}", config.data_dir().display());
    println!("  Bind: {bind_addr}");
    println!("  Users: {}", config.users.len());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });

    runtime.block_on(async move {
        if let Err(e) = serve_config(config, bind_addr).await {
            eprintln!("error: {e}");
            process::exit(1);
        }
    });
}

async fn serve_config(config: ServerConfig, bind: SocketAddr) -> Result<(), String> {
    let data_dir = config.data_dir();
    fs::create_dir_all(&data_dir)
        .map_err(|e| format!("failed to create {}: {e}", data_dir.display()))?;

    let records = JsonlRecordStore::open(&data_dir).map_err(|e| e.to_string())?;
    let blobs = FsBlobStore::new(data_dir.join(BLOB_DIR));
    let auth = StaticAuthenticator::new(config.users.clone());
    let service = Arc::new(SessionService::new(
        config.session_config(),
        Arc::new(records),
        Arc::new(blobs),
        Arc::new(auth),
        Handle::current(),
    ));

    let hydrating = service.clone();
    let queued = tokio::task::spawn_blocking(move || hydrating.hydrate())
        .await
        .map_err(|e| format!("hydrate task failed: {e}"))?
        .map_err(|e| e.to_string())?;

    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| format!("failed to bind {bind}: {e}"))?;
    info!(%bind, queued, name = %config.name, "scv listening");

    serve_until(listener, service.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await
    .map_err(|e| e.to_string())?;

    info!("shutting down; revoking outstanding leases");
    service.shutdown();
    Ok(())
}
