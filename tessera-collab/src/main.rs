use log::{error, info};
use tessera_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open snapshot store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    let persisted = server.persist_all().await;
    info!("Persisted {persisted} page(s) on exit");
}
