use linedit_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!("Starting line editor server with {config:?}");

    if let Err(e) = CollabServer::new(config).run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
