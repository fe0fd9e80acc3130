use pmoconfig::get_config;
use pmoserver::{LoggingOptions, Server};
use pmowebp::WebpGatewayExt;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ========== PHASE 1 : Infrastructure ==========
    let config = get_config();

    let mut server = Server::new_configured();
    server.init_logging(LoggingOptions::from_config(&config))?;
    info!("Using config directory {}", config.get_config_dir());

    server
        .add_route("/info", || async {
            serde_json::json!({"name": "PMOWebp", "version": env!("CARGO_PKG_VERSION")})
        })
        .await;

    // ========== PHASE 2 : Passerelle d'images ==========
    info!("Initializing image gateway...");
    let gateway = server.init_webp_gateway_configured().await?;
    info!(
        "Gateway ready ({} mode, avif {})",
        if gateway.pipeline().is_some() { "lazy" } else { "eager" },
        if gateway.settings().enable_avif { "on" } else { "off" }
    );

    // ========== PHASE 3 : Démarrage du serveur ==========
    info!("Starting HTTP server...");
    server.start().await?;

    info!("PMOWebp is ready!");
    info!("Press Ctrl+C to stop...");
    server.wait().await;

    if !gateway.shutdown().await {
        tracing::warn!("Some conversions were still running at shutdown");
    }
    info!("Bye");
    Ok(())
}
