//! # pmoserver - Serveur web haut niveau basé sur Axum
//!
//! Cette crate fournit une abstraction simple pour créer des serveurs HTTP
//! avec Axum. Les crates de domaine y accrochent leurs routes via des traits
//! d'extension (voir `pmowebp::WebpGatewayExt`).
//!
//! ## Architecture
//!
//! - [`server`] : serveur principal et builder
//! - [`logs`] : initialisation de `tracing-subscriber`
//!
//! ## Exemple d'utilisation
//!
//! ```rust,no_run
//! use pmoserver::{ServerBuilder, logs::LoggingOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ServerBuilder::new("MyServer", "127.0.0.1", 8080).build();
//!     server.init_logging(LoggingOptions::default())?;
//!
//!     server.add_route("/api/status", || async {
//!         serde_json::json!({"status": "ok"})
//!     }).await;
//!
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

pub mod logs;
pub mod server;

pub use logs::{LogHandle, LoggingOptions, init_logging};
pub use server::{Server, ServerBuilder, ServerInfo};
