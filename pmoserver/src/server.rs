//! # Module Server - API de haut niveau pour Axum
//!
//! Ce module fournit une abstraction simple pour créer des serveurs HTTP
//! avec Axum, en cachant la configuration de l'écoute et de l'arrêt.
//!
//! ## Fonctionnalités
//!
//! - **Routes JSON simples** : endpoints avec `add_route()`
//! - **Sous-routers** : montage de routers complets avec `add_router()`
//! - **Arrêt gracieux** : sur Ctrl+C ou via [`Server::stop`]

use crate::logs::{LogHandle, LoggingOptions, init_logging};
use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use pmoconfig::get_config;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Info serveur sérialisable
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// Serveur principal
pub struct Server {
    name: String,
    listen: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    log_handle: Option<LogHandle>,
}

impl Server {
    /// Crée une nouvelle instance de serveur
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur (pour les logs)
    /// * `listen` - Adresse d'écoute (ex: "127.0.0.1")
    /// * `http_port` - Port HTTP à écouter, `0` pour un port libre
    ///
    /// # Exemple
    ///
    /// ```rust
    /// # use pmoserver::Server;
    /// let server = Server::new("MyAPI", "127.0.0.1", 3000);
    /// ```
    pub fn new(name: impl Into<String>, listen: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            shutdown: CancellationToken::new(),
            local_addr: None,
            log_handle: None,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self::new("PMOWebp", config.get_listen(), config.get_http_port())
    }

    /// Ajoute une route JSON dynamique
    ///
    /// La closure fournie est appelée à chaque requête GET sur le chemin.
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("Test", "127.0.0.1", 3000);
    /// server.add_route("/api/status", || async {
    ///     serde_json::json!({"status": "online"})
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = move || {
            let f = f.clone();
            async move { Json(f().await) }
        };

        self.mount(path, Router::new().route("/", get(handler))).await;
    }

    /// Ajoute un sous-router au serveur
    ///
    /// - Si `path` est "/", merge directement au router principal
    /// - Sinon, nest le router sous le chemin donné
    pub async fn add_router(&mut self, path: &str, sub_router: Router) {
        self.mount(path, sub_router).await;
    }

    async fn mount(&mut self, path: &str, sub_router: Router) {
        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(sub_router)
        } else {
            let normalized = format!("/{}", path.trim_start_matches('/'));
            std::mem::take(&mut *r).nest(&normalized, sub_router)
        };
    }

    /// Router courant, tel qu'il serait servi
    pub async fn router(&self) -> Router {
        self.router.read().await.clone()
    }

    /// Démarre le serveur HTTP
    ///
    /// L'écoute est ouverte avant le retour : une adresse déjà prise est
    /// une erreur. Le serveur s'arrête proprement sur Ctrl+C ou
    /// [`Server::stop`].
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// # let mut server = Server::new("Test", "127.0.0.1", 3000);
    /// server.start().await?;
    /// server.wait().await;  // Attend Ctrl+C
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind((self.listen.as_str(), self.http_port))
            .await
            .with_context(|| format!("cannot listen on {}:{}", self.listen, self.http_port))?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);

        info!("Server {} running at http://{}", self.name, addr);

        let router = self.router.read().await.clone();
        let token = self.shutdown.clone();
        let name = self.name.clone();

        self.join_handle = Some(tokio::spawn(async move {
            let shutdown = async move {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                            token.cancelled().await;
                        } else {
                            info!("Ctrl+C received, shutting down gracefully");
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Shutdown requested");
                    }
                }
            };

            if let Err(e) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Server {} stopped with error: {}", name, e);
            }
        }));

        Ok(())
    }

    /// Attend la fin du serveur
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    /// Demande l'arrêt gracieux du serveur
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Jeton annulé à l'arrêt du serveur
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Adresse effective d'écoute, connue après [`Server::start`]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Récupère les infos du serveur
    pub fn info(&self) -> ServerInfo {
        let port = self.local_addr.map(|a| a.port()).unwrap_or(self.http_port);
        ServerInfo {
            name: self.name.clone(),
            base_url: format!("http://{}:{}", self.listen, port),
            http_port: port,
        }
    }

    /// Initialise le système de logging
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::{Server, logs::LoggingOptions};
    /// # fn main() -> anyhow::Result<()> {
    /// let mut server = Server::new_configured();
    /// server.init_logging(LoggingOptions::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn init_logging(&mut self, options: LoggingOptions) -> Result<()> {
        self.log_handle = Some(init_logging(options)?);
        Ok(())
    }

    /// Poignée du logging, pour changer le niveau à chaud
    pub fn log_handle(&self) -> Option<&LogHandle> {
        self.log_handle.as_ref()
    }
}

/// Builder pattern
pub struct ServerBuilder {
    name: String,
    listen: String,
    http_port: u16,
}

impl ServerBuilder {
    /// Crée un nouveau builder
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur
    /// * `listen` - Adresse d'écoute
    /// * `http_port` - Port HTTP
    pub fn new(name: impl Into<String>, listen: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            http_port,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self {
            name: "PMOWebp".to_string(),
            listen: config.get_listen(),
            http_port: config.get_http_port(),
        }
    }

    pub fn http_port(mut self, http_port: u16) -> Self {
        self.http_port = http_port;
        self
    }

    pub fn listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Construit le serveur
    ///
    /// ```rust
    /// # use pmoserver::ServerBuilder;
    /// let server = ServerBuilder::new("MyAPI", "127.0.0.1", 3000).build();
    /// ```
    pub fn build(self) -> Server {
        Server::new(self.name, self.listen, self.http_port)
    }
}
