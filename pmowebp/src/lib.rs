//! # pmowebp - Passerelle HTTP de conversion d'images
//!
//! Cette crate sert des images en choisissant, pour chaque requête, la
//! représentation la plus légère que le client accepte : l'original, une
//! version WebP ou une version AVIF, produites à la demande et conservées
//! dans un répertoire de cache (« exhaust »).
//!
//! ## Fonctionnalités
//!
//! - Négociation du format à partir de `Accept` et du `User-Agent`
//! - Conversion immédiate ou différée (files à priorité, pools bornés)
//! - Une seule conversion en cours par fichier cible
//! - Mode proxy : miroir d'une origine HTTP avec revalidation par ETag
//! - Métadonnées de fraîcheur en fichiers annexes ou en base SQLite
//! - Préchargement optionnel de toute l'arborescence source
//!
//! ## Architecture
//!
//! ```text
//! gateway ──▶ format (négociation)
//!         ──▶ fetch ──▶ meta / db         (mode proxy)
//!         ──▶ paths (chemins dérivés)
//!         ──▶ coordinator ──▶ codec                    (immédiat)
//!                         ──▶ pipeline ──▶ pool ──▶ codec (différé)
//!         ──▶ select (plus petit fichier, invalidation)
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use pmowebp::{GatewaySettings, ImageCodec, ImageGateway, ImageRequest, Outcome};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = GatewaySettings::local("./pics", "./exhaust");
//!     let gateway = ImageGateway::new(settings, Arc::new(ImageCodec), None)?;
//!
//!     let request = ImageRequest::new("/photo.jpg").accept("image/webp,*/*");
//!     if let Outcome::File { path, content_type, .. } = gateway.serve(&request).await {
//!         println!("{} ({})", path.display(), content_type);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Exemple avec configuration automatique
//!
//! ```rust,no_run
//! use pmowebp::WebpGatewayExt;
//! use pmoserver::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ServerBuilder::new_configured().build();
//!     let gateway = server.init_webp_gateway_configured().await?;
//!     server.start().await?;
//!     server.wait().await;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod coordinator;
pub mod db;
pub mod fetch;
pub mod format;
pub mod gateway;
pub mod identity;
pub mod inflight;
pub mod meta;
pub mod paths;
pub mod pipeline;
pub mod pool;
pub mod prefetch;
pub mod select;

#[cfg(feature = "pmoserver")]
pub mod pmoserver_ext;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use codec::{Codec, ImageCodec};
pub use coordinator::Coordinator;
pub use db::DbMetadataStore;
pub use fetch::{FetchError, OriginFetcher};
pub use format::{ImageFormat, negotiate};
pub use gateway::{
    GatewaySettings, ImageGateway, ImageRequest, MetadataBackend, Origin, Outcome, ProxySettings,
};
pub use identity::identity_for;
pub use inflight::{Admission, InFlightGuard, InFlightSet};
pub use meta::{FileMetadataStore, FreshnessMetadata, MetadataStore};
pub use paths::{CachePaths, ExtraParams};
pub use pipeline::{CachePipeline, ConversionTask, PipelineSettings, QueueClass};
pub use prefetch::{PrefetchReport, prefetch};

#[cfg(feature = "pmoserver")]
pub use pmoserver_ext::{WebpGatewayExt, create_router};

#[cfg(feature = "pmoconfig")]
pub use config_ext::WebpConfigExt;
