//! Extension pmoserver pour servir les images via HTTP
//!
//! Toutes les requêtes `GET` sont interprétées comme des chemins d'images :
//!
//! - `GET /a/b.jpg` - meilleure représentation de `b.jpg` pour ce client
//! - `GET /a/b.jpg?width=200&height=0` - idem, redimensionnée si les
//!   paramètres supplémentaires sont activés
//!
//! ## En-têtes de réponse
//!
//! - `Content-Type` : type du fichier choisi
//! - `X-Compression-Rate` : taille choisie / taille source, deux décimales
//! - `ETag` : étiquette faible, `If-None-Match` donne un `304`

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::codec::{Codec, ImageCodec};
use crate::gateway::{ImageGateway, ImageRequest, Outcome};
use crate::paths::ExtraParams;
use crate::select::{compression_ratio, weak_etag};

/// En-tête portant le rapport de compression
pub const COMPRESSION_RATE_HEADER: &str = "X-Compression-Rate";

/// Crée le router de la passerelle
///
/// À monter à la racine : le chemin de la requête est le chemin de l'image.
pub fn create_router(gateway: ImageGateway) -> Router {
    Router::new()
        .route("/{*path}", get(serve_image))
        .with_state(gateway)
}

/// Paramètres de redimensionnement de la requête
///
/// Gardés en texte : une valeur non numérique vaut 0 au lieu d'un rejet.
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub width: Option<String>,
    pub height: Option<String>,
}

impl ImageQuery {
    pub fn dimensions(&self) -> (u32, u32) {
        (
            ExtraParams::parse_dimension(self.width.as_deref()),
            ExtraParams::parse_dimension(self.height.as_deref()),
        )
    }
}

async fn serve_image(
    State(gateway): State<ImageGateway>,
    Query(query): Query<ImageQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = image_request(&uri, &headers, &query);
    let outcome = gateway.serve(&request).await;
    outcome_response(outcome, &headers).await
}

/// Construit la requête de domaine à partir de la requête HTTP
fn image_request(uri: &Uri, headers: &HeaderMap, query: &ImageQuery) -> ImageRequest {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let path = percent_decode_str(uri.path()).decode_utf8_lossy().into_owned();
    let uri_with_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let (width, height) = query.dimensions();

    ImageRequest {
        path,
        uri_with_query,
        host: host_without_port(&header_str(header::HOST)).to_ascii_lowercase(),
        client_ip: client_ip(headers),
        accept: header_str(header::ACCEPT),
        user_agent: header_str(header::USER_AGENT),
        width,
        height,
    }
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6 littérale
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded.or(real).map(str::to_string)
}

async fn outcome_response(outcome: Outcome, headers: &HeaderMap) -> Response {
    match outcome {
        Outcome::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Outcome::NotFound => (StatusCode::NOT_FOUND, "Image not found").into_response(),
        Outcome::Upstream(status, msg) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, msg).into_response()
        }
        Outcome::File {
            path,
            content_type,
            ratio,
            raw,
            raw_content_type,
            ..
        } => {
            let (data, content_type, ratio) = match tokio::fs::read(&path).await {
                Ok(data) => (data, content_type, ratio),
                // Artefact invalidé entre le choix et la lecture
                Err(e) if path != raw => {
                    warn!("Error reading file {:?}: {}, serving source", path, e);
                    match tokio::fs::read(&raw).await {
                        Ok(data) => (data, raw_content_type, compression_ratio(&raw, &raw)),
                        Err(e) => return not_found(&raw, e),
                    }
                }
                Err(e) => return not_found(&path, e),
            };

            let etag = weak_etag(&data);
            let matches = headers
                .get(header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.split(',').any(|candidate| candidate.trim() == etag));

            let mut builder = Response::builder().header(header::ETAG, &etag);
            if !ratio.is_empty() {
                builder = builder.header(COMPRESSION_RATE_HEADER, ratio);
            }

            let response = if matches {
                builder.status(StatusCode::NOT_MODIFIED).body(Body::empty())
            } else {
                builder
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(data))
            };

            response.unwrap_or_else(|e| {
                warn!("Cannot build response for {:?}: {}", path, e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
        }
    }
}

fn not_found(path: &Path, e: std::io::Error) -> Response {
    warn!("Error reading file {:?}: {}", path, e);
    (StatusCode::NOT_FOUND, "Image not found").into_response()
}

/// Trait d'extension pour ajouter la passerelle d'images à pmoserver
#[async_trait::async_trait]
pub trait WebpGatewayExt {
    /// Enregistre les routes de la passerelle à la racine du serveur
    ///
    /// # Routes enregistrées
    ///
    /// - `GET /{*path}` - image négociée
    async fn init_webp_gateway(&mut self, gateway: ImageGateway);

    /// Crée la passerelle depuis `pmoconfig` puis enregistre ses routes
    ///
    /// Le préchargement est lancé en tâche de fond si `prefetch.enabled`.
    async fn init_webp_gateway_configured(&mut self) -> anyhow::Result<ImageGateway>;
}

#[async_trait::async_trait]
impl WebpGatewayExt for pmoserver::Server {
    async fn init_webp_gateway(&mut self, gateway: ImageGateway) {
        self.add_router("/", create_router(gateway)).await;
    }

    async fn init_webp_gateway_configured(&mut self) -> anyhow::Result<ImageGateway> {
        use crate::WebpConfigExt;

        let config = pmoconfig::get_config();
        let codec: Arc<dyn Codec> = Arc::new(ImageCodec);
        let gateway = config.create_webp_gateway(codec)?;

        if config.get_prefetch_enabled() {
            let jobs = config.get_prefetch_jobs();
            let prefetched = gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::prefetch::prefetch(&prefetched, jobs).await {
                    warn!("Prefetch failed: {}", e);
                }
            });
        }

        self.init_webp_gateway(gateway.clone()).await;
        Ok(gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::codec::Codec;
    use crate::format::ImageFormat;
    use crate::gateway::GatewaySettings;

    fn query(uri: &str) -> ImageQuery {
        let uri: Uri = uri.parse().unwrap();
        Query::<ImageQuery>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn test_query_dimensions() {
        assert_eq!(query("/a.jpg?width=200&height=100").dimensions(), (200, 100));
        assert_eq!(query("/a.jpg?width=abc&foo=1").dimensions(), (0, 0));
        assert_eq!(query("/a.jpg").dimensions(), (0, 0));
    }

    #[test]
    fn test_query_dimensions_are_percent_decoded() {
        assert_eq!(query("/a.jpg?width=%32%30%30").dimensions(), (200, 0));
        assert_eq!(query("/a.jpg?w%69dth=64&height=%33%32").dimensions(), (64, 32));
    }

    #[test]
    fn test_image_request_lowercases_host() {
        let uri: Uri = "/a/b.jpg?width=10".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "Img.Example.COM:3333".parse().unwrap());

        let request = image_request(&uri, &headers, &query("/a/b.jpg?width=10"));
        assert_eq!(request.host, "img.example.com");
        assert_eq!(request.uri_with_query, "/a/b.jpg?width=10");
        assert_eq!((request.width, request.height), (10, 0));
    }

    struct SmallCodec;

    impl Codec for SmallCodec {
        fn encode(
            &self,
            _raw: &std::path::Path,
            _format: ImageFormat,
            _quality: u8,
            _params: &ExtraParams,
        ) -> anyhow::Result<Vec<u8>> {
            Ok(vec![b'w'; 200])
        }
    }

    #[tokio::test]
    async fn test_vanished_artifact_falls_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let pics = dir.path().join("pics");
        std::fs::create_dir_all(&pics).unwrap();
        std::fs::write(pics.join("b.jpg"), vec![1u8; 1000]).unwrap();

        let settings = GatewaySettings::local(&pics, dir.path().join("exhaust"));
        let gateway = ImageGateway::new(settings, Arc::new(SmallCodec), None).unwrap();

        let outcome = gateway
            .serve(&ImageRequest::new("/b.jpg").accept("image/webp"))
            .await;
        let Outcome::File { path, format, .. } = &outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(*format, ImageFormat::Webp);

        // Invalidation concurrente avant la lecture
        std::fs::remove_file(path).unwrap();

        let response = outcome_response(outcome, &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()[COMPRESSION_RATE_HEADER], "1.00");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("gone.jpg");
        let outcome = Outcome::File {
            path: raw.clone(),
            format: ImageFormat::Raw,
            content_type: "image/jpeg".into(),
            ratio: "1.00".into(),
            raw,
            raw_content_type: "image/jpeg".into(),
        };

        let response = outcome_response(outcome, &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("img.example:3333"), "img.example");
        assert_eq!(host_without_port("img.example"), "img.example");
        assert_eq!(host_without_port("[::1]:3333"), "::1");
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("1.2.3.4"));
    }
}
