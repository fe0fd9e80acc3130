#![cfg(feature = "pmoserver")]

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pmowebp::{Codec, ExtraParams, GatewaySettings, ImageFormat, ImageGateway, create_router};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

struct FixedCodec;

impl Codec for FixedCodec {
    fn encode(
        &self,
        _raw: &Path,
        format: ImageFormat,
        _quality: u8,
        _params: &ExtraParams,
    ) -> anyhow::Result<Vec<u8>> {
        let size = if format == ImageFormat::Avif { 120 } else { 250 };
        Ok(vec![b'w'; size])
    }
}

fn setup() -> (tempfile::TempDir, axum::Router) {
    let dir = tempfile::tempdir().unwrap();
    let pics = dir.path().join("pics");
    std::fs::create_dir_all(pics.join("a")).unwrap();
    std::fs::write(pics.join("a/b.jpg"), vec![0u8; 1000]).unwrap();
    std::fs::write(pics.join("a/my pic.png"), vec![0u8; 500]).unwrap();

    let settings = GatewaySettings::local(&pics, dir.path().join("exhaust"));
    let gateway = ImageGateway::new(settings, Arc::new(FixedCodec), None).unwrap();
    (dir, create_router(gateway))
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

#[tokio::test]
async fn test_webp_response_headers() {
    let (_dir, router) = setup();

    let response = router
        .clone()
        .oneshot(
            get("/a/b.jpg")
                .header(header::ACCEPT, "image/webp,*/*")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
    assert_eq!(response.headers()["x-compression-rate"], "0.25");
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
    assert!(etag.starts_with("W/\"250-"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), 250);

    // Revalidation
    let response = router
        .oneshot(
            get("/a/b.jpg")
                .header(header::ACCEPT, "image/webp")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_raw_response_content_type() {
    let (_dir, router) = setup();

    let response = router
        .oneshot(get("/a/my%20pic.png").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()["x-compression-rate"], "1.00");
}

#[tokio::test]
async fn test_error_statuses() {
    let (_dir, router) = setup();

    let response = router
        .clone()
        .oneshot(get("/a/b.gif").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(get("/a/none.jpg").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
