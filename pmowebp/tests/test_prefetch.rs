use pmowebp::paths::source_mtime;
use pmowebp::{
    Codec, ExtraParams, GatewaySettings, ImageFormat, ImageGateway, MetadataBackend, Origin,
    PipelineSettings, ProxySettings, prefetch,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct CountingCodec {
    calls: AtomicUsize,
}

impl Codec for CountingCodec {
    fn encode(
        &self,
        _raw: &Path,
        _format: ImageFormat,
        _quality: u8,
        _params: &ExtraParams,
    ) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![b'x'; 150])
    }
}

fn tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let pics = dir.path().join("pics");
    std::fs::create_dir_all(pics.join("a/deep")).unwrap();
    std::fs::write(pics.join("a/b.jpg"), vec![0u8; 1000]).unwrap();
    std::fs::write(pics.join("a/deep/c.png"), vec![0u8; 1000]).unwrap();
    std::fs::write(pics.join("d.gif"), vec![0u8; 1000]).unwrap();
    dir
}

#[tokio::test]
async fn test_prefetch_converts_allowed_images() {
    let dir = tree();
    let pics = dir.path().join("pics");
    let exhaust = dir.path().join("exhaust");
    let codec = Arc::new(CountingCodec::default());
    let gateway =
        ImageGateway::new(GatewaySettings::local(&pics, &exhaust), codec.clone(), None).unwrap();

    let report = prefetch(&gateway, 2).await.unwrap();
    assert_eq!(report.images, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(codec.calls.load(Ordering::SeqCst), 2);

    let mtime = source_mtime(&pics.join("a/deep/c.png")).unwrap();
    assert!(exhaust.join(format!("a/deep/c.png.{}.webp", mtime)).exists());

    // Un second passage ne refait rien
    prefetch(&gateway, 2).await.unwrap();
    assert_eq!(codec.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_prefetch_enqueues_in_lazy_mode() {
    let dir = tree();
    let pics = dir.path().join("pics");
    let exhaust = dir.path().join("exhaust");
    let pipeline = PipelineSettings {
        tick: Duration::from_secs(3600),
        ..Default::default()
    };
    let gateway = ImageGateway::new(
        GatewaySettings::local(&pics, &exhaust),
        Arc::new(CountingCodec::default()),
        Some(pipeline),
    )
    .unwrap();

    prefetch(&gateway, 1).await.unwrap();
    let pipeline = gateway.pipeline().unwrap();
    assert_eq!(pipeline.inflight().len(), 2);
    assert!(gateway.shutdown().await);
}

#[tokio::test]
async fn test_prefetch_requires_local_origin() {
    let dir = tempfile::tempdir().unwrap();
    let settings = GatewaySettings {
        origin: Origin::Proxy(ProxySettings {
            backend_url: "http://127.0.0.1:9".into(),
            host_map: HashMap::new(),
            remote_raw: dir.path().join("remote-raw"),
            timeout: Duration::from_secs(1),
            metadata_backend: MetadataBackend::File,
        }),
        ..GatewaySettings::local(dir.path(), dir.path().join("exhaust"))
    };
    let gateway = ImageGateway::new(settings, Arc::new(CountingCodec::default()), None).unwrap();
    assert!(prefetch(&gateway, 1).await.is_err());
}
