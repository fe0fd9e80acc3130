use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};
use pmowebp::codec::{apply_resize, encode_webp, produce};
use pmowebp::{Codec, ExtraParams, ImageCodec, ImageFormat};

/// Crée une image de test simple
fn create_test_image(width: u32, height: u32) -> DynamicImage {
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        if (x + y) % 2 == 0 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([0, 0, 255, 255])
        }
    });
    DynamicImage::ImageRgba8(img)
}

#[test]
fn test_encode_webp_signature() {
    let data = encode_webp(&create_test_image(64, 64), 80).unwrap();
    assert_eq!(&data[0..4], b"RIFF");
    assert_eq!(&data[8..12], b"WEBP");
}

#[test]
fn test_resize_keeps_aspect_ratio_with_one_side() {
    let img = create_test_image(400, 200);

    let resized = apply_resize(img.clone(), &ExtraParams::new(100, 0));
    assert_eq!(resized.dimensions(), (100, 50));

    let resized = apply_resize(img.clone(), &ExtraParams::new(0, 50));
    assert_eq!(resized.dimensions(), (100, 50));

    let filled = apply_resize(img.clone(), &ExtraParams::new(60, 60));
    assert_eq!(filled.dimensions(), (60, 60));

    let untouched = apply_resize(img, &ExtraParams::default());
    assert_eq!(untouched.dimensions(), (400, 200));
}

#[test]
fn test_resize_never_upscales() {
    let img = create_test_image(40, 20);

    let clamped = apply_resize(img.clone(), &ExtraParams::new(100_000, 100_000));
    assert_eq!(clamped.dimensions(), (40, 20));

    let clamped = apply_resize(img.clone(), &ExtraParams::new(100_000, 0));
    assert_eq!(clamped.dimensions(), (40, 20));

    let filled = apply_resize(img, &ExtraParams::new(100_000, 10));
    assert_eq!(filled.dimensions(), (40, 10));
}

#[test]
fn test_produce_writes_target() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("photo.png");
    create_test_image(120, 80).save(&raw).unwrap();

    let target = dir.path().join("exhaust/photo.png.1.webp");
    produce(
        &ImageCodec,
        &raw,
        &target,
        ImageFormat::Webp,
        75,
        &ExtraParams::new(60, 0),
    )
    .unwrap();

    let data = std::fs::read(&target).unwrap();
    assert_eq!(&data[8..12], b"WEBP");
    let decoded = image::load_from_memory(&data).unwrap();
    assert_eq!(decoded.dimensions(), (60, 40));
}

#[test]
fn test_undecodable_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("broken.jpg");
    std::fs::write(&raw, b"definitely not an image").unwrap();

    let result = ImageCodec.encode(&raw, ImageFormat::Webp, 80, &ExtraParams::default());
    assert!(result.is_err());

    let target = dir.path().join("broken.jpg.1.webp");
    assert!(produce(&ImageCodec, &raw, &target, ImageFormat::Webp, 80, &ExtraParams::default()).is_err());
    assert!(!target.exists());
}
