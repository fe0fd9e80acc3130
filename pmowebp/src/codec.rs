//! Encodage des images (WebP, AVIF)
//!
//! Le trait [`Codec`] isole la transformation pixel par pixel ; le reste du
//! crate ne manipule que des chemins et des octets encodés.

use anyhow::{Result, bail};
use image::{DynamicImage, ImageReader, imageops::FilterType};
use std::io::Write;
use std::path::Path;
use webp::{Encoder, WebPMemory};

use crate::format::ImageFormat;
use crate::paths::ExtraParams;

/// Vitesse de l'encodeur AVIF (1 = lent et compact, 10 = rapide)
const AVIF_SPEED: u8 = 8;

/// Encodeur d'images
///
/// Les implémentations sont appelées depuis des threads bloquants et
/// doivent donc être partageables.
pub trait Codec: Send + Sync {
    /// Encode le fichier `raw` dans `format`
    fn encode(
        &self,
        raw: &Path,
        format: ImageFormat,
        quality: u8,
        params: &ExtraParams,
    ) -> Result<Vec<u8>>;
}

/// Codec basé sur les crates `image` et `webp`
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl Codec for ImageCodec {
    fn encode(
        &self,
        raw: &Path,
        format: ImageFormat,
        quality: u8,
        params: &ExtraParams,
    ) -> Result<Vec<u8>> {
        let img = ImageReader::open(raw)?.with_guessed_format()?.decode()?;
        let img = apply_resize(img, params);

        match format {
            ImageFormat::Webp => encode_webp(&img, quality),
            ImageFormat::Avif => encode_avif(&img, quality),
            ImageFormat::Raw => bail!("raw is not an encoding target"),
        }
    }
}

/// Applique les paramètres de redimensionnement
///
/// Avec une seule dimension, l'autre suit le ratio de l'image. Les
/// dimensions demandées sont bornées à celles de la source : l'image n'est
/// jamais agrandie.
pub fn apply_resize(img: DynamicImage, params: &ExtraParams) -> DynamicImage {
    let width = params.width.min(img.width());
    let height = params.height.min(img.height());
    match (width, height) {
        (0, 0) => img,
        (w, 0) => img.resize(w, u32::MAX, FilterType::Lanczos3),
        (0, h) => img.resize(u32::MAX, h, FilterType::Lanczos3),
        (w, h) => img.resize_to_fill(w, h, FilterType::Lanczos3),
    }
}

pub fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgba = img.to_rgba8();
    let encoder = Encoder::from_rgba(&rgba, rgba.width(), rgba.height());
    let webp_data: WebPMemory = encoder.encode(f32::from(quality.min(100)));
    Ok(webp_data.to_vec())
}

pub fn encode_avif(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut buffer = Vec::new();
    let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
        &mut buffer,
        AVIF_SPEED,
        quality.clamp(1, 100),
    );
    rgba.write_with_encoder(encoder)?;
    Ok(buffer)
}

/// Produit un artefact : encode puis écrit atomiquement sur `target`
///
/// Appel bloquant, à exécuter hors du runtime asynchrone.
pub fn produce(
    codec: &dyn Codec,
    raw: &Path,
    target: &Path,
    format: ImageFormat,
    quality: u8,
    params: &ExtraParams,
) -> Result<()> {
    let started = std::time::Instant::now();
    let data = codec.encode(raw, format, quality, params)?;

    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".encode-")
        .tempfile_in(parent)?;
    tmp.write_all(&data)?;
    tmp.persist(target)?;

    tracing::info!(
        "Encoded {} -> {} ({} bytes, {:?})",
        raw.display(),
        target.display(),
        data.len(),
        started.elapsed()
    );
    Ok(())
}
