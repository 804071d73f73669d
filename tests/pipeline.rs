//! End-to-end tests through the public API.
//!
//! A scripted backend stands in for real codecs: it writes a minimal file
//! carrying the right magic bytes, so every stage around the backend
//! (resolution, policy, caching, locking, validation, recording, cleanup)
//! runs for real against a temporary content tree.

use avifier::capability::CapabilityDetector;
use avifier::imaging::{BackendError, Capability, ConversionBackend, ConversionParams, TargetFormat};
use avifier::maintenance;
use avifier::registry::VariantRegistry;
use avifier::variants::{ImageVariants, Size};
use avifier::{ConversionError, ConversionRequest, Engine, Outcome, Settings, SourceRef, config};
use std::path::Path;
use tempfile::TempDir;

/// Writes a 120-byte file with the target format's signature.
struct Scripted;

impl ConversionBackend for Scripted {
    fn capability(&self) -> Capability {
        Capability::External
    }

    fn supports(&self, _: TargetFormat) -> bool {
        true
    }

    fn convert(&self, params: &ConversionParams) -> Result<(), BackendError> {
        let mut bytes = match params.format {
            TargetFormat::Avif => b"\x00\x00\x00\x1cftypavif\x00\x00\x00\x00avifmif1".to_vec(),
            TargetFormat::Webp => b"RIFF\x70\x00\x00\x00WEBPVP8 ".to_vec(),
        };
        bytes.resize(120, 0);
        std::fs::write(&params.output, bytes)?;
        Ok(())
    }
}

fn write_jpeg(path: &Path, width: u32, height: u32) {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 90])
    })
    .save_with_format(path, image::ImageFormat::Jpeg)
    .unwrap();
}

/// A content tree with a `config.toml` mapping `https://site.test/media` to
/// `<tmp>/media`.
fn site(extra_config: &str) -> (TempDir, Settings) {
    let tmp = TempDir::new().unwrap();
    let media = tmp.path().join("media");
    std::fs::create_dir_all(media.join("2024")).unwrap();
    let toml = format!(
        r#"
state_dir = "state"
{extra_config}

[[roots]]
url = "https://site.test/media"
path = "{}"
"#,
        media.display()
    );
    std::fs::write(tmp.path().join("config.toml"), toml).unwrap();
    let settings = config::load_config(tmp.path()).unwrap();
    (tmp, settings)
}

fn engine(settings: &Settings) -> Engine {
    Engine::new(
        CapabilityDetector::new(vec![Box::new(Scripted)], Some(&settings.state_dir)),
        VariantRegistry::open(&settings.state_dir),
    )
}

#[test]
fn url_under_root_converts_and_is_indexed() {
    let (tmp, settings) = site("");
    write_jpeg(&tmp.path().join("media/2024/dawn.jpg"), 64, 64);
    let engine = engine(&settings);

    let request = ConversionRequest::new(
        "https://site.test/media/2024/dawn.jpg?v=2",
        TargetFormat::Avif,
    );
    let first = engine.convert(&settings, &request);
    assert_eq!(first.outcome, Outcome::Converted);
    assert_eq!(first.url, "https://site.test/media/2024/dawn.avif");
    assert!(tmp.path().join("media/2024/dawn.avif").exists());

    let second = engine.convert(&settings, &request);
    assert_eq!(second.outcome, Outcome::Cached);
    assert_eq!(second.url, first.url);

    assert!(tmp.path().join("state/capabilities.json").exists());
    assert!(tmp.path().join("state/variants.json").exists());
    let identity = engine.resolve(&settings, &request.source).identity;
    assert_eq!(
        engine.registry().lookup(&identity, TargetFormat::Avif, None, None),
        Some(first.url)
    );
}

#[test]
fn remote_url_passes_through() {
    let (_tmp, settings) = site("");
    let engine = engine(&settings);

    let result = engine.convert(
        &settings,
        &ConversionRequest::new("https://cdn.other.test/pic.jpg", TargetFormat::Webp),
    );
    assert_eq!(result.url, "https://cdn.other.test/pic.jpg");
    assert!(matches!(
        result.outcome,
        Outcome::Fallback(ConversionError::SourceUnresolvable(_))
    ));
}

#[test]
fn configured_limits_reject_large_sources() {
    let (tmp, settings) = site("[limits]\nmax_dimension = 1000");
    write_jpeg(&tmp.path().join("media/wide.jpg"), 1200, 100);
    let engine = engine(&settings);

    let result = engine.convert(
        &settings,
        &ConversionRequest::new("https://site.test/media/wide.jpg", TargetFormat::Avif),
    );
    assert_eq!(result.url, "https://site.test/media/wide.jpg");
    assert!(!tmp.path().join("media/wide.avif").exists());
}

#[test]
fn upload_bulk_and_purge_lifecycle() {
    let (tmp, settings) = site("[uploads]\nauto_convert = false");
    let media = tmp.path().join("media");
    let original = media.join("2024/sea.jpg");
    let thumb = media.join("2024/sea-32x32.jpg");
    write_jpeg(&original, 64, 64);
    write_jpeg(&thumb, 32, 32);
    let engine = engine(&settings);

    let (attachment, stats) = maintenance::register_upload(
        &engine,
        &settings,
        "https://site.test/media/2024/sea.jpg",
        &original,
        vec![thumb.clone()],
    )
    .unwrap();
    assert_eq!(stats.total(), 0);

    let stats = maintenance::bulk_convert(&engine, &settings, false, None);
    assert_eq!(stats.converted, 4);
    assert!(media.join("2024/sea-32x32.webp").exists());

    let source = SourceRef::from("https://site.test/media/2024/sea.jpg");
    let variants = ImageVariants::new(&engine, &settings, &source);
    assert_eq!(variants.original().identity, attachment.identity());
    assert_eq!(
        variants.best_for_accept("image/avif,image/webp,*/*"),
        "https://site.test/media/2024/sea.avif"
    );
    assert_eq!(
        variants.avif(Size::width(32), None),
        "https://site.test/media/2024/sea-32x32.avif"
    );

    let purged = maintenance::purge(&engine, &settings).unwrap();
    assert_eq!(purged.removed, 4);
    assert!(original.exists());
    assert!(thumb.exists());
    assert_eq!(
        variants.best_for_accept("image/avif"),
        "https://site.test/media/2024/sea.jpg"
    );
}

#[test]
fn clear_cache_redetects() {
    let (tmp, settings) = site("");
    let engine = engine(&settings);

    assert_eq!(
        engine.detector().detect(TargetFormat::Avif),
        Capability::External
    );
    let verdicts = engine.detector().clear();
    assert_eq!(
        verdicts,
        vec![
            (TargetFormat::Avif, Capability::External),
            (TargetFormat::Webp, Capability::External)
        ]
    );
    assert!(tmp.path().join("state/capabilities.json").exists());
}
