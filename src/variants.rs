//! Named derivations of one image, for template call sites.
//!
//! [`ImageVariants`] wraps a resolved source and answers "which URL should I
//! print?" for each derived form:
//!
//! | Method | Returns |
//! |---|---|
//! | [`avif`](ImageVariants::avif) | AVIF variant, converting on demand |
//! | [`webp`](ImageVariants::webp) | WEBP variant, converting on demand |
//! | [`best`](ImageVariants::best) | AVIF, else WEBP, else the original |
//! | [`best_for_accept`](ImageVariants::best_for_accept) | best format the browser accepts that already exists |
//!
//! Every method returns a URL that can be served as-is. When a variant
//! cannot be had, it is the original's.

use crate::config::Settings;
use crate::convert::{ConversionRequest, Engine};
use crate::imaging::{TargetFormat, is_valid_output, resize_copy};
use crate::naming;
use crate::source::{SourceImage, SourceRef};

/// Requested display box. Either side may be left open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Size {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Size {
    /// The image at its own size.
    pub const ORIGINAL: Size = Size {
        width: None,
        height: None,
    };

    pub fn width(width: u32) -> Self {
        Self {
            width: Some(width),
            height: None,
        }
    }

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }

    pub fn is_original(self) -> bool {
        self.width.is_none() && self.height.is_none()
    }
}

pub struct ImageVariants<'a> {
    engine: &'a Engine,
    settings: &'a Settings,
    image: SourceImage,
}

impl<'a> ImageVariants<'a> {
    pub fn new(engine: &'a Engine, settings: &'a Settings, source: &SourceRef) -> Self {
        Self {
            engine,
            settings,
            image: engine.resolve(settings, source),
        }
    }

    pub fn original(&self) -> &SourceImage {
        &self.image
    }

    pub fn avif(&self, size: Size, quality: Option<u32>) -> String {
        self.variant(TargetFormat::Avif, size, quality)
    }

    /// Without size or quality this is the original when WEBP generation is
    /// disabled.
    pub fn webp(&self, size: Size, quality: Option<u32>) -> String {
        if !self.settings.policy.webp && size.is_original() && quality.is_none() {
            return self.image.url.clone();
        }
        self.variant(TargetFormat::Webp, size, quality)
    }

    /// AVIF if it can be had, else WEBP, else the original.
    pub fn best(&self) -> String {
        let avif = self.avif(Size::ORIGINAL, None);
        if avif != self.image.url {
            return avif;
        }
        self.webp(Size::ORIGINAL, None)
    }

    /// Best variant the `Accept` header allows, among those already on disk.
    ///
    /// Never converts, so it is safe on a hot request path.
    pub fn best_for_accept(&self, accept: &str) -> String {
        for format in self.settings.formats() {
            if !accepts(accept, format.mime_type()) {
                continue;
            }
            if let Some(url) = self.existing(format) {
                return url;
            }
        }
        self.image.url.clone()
    }

    /// Registry first, then a resized copy when a size is asked for, then
    /// conversion. The original must pass the policy check before it is
    /// decoded for resizing.
    fn variant(&self, format: TargetFormat, size: Size, quality: Option<u32>) -> String {
        if quality.is_none()
            && let Some(url) =
                self.engine
                    .registry()
                    .lookup(&self.image.identity, format, size.width, size.height)
        {
            return url;
        }

        let source = if size.is_original() {
            self.image.clone()
        } else {
            if let Err(e) = self.engine.admit(self.settings, &self.image, format) {
                tracing::debug!(url = %self.image.url, %format, reason = %e, "not resizing");
                return self.image.url.clone();
            }
            self.resized(size)
        };
        let mut request = ConversionRequest::new(source.url.as_str(), format);
        request.quality = quality;
        self.engine
            .convert_image(self.settings, &source, &request)
            .url
    }

    fn resized(&self, size: Size) -> SourceImage {
        let Some(path) = &self.image.path else {
            return self.image.clone();
        };
        match resize_copy(path, size.width, size.height) {
            Ok(copy) if copy != *path => {
                let name = copy
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                SourceImage {
                    url: self.image.sibling_url(&name),
                    path: Some(copy),
                    identity: self.image.identity.clone(),
                }
            }
            Ok(_) => self.image.clone(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "resize failed, using original");
                self.image.clone()
            }
        }
    }

    /// A valid variant at the default-quality destination, or a recorded one.
    fn existing(&self, format: TargetFormat) -> Option<String> {
        if let Some(url) =
            self.engine
                .registry()
                .lookup(&self.image.identity, format, None, None)
        {
            return Some(url);
        }
        let path = self.image.path.as_deref()?;
        let quality = self.settings.default_quality(format);
        let destination = naming::destination_path(path, format, quality, quality);
        let name = destination.file_name()?.to_string_lossy().into_owned();
        is_valid_output(&destination, format).then(|| self.image.sibling_url(&name))
    }
}

/// Whether an `Accept` header admits `mime`. Entries with `q=0` do not.
pub fn accepts(header: &str, mime: &str) -> bool {
    header.split(',').any(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        let media = parts.next().unwrap_or_default();
        if !media.eq_ignore_ascii_case(mime) {
            return false;
        }
        !parts.any(|p| {
            p.strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        })
    })
}
