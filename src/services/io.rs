//! Image I/O operations service
//!
//! Decodes every supported source form into an [`RgbaImage`] before any
//! pipeline work starts, and encodes results back into PNG bytes.

use crate::download::{ChunkedFetcher, FetchOptions};
use crate::error::{BgRemovalError, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use reqwest::Url;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Something an image can be read from
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Local file
    Path(PathBuf),
    /// Remote image fetched through the transport
    Url(Url),
    /// Encoded image bytes
    Bytes(Vec<u8>),
    /// Already decoded pixels
    Decoded(RgbaImage),
}

impl ImageSource {
    /// Interpret a string locator
    ///
    /// `http`, `https`, `file` and `data` URLs are treated as URLs, anything
    /// else as a filesystem path.
    #[must_use]
    pub fn parse(locator: &str) -> Self {
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_or_else(|()| Self::Path(PathBuf::from(locator)), Self::Path),
            _ => Self::Path(PathBuf::from(locator)),
        }
    }

    /// Short description for logs and error messages
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => format!("file {}", path.display()),
            Self::Url(url) => format!("url {}", url),
            Self::Bytes(bytes) => format!("{} encoded bytes", bytes.len()),
            Self::Decoded(image) => format!("{}x{} decoded image", image.width(), image.height()),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for ImageSource {
    fn from(locator: &str) -> Self {
        Self::parse(locator)
    }
}

impl From<Url> for ImageSource {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<RgbaImage> for ImageSource {
    fn from(image: RgbaImage) -> Self {
        Self::Decoded(image)
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        Self::Decoded(image.to_rgba8())
    }
}

/// Service for handling image input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Decode any source into RGBA pixels
    ///
    /// URLs are downloaded with `fetcher` using the same headers, timeout
    /// and cancellation as artifact downloads.
    ///
    /// # Errors
    /// - `Io` when a file cannot be read
    /// - Transport errors for URLs
    /// - `UnsupportedFormat` when the bytes are not a decodable image
    pub async fn load(
        source: ImageSource,
        fetcher: &ChunkedFetcher,
        options: &FetchOptions,
    ) -> Result<RgbaImage> {
        match source {
            ImageSource::Decoded(image) => Ok(image),
            ImageSource::Bytes(bytes) => Self::decode(&bytes),
            ImageSource::Path(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| BgRemovalError::file_io_error("read image file", &path, &e))?;
                Self::decode(&bytes).map_err(|e| match e {
                    BgRemovalError::UnsupportedFormat(msg) => BgRemovalError::unsupported_format(
                        format!("{} ({})", msg, path.display()),
                    ),
                    other => other,
                })
            },
            ImageSource::Url(url) => {
                log::debug!("Fetching input image from {}", url);
                let bytes = fetcher.fetch_url(url, options).await?;
                Self::decode(&bytes)
            },
        }
    }

    /// Decode encoded image bytes, detecting the container from content
    ///
    /// # Errors
    /// - `UnsupportedFormat` for unknown or corrupt containers
    pub fn decode(bytes: &[u8]) -> Result<RgbaImage> {
        let format = image::guess_format(bytes).map_err(|e| {
            BgRemovalError::unsupported_format(format!(
                "Unrecognised image container ({} bytes): {}",
                bytes.len(),
                e
            ))
        })?;
        let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
            BgRemovalError::unsupported_format(format!("Failed to decode {:?} image: {}", format, e))
        })?;
        Ok(image.to_rgba8())
    }

    /// Encode pixels as PNG
    ///
    /// # Errors
    /// - PNG encoder failures
    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).map_err(|e| {
            BgRemovalError::processing_stage_error(
                "image encode",
                &format!("Failed to encode PNG: {}", e),
                Some(&format!("{}x{}", image.width(), image.height())),
            )
        })?;
        Ok(buffer.into_inner())
    }

    /// Write PNG bytes to `path`, creating parent directories
    ///
    /// # Errors
    /// - Encoding or filesystem failures
    pub async fn save_png<P: AsRef<Path>>(image: &RgbaImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BgRemovalError::file_io_error("create output directory", parent, &e)
            })?;
        }
        let bytes = Self::encode_png(image)?;
        tokio::fs::write(path_ref, bytes)
            .await
            .map_err(|e| BgRemovalError::file_io_error("write output image", path_ref, &e))
    }
}
