//! Backend adapters for the supported text recognition services.
//!
//! Each adapter declares its input limits and rate cap and turns one image
//! into a [`Recognition`]. Adapters classify their own failures: credential
//! and permission problems become [`HtrError::Auth`], throttling becomes
//! [`HtrError::RateLimit`], and everything else a service can do wrong
//! becomes [`HtrError::Service`]. The orchestrator reacts to the class, not
//! to backend-specific details.

mod google;
mod microsoft;
mod mistral;

pub use google::GoogleAdapter;
pub use microsoft::MicrosoftAdapter;
pub use mistral::MistralAdapter;

use std::fs;
use std::path::Path;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{HtrError, Result};
use crate::models::Recognition;

/// All recognized service names, in the order adapters run when no explicit
/// selection is given.
pub const SERVICE_NAMES: &[&str] = &["google", "microsoft", "mistral"];

#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maximum sustained calls per second this backend tolerates.
    fn max_rate(&self) -> f64;

    /// Largest accepted image in bytes, if the backend documents one.
    fn max_size(&self) -> Option<u64>;

    /// Largest accepted image dimensions, if the backend documents them.
    fn max_dimensions(&self) -> Option<(u32, u32)>;

    async fn recognize(&self, image: &Path) -> Result<Recognition>;
}

/// Construct the adapter for `name`. Unknown names are a usage error;
/// missing or malformed credentials surface as [`HtrError::Auth`] so the
/// caller can disable just this adapter.
pub fn adapter_for(name: &str, config: &Config) -> Result<Box<dyn ServiceAdapter>> {
    match name {
        "google" => Ok(Box::new(GoogleAdapter::new(config)?)),
        "microsoft" => Ok(Box::new(MicrosoftAdapter::new(config)?)),
        "mistral" => Ok(Box::new(MistralAdapter::new(config)?)),
        other => Err(HtrError::Internal(format!("Unknown service '{other}'"))),
    }
}

/// Read an image file and verify it against an adapter's declared limits.
/// Inputs are normalized before any adapter runs, so a violation here means
/// the pipeline produced something the backend would reject anyway.
pub(crate) fn read_image_checked(
    image: &Path,
    max_size: Option<u64>,
    max_dimensions: Option<(u32, u32)>,
) -> Result<Vec<u8>> {
    let bytes = fs::read(image)?;
    if bytes.is_empty() {
        return Err(HtrError::CorruptedContent(format!(
            "File is empty: {}",
            image.display()
        )));
    }
    if let Some(limit) = max_size {
        if bytes.len() as u64 > limit {
            return Err(HtrError::Service(format!(
                "{} is {} bytes, over the {} byte limit",
                image.display(),
                bytes.len(),
                limit
            )));
        }
    }
    if let Some((max_w, max_h)) = max_dimensions {
        let (width, height) = image::image_dimensions(image).map_err(|e| {
            HtrError::CorruptedContent(format!("Cannot read {}: {e}", image.display()))
        })?;
        if width > max_w || height > max_h {
            return Err(HtrError::Service(format!(
                "{} is {width}x{height} pixels, over the {max_w}x{max_h} limit",
                image.display()
            )));
        }
    }
    Ok(bytes)
}

/// Pull a `Retry-After` delay (in seconds) out of a throttled response.
pub(crate) fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_service_is_rejected() {
        let config = Config::default();
        let result = adapter_for("tesseract", &config);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_file_is_corrupted_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.png");
        fs::write(&path, b"").unwrap();

        let err = read_image_checked(&path, None, None).unwrap_err();
        assert!(matches!(err, HtrError::CorruptedContent(_)));
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        assert!(read_image_checked(&path, Some(1024), None).is_err());
        assert!(read_image_checked(&path, Some(4096), None).is_ok());
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        image::DynamicImage::new_rgb8(64, 32).save(&path).unwrap();

        let err = read_image_checked(&path, None, Some((32, 32))).unwrap_err();
        assert!(matches!(err, HtrError::Service(_)));
        assert!(read_image_checked(&path, None, Some((64, 64))).is_ok());
    }
}
