//! Normalization of input images to the run's constraint set.
//!
//! Every selected backend accepts PNG, so all inputs are converted to PNG
//! and then shrunk until they fit the tightest dimension and byte-size
//! bounds across the selected backends. Each step writes a derived file
//! named `<stem>.htrbench.png` next to the outputs and reuses it on later
//! runs when it already satisfies the current constraints.

use std::collections::HashSet;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::AnimationDecoder;
use tracing::{debug, info, warn};

use crate::config::{DERIVED_INFIX, OUTPUT_FORMAT};
use crate::error::{HtrError, Result};
use crate::models::{ConstraintSet, Item, NormalizedImage};

pub struct Normalizer {
    constraints: ConstraintSet,
}

impl Normalizer {
    pub fn new(constraints: ConstraintSet) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> ConstraintSet {
        self.constraints
    }

    /// Produce an image derived from `item` that satisfies the constraint
    /// set, writing derived files into `dest_dir`. Any failure is a
    /// per-item error: the caller skips the item and continues the batch.
    pub fn normalize(&self, item: &Item, dest_dir: &Path) -> Result<NormalizedImage> {
        let mut temp_files = HashSet::new();
        let derived = derived_path(&item.file, dest_dir);
        let mut file = item.file.clone();

        if canonical_format(&item.format) != OUTPUT_FORMAT {
            file = self.converted(&file, &item.format, &derived)?;
            temp_files.insert(file.clone());
        }

        if let Some((max_w, max_h)) = self.constraints.max_dimensions {
            let (width, height) = image::image_dimensions(&file)?;
            if width > max_w || height > max_h {
                file = self.resized_to_dimensions(&file, &derived, max_w, max_h)?;
                temp_files.insert(file.clone());
            }
        }

        if let Some(max_size) = self.constraints.max_size {
            let size = file_size(&file)?;
            if size > max_size {
                file = self.resized_to_byte_size(&file, &derived, size, max_size)?;
                temp_files.insert(file.clone());
            }
        }

        Ok(NormalizedImage {
            item_file: item.file.clone(),
            file,
            dest_dir: dest_dir.to_path_buf(),
            temp_files,
        })
    }

    fn converted(&self, file: &Path, format: &str, derived: &Path) -> Result<PathBuf> {
        if derived.exists() {
            info!("Using existing converted image {}", derived.display());
            return Ok(derived.to_path_buf());
        }
        info!("Converting {} to {}", file.display(), OUTPUT_FORMAT);
        let img = decode_first_page(file, format)?;
        img.save(derived)?;
        Ok(derived.to_path_buf())
    }

    fn resized_to_dimensions(
        &self,
        file: &Path,
        derived: &Path,
        max_w: u32,
        max_h: u32,
    ) -> Result<PathBuf> {
        if file != derived && derived.exists() {
            if let Ok((w, h)) = image::image_dimensions(derived) {
                if w <= max_w && h <= max_h {
                    info!("Reusing reduced image {}", derived.display());
                    return Ok(derived.to_path_buf());
                }
                debug!(
                    "Existing derived file is {}x{}, larger than {}x{}; recomputing",
                    w, h, max_w, max_h
                );
            }
        }
        info!("Dimensions too large; reducing {}", file.display());
        let img = image::ImageReader::open(file)?.decode()?;
        // resize() fits within the bounds, shrinking by the larger of the
        // two per-axis ratios and preserving the aspect ratio.
        let resized = img.resize(max_w, max_h, FilterType::Lanczos3);
        resized.save(derived)?;
        Ok(derived.to_path_buf())
    }

    /// Shrink a file whose encoded size exceeds the byte bound. This scales
    /// the pixel dimensions once by `max_size / current_size` and re-saves;
    /// it is a single-pass estimate, not a convergence loop, so the result
    /// is usually but not provably under the limit.
    fn resized_to_byte_size(
        &self,
        file: &Path,
        derived: &Path,
        current: u64,
        max_size: u64,
    ) -> Result<PathBuf> {
        if file != derived && derived.exists() {
            if let Ok(size) = file_size(derived) {
                if size <= max_size {
                    info!("Reusing resized image {}", derived.display());
                    return Ok(derived.to_path_buf());
                }
                debug!(
                    "Existing derived file is {} bytes, over the {} byte limit; recomputing",
                    size, max_size
                );
            }
        }
        info!("Size too large; reducing {}", file.display());
        let ratio = max_size as f64 / current as f64;
        let img = image::ImageReader::open(file)?.decode()?;
        let new_w = ((img.width() as f64 * ratio).round() as u32).max(1);
        let new_h = ((img.height() as f64 * ratio).round() as u32).max(1);
        debug!("Rescaling to {}x{}", new_w, new_h);
        let resized = img.resize_exact(new_w, new_h, FilterType::Lanczos3);
        resized.save(derived)?;
        Ok(derived.to_path_buf())
    }
}

/// Derived-file path for an input: `<dest_dir>/<stem>.htrbench.png`. A file
/// that already carries the infix keeps its name, so repeated runs converge
/// on one derived artifact per item.
pub fn derived_path(file: &Path, dest_dir: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let stem = stem
        .strip_suffix(DERIVED_INFIX)
        .map(str::to_string)
        .unwrap_or(stem);
    dest_dir.join(format!("{stem}{DERIVED_INFIX}.{OUTPUT_FORMAT}"))
}

/// Map format-name aliases onto one spelling.
pub fn canonical_format(format: &str) -> String {
    match format.to_lowercase().as_str() {
        "jpg" | "jpeg" => "jpeg".to_string(),
        "tif" | "tiff" => "tiff".to_string(),
        other => other.to_string(),
    }
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Decode the first page of a source image. Multi-page sources are valid
/// input but only their first page is used; the dropped pages are logged,
/// not an error.
fn decode_first_page(file: &Path, format: &str) -> Result<image::DynamicImage> {
    match canonical_format(format).as_str() {
        "gif" => {
            let reader = BufReader::new(fs::File::open(file)?);
            let decoder = image::codecs::gif::GifDecoder::new(reader)?;
            let mut frames = decoder.into_frames();
            let first = frames
                .next()
                .transpose()?
                .ok_or_else(|| HtrError::CorruptedContent(format!("No frames in {}", file.display())))?;
            let dropped = frames.count();
            if dropped > 0 {
                warn!(
                    "{} has {} additional frames; using only the first",
                    file.display(),
                    dropped
                );
            }
            Ok(image::DynamicImage::ImageRgba8(first.into_buffer()))
        }
        "tiff" => {
            // The TIFF decoder reads the first directory; later pages are
            // not reachable through it.
            info!("{} is TIFF; only the first page is used", file.display());
            Ok(image::ImageReader::open(file)?.decode()?)
        }
        _ => Ok(image::ImageReader::open(file)?.decode()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::time::Duration;

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = DynamicImage::new_rgb8(width, height);
        img.save(path).unwrap();
    }

    fn test_item(file: &Path, format: &str) -> Item {
        Item {
            source: file.display().to_string(),
            file: file.to_path_buf(),
            format: format.to_string(),
        }
    }

    #[test]
    fn test_canonical_format_aliases() {
        assert_eq!(canonical_format("JPG"), "jpeg");
        assert_eq!(canonical_format("jpeg"), "jpeg");
        assert_eq!(canonical_format("tif"), "tiff");
        assert_eq!(canonical_format("png"), "png");
    }

    #[test]
    fn test_derived_path_is_stable_under_reapplication() {
        let dir = PathBuf::from("/out");
        let first = derived_path(Path::new("/in/scan.jpg"), &dir);
        assert_eq!(first, PathBuf::from("/out/scan.htrbench.png"));
        let second = derived_path(&first, &dir);
        assert_eq!(second, first);
    }

    #[test]
    fn test_compliant_png_passes_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.png");
        write_test_image(&file, 100, 80);

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: Some(10 * 1024 * 1024),
            max_dimensions: Some((4000, 4000)),
            max_rate: f64::INFINITY,
        });
        let normalized = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();

        assert_eq!(normalized.file, file);
        assert!(normalized.temp_files.is_empty());
    }

    #[test]
    fn test_conversion_to_png() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.bmp");
        write_test_image(&file, 60, 60);

        let normalizer = Normalizer::new(ConstraintSet::unbounded());
        let normalized = normalizer
            .normalize(&test_item(&file, "bmp"), dir.path())
            .unwrap();

        assert_eq!(normalized.file, dir.path().join("page.htrbench.png"));
        assert!(normalized.temp_files.contains(&normalized.file));
        let (w, h) = image::image_dimensions(&normalized.file).unwrap();
        assert_eq!((w, h), (60, 60));
    }

    #[test]
    fn test_dimension_reduction_preserves_aspect_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wide.png");
        write_test_image(&file, 2000, 500);

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((1000, 1000)),
            max_rate: f64::INFINITY,
        });
        let normalized = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();

        let (w, h) = image::image_dimensions(&normalized.file).unwrap();
        assert_eq!(w, 1000);
        assert_eq!(h, 250);
    }

    #[test]
    fn test_output_never_exceeds_dimension_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tall.png");
        write_test_image(&file, 300, 2400);

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((800, 600)),
            max_rate: f64::INFINITY,
        });
        let normalized = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();

        let (w, h) = image::image_dimensions(&normalized.file).unwrap();
        assert!(w <= 800);
        assert!(h <= 600);
    }

    #[test]
    fn test_existing_derived_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.png");
        write_test_image(&file, 2000, 2000);

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((500, 500)),
            max_rate: f64::INFINITY,
        });
        let first = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();
        let modified = fs::metadata(&first.file).unwrap().modified().unwrap();

        // A second run must reuse the derived file rather than recompute it.
        std::thread::sleep(Duration::from_millis(20));
        let second = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();
        assert_eq!(second.file, first.file);
        assert_eq!(
            fs::metadata(&second.file).unwrap().modified().unwrap(),
            modified
        );
    }

    #[test]
    fn test_stale_derived_file_is_recomputed_for_tighter_constraints() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.png");
        write_test_image(&file, 2000, 2000);

        let loose = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((1500, 1500)),
            max_rate: f64::INFINITY,
        });
        loose
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();

        let tight = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((400, 400)),
            max_rate: f64::INFINITY,
        });
        let normalized = tight
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();
        let (w, h) = image::image_dimensions(&normalized.file).unwrap();
        assert!(w <= 400 && h <= 400);
    }

    #[test]
    fn test_byte_size_reduction_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("noisy.png");
        // Noise compresses poorly, giving a usefully large PNG.
        let img = image::RgbImage::from_fn(600, 600, |x, y| {
            image::Rgb([(x * 7 % 251) as u8, (y * 13 % 241) as u8, ((x ^ y) % 239) as u8])
        });
        DynamicImage::ImageRgb8(img).save(&file).unwrap();
        let original_size = fs::metadata(&file).unwrap().len();

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: Some(original_size / 2),
            max_dimensions: None,
            max_rate: f64::INFINITY,
        });
        let normalized = normalizer
            .normalize(&test_item(&file, "png"), dir.path())
            .unwrap();

        assert_ne!(normalized.file, file);
        let reduced_size = fs::metadata(&normalized.file).unwrap().len();
        assert!(reduced_size < original_size);
    }

    #[test]
    fn test_unreadable_file_is_a_per_item_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.png");
        fs::write(&file, b"this is not a png").unwrap();

        let normalizer = Normalizer::new(ConstraintSet {
            max_size: None,
            max_dimensions: Some((100, 100)),
            max_rate: f64::INFINITY,
        });
        let result = normalizer.normalize(&test_item(&file, "png"), dir.path());
        assert!(result.is_err());
    }
}
