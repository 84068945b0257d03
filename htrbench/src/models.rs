use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Granularity of a recognized text box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxKind {
    Word,
    Line,
    Paragraph,
}

/// One recognized text region. The polygon lists corners in order, starting
/// with the upper-left corner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBox {
    pub kind: BoxKind,
    pub polygon: Vec<(f32, f32)>,
    pub text: String,
    pub confidence: f32,
}

/// Successful output of one recognition call: the backend's raw structured
/// response, the extracted text, and the ordered text boxes. A failed call
/// carries an `HtrError` instead; the two never mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recognition {
    pub data: serde_json::Value,
    pub text: String,
    pub boxes: Vec<TextBox>,
}

/// One entry of a batch run: the original source reference, the local file
/// it resolved to, and the format discovered for it.
#[derive(Debug, Clone)]
pub struct Item {
    pub source: String,
    pub file: PathBuf,
    pub format: String,
}

/// Image derived from an [`Item`] that satisfies the run's [`ConstraintSet`].
/// Owns the temporary files produced along the way so the orchestrator can
/// delete them once the item is finished.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub item_file: PathBuf,
    pub file: PathBuf,
    pub dest_dir: PathBuf,
    pub temp_files: HashSet<PathBuf>,
}

/// Tightest combination of input constraints across the adapters selected
/// for a run, computed as the element-wise minimum of their declared limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstraintSet {
    pub max_size: Option<u64>,
    pub max_dimensions: Option<(u32, u32)>,
    /// Slowest sustained call rate among the selected adapters, in calls
    /// per second.
    pub max_rate: f64,
}

impl ConstraintSet {
    pub fn unbounded() -> Self {
        Self {
            max_size: None,
            max_dimensions: None,
            max_rate: f64::INFINITY,
        }
    }

    pub fn intersect(
        self,
        max_size: Option<u64>,
        max_dimensions: Option<(u32, u32)>,
        max_rate: f64,
    ) -> Self {
        let max_size = match (self.max_size, max_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let max_dimensions = match (self.max_dimensions, max_dimensions) {
            (Some((aw, ah)), Some((bw, bh))) => Some((aw.min(bw), ah.min(bh))),
            (a, b) => a.or(b),
        };
        Self {
            max_size,
            max_dimensions,
            max_rate: self.max_rate.min(max_rate),
        }
    }
}

/// Outcome of running one adapter on one item, collected in adapter
/// declaration order.
#[derive(Debug)]
pub struct ServiceOutcome {
    pub service: String,
    pub annotated: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub error: Option<crate::error::HtrError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_intersection_takes_minimum() {
        let set = ConstraintSet::unbounded()
            .intersect(Some(10 * 1024 * 1024), None, 30.0)
            .intersect(Some(4 * 1024 * 1024), Some((10000, 10000)), 0.333)
            .intersect(Some(5 * 1024 * 1024), Some((4200, 8000)), 1.0);

        assert_eq!(set.max_size, Some(4 * 1024 * 1024));
        assert_eq!(set.max_dimensions, Some((4200, 8000)));
        assert!((set.max_rate - 0.333).abs() < 1e-9);
    }

    #[test]
    fn test_constraint_intersection_handles_unknown_limits() {
        let set = ConstraintSet::unbounded().intersect(None, None, f64::INFINITY);
        assert_eq!(set.max_size, None);
        assert_eq!(set.max_dimensions, None);
        assert_eq!(set.max_rate, f64::INFINITY);

        let set = set.intersect(Some(1024), None, 2.0);
        assert_eq!(set.max_size, Some(1024));
        assert_eq!(set.max_dimensions, None);
        assert_eq!(set.max_rate, 2.0);
    }

    #[test]
    fn test_dimension_minimum_is_per_axis() {
        let set = ConstraintSet::unbounded()
            .intersect(None, Some((100, 900)), 1.0)
            .intersect(None, Some((800, 200)), 1.0);
        assert_eq!(set.max_dimensions, Some((100, 200)));
    }
}
