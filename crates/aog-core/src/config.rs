//! Configuration types for the inference engine.
//!
//! This module provides two configuration types:
//! - [`InferenceConfig`]: Engine-level configuration (fixed for the engine's lifetime)
//! - [`DetectOptions`]: Per-call selection options (threshold, cap, suppression mode)

// ============================================================================
// InferenceConfig: Engine-level configuration
// ============================================================================

/// How two windows' overlap ratio is normalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OverlapMetric {
    /// Intersection over union.
    Union,
    /// Intersection over the area of the smaller window.
    /// Suppresses windows nested inside a stronger detection.
    Smaller,
}

/// Margin term injected by loss adjustment for mislocalized windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LossKind {
    /// Loss of 1 for every window below the foreground overlap.
    ZeroOne,
    /// Loss of `1 - overlap` for every window below the foreground overlap.
    Overlap,
}

/// Engine-level configuration.
///
/// # Example
/// ```
/// use aog_core::config::{InferenceConfig, OverlapMetric};
///
/// let config = InferenceConfig::builder()
///     .nms_overlap(0.3)
///     .overlap_metric(OverlapMetric::Union)
///     .build();
/// assert_eq!(config.nms_overlap, 0.3);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InferenceConfig {
    /// Maximum overlap between two kept detections (default: 0.5).
    pub nms_overlap: f64,
    /// Overlap normalization used by duplicate suppression (default: `Smaller`).
    pub overlap_metric: OverlapMetric,
    /// Overlap at which a window counts as a correct localization (default: 0.7).
    pub fg_overlap: f64,
    /// Overlap with another ground-truth box at which a window is excluded
    /// from the search for the current box (default: 0.5).
    pub bg_overlap: f64,
    /// Loss injected for mislocalized windows (default: `ZeroOne`).
    pub loss_kind: LossKind,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            nms_overlap: 0.5,
            overlap_metric: OverlapMetric::Smaller,
            fg_overlap: 0.7,
            bg_overlap: 0.5,
            loss_kind: LossKind::ZeroOne,
        }
    }
}

impl InferenceConfig {
    /// Create a new builder for `InferenceConfig`.
    #[must_use]
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

/// Builder for [`InferenceConfig`].
#[derive(Default)]
pub struct InferenceConfigBuilder {
    nms_overlap: Option<f64>,
    overlap_metric: Option<OverlapMetric>,
    fg_overlap: Option<f64>,
    bg_overlap: Option<f64>,
    loss_kind: Option<LossKind>,
}

impl InferenceConfigBuilder {
    /// Set the duplicate-suppression overlap.
    #[must_use]
    pub fn nms_overlap(mut self, overlap: f64) -> Self {
        self.nms_overlap = Some(overlap);
        self
    }

    /// Set the overlap normalization for duplicate suppression.
    #[must_use]
    pub fn overlap_metric(mut self, metric: OverlapMetric) -> Self {
        self.overlap_metric = Some(metric);
        self
    }

    /// Set the foreground overlap.
    #[must_use]
    pub fn fg_overlap(mut self, overlap: f64) -> Self {
        self.fg_overlap = Some(overlap);
        self
    }

    /// Set the background overlap.
    #[must_use]
    pub fn bg_overlap(mut self, overlap: f64) -> Self {
        self.bg_overlap = Some(overlap);
        self
    }

    /// Set the loss kind.
    #[must_use]
    pub fn loss_kind(mut self, kind: LossKind) -> Self {
        self.loss_kind = Some(kind);
        self
    }

    /// Build the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(self) -> InferenceConfig {
        let d = InferenceConfig::default();
        InferenceConfig {
            nms_overlap: self.nms_overlap.unwrap_or(d.nms_overlap),
            overlap_metric: self.overlap_metric.unwrap_or(d.overlap_metric),
            fg_overlap: self.fg_overlap.unwrap_or(d.fg_overlap),
            bg_overlap: self.bg_overlap.unwrap_or(d.bg_overlap),
            loss_kind: self.loss_kind.unwrap_or(d.loss_kind),
        }
    }
}

// ============================================================================
// DetectOptions: Per-call options
// ============================================================================

/// Per-call detection options.
///
/// # Example
/// ```
/// use aog_core::config::DetectOptions;
///
/// // Top five non-overlapping detections scoring above -0.5
/// let options = DetectOptions::builder()
///     .threshold(-0.5)
///     .max_detections(5)
///     .build();
///
/// // Everything above zero, no suppression, raw detections kept
/// let ext = DetectOptions::extended(0.0);
/// assert!(!ext.suppress && ext.keep_raw);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectOptions {
    /// Candidates must score strictly above this value (default: 0.0).
    pub threshold: f64,
    /// Maximum number of candidates; `None` keeps all (default: `None`).
    pub max_detections: Option<usize>,
    /// Apply duplicate suppression (default: true).
    pub suppress: bool,
    /// Also return every raw above-threshold detection (default: false).
    pub keep_raw: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            max_detections: None,
            suppress: true,
            keep_raw: false,
        }
    }
}

impl DetectOptions {
    /// Create a new builder for `DetectOptions`.
    #[must_use]
    pub fn builder() -> DetectOptionsBuilder {
        DetectOptionsBuilder::default()
    }

    /// Suppressed selection above `threshold`.
    #[must_use]
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Extended mode: no suppression, raw detections kept.
    #[must_use]
    pub fn extended(threshold: f64) -> Self {
        Self {
            threshold,
            max_detections: None,
            suppress: false,
            keep_raw: true,
        }
    }
}

/// Builder for [`DetectOptions`].
#[derive(Default)]
pub struct DetectOptionsBuilder {
    threshold: Option<f64>,
    max_detections: Option<usize>,
    suppress: Option<bool>,
    keep_raw: Option<bool>,
}

impl DetectOptionsBuilder {
    /// Set the score threshold.
    #[must_use]
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Set the candidate cap.
    #[must_use]
    pub fn max_detections(mut self, max: usize) -> Self {
        self.max_detections = Some(max);
        self
    }

    /// Enable or disable duplicate suppression.
    #[must_use]
    pub fn suppress(mut self, suppress: bool) -> Self {
        self.suppress = Some(suppress);
        self
    }

    /// Keep every raw above-threshold detection.
    #[must_use]
    pub fn keep_raw(mut self, keep: bool) -> Self {
        self.keep_raw = Some(keep);
        self
    }

    /// Build the options.
    #[must_use]
    pub fn build(self) -> DetectOptions {
        let d = DetectOptions::default();
        DetectOptions {
            threshold: self.threshold.unwrap_or(d.threshold),
            max_detections: self.max_detections.or(d.max_detections),
            suppress: self.suppress.unwrap_or(d.suppress),
            keep_raw: self.keep_raw.unwrap_or(d.keep_raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_config_builder() {
        let config = InferenceConfig::builder()
            .nms_overlap(0.3)
            .loss_kind(LossKind::Overlap)
            .build();
        assert_eq!(config.nms_overlap, 0.3);
        assert_eq!(config.loss_kind, LossKind::Overlap);
        // Check defaults
        assert_eq!(config.fg_overlap, 0.7);
        assert_eq!(config.overlap_metric, OverlapMetric::Smaller);
    }

    #[test]
    fn test_detect_options_defaults() {
        let opt = DetectOptions::default();
        assert!(opt.suppress);
        assert!(!opt.keep_raw);
        assert_eq!(opt.max_detections, None);
    }

    #[test]
    fn test_detect_options_builder() {
        let opt = DetectOptions::builder().threshold(-1.0).max_detections(3).suppress(false).build();
        assert_eq!(opt.threshold, -1.0);
        assert_eq!(opt.max_detections, Some(3));
        assert!(!opt.suppress);
    }
}
