//! Optional, name-resolved hooks.
//!
//! Procedures look hooks up by name at the step that uses them. A missing
//! name or a failing hook is never fatal: the caller logs it and falls back
//! to the built-in behavior.
//!
//! | kind | signature | built-in default |
//! |------|-----------|------------------|
//! | [`ImageClassifier`] | `(image, history) -> Classification` | tip-change detector |
//! | [`ImagePostProcessor`] | `(image, metadata)` | nothing |
//! | [`ReshapeAdvisor`] | `(clean, imprint, params, target, actual, history) -> advice` | assessor verdict, unchanged params |
//! | [`Illumination`] | `(on)` | nothing |

use crate::capabilities::TipShaperProps;
use crate::frame::ScanFrame;
use ndarray::Array2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Hook Data
// =============================================================================

/// Verdict of an image classifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    /// Number of tip changes detected in the image
    pub tip_changes: usize,
    /// The image contains unscanned (NaN) lines
    pub incomplete: bool,
    /// The tip should be reshaped before continuing
    pub needs_tip_shape: bool,
}

/// Context passed to per-image post-processors.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanMetadata {
    /// Procedure that acquired the image
    pub procedure: &'static str,
    /// Zero-based index of the image in the procedure's plan
    pub index: usize,
    /// Number of images planned
    pub total: usize,
    /// Frame the image was acquired in
    pub frame: ScanFrame,
    /// File the instrument saved
    pub file_path: Option<PathBuf>,
    /// Bias during acquisition (V)
    pub bias: Option<f64>,
}

/// Symmetry and size of a tip-shaping imprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TipQuality {
    /// Circularity, 1.0 for a perfect circle
    pub symmetry: f64,
    /// Imprint area (nm²); negative when no contour was found
    pub size: f64,
}

impl TipQuality {
    /// Sentinel reported when no imprint contour encloses the expected point.
    pub const NOT_FOUND: TipQuality = TipQuality {
        symmetry: 0.0,
        size: -1.0,
    };

    /// Whether the imprint was located.
    pub fn found(&self) -> bool {
        self.size >= 0.0
    }

    /// Built-in acceptance: symmetric enough and small but non-empty.
    pub fn meets(&self, target: &TipQuality) -> bool {
        self.symmetry > target.symmetry && self.size > 0.0 && self.size < target.size
    }
}

/// Inputs for a reshape advisor.
#[derive(Debug)]
pub struct ReshapeRequest<'a> {
    /// Image of the area before the light pulse
    pub clean_image: &'a Array2<f64>,
    /// Image showing the imprint
    pub imprint: &'a Array2<f64>,
    /// Main pulse parameters about to be applied
    pub params: &'a TipShaperProps,
    /// Target quality
    pub target: TipQuality,
    /// Measured quality
    pub actual: TipQuality,
    /// Opaque state returned by the previous call
    pub history: &'a serde_json::Value,
}

/// Advisor verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ReshapeAdvice {
    /// Replacement main pulse parameters
    pub params: Option<TipShaperProps>,
    /// State carried to the next call
    pub history: serde_json::Value,
    /// Whether the advisor accepts the tip
    pub accept: bool,
}

// =============================================================================
// Hook Traits
// =============================================================================

/// Classifies a freshly acquired survey image.
pub trait ImageClassifier: Send + Sync {
    /// Classify `image` given the classifications of earlier images.
    fn classify(
        &self,
        image: &Array2<f64>,
        history: &[Classification],
    ) -> anyhow::Result<Classification>;
}

/// Receives every acquired image.
pub trait ImagePostProcessor: Send + Sync {
    /// Process one image.
    fn process(&self, image: &Array2<f64>, metadata: &ScanMetadata) -> anyhow::Result<()>;
}

/// Overrides the tip-shaping verdict and suggests pulse parameters.
pub trait ReshapeAdvisor: Send + Sync {
    /// Advise on one tip-shaping attempt.
    fn advise(&self, request: &ReshapeRequest<'_>) -> anyhow::Result<ReshapeAdvice>;
}

/// Switches the illumination used by the camera.
pub trait Illumination: Send + Sync {
    /// Turn the light on or off.
    fn set_light(&self, on: bool) -> anyhow::Result<()>;
}

// =============================================================================
// Registry
// =============================================================================

/// Named hooks, one table per kind.
#[derive(Default)]
pub struct HookRegistry {
    classifiers: RwLock<HashMap<String, Arc<dyn ImageClassifier>>>,
    post_processors: RwLock<HashMap<String, Arc<dyn ImagePostProcessor>>>,
    advisors: RwLock<HashMap<String, Arc<dyn ReshapeAdvisor>>>,
    illumination: RwLock<HashMap<String, Arc<dyn Illumination>>>,
}

fn resolve<T: ?Sized>(
    table: &RwLock<HashMap<String, Arc<T>>>,
    kind: &'static str,
    name: Option<&str>,
) -> Option<Arc<T>> {
    let name = name?;
    let found = table.read().get(name).cloned();
    if found.is_none() {
        warn!(kind, hook = name, "Hook not registered, using default");
    }
    found
}

impl HookRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a classifier under `name`.
    pub fn register_classifier(&self, name: impl Into<String>, hook: Arc<dyn ImageClassifier>) {
        self.classifiers.write().insert(name.into(), hook);
    }

    /// Register a post-processor under `name`.
    pub fn register_post_processor(
        &self,
        name: impl Into<String>,
        hook: Arc<dyn ImagePostProcessor>,
    ) {
        self.post_processors.write().insert(name.into(), hook);
    }

    /// Register a reshape advisor under `name`.
    pub fn register_advisor(&self, name: impl Into<String>, hook: Arc<dyn ReshapeAdvisor>) {
        self.advisors.write().insert(name.into(), hook);
    }

    /// Register an illumination hook under `name`.
    pub fn register_illumination(&self, name: impl Into<String>, hook: Arc<dyn Illumination>) {
        self.illumination.write().insert(name.into(), hook);
    }

    /// Look up a classifier.
    pub fn classifier(&self, name: Option<&str>) -> Option<Arc<dyn ImageClassifier>> {
        resolve(&self.classifiers, "classifier", name)
    }

    /// Look up a post-processor.
    pub fn post_processor(&self, name: Option<&str>) -> Option<Arc<dyn ImagePostProcessor>> {
        resolve(&self.post_processors, "post_processor", name)
    }

    /// Look up a reshape advisor.
    pub fn advisor(&self, name: Option<&str>) -> Option<Arc<dyn ReshapeAdvisor>> {
        resolve(&self.advisors, "reshape_advisor", name)
    }

    /// Look up an illumination hook.
    pub fn illumination(&self, name: Option<&str>) -> Option<Arc<dyn Illumination>> {
        resolve(&self.illumination, "illumination", name)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("classifiers", &self.classifiers.read().len())
            .field("post_processors", &self.post_processors.read().len())
            .field("advisors", &self.advisors.read().len())
            .field("illumination", &self.illumination.read().len())
            .finish()
    }
}
