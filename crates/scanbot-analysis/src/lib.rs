//! Image analysis for scanbot.
//!
//! Pure functions over `ndarray` images; nothing here talks to the instrument.
//!
//! - [`drift`]: frame offset between a reference and a new image
//! - [`quality`]: imprint symmetry and size after a tip-shaping pulse
//! - [`cleanliness`]: flat-area heuristic and clean-spot picker
//! - [`classify`]: built-in tip-change classifier
//! - [`stitch`]: survey tiles into one image

pub mod classify;
pub mod cleanliness;
pub mod drift;
pub mod filters;
pub mod quality;
pub mod stitch;

pub use classify::TipChangeClassifier;
pub use cleanliness::{clean_coordinate, is_clean, CleanlinessCriteria};
pub use drift::{estimate_offset, DriftCorrector, PixelSize};
pub use quality::{assess_imprint, assess_or_sentinel, AssessorConfig};
pub use stitch::stitch;
