//! Camera-side navigation.
//!
//! Capturing and tracking the tip in the overview camera is done outside the
//! engine. A [`TipTracker`] reports where the tip currently is, in camera
//! pixels, and [`NavigationMarks`] hold the positions the operator marked
//! during auto-initialization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Position in the camera image (pixels, y grows downwards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPosition {
    /// Column
    pub x: i32,
    /// Row
    pub y: i32,
}

impl PixelPosition {
    /// Create a position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Named targets the tip can be driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationTarget {
    /// Clean metal used for tip shaping
    CleanMetal,
    /// Sample area of interest
    Sample,
}

impl std::fmt::Display for NavigationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavigationTarget::CleanMetal => write!(f, "clean metal"),
            NavigationTarget::Sample => write!(f, "sample"),
        }
    }
}

/// Positions marked during auto-initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationMarks {
    /// Last known tip apex
    pub tip: PixelPosition,
    /// Clean metal area
    pub clean_metal: PixelPosition,
    /// Sample area
    pub sample: PixelPosition,
}

impl NavigationMarks {
    /// Position of `target`.
    pub fn target(&self, target: NavigationTarget) -> PixelPosition {
        match target {
            NavigationTarget::CleanMetal => self.clean_metal,
            NavigationTarget::Sample => self.sample,
        }
    }
}

/// Locates the tip in the overview camera.
#[async_trait]
pub trait TipTracker: Send + Sync {
    /// Current tip position, or `None` when the tip is not visible.
    async fn locate_tip(&self) -> anyhow::Result<Option<PixelPosition>>;
}
