//! Camera tip tracker driven by the simulated motor odometer.

use crate::instrument::SimulatedInstrument;
use async_trait::async_trait;
use scanbot_core::camera::{PixelPosition, TipTracker};

/// Reports the tip where the motor steps taken so far would put it.
///
/// The camera looks at the tip from the side: X+ moves right, Z+ moves up
/// (smaller pixel row).
#[derive(Debug, Clone)]
pub struct OdometerTracker {
    instrument: SimulatedInstrument,
    origin: PixelPosition,
    steps_per_pixel: f64,
    visible: bool,
}

impl OdometerTracker {
    /// Tracker starting at `origin`, moving one pixel per `steps_per_pixel` steps.
    pub fn new(instrument: SimulatedInstrument, origin: PixelPosition, steps_per_pixel: f64) -> Self {
        Self {
            instrument,
            origin,
            steps_per_pixel: steps_per_pixel.max(1e-9),
            visible: true,
        }
    }

    /// Tracker that never finds the tip.
    pub fn hidden(instrument: SimulatedInstrument) -> Self {
        Self {
            visible: false,
            ..Self::new(instrument, PixelPosition::new(0, 0), 1.0)
        }
    }
}

#[async_trait]
impl TipTracker for OdometerTracker {
    async fn locate_tip(&self) -> anyhow::Result<Option<PixelPosition>> {
        if !self.visible {
            return Ok(None);
        }
        let odo = self.instrument.odometer();
        let dx = (odo.x as f64 / self.steps_per_pixel).round() as i32;
        let dz = (odo.z as f64 / self.steps_per_pixel).round() as i32;
        Ok(Some(PixelPosition::new(self.origin.x + dx, self.origin.y - dz)))
    }
}
