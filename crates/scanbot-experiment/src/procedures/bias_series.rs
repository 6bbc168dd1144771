//! Bias-dependent imaging with optional drift correction.
//!
//! The same frame is scanned at a list of biases. With a drift-correction
//! bias set, every data scan is preceded by a small calibration scan at that
//! bias; the first calibration image is the reference and later ones shift
//! the frame to follow the sample.

use crate::acquire::{acquire, Acquisition, ScanOutcome};
use crate::context::{Procedure, ProcedureContext};
use crate::motion::ramp_bias;
use crate::planner::linspace;
use crate::procedures::{buffer_for, check_bias, line_speed};
use async_trait::async_trait;
use scanbot_analysis::{DriftCorrector, PixelSize};
use scanbot_core::capabilities::{Instrument, ScanControl, ScanDirection, ScanSpeed};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{round_up_pixels, Point, ScanFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Bias series parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasSeriesConfig {
    /// Number of biases
    pub count: usize,
    /// First bias (V)
    pub first: f64,
    /// Last bias (V)
    pub last: f64,
    /// Data scan pixels; the current buffer otherwise
    pub pixels: Option<u32>,
    /// Data scan lines; keeps the frame aspect otherwise
    pub lines: Option<u32>,
    /// Data scan forward line time (s)
    pub line_time: Option<f64>,
    /// Forward over backward speed of data scans
    pub speed_ratio: f64,
    /// Bias of the drift-correction scans (V); none disables drift correction
    pub drift_bias: Option<f64>,
    /// Drift-correction scan pixels
    pub drift_pixels: u32,
    /// Drift-correction scan lines; same aspect as the data scans otherwise
    pub drift_lines: Option<u32>,
    /// Drift-correction forward line time (s)
    pub drift_line_time: Option<f64>,
    /// Forward over backward speed of drift-correction scans
    pub drift_speed_ratio: f64,
    /// Appended to the basename of saved files
    pub suffix: String,
}

impl Default for BiasSeriesConfig {
    fn default() -> Self {
        Self {
            count: 4,
            first: -1.0,
            last: 1.0,
            pixels: None,
            lines: None,
            line_time: None,
            speed_ratio: 1.0,
            drift_bias: None,
            drift_pixels: 64,
            drift_lines: None,
            drift_line_time: None,
            drift_speed_ratio: 1.0,
            suffix: "sb-bias-dep".into(),
        }
    }
}

impl BiasSeriesConfig {
    /// Biases in acquisition order.
    pub fn biases(&self) -> Vec<f64> {
        linspace(self.first, self.last, self.count)
    }

    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.count == 0 {
            return Err(ScanbotError::InvalidParameter("bias series needs at least one bias".into()));
        }
        for bias in self.biases() {
            check_bias("series bias", bias)?;
        }
        if let Some(bias) = self.drift_bias {
            check_bias("drift-correction bias", bias)?;
        }
        let times = [self.line_time, self.drift_line_time];
        if times.iter().flatten().any(|t| !(*t > 0.0)) {
            return Err(ScanbotError::InvalidParameter("line times must be positive".into()));
        }
        if !(self.speed_ratio > 0.0) || !(self.drift_speed_ratio > 0.0) {
            return Err(ScanbotError::InvalidParameter("speed ratios must be positive".into()));
        }
        Ok(())
    }
}

fn ratio_speed(current: ScanSpeed, forward: Option<f64>, ratio: f64) -> ScanSpeed {
    let forward = forward.unwrap_or(current.forward_line_time);
    line_speed(current, Some(forward), Some(forward / ratio))
}

struct ScanSetup {
    pixels: u32,
    lines: u32,
    speed: ScanSpeed,
}

impl ScanSetup {
    async fn apply(&self, gw: &dyn Instrument) -> ScanbotResult<()> {
        gw.scan_buffer_set(self.pixels, self.lines).await?;
        gw.scan_speed_set(&self.speed).await
    }

    fn pixel_size(&self, frame: &ScanFrame) -> PixelSize {
        PixelSize::of_frame(frame.width, frame.height, self.pixels, self.lines)
    }
}

/// Scan one frame at a list of biases.
#[derive(Debug, Clone, Default)]
pub struct BiasSeries {
    config: BiasSeriesConfig,
}

impl BiasSeries {
    /// Procedure with `config`.
    pub fn new(config: BiasSeriesConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for BiasSeries {
    fn name(&self) -> &'static str {
        "bias series"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        cfg.validate()?;
        let mut frame = gw.scan_frame_get().await?;
        let buffer = gw.scan_buffer_get().await?;
        let current = gw.scan_speed_get().await?;

        let (pixels, lines) = buffer_for(cfg.pixels, cfg.lines, &buffer, &frame);
        let data = ScanSetup {
            pixels,
            lines,
            speed: ratio_speed(current, cfg.line_time, cfg.speed_ratio),
        };
        let drift_pixels = round_up_pixels(cfg.drift_pixels);
        let drift = ScanSetup {
            pixels: drift_pixels,
            lines: cfg
                .drift_lines
                .unwrap_or_else(|| (drift_pixels * lines / pixels.max(1)).max(1)),
            speed: ratio_speed(current, cfg.drift_line_time, cfg.drift_speed_ratio),
        };

        let temp = ctx.temp_basename(&cfg.suffix);
        let channel = ctx.settings().instrument.channel;
        let biases = cfg.biases();
        let total = biases.len();
        let mut corrector = DriftCorrector::new();
        info!(total, drift_correction = cfg.drift_bias.is_some(), "Bias series started");

        for (i, bias) in biases.into_iter().enumerate() {
            ctx.notify(&format!("Scan {} of {total}", i + 1));

            if let Some(drift_bias) = cfg.drift_bias {
                drift.apply(gw).await?;
                ramp_bias(ctx, gw, drift_bias, true).await?;
                ctx.set_series_name(gw, &format!("{temp}{drift_bias:.2}V-DC_")).await?;
                let acq = Acquisition::of(Some(frame), ScanDirection::Up).channel(channel);
                let scan = match acquire(ctx, gw, &acq).await? {
                    ScanOutcome::Completed(scan) => scan,
                    _ => break,
                };
                let offset = corrector.observe(&scan.image, drift.pixel_size(&frame), frame.angle_deg)?;
                frame = frame.shifted(Point::new(-offset.x, -offset.y));
                debug!(dx = offset.x, dy = offset.y, "Drift correction");
                ctx.notify(&format!(
                    "Drift correction: frame moved by ({:.2}, {:.2}) nm",
                    -offset.x * 1e9,
                    -offset.y * 1e9
                ));
            }

            ramp_bias(ctx, gw, bias, true).await?;
            data.apply(gw).await?;
            ctx.set_series_name(gw, &format!("{temp}{bias:.2}V_")).await?;
            let acq = Acquisition::of(Some(frame), ScanDirection::Down).channel(channel);
            match acquire(ctx, gw, &acq).await? {
                ScanOutcome::Completed(scan) => {
                    if let Some(path) = &scan.file_path {
                        ctx.send_image(path);
                    }
                }
                _ => break,
            }
        }

        Ok(format!("bias series '{}' complete", cfg.suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::supervisor::TaskControl;
    use scanbot_core::capabilities::{BiasControl, ScanAction};
    use scanbot_core::config::Settings;
    use scanbot_driver_mock::{simulated_pool, MockConnector, RecordingNotifier, SimulatedInstrument};
    use std::sync::Arc;

    fn context(instrument: &SimulatedInstrument) -> (ProcedureContext, Arc<RecordingNotifier>) {
        context_with(instrument, Settings::default())
    }

    fn context_with(instrument: &SimulatedInstrument, settings: Settings) -> (ProcedureContext, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = simulated_pool(MockConnector::new(instrument.clone()), 1);
        let services = Arc::new(Services::new(pool, settings).with_notifier(notifier.clone()));
        let control = TaskControl::new();
        control.admit().unwrap();
        (ProcedureContext::new(services, control, "bias series"), notifier)
    }

    #[test]
    fn test_series_through_zero_is_rejected() {
        let cfg = BiasSeriesConfig {
            count: 3,
            ..BiasSeriesConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(BiasSeriesConfig::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scans_each_bias_downwards() {
        let instrument = SimulatedInstrument::new();
        let (ctx, notifier) = context(&instrument);
        let mut procedure = BiasSeries::new(BiasSeriesConfig {
            count: 2,
            line_time: Some(0.02),
            speed_ratio: 2.0,
            ..BiasSeriesConfig::default()
        });

        let summary = procedure.execute(&ctx, &instrument).await.unwrap();
        assert_eq!(summary, "bias series 'sb-bias-dep' complete");
        assert_eq!(instrument.saved_scans(), 2);
        assert!(instrument
            .scan_actions()
            .iter()
            .filter(|(a, _)| *a == ScanAction::Start)
            .all(|(_, d)| *d == ScanDirection::Down));
        assert_eq!(instrument.bias_get().await.unwrap(), 1.0);
        assert_eq!(instrument.series_name(), "scanbot_sb-bias-dep_1.00V_");
        let speed = instrument.scan_speed_get().await.unwrap();
        assert_eq!((speed.forward_line_time, speed.backward_line_time), (0.02, 0.01));
        assert_eq!(notifier.images().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_scans_precede_data_scans() {
        let instrument = SimulatedInstrument::new();
        let (ctx, _notifier) = context(&instrument);
        let mut procedure = BiasSeries::new(BiasSeriesConfig {
            count: 2,
            drift_bias: Some(0.5),
            drift_pixels: 32,
            ..BiasSeriesConfig::default()
        });

        procedure.execute(&ctx, &instrument).await.unwrap();
        let directions: Vec<ScanDirection> = instrument
            .scan_actions()
            .iter()
            .filter(|(a, _)| *a == ScanAction::Start)
            .map(|(_, d)| *d)
            .collect();
        assert_eq!(
            directions,
            vec![ScanDirection::Up, ScanDirection::Down, ScanDirection::Up, ScanDirection::Down]
        );
        assert_eq!(instrument.saved_scans(), 4);
        // a flat surface shows no drift
        let frames = instrument.frames_set();
        assert_eq!(frames[0].center(), frames[3].center());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_scans_grab_the_configured_channel() {
        // only channel 0 is recorded; the default channel cannot be grabbed
        let instrument = SimulatedInstrument::builder().channels(vec![0]).build();
        let mut settings = Settings::default();
        settings.instrument.channel = 0;
        let (ctx, _notifier) = context_with(&instrument, settings);
        let mut procedure = BiasSeries::new(BiasSeriesConfig {
            count: 2,
            drift_bias: Some(0.5),
            drift_pixels: 32,
            ..BiasSeriesConfig::default()
        });

        procedure.execute(&ctx, &instrument).await.unwrap();
        assert_eq!(instrument.saved_scans(), 4);
    }
}
