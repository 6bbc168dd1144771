//! Grid survey with per-frame classification.
//!
//! Frames are acquired in snake order; each one is handed to the classifier
//! and post-processor hooks. When the classifier asks for a new tip and
//! auto tip shaping is on, the tip is taken to clean metal, reshaped and
//! brought back before the survey resumes at the next frame.

use crate::acquire::{acquire, Acquisition, ScanOutcome};
use crate::context::{Procedure, ProcedureContext};
use crate::motion::ramp_bias;
use crate::output::{stitched_path, write_csv};
use crate::planner::{plan_grid, GridSpec};
use crate::procedures::navigation::{reshape_on_clean_metal, NavigationConfig};
use crate::procedures::tip_shaping::TipShapingConfig;
use crate::procedures::{buffer_for, check_bias};
use async_trait::async_trait;
use ndarray::Array2;
use scanbot_analysis::{stitch, TipChangeClassifier};
use scanbot_core::capabilities::{BiasControl, Instrument, PiezoControl, ScanControl, ScanDirection};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{GridCell, Point};
use scanbot_core::hooks::{Classification, ImageClassifier, ScanMetadata};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Survey parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    /// Frames per side
    pub n: usize,
    /// Frame spacing (m); defaults to the frame size
    pub pitch: Option<f64>,
    /// Frame size (m); defaults to the current frame width
    pub size: Option<f64>,
    /// Pixels per line, rounded up to a multiple of 16
    pub pixels: Option<u32>,
    /// Absolute grid center (m)
    pub origin: Point,
    /// Walk the snake backwards
    pub reverse: bool,
    /// 1-based frame to start at
    pub start_at: usize,
    /// Appended to the basename of saved files
    pub suffix: String,
    /// Bias to ramp to before the first frame (V)
    pub bias: Option<f64>,
    /// Drift settle time before each frame
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Write the stitched survey as CSV
    pub stitch: bool,
    /// Registered classifier; the built-in tip-change classifier otherwise
    pub classifier: Option<String>,
    /// Registered post-processor
    pub post_processor: Option<String>,
    /// Reshape the tip on clean metal when the classifier asks for it
    pub auto_tip_shape: bool,
    /// Tip-shaping parameters
    pub tip_shaping: TipShapingConfig,
    /// Navigation to and from clean metal
    pub navigation: NavigationConfig,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            n: 5,
            pitch: None,
            size: None,
            pixels: None,
            origin: Point::default(),
            reverse: false,
            start_at: 1,
            suffix: "scanbot".into(),
            bias: None,
            settle: Duration::from_secs(10),
            stitch: true,
            classifier: None,
            post_processor: None,
            auto_tip_shape: false,
            tip_shaping: TipShapingConfig::default(),
            navigation: NavigationConfig::default(),
        }
    }
}

impl SurveyConfig {
    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.n == 0 {
            return Err(ScanbotError::InvalidParameter("survey needs n >= 1".into()));
        }
        for (name, value) in [("pitch", self.pitch), ("size", self.size)] {
            if let Some(v) = value {
                if !(v > 0.0) {
                    return Err(ScanbotError::InvalidParameter(format!(
                        "survey {name} must be positive (got {v})"
                    )));
                }
            }
        }
        if self.start_at == 0 || self.start_at > self.n * self.n {
            return Err(ScanbotError::InvalidParameter(format!(
                "start_at must be between 1 and {} (got {})",
                self.n * self.n,
                self.start_at
            )));
        }
        if let Some(bias) = self.bias {
            check_bias("survey bias", bias)?;
        }
        if self.auto_tip_shape {
            self.tip_shaping.validate()?;
            self.navigation.validate()?;
        }
        Ok(())
    }
}

fn tip_changes(
    ctx: &ProcedureContext,
    name: Option<&str>,
    image: &Array2<f64>,
    history: &[Classification],
) -> Classification {
    let builtin = || TipChangeClassifier.classify(image, history);
    let result = match ctx.hooks().classifier(name) {
        Some(hook) => hook.classify(image, history).or_else(|e| {
            ctx.hook_failed(name.unwrap_or("classifier"), e);
            builtin()
        }),
        None => builtin(),
    };
    result.unwrap_or_else(|e| {
        warn!(error = %e, "Tip change classification failed");
        Classification::default()
    })
}

/// Run one survey and return its summary.
pub async fn run_survey(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    cfg: &SurveyConfig,
) -> ScanbotResult<String> {
    cfg.validate()?;
    if cfg.auto_tip_shape && ctx.marks().is_none() {
        return Err(ScanbotError::NavigationRequired("running a survey with auto tip shaping"));
    }

    let current = gw.scan_frame_get().await?;
    let size = cfg.size.unwrap_or(current.width);
    let spec = GridSpec {
        n: cfg.n,
        pitch: cfg.pitch.unwrap_or(size),
        size,
        origin: cfg.origin,
        reverse: cfg.reverse,
    };
    let range = gw.piezo_range_get().await?;
    let mut plan = plan_grid(&spec, &range)?;
    plan.set_resume_index(cfg.start_at - 1);

    if let Some(bias) = cfg.bias {
        ramp_bias(ctx, gw, bias, true).await?;
    }
    let basename = ctx.temp_basename(&cfg.suffix);
    ctx.set_series_name(gw, &basename).await?;
    if cfg.pixels.is_some() {
        let buffer = gw.scan_buffer_get().await?;
        let (px, lines) = buffer_for(cfg.pixels, None, &buffer, &plan.frames()[0]);
        gw.scan_buffer_set(px, lines).await?;
    }

    let total = plan.len();
    let channel = ctx.settings().instrument.channel;
    let mut history: Vec<Classification> = Vec::new();
    let mut tiles: Vec<(GridCell, Array2<f64>)> = Vec::new();
    info!(suffix = %cfg.suffix, total, start = plan.resume_index(), "Survey started");

    while let Some((frame, cell)) = plan.get(plan.resume_index()) {
        let index = plan.resume_index();
        plan.set_resume_index(index + 1);
        ctx.notify(&format!("Running scan {} of {total}", index + 1));

        let acq = Acquisition::of(Some(frame), ScanDirection::Up)
            .channel(channel)
            .settle(cfg.settle);
        let scan = match acquire(ctx, gw, &acq).await? {
            ScanOutcome::Completed(scan) => scan,
            _ => {
                warn!(index, "Frame not completed, moving on");
                continue;
            }
        };
        if let Some(path) = &scan.file_path {
            ctx.send_image(path);
        }

        let classification = tip_changes(ctx, cfg.classifier.as_deref(), &scan.image, &history);
        if let Some(hook) = ctx.hooks().post_processor(cfg.post_processor.as_deref()) {
            let metadata = ScanMetadata {
                procedure: ctx.procedure(),
                index,
                total,
                frame,
                file_path: scan.file_path.clone(),
                bias: gw.bias_get().await.ok(),
            };
            if let Err(e) = hook.process(&scan.image, &metadata) {
                ctx.hook_failed(cfg.post_processor.as_deref().unwrap_or("post_processor"), e);
            }
        }
        let needs_tip_shape = classification.needs_tip_shape;
        history.push(classification);
        tiles.push((cell, scan.image));

        if needs_tip_shape && cfg.auto_tip_shape && !plan.finished() {
            ctx.notify("Tip looks bad, reshaping");
            let report = reshape_on_clean_metal(ctx, gw, &cfg.navigation, &cfg.tip_shaping).await?;
            if !report.accepted {
                save_stitched(ctx, cfg, &tiles);
                return Ok(format!(
                    "survey '{}' ended after {} of {total} frames: {}",
                    cfg.suffix,
                    index + 1,
                    report.summary()
                ));
            }
            ctx.set_series_name(gw, &basename).await?;
            history.clear();
            ctx.notify("Resuming survey");
        }
    }

    save_stitched(ctx, cfg, &tiles);
    Ok(format!("survey '{}' done", cfg.suffix))
}

fn save_stitched(ctx: &ProcedureContext, cfg: &SurveyConfig, tiles: &[(GridCell, Array2<f64>)]) {
    if !cfg.stitch || tiles.is_empty() {
        return;
    }
    let path = stitched_path(&ctx.settings().output.data_dir, &cfg.suffix);
    let result = stitch(tiles, cfg.n).and_then(|image| write_csv(&path, &image));
    match result {
        Ok(path) => ctx.send_image(&path),
        Err(e) => {
            warn!(error = %e, "Stitching failed");
            ctx.notify(&format!("Could not save the stitched survey: {e}"));
        }
    }
}

/// Grid survey procedure.
#[derive(Debug, Clone, Default)]
pub struct Survey {
    config: SurveyConfig,
}

impl Survey {
    /// Procedure with `config`.
    pub fn new(config: SurveyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for Survey {
    fn name(&self) -> &'static str {
        "survey"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        run_survey(ctx, gw, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::supervisor::TaskControl;
    use parking_lot::Mutex;
    use scanbot_analysis::classify::{BAD_SCANS_BEFORE_RESHAPE, BAD_SCAN_TIP_CHANGES};
    use scanbot_core::config::Settings;
    use scanbot_core::hooks::{HookRegistry, ImagePostProcessor};
    use scanbot_driver_mock::{simulated_pool, MockConnector, RecordingNotifier, SimulatedInstrument};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn context(
        instrument: &SimulatedInstrument,
        hooks: Arc<HookRegistry>,
        data_dir: &std::path::Path,
    ) -> (ProcedureContext, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = simulated_pool(MockConnector::new(instrument.clone()), 2);
        let mut settings = Settings::default();
        settings.output.data_dir = data_dir.to_path_buf();
        let services = Services::new(pool, settings)
            .with_notifier(notifier.clone())
            .with_hooks(hooks);
        let control = TaskControl::new();
        control.admit().unwrap();
        (ProcedureContext::new(Arc::new(services), control, "survey"), notifier)
    }

    fn quick(n: usize) -> SurveyConfig {
        SurveyConfig {
            n,
            size: Some(10e-9),
            settle: Duration::ZERO,
            ..SurveyConfig::default()
        }
    }

    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl ImagePostProcessor for Recorder {
        fn process(&self, _image: &Array2<f64>, metadata: &ScanMetadata) -> anyhow::Result<()> {
            self.0.lock().push((metadata.index, metadata.total));
            Ok(())
        }
    }

    #[test]
    fn test_validate() {
        assert!(SurveyConfig::default().validate().is_ok());
        let zero_bias = SurveyConfig {
            bias: Some(0.0),
            ..SurveyConfig::default()
        };
        assert!(zero_bias.validate().is_err());
        let late = SurveyConfig {
            n: 2,
            start_at: 5,
            ..SurveyConfig::default()
        };
        assert!(late.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_done_frames() {
        let instrument = SimulatedInstrument::new();
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let hooks = Arc::new(HookRegistry::new());
        hooks.register_post_processor("rec", recorder.clone());
        let (ctx, notifier) = context(&instrument, hooks, dir.path());
        let cfg = SurveyConfig {
            start_at: 3,
            post_processor: Some("rec".into()),
            suffix: "resume".into(),
            ..quick(2)
        };

        let summary = run_survey(&ctx, &instrument, &cfg).await.unwrap();
        assert_eq!(summary, "survey 'resume' done");
        assert_eq!(instrument.frames_set().len(), 2);
        assert_eq!(*recorder.0.lock(), vec![(2, 4), (3, 4)]);
        assert!(notifier.saw("Running scan 3 of 4"));
        assert!(dir.path().join("resume_stitch.csv").exists());
        assert_eq!(instrument.series_name(), "scanbot_resume_");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_tip_shape_needs_marks() {
        let instrument = SimulatedInstrument::new();
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _notifier) = context(&instrument, Arc::new(HookRegistry::new()), dir.path());
        let cfg = SurveyConfig {
            auto_tip_shape: true,
            ..quick(2)
        };
        let err = run_survey(&ctx, &instrument, &cfg).await.unwrap_err();
        assert!(matches!(err, ScanbotError::NavigationRequired(_)));
        assert!(instrument.frames_set().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pixels_keep_square_frames() {
        let instrument = SimulatedInstrument::new();
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _notifier) = context(&instrument, Arc::new(HookRegistry::new()), dir.path());
        let cfg = SurveyConfig {
            pixels: Some(40),
            stitch: false,
            ..quick(1)
        };
        run_survey(&ctx, &instrument, &cfg).await.unwrap();
        let buffer = instrument.scan_buffer_get().await.unwrap();
        assert_eq!((buffer.pixels, buffer.lines), (48, 48));
    }

    struct Broken;

    impl ImageClassifier for Broken {
        fn classify(&self, _image: &Array2<f64>, _history: &[Classification]) -> anyhow::Result<Classification> {
            anyhow::bail!("model not loaded")
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failing_classifier_falls_back() {
        let instrument = SimulatedInstrument::new();
        let dir = tempfile::tempdir().unwrap();
        let hooks = Arc::new(HookRegistry::new());
        hooks.register_classifier("broken", Arc::new(Broken));
        let (ctx, notifier) = context(&instrument, hooks, dir.path());
        let cfg = SurveyConfig {
            classifier: Some("broken".into()),
            stitch: false,
            ..quick(1)
        };

        let summary = run_survey(&ctx, &instrument, &cfg).await.unwrap();
        assert_eq!(summary, "survey 'scanbot' done");
        assert!(notifier.saw("model not loaded"));
        assert!(logs_contain("Hook failed, using default"));
    }

    #[test]
    #[traced_test]
    fn test_failing_classifier_keeps_builtin_verdict() {
        let instrument = SimulatedInstrument::new();
        let dir = tempfile::tempdir().unwrap();
        let hooks = Arc::new(HookRegistry::new());
        hooks.register_classifier("broken", Arc::new(Broken));
        let (ctx, _notifier) = context(&instrument, hooks, dir.path());

        // an unscanned frame is skipped, so the bad history alone decides
        let unscanned = Array2::from_elem((16, 16), f64::NAN);
        let bad = Classification {
            tip_changes: BAD_SCAN_TIP_CHANGES + 1,
            ..Classification::default()
        };
        let history = vec![bad; BAD_SCANS_BEFORE_RESHAPE];

        let verdict = tip_changes(&ctx, Some("broken"), &unscanned, &history);
        assert!(verdict.incomplete);
        assert!(verdict.needs_tip_shape);
        assert!(logs_contain("Hook failed, using default"));
    }
}
