//! Procedure execution context.
//!
//! [`Services`] bundles the long-lived collaborators (pool, settings,
//! notifier, hooks, camera). Each run gets a [`ProcedureContext`] holding a
//! read-only view of the task state plus the checkpoint primitive.
//!
//! [`run_procedure`] is the single exit path for every procedure: it leases
//! the instrument, snapshots the session, executes, restores the session,
//! releases the lease and emits the terminal message, in that order, whatever
//! the procedure returned.

use crate::safety::SafetyMonitor;
use crate::supervisor::{TaskControl, TaskState};
use async_trait::async_trait;
use parking_lot::RwLock;
use scanbot_core::camera::{NavigationMarks, TipTracker};
use scanbot_core::capabilities::{
    Instrument, InstrumentPool, ScanAction, ScanControl, ScanDirection, ScanProps, ScanSpeed,
    TipShaper, TipShaperProps,
};
use scanbot_core::config::Settings;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::hooks::HookRegistry;
use scanbot_core::limits::SLEEP_SLICE;
use scanbot_core::notify::{Notifier, Reaction, TracingNotifier};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Services
// =============================================================================

/// Collaborators shared by every procedure run.
pub struct Services {
    /// Instrument endpoints
    pub pool: InstrumentPool,
    /// Read-only settings
    pub settings: Settings,
    /// Status sink
    pub notifier: Arc<dyn Notifier>,
    /// Named hooks
    pub hooks: Arc<HookRegistry>,
    /// Camera tip tracker, when a camera is attached
    pub tracker: Option<Arc<dyn TipTracker>>,
    marks: RwLock<Option<NavigationMarks>>,
}

impl Services {
    /// Services logging status to `tracing` with no hooks registered.
    pub fn new(pool: InstrumentPool, settings: Settings) -> Self {
        Self {
            pool,
            settings,
            notifier: Arc::new(TracingNotifier),
            hooks: Arc::new(HookRegistry::new()),
            tracker: None,
            marks: RwLock::new(None),
        }
    }

    /// Replace the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attach a camera tip tracker.
    pub fn with_tracker(mut self, tracker: Arc<dyn TipTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Navigation marks from the last auto-initialization.
    pub fn marks(&self) -> Option<NavigationMarks> {
        *self.marks.read()
    }

    /// Store navigation marks.
    pub fn set_marks(&self, marks: NavigationMarks) {
        *self.marks.write() = Some(marks);
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("endpoints", &self.pool.capacity())
            .field("hooks", &self.hooks)
            .field("tracker", &self.tracker.is_some())
            .field("marks", &self.marks())
            .finish()
    }
}

// =============================================================================
// Procedure
// =============================================================================

/// A long-running instrument routine.
#[async_trait]
pub trait Procedure: Send {
    /// Short name used in logs and status messages.
    fn name(&self) -> &'static str;

    /// Parameter checks that need no hardware; run before admission.
    fn validate(&self) -> ScanbotResult<()> {
        Ok(())
    }

    /// Run to completion and return the terminal summary.
    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument)
        -> ScanbotResult<String>;
}

/// How a run ended.
#[derive(Debug)]
pub enum ProcedureOutcome {
    /// Ran to the end; carries the terminal summary
    Completed(String),
    /// Stopped at a checkpoint
    Stopped,
    /// Failed with an error
    Failed(ScanbotError),
}

impl ProcedureOutcome {
    /// Whether the run completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcedureOutcome::Completed(_))
    }
}

// =============================================================================
// ProcedureContext
// =============================================================================

/// Per-run view of the services and the task state.
#[derive(Debug)]
pub struct ProcedureContext {
    services: Arc<Services>,
    control: TaskControl,
    procedure: &'static str,
    basename: String,
}

impl ProcedureContext {
    /// Context for `procedure`.
    pub fn new(services: Arc<Services>, control: TaskControl, procedure: &'static str) -> Self {
        let basename = services
            .settings
            .instrument
            .basename()
            .unwrap_or("scanbot")
            .to_string();
        Self {
            services,
            control,
            procedure,
            basename,
        }
    }

    /// Procedure name.
    pub fn procedure(&self) -> &'static str {
        self.procedure
    }

    /// Settings.
    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    /// Hook registry.
    pub fn hooks(&self) -> &HookRegistry {
        &self.services.hooks
    }

    /// Camera tip tracker.
    pub fn tracker(&self) -> Option<&Arc<dyn TipTracker>> {
        self.services.tracker.as_ref()
    }

    /// Navigation marks.
    pub fn marks(&self) -> Option<NavigationMarks> {
        self.services.marks()
    }

    /// Store navigation marks.
    pub fn set_marks(&self, marks: NavigationMarks) {
        self.services.set_marks(marks);
    }

    /// Task state handle.
    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Basename saved files are derived from, without trailing underscores.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Safety monitor using the configured thresholds.
    pub fn safety(&self) -> SafetyMonitor<'_> {
        SafetyMonitor::new(
            self.services.settings.safety,
            self.services.notifier.as_ref(),
            &self.control,
        )
        .with_call_timeout(self.services.settings.instrument.call_timeout)
    }

    /// Send a status message.
    pub fn notify(&self, message: &str) {
        info!(procedure = self.procedure, "{}", message);
        self.services.notifier.send_text(message);
    }

    /// Forward a saved image.
    pub fn send_image(&self, path: &Path) {
        self.services.notifier.send_image(path);
    }

    /// React to the operator's command.
    pub fn react(&self, reaction: Reaction) {
        self.services.notifier.react(reaction);
    }

    /// Report a failing hook; the caller continues with its default.
    pub fn hook_failed(&self, hook: &str, err: anyhow::Error) {
        let err = ScanbotError::HookFailure {
            hook: hook.to_string(),
            message: format!("{err:#}"),
        };
        warn!(procedure = self.procedure, error = %err, "Hook failed, using default");
        self.services
            .notifier
            .send_text(&format!("{err}. Using the built-in default."));
    }

    /// Observe pause and stop requests.
    ///
    /// A pause request pauses the scan, parks until resumed or stopped and
    /// resumes the scan again if the run may continue. Returns
    /// [`ScanbotError::Cancelled`] once a stop has been requested.
    pub async fn checkpoint(&self, gw: &dyn Instrument) -> ScanbotResult<()> {
        match self.control.state() {
            TaskState::CancelRequested => self.cancelled(),
            TaskState::Paused => {
                info!(procedure = self.procedure, "Paused at checkpoint");
                gw.scan_action(ScanAction::Pause, ScanDirection::Up).await?;
                self.react(Reaction::Pause);

                match self.control.wait_while_paused().await {
                    TaskState::CancelRequested => self.cancelled(),
                    _ => {
                        info!(procedure = self.procedure, "Resumed");
                        self.react(Reaction::Play);
                        gw.scan_action(ScanAction::Resume, ScanDirection::Up).await?;
                        Ok(())
                    }
                }
            }
            TaskState::Running | TaskState::Idle => Ok(()),
        }
    }

    fn cancelled(&self) -> ScanbotResult<()> {
        info!(procedure = self.procedure, "Stop observed at checkpoint");
        self.react(Reaction::Stop);
        Err(ScanbotError::Cancelled)
    }

    /// Sleep for `duration` in short slices, checkpointing after each one.
    pub async fn sleep(&self, gw: &dyn Instrument, duration: Duration) -> ScanbotResult<()> {
        let mut remaining = duration;
        self.checkpoint(gw).await?;
        while !remaining.is_zero() {
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining -= slice;
            self.checkpoint(gw).await?;
        }
        Ok(())
    }

    /// Await a blocking gateway call for at most `instrument.call_timeout`.
    pub async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = ScanbotResult<T>>,
    ) -> ScanbotResult<T> {
        bounded(operation, self.settings().instrument.call_timeout, call).await
    }

    /// Set the series basename used for the next saved files.
    pub async fn set_series_name(&self, gw: &dyn Instrument, name: &str) -> ScanbotResult<()> {
        debug!(procedure = self.procedure, series_name = name, "Setting basename");
        gw.scan_props_set(&ScanProps {
            series_name: name.to_string(),
        })
        .await
    }

    /// Temporary basename `<basename>_<suffix>_`.
    pub fn temp_basename(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}_", self.basename)
        } else {
            format!("{}_{}_", self.basename, suffix)
        }
    }
}

/// Await `call`, failing with [`ScanbotError::Timeout`] once `after` has elapsed.
pub async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    call: impl Future<Output = ScanbotResult<T>>,
) -> ScanbotResult<T> {
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?after, "Gateway call timed out");
            Err(ScanbotError::Timeout { operation, after })
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Instrument settings a procedure may change and must put back.
#[derive(Debug, Clone)]
struct Session {
    props: ScanProps,
    pixels: u32,
    lines: u32,
    speed: ScanSpeed,
    shaper: Option<TipShaperProps>,
}

impl Session {
    async fn capture(gw: &dyn Instrument) -> ScanbotResult<Self> {
        let props = gw.scan_props_get().await?;
        let buffer = gw.scan_buffer_get().await?;
        let speed = gw.scan_speed_get().await?;
        let shaper = match gw.tip_shaper_props_get().await {
            Ok(props) => Some(props),
            Err(e) => {
                warn!(error = %e, "Tip shaper settings unavailable, they will not be restored");
                None
            }
        };
        Ok(Self {
            props,
            pixels: buffer.pixels,
            lines: buffer.lines,
            speed,
            shaper,
        })
    }

    async fn restore(&self, gw: &dyn Instrument) {
        if let Err(e) = gw.scan_props_set(&self.props).await {
            error!(error = %e, "Failed to restore basename");
        }
        if let Err(e) = gw.scan_buffer_set(self.pixels, self.lines).await {
            error!(error = %e, "Failed to restore scan buffer");
        }
        if let Err(e) = gw.scan_speed_set(&self.speed).await {
            error!(error = %e, "Failed to restore scan speed");
        }
        if let Some(shaper) = &self.shaper {
            if let Err(e) = gw.tip_shaper_props_set(shaper).await {
                error!(error = %e, "Failed to restore tip shaper settings");
            }
        }
        debug!(series_name = %self.props.series_name, "Session restored");
    }
}

/// Lease, snapshot, execute, restore, release and report.
///
/// The returned future is `Send`, so it can be handed to `tokio::spawn`.
pub fn run_procedure(
    services: Arc<Services>,
    control: TaskControl,
    mut procedure: Box<dyn Procedure>,
) -> impl Future<Output = ProcedureOutcome> + Send {
    async move {
        let name = procedure.name();
        let mut ctx = ProcedureContext::new(services, control, name);
        ctx.react(Reaction::Working);

        let lease = match ctx.services.pool.lease().await {
            Ok(lease) => lease,
            Err(e) => return conclude(&ctx, Err(ScanbotError::from(e))),
        };
        info!(procedure = name, endpoint = %lease.endpoint(), "Leased instrument");
        let gw: &dyn Instrument = lease.connection().as_ref();

        let result = match Session::capture(gw).await {
            Ok(session) => {
                if ctx.settings().instrument.basename().is_none() {
                    let own = session.props.series_name.trim_end_matches('_');
                    if !own.is_empty() {
                        ctx.basename = own.to_string();
                    }
                }
                let result = procedure.execute(&ctx, gw).await;
                session.restore(gw).await;
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = lease.release().await {
            warn!(procedure = name, error = %e, "Releasing instrument failed");
        }
        conclude(&ctx, result)
    }
}

fn conclude(ctx: &ProcedureContext, result: ScanbotResult<String>) -> ProcedureOutcome {
    let name = ctx.procedure;
    match result {
        Ok(summary) => {
            info!(procedure = name, %summary, "Procedure completed");
            ctx.services.notifier.send_text(&summary);
            ctx.react(Reaction::Success);
            ProcedureOutcome::Completed(summary)
        }
        Err(ScanbotError::Cancelled) => {
            info!(procedure = name, "Procedure stopped");
            ctx.services.notifier.send_text(&format!("{name} stopped"));
            ProcedureOutcome::Stopped
        }
        Err(e) => {
            error!(procedure = name, error = %e, "Procedure failed");
            ctx.services
                .notifier
                .send_text(&format!("{name} failed: {e}"));
            ctx.react(Reaction::Warning);
            ProcedureOutcome::Failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbot_driver_mock::{simulated_pool, MockConnector, RecordingNotifier, SimulatedInstrument};

    struct Rename;

    #[async_trait]
    impl Procedure for Rename {
        fn name(&self) -> &'static str {
            "rename"
        }

        async fn execute(
            &mut self,
            ctx: &ProcedureContext,
            gw: &dyn Instrument,
        ) -> ScanbotResult<String> {
            ctx.set_series_name(gw, &ctx.temp_basename("tmp")).await?;
            gw.scan_buffer_set(128, 128).await?;
            Err(ScanbotError::Instrument("boom".into()))
        }
    }

    fn services(instrument: &SimulatedInstrument, notifier: Arc<RecordingNotifier>) -> Arc<Services> {
        let pool = simulated_pool(MockConnector::new(instrument.clone()), 2);
        Arc::new(Services::new(pool, Settings::default()).with_notifier(notifier))
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_restored_after_failure() {
        let instrument = SimulatedInstrument::builder().series_name("Au111_").build();
        let notifier = Arc::new(RecordingNotifier::new());
        let services = services(&instrument, notifier.clone());

        let control = TaskControl::new();
        control.admit().unwrap();
        let outcome = run_procedure(services.clone(), control, Box::new(Rename)).await;

        assert!(matches!(outcome, ProcedureOutcome::Failed(ScanbotError::Instrument(_))));
        assert_eq!(instrument.series_name(), "Au111_");
        let buffer = instrument.scan_buffer_get().await.unwrap();
        assert_eq!((buffer.pixels, buffer.lines), (64, 64));
        assert_eq!(services.pool.available(), 2);
        assert_eq!(notifier.last_text().unwrap(), "rename failed: Instrument error: boom");
        assert_eq!(notifier.reactions().last(), Some(&Reaction::Warning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_reports_cancellation() {
        let instrument = SimulatedInstrument::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let control = TaskControl::new();
        control.admit().unwrap();
        let ctx = ProcedureContext::new(services(&instrument, notifier.clone()), control.clone(), "test");

        assert!(ctx.checkpoint(&instrument).await.is_ok());
        control.request_cancel();
        assert!(matches!(ctx.checkpoint(&instrument).await, Err(ScanbotError::Cancelled)));
        assert!(matches!(
            ctx.sleep(&instrument, Duration::from_secs(10)).await,
            Err(ScanbotError::Cancelled)
        ));
        assert_eq!(notifier.reactions(), vec![Reaction::Stop, Reaction::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_pauses_and_resumes_the_scan() {
        let instrument = SimulatedInstrument::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let control = TaskControl::new();
        control.admit().unwrap();
        control.request_pause().unwrap();
        let ctx = ProcedureContext::new(services(&instrument, notifier.clone()), control.clone(), "test");

        let resumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            control.request_resume().unwrap();
        });
        ctx.checkpoint(&instrument).await.unwrap();
        resumer.await.unwrap();

        let actions: Vec<ScanAction> = instrument.scan_actions().iter().map(|(a, _)| *a).collect();
        assert_eq!(actions, vec![ScanAction::Pause, ScanAction::Resume]);
        assert_eq!(notifier.reactions(), vec![Reaction::Pause, Reaction::Play]);
    }

    #[test]
    fn test_temp_basename() {
        let instrument = SimulatedInstrument::new();
        let ctx = ProcedureContext::new(
            services(&instrument, Arc::new(RecordingNotifier::new())),
            TaskControl::new(),
            "test",
        );
        assert_eq!(ctx.temp_basename("survey"), "scanbot_survey_");
        assert_eq!(ctx.temp_basename(""), "scanbot_");
    }
}
