//! Single-flight task supervisor.
//!
//! At most one procedure runs at a time. Pause and stop requests are
//! delivered through a watch channel and observed by the procedure at its
//! checkpoints; nothing is interrupted mid-call.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐   pause()    ┌────────┐
//! │ Idle │────────────▶│ Running │─────────────▶│ Paused │
//! └──────┘             └────┬────┘◀─────────────└───┬────┘
//!    ▲                      │        resume()       │
//!    │                      │ stop() / safety trip  │ stop()
//!    │                      ▼                       │
//!    │  procedure     ┌─────────────────┐           │
//!    └────returns─────│ CancelRequested │◀──────────┘
//!                     └─────────────────┘
//! ```
//!
//! The procedure task always returns the supervisor to `Idle`, whether it
//! completes, fails, observes a cancellation or panics.

use crate::context::{run_procedure, Procedure, ProcedureOutcome, Services};
use parking_lot::Mutex;
use scanbot_core::capabilities::{ScanAction, ScanControl, ScanDirection};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No procedure running, ready to accept one
    Idle,
    /// A procedure is executing
    Running,
    /// The procedure is parked at a checkpoint
    Paused,
    /// Stop requested; the procedure exits at its next checkpoint
    CancelRequested,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Running => write!(f, "running"),
            TaskState::Paused => write!(f, "paused"),
            TaskState::CancelRequested => write!(f, "stopping"),
        }
    }
}

/// Shared view of the task state, handed to the running procedure.
#[derive(Debug, Clone)]
pub struct TaskControl {
    tx: Arc<watch::Sender<TaskState>>,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    /// Control starting in `Idle`.
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(TaskState::Idle)),
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.tx.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.tx.subscribe()
    }

    fn transition(
        &self,
        action: &'static str,
        from: &[TaskState],
        to: TaskState,
    ) -> ScanbotResult<()> {
        let mut rejected = None;
        self.tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(state) => Err(ScanbotError::InvalidState {
                action,
                state: state.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Claim the single execution slot.
    pub(crate) fn admit(&self) -> ScanbotResult<()> {
        self.transition("start", &[TaskState::Idle], TaskState::Running)
            .map_err(|_| ScanbotError::AlreadyRunning)
    }

    /// Return to `Idle`.
    pub(crate) fn finish(&self) {
        self.tx.send_replace(TaskState::Idle);
    }

    /// Ask the procedure to park at its next checkpoint.
    pub fn request_pause(&self) -> ScanbotResult<()> {
        self.transition("pause", &[TaskState::Running], TaskState::Paused)
    }

    /// Let a parked procedure continue.
    pub fn request_resume(&self) -> ScanbotResult<()> {
        self.transition("resume", &[TaskState::Paused], TaskState::Running)
    }

    /// Ask the procedure to stop; returns false when nothing is running.
    pub fn request_cancel(&self) -> bool {
        self.transition(
            "stop",
            &[TaskState::Running, TaskState::Paused],
            TaskState::CancelRequested,
        )
        .is_ok()
    }

    /// Whether a stop has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.state() == TaskState::CancelRequested
    }

    /// Wait until the state leaves `Paused`, returning the new state.
    pub async fn wait_while_paused(&self) -> TaskState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != TaskState::Paused {
                return state;
            }
            if rx.changed().await.is_err() {
                return state;
            }
        }
    }
}

/// Puts the supervisor back in `Idle` when the procedure task ends.
struct IdleGuard(TaskControl);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Runs one procedure at a time on behalf of the command front end.
///
/// # Example
///
/// ```rust,ignore
/// let supervisor = TaskSupervisor::new(Arc::new(services));
/// supervisor.start(Box::new(Survey::new(config)))?;
/// supervisor.pause()?;
/// supervisor.resume()?;
/// let outcome = supervisor.stop(true).await?;
/// ```
pub struct TaskSupervisor {
    services: Arc<Services>,
    control: TaskControl,
    handle: Mutex<Option<JoinHandle<ProcedureOutcome>>>,
}

impl TaskSupervisor {
    /// Supervisor over `services`, starting idle.
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            control: TaskControl::new(),
            handle: Mutex::new(None),
        }
    }

    /// Shared services.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.control.subscribe()
    }

    /// Validate `procedure` and run it in a background task.
    ///
    /// Fails with [`ScanbotError::AlreadyRunning`] when another procedure is
    /// active; parameter errors are reported before anything is spawned.
    pub fn start(&self, procedure: Box<dyn Procedure>) -> ScanbotResult<()> {
        procedure.validate()?;
        self.control.admit()?;

        let name = procedure.name();
        info!(procedure = name, "Starting procedure");

        let services = Arc::clone(&self.services);
        let control = self.control.clone();
        let handle = tokio::spawn(async move {
            let _guard = IdleGuard(control.clone());
            run_procedure(services, control, procedure).await
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Park the running procedure at its next checkpoint.
    pub fn pause(&self) -> ScanbotResult<()> {
        self.control.request_pause()?;
        info!("Pause requested");
        Ok(())
    }

    /// Resume a paused procedure.
    pub fn resume(&self) -> ScanbotResult<()> {
        self.control.request_resume()?;
        info!("Resume requested");
        Ok(())
    }

    /// Stop the running procedure and wait for it to wind down.
    ///
    /// With `halt_scan` an immediate scan stop is also sent over a second
    /// pool endpoint, so a long frame does not have to finish first.
    /// Returns `None` when nothing was running.
    pub async fn stop(&self, halt_scan: bool) -> ScanbotResult<Option<ProcedureOutcome>> {
        if !self.control.request_cancel() {
            info!("Stop requested while idle");
            return Ok(self.join().await);
        }
        info!(halt_scan, "Stop requested");

        if halt_scan {
            match self.services.pool.lease().await {
                Ok(lease) => {
                    let gw = lease.connection();
                    if let Err(e) = gw.scan_action(ScanAction::Stop, ScanDirection::Up).await {
                        warn!(error = %e, "Immediate scan stop failed");
                    }
                    if let Err(e) = lease.release().await {
                        warn!(error = %e, "Releasing stop endpoint failed");
                    }
                }
                Err(e) => {
                    let e = ScanbotError::from(e);
                    warn!(error = %e, "No endpoint for immediate scan stop");
                }
            }
        }

        let outcome = self.join().await;
        self.control.finish();
        Ok(outcome)
    }

    /// Wait for the current procedure task, if any.
    pub async fn join(&self) -> Option<ProcedureOutcome> {
        let handle = self.handle.lock().take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Procedure task panicked");
                Some(ProcedureOutcome::Failed(ScanbotError::Instrument(format!(
                    "procedure task ended abnormally: {e}"
                ))))
            }
        }
    }
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::{Survey, TipShaping};
    use scanbot_core::config::Settings;
    use scanbot_driver_mock::{simulated_pool, MockConnector, SimulatedInstrument};

    fn assert_send<T: Send + 'static>(_: &T) {}

    #[test]
    fn test_procedure_task_can_be_spawned() {
        let pool = simulated_pool(MockConnector::new(SimulatedInstrument::new()), 1);
        let services = Arc::new(Services::new(pool, Settings::default()));
        let survey = run_procedure(services.clone(), TaskControl::new(), Box::new(Survey::default()));
        assert_send(&survey);
        let shaping = run_procedure(services, TaskControl::new(), Box::new(TipShaping::default()));
        assert_send(&shaping);
    }

    #[test]
    fn test_state_transitions() {
        let control = TaskControl::new();
        assert_eq!(control.state(), TaskState::Idle);

        // can't pause or resume when idle
        assert!(control.request_pause().is_err());
        assert!(control.request_resume().is_err());
        assert!(!control.request_cancel());

        control.admit().unwrap();
        assert!(matches!(control.admit(), Err(ScanbotError::AlreadyRunning)));
        assert!(control.request_resume().is_err());

        control.request_pause().unwrap();
        assert_eq!(control.state(), TaskState::Paused);
        control.request_resume().unwrap();
        assert!(control.request_cancel());
        assert!(control.is_cancel_requested());
        assert!(control.request_pause().is_err());

        control.finish();
        assert_eq!(control.state(), TaskState::Idle);
    }

    #[test]
    fn test_invalid_state_message() {
        let control = TaskControl::new();
        let err = control.request_pause().unwrap_err();
        assert_eq!(err.to_string(), "Cannot pause: task is idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_while_paused_returns_on_resume() {
        let control = TaskControl::new();
        control.admit().unwrap();
        control.request_pause().unwrap();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        control.request_resume().unwrap();
        assert_eq!(waiter.await.unwrap(), TaskState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_a_paused_waiter() {
        let control = TaskControl::new();
        control.admit().unwrap();
        control.request_pause().unwrap();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        assert!(control.request_cancel());
        assert_eq!(waiter.await.unwrap(), TaskState::CancelRequested);
    }
}
