//! Simulated scanning-probe controller.

use crate::faults::FaultConfig;
use crate::surface::{Imprint, Surface};
use async_trait::async_trait;
use ndarray::Array2;
use parking_lot::Mutex;
use scanbot_core::capabilities::{
    AutoApproach, BiasControl, CurrentSensor, DataDirection, DriftCompensation, FollowMe,
    MotorControl, MotorDirection, PiezoControl, ScanAction, ScanBuffer, ScanControl,
    ScanDirection, ScanProps, ScanSpeed, ScanWait, TipShaper, TipShaperProps, ZController,
};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{PiezoRange, Point, ScanFrame};
use scanbot_core::limits::{CURRENT_CHANNEL, DEFAULT_CHANNEL, PIXEL_MULTIPLE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Longest single sleep while waiting for a scan, so state changes made by
/// other handles are noticed.
const WAIT_GRANULARITY: Duration = Duration::from_millis(50);

/// Time per motor step when a move waits for completion.
const MOTOR_STEP_TIME: Duration = Duration::from_millis(1);

// =============================================================================
// Recorded Activity
// =============================================================================

/// One coarse motor move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorMove {
    /// Direction moved
    pub direction: MotorDirection,
    /// Steps moved
    pub steps: u32,
    /// Drive frequency at the time (Hz)
    pub frequency: f64,
    /// Drive amplitude at the time (V)
    pub amplitude: f64,
}

/// One tip-shaper pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipPulse {
    /// Tip position when the pulse fired
    pub position: Point,
    /// Pulse parameters
    pub props: TipShaperProps,
}

/// Signed motor step totals per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Odometer {
    /// Net X+ steps
    pub x: i64,
    /// Net Y+ steps
    pub y: i64,
    /// Net Z+ steps
    pub z: i64,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanStatus {
    Idle,
    Running { started: Instant, carried: Duration },
    Paused { carried: Duration },
}

#[derive(Debug)]
struct ScanState {
    status: ScanStatus,
    direction: ScanDirection,
    duration: Duration,
    /// Display-oriented image of the frame being (or last) scanned
    image: Option<Array2<f64>>,
    lines_done: usize,
    saved: u32,
    unreported: Option<PathBuf>,
}

#[derive(Debug)]
struct State {
    frame: ScanFrame,
    buffer: ScanBuffer,
    props: ScanProps,
    speed: ScanSpeed,
    scan: ScanState,
    frames_set: Vec<ScanFrame>,
    actions: Vec<(ScanAction, ScanDirection)>,

    bias: f64,
    bias_history: Vec<f64>,

    z_on: bool,
    setpoint: f64,
    z_pos: f64,
    withdrawals: u32,

    motor_frequency: f64,
    motor_amplitude: f64,
    moves: Vec<MotorMove>,
    odometer: Odometer,

    approach_until: Option<Instant>,
    approach_duration: Duration,
    approaches: u32,

    baseline_current: f64,
    current: f64,
    retract_relief: f64,
    crash_on_lateral_move: Option<f64>,

    folme: Point,
    shaper_props: TipShaperProps,
    pulses: Vec<TipPulse>,
    imprint_shape: (f64, f64),

    range: PiezoRange,
    drift_comp: DriftCompensation,

    surface: Surface,
    drift_per_scan: Point,
    drift: Point,
}

impl State {
    fn elapsed(&self, now: Instant) -> Duration {
        match self.scan.status {
            ScanStatus::Idle => Duration::ZERO,
            ScanStatus::Running { started, carried } => carried + now.saturating_duration_since(started),
            ScanStatus::Paused { carried } => carried,
        }
    }

    fn lines_scanned(&self, now: Instant) -> usize {
        let lines = self.buffer.lines as usize;
        match self.scan.status {
            ScanStatus::Idle => self.scan.lines_done,
            _ => {
                let fraction = self.elapsed(now).as_secs_f64() / self.scan.duration.as_secs_f64().max(1e-9);
                ((fraction * lines as f64).floor() as usize).min(lines)
            }
        }
    }

    /// Complete a running scan whose time is up.
    fn refresh(&mut self, now: Instant) {
        if let ScanStatus::Running { .. } = self.scan.status {
            if self.elapsed(now) >= self.scan.duration {
                self.scan.status = ScanStatus::Idle;
                self.scan.lines_done = self.buffer.lines as usize;
                self.scan.saved += 1;
                let name = format!("{}{:03}.sxm", self.props.series_name, self.scan.saved);
                self.scan.unreported = Some(PathBuf::from(name));
                self.drift = self.drift + self.drift_per_scan;
            }
        }
    }

    fn start_scan(&mut self, now: Instant, direction: ScanDirection) {
        let image = self.surface.render(
            &self.frame,
            self.buffer.pixels,
            self.buffer.lines,
            self.drift,
            u64::from(self.scan.saved),
        );
        self.scan.image = Some(image);
        self.scan.direction = direction;
        self.scan.duration = self.speed.frame_time(self.buffer.lines).max(Duration::from_millis(1));
        self.scan.lines_done = 0;
        self.scan.unreported = None;
        self.scan.status = ScanStatus::Running {
            started: now,
            carried: Duration::ZERO,
        };
    }

    /// Scan data in acquisition order; lines not yet scanned are NaN.
    fn grab(&self, now: Instant) -> Option<Array2<f64>> {
        let image = self.scan.image.as_ref()?;
        let (rows, cols) = image.dim();
        let scanned = self.lines_scanned(now);
        Some(Array2::from_shape_fn((rows, cols), |(i, c)| {
            if i >= scanned {
                return f64::NAN;
            }
            let r = match self.scan.direction {
                ScanDirection::Up => rows - 1 - i,
                ScanDirection::Down => i,
            };
            image[[r, c]]
        }))
    }
}

// =============================================================================
// SimulatedInstrument
// =============================================================================

/// Simulated controller implementing every gateway capability.
///
/// Clones share state, so a connector can hand the same instrument to every
/// pool endpoint and tests can inspect what procedures did.
///
/// Timing follows `tokio::time`: scans take `lines x (forward + backward)`
/// line time and waits sleep, so paused-clock tests run instantly.
///
/// # Example
///
/// ```rust
/// use scanbot_driver_mock::SimulatedInstrument;
///
/// let instrument = SimulatedInstrument::builder()
///     .crash_current(10e-9)
///     .retract_relief(2e-9)
///     .build();
/// assert_eq!(instrument.current(), 10e-9);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<State>>,
    faults: FaultConfig,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    /// Instrument over a flat surface with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder.
    pub fn builder() -> SimulatedInstrumentBuilder {
        SimulatedInstrumentBuilder::new()
    }

    /// Shared fault configuration.
    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }

    /// Current tunnelling current (A).
    pub fn current(&self) -> f64 {
        self.state.lock().current
    }

    /// Force the tunnelling current, e.g. to simulate a crash mid-run.
    pub fn set_current(&self, amps: f64) {
        self.state.lock().current = amps;
    }

    /// Every frame set through the gateway, in order.
    pub fn frames_set(&self) -> Vec<ScanFrame> {
        self.state.lock().frames_set.clone()
    }

    /// Every scan action issued, in order.
    pub fn scan_actions(&self) -> Vec<(ScanAction, ScanDirection)> {
        self.state.lock().actions.clone()
    }

    /// Number of completed (saved) scans.
    pub fn saved_scans(&self) -> u32 {
        self.state.lock().scan.saved
    }

    /// Every coarse move, in order.
    pub fn motor_moves(&self) -> Vec<MotorMove> {
        self.state.lock().moves.clone()
    }

    /// Net motor steps per axis.
    pub fn odometer(&self) -> Odometer {
        self.state.lock().odometer
    }

    /// Every bias set, in order.
    pub fn bias_history(&self) -> Vec<f64> {
        self.state.lock().bias_history.clone()
    }

    /// Every tip-shaper pulse, in order.
    pub fn tip_pulses(&self) -> Vec<TipPulse> {
        self.state.lock().pulses.clone()
    }

    /// Current series basename.
    pub fn series_name(&self) -> String {
        self.state.lock().props.series_name.clone()
    }

    /// Whether z feedback is on.
    pub fn z_feedback(&self) -> bool {
        self.state.lock().z_on
    }

    /// Number of withdraws issued.
    pub fn withdrawals(&self) -> u32 {
        self.state.lock().withdrawals
    }

    /// Number of auto approaches started.
    pub fn approaches(&self) -> u32 {
        self.state.lock().approaches
    }

    /// Current drift compensation.
    pub fn drift_compensation(&self) -> DriftCompensation {
        self.state.lock().drift_comp
    }

    /// Imprints left on the surface.
    pub fn imprints(&self) -> Vec<Imprint> {
        self.state.lock().surface.imprints().to_vec()
    }

    /// Whether a scan is running or paused.
    pub fn is_scanning(&self) -> bool {
        let mut state = self.state.lock();
        state.refresh(Instant::now());
        !matches!(state.scan.status, ScanStatus::Idle)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SimulatedInstrument`].
#[derive(Debug)]
pub struct SimulatedInstrumentBuilder {
    surface: Surface,
    frame: ScanFrame,
    pixels: u32,
    lines: u32,
    channels: Vec<u32>,
    line_time: f64,
    series_name: String,
    bias: f64,
    current: f64,
    crash_current: Option<f64>,
    retract_relief: f64,
    crash_on_lateral_move: Option<f64>,
    imprint_shape: (f64, f64),
    range: PiezoRange,
    drift_per_scan: Point,
    approach_duration: Duration,
    faults: FaultConfig,
}

impl Default for SimulatedInstrumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrumentBuilder {
    /// Builder with defaults: flat surface, 64 x 64 pixels, 10 ms lines.
    pub fn new() -> Self {
        Self {
            surface: Surface::flat(),
            frame: ScanFrame {
                center_x: 0.0,
                center_y: 0.0,
                width: 10e-9,
                height: 10e-9,
                angle_deg: 0.0,
            },
            pixels: 64,
            lines: 64,
            channels: vec![DEFAULT_CHANNEL],
            line_time: 0.01,
            series_name: "scanbot_".into(),
            bias: 1.0,
            current: 100e-12,
            crash_current: None,
            retract_relief: 1e-9,
            crash_on_lateral_move: None,
            imprint_shape: (2e-9, 0.5e-9),
            range: PiezoRange {
                x: 1e-6,
                y: 1e-6,
                z: 1e-6,
            },
            drift_per_scan: Point::default(),
            approach_duration: Duration::from_secs(3),
            faults: FaultConfig::none(),
        }
    }

    /// Surface to scan.
    pub fn surface(mut self, surface: Surface) -> Self {
        self.surface = surface;
        self
    }

    /// Initial scan frame.
    pub fn frame(mut self, frame: ScanFrame) -> Self {
        self.frame = frame;
        self
    }

    /// Initial scan buffer; pixels are rounded up to a multiple of 16.
    pub fn buffer(mut self, pixels: u32, lines: u32) -> Self {
        self.pixels = pixels;
        self.lines = lines;
        self
    }

    /// Channels recorded in the scan buffer.
    pub fn channels(mut self, channels: Vec<u32>) -> Self {
        self.channels = channels;
        self
    }

    /// Forward and backward line time (s).
    pub fn line_time(mut self, seconds: f64) -> Self {
        self.line_time = seconds;
        self
    }

    /// Initial series basename.
    pub fn series_name(mut self, name: impl Into<String>) -> Self {
        self.series_name = name.into();
        self
    }

    /// Initial bias (V).
    pub fn bias(mut self, volts: f64) -> Self {
        self.bias = volts;
        self
    }

    /// Baseline tunnelling current (A).
    pub fn baseline_current(mut self, amps: f64) -> Self {
        self.current = amps;
        self
    }

    /// Start in a crashed state drawing `amps`.
    pub fn crash_current(mut self, amps: f64) -> Self {
        self.crash_current = Some(amps);
        self
    }

    /// Current removed by each Z+ move (A).
    pub fn retract_relief(mut self, amps: f64) -> Self {
        self.retract_relief = amps;
        self
    }

    /// The next lateral motor move crashes the tip, drawing `amps`.
    pub fn crash_on_lateral_move(mut self, amps: f64) -> Self {
        self.crash_on_lateral_move = Some(amps);
        self
    }

    /// Semi-axes of tip-shaping imprints (m).
    pub fn imprint_shape(mut self, semi_x: f64, semi_y: f64) -> Self {
        self.imprint_shape = (semi_x, semi_y);
        self
    }

    /// Scan piezo range.
    pub fn piezo_range(mut self, range: PiezoRange) -> Self {
        self.range = range;
        self
    }

    /// Sample creep added after every completed scan.
    pub fn drift_per_scan(mut self, drift: Point) -> Self {
        self.drift_per_scan = drift;
        self
    }

    /// Time an auto approach takes.
    pub fn approach_duration(mut self, duration: Duration) -> Self {
        self.approach_duration = duration;
        self
    }

    /// Fault injection.
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Build the instrument.
    pub fn build(self) -> SimulatedInstrument {
        let pixels = self.pixels.div_ceil(PIXEL_MULTIPLE).max(1) * PIXEL_MULTIPLE;
        let state = State {
            frame: self.frame,
            buffer: ScanBuffer {
                channels: self.channels,
                pixels,
                lines: self.lines.max(1),
            },
            props: ScanProps {
                series_name: self.series_name,
            },
            speed: ScanSpeed {
                forward_line_time: self.line_time,
                backward_line_time: self.line_time,
            },
            scan: ScanState {
                status: ScanStatus::Idle,
                direction: ScanDirection::Up,
                duration: Duration::ZERO,
                image: None,
                lines_done: 0,
                saved: 0,
                unreported: None,
            },
            frames_set: Vec::new(),
            actions: Vec::new(),
            bias: self.bias,
            bias_history: Vec::new(),
            z_on: true,
            setpoint: 100e-12,
            z_pos: 0.0,
            withdrawals: 0,
            motor_frequency: 1000.0,
            motor_amplitude: 100.0,
            moves: Vec::new(),
            odometer: Odometer::default(),
            approach_until: None,
            approach_duration: self.approach_duration,
            approaches: 0,
            baseline_current: self.current,
            current: self.crash_current.unwrap_or(self.current),
            retract_relief: self.retract_relief,
            crash_on_lateral_move: self.crash_on_lateral_move,
            folme: self.frame.center(),
            shaper_props: TipShaperProps {
                switch_off_delay: 0.05,
                change_bias: false,
                bias1: 0.0,
                lift1: -2e-9,
                lift_time1: 0.1,
                bias2: 0.0,
                lift_time2: 0.1,
                lift3: 6e-9,
                lift_time3: 0.1,
                final_wait: 0.1,
                restore_feedback: true,
            },
            pulses: Vec::new(),
            imprint_shape: self.imprint_shape,
            range: self.range,
            drift_comp: DriftCompensation::default(),
            surface: self.surface,
            drift_per_scan: self.drift_per_scan,
            drift: Point::default(),
        };
        SimulatedInstrument {
            state: Arc::new(Mutex::new(state)),
            faults: self.faults,
        }
    }
}

// =============================================================================
// Capability Implementations
// =============================================================================

#[async_trait]
impl ScanControl for SimulatedInstrument {
    async fn scan_frame_get(&self) -> ScanbotResult<ScanFrame> {
        self.faults.check("scan_frame_get")?;
        Ok(self.state.lock().frame)
    }

    async fn scan_frame_set(&self, frame: &ScanFrame) -> ScanbotResult<()> {
        self.faults.check("scan_frame_set")?;
        frame.validate()?;
        let mut state = self.state.lock();
        if !state.range.fits(frame) {
            return Err(ScanbotError::Instrument(format!(
                "frame at ({:.3e}, {:.3e}) outside piezo range",
                frame.center_x, frame.center_y
            )));
        }
        state.frame = *frame;
        state.frames_set.push(*frame);
        Ok(())
    }

    async fn scan_buffer_get(&self) -> ScanbotResult<ScanBuffer> {
        self.faults.check("scan_buffer_get")?;
        Ok(self.state.lock().buffer.clone())
    }

    async fn scan_buffer_set(&self, pixels: u32, lines: u32) -> ScanbotResult<()> {
        self.faults.check("scan_buffer_set")?;
        if pixels == 0 || pixels % PIXEL_MULTIPLE != 0 || lines == 0 {
            return Err(ScanbotError::Instrument(format!(
                "invalid scan buffer {pixels} x {lines}"
            )));
        }
        let mut state = self.state.lock();
        state.buffer.pixels = pixels;
        state.buffer.lines = lines;
        Ok(())
    }

    async fn scan_props_get(&self) -> ScanbotResult<ScanProps> {
        self.faults.check("scan_props_get")?;
        Ok(self.state.lock().props.clone())
    }

    async fn scan_props_set(&self, props: &ScanProps) -> ScanbotResult<()> {
        self.faults.check("scan_props_set")?;
        self.state.lock().props = props.clone();
        Ok(())
    }

    async fn scan_speed_get(&self) -> ScanbotResult<ScanSpeed> {
        self.faults.check("scan_speed_get")?;
        Ok(self.state.lock().speed)
    }

    async fn scan_speed_set(&self, speed: &ScanSpeed) -> ScanbotResult<()> {
        self.faults.check("scan_speed_set")?;
        self.state.lock().speed = *speed;
        Ok(())
    }

    async fn scan_action(&self, action: ScanAction, direction: ScanDirection) -> ScanbotResult<()> {
        self.faults.check("scan_action")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refresh(now);
        state.actions.push((action, direction));
        match action {
            ScanAction::Start => state.start_scan(now, direction),
            ScanAction::Stop => {
                if !matches!(state.scan.status, ScanStatus::Idle) {
                    state.scan.lines_done = state.lines_scanned(now);
                    state.scan.status = ScanStatus::Idle;
                }
                state.scan.unreported = None;
            }
            ScanAction::Pause => {
                if let ScanStatus::Running { .. } = state.scan.status {
                    let carried = state.elapsed(now);
                    state.scan.status = ScanStatus::Paused { carried };
                }
            }
            ScanAction::Resume => {
                if let ScanStatus::Paused { carried } = state.scan.status {
                    state.scan.status = ScanStatus::Running {
                        started: now,
                        carried,
                    };
                }
            }
        }
        tracing::debug!(?action, ?direction, "SimulatedInstrument: scan action");
        Ok(())
    }

    async fn wait_end_of_scan(&self, timeout: Duration) -> ScanbotResult<ScanWait> {
        self.faults.check("wait_end_of_scan")?;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let remaining = {
                let mut state = self.state.lock();
                state.refresh(now);
                match state.scan.status {
                    ScanStatus::Idle => {
                        return Ok(ScanWait {
                            timed_out: false,
                            file_path: state.scan.unreported.take(),
                        });
                    }
                    ScanStatus::Running { .. } => {
                        state.scan.duration.saturating_sub(state.elapsed(now))
                    }
                    ScanStatus::Paused { .. } => WAIT_GRANULARITY,
                }
            };
            if now >= deadline {
                return Ok(ScanWait {
                    timed_out: true,
                    file_path: None,
                });
            }
            let nap = remaining
                .min(deadline.saturating_duration_since(now))
                .min(WAIT_GRANULARITY)
                .max(Duration::from_micros(100));
            sleep(nap).await;
        }
    }

    async fn frame_data_grab(
        &self,
        channel: u32,
        _direction: DataDirection,
    ) -> ScanbotResult<Array2<f64>> {
        self.faults.check("frame_data_grab")?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refresh(now);
        if !state.buffer.channels.contains(&channel) && channel != CURRENT_CHANNEL {
            return Err(ScanbotError::Instrument(format!(
                "channel {channel} is not recorded"
            )));
        }
        state
            .grab(now)
            .ok_or_else(|| ScanbotError::Instrument("no scan data available".into()))
    }
}

#[async_trait]
impl BiasControl for SimulatedInstrument {
    async fn bias_get(&self) -> ScanbotResult<f64> {
        self.faults.check("bias_get")?;
        Ok(self.state.lock().bias)
    }

    async fn bias_set(&self, volts: f64) -> ScanbotResult<()> {
        self.faults.check("bias_set")?;
        if !volts.is_finite() || volts.abs() > 10.0 {
            return Err(ScanbotError::Instrument(format!("bias {volts} V out of range")));
        }
        let mut state = self.state.lock();
        state.bias = volts;
        state.bias_history.push(volts);
        Ok(())
    }
}

#[async_trait]
impl ZController for SimulatedInstrument {
    async fn z_controller_get(&self) -> ScanbotResult<bool> {
        self.faults.check("z_controller_get")?;
        Ok(self.state.lock().z_on)
    }

    async fn z_controller_set(&self, on: bool) -> ScanbotResult<()> {
        self.faults.check("z_controller_set")?;
        self.state.lock().z_on = on;
        Ok(())
    }

    async fn setpoint_get(&self) -> ScanbotResult<f64> {
        self.faults.check("setpoint_get")?;
        Ok(self.state.lock().setpoint)
    }

    async fn setpoint_set(&self, amps: f64) -> ScanbotResult<()> {
        self.faults.check("setpoint_set")?;
        self.state.lock().setpoint = amps;
        Ok(())
    }

    async fn z_pos_get(&self) -> ScanbotResult<f64> {
        self.faults.check("z_pos_get")?;
        Ok(self.state.lock().z_pos)
    }

    async fn z_pos_set(&self, z: f64) -> ScanbotResult<()> {
        self.faults.check("z_pos_set")?;
        let mut state = self.state.lock();
        if state.z_on {
            return Err(ScanbotError::Instrument(
                "z position can only be set with feedback off".into(),
            ));
        }
        state.z_pos = z;
        Ok(())
    }

    async fn withdraw(&self, wait: bool, timeout: Duration) -> ScanbotResult<()> {
        self.faults.check("withdraw")?;
        {
            let mut state = self.state.lock();
            state.z_on = false;
            state.withdrawals += 1;
        }
        if wait {
            sleep(timeout.min(Duration::from_millis(100))).await;
        }
        Ok(())
    }
}

#[async_trait]
impl MotorControl for SimulatedInstrument {
    async fn motor_freq_amp_set(&self, frequency: f64, amplitude: f64) -> ScanbotResult<()> {
        self.faults.check("motor_freq_amp_set")?;
        let mut state = self.state.lock();
        state.motor_frequency = frequency;
        state.motor_amplitude = amplitude;
        Ok(())
    }

    async fn motor_start_move(
        &self,
        direction: MotorDirection,
        steps: u32,
        wait: bool,
    ) -> ScanbotResult<()> {
        self.faults.check("motor_start_move")?;
        {
            let mut state = self.state.lock();
            let mv = MotorMove {
                direction,
                steps,
                frequency: state.motor_frequency,
                amplitude: state.motor_amplitude,
            };
            state.moves.push(mv);
            let n = i64::from(steps);
            match direction {
                MotorDirection::XPlus => state.odometer.x += n,
                MotorDirection::XMinus => state.odometer.x -= n,
                MotorDirection::YPlus => state.odometer.y += n,
                MotorDirection::YMinus => state.odometer.y -= n,
                MotorDirection::ZPlus => state.odometer.z += n,
                MotorDirection::ZMinus => state.odometer.z -= n,
            }
            if direction == MotorDirection::ZPlus && steps > 0 {
                state.current = (state.current - state.retract_relief).max(state.baseline_current);
            }
            if direction.is_lateral() && steps > 0 {
                if let Some(amps) = state.crash_on_lateral_move.take() {
                    state.current = amps;
                }
            }
        }
        tracing::debug!(%direction, steps, "SimulatedInstrument: motor move");
        if wait {
            if self.faults.stalls("motor_start_move") {
                std::future::pending::<()>().await;
            }
            sleep(MOTOR_STEP_TIME * steps).await;
        }
        Ok(())
    }
}

#[async_trait]
impl AutoApproach for SimulatedInstrument {
    async fn approach_open(&self) -> ScanbotResult<()> {
        self.faults.check("approach_open")
    }

    async fn approach_set(&self, on: bool) -> ScanbotResult<()> {
        self.faults.check("approach_set")?;
        let mut state = self.state.lock();
        if on {
            state.approach_until = Some(Instant::now() + state.approach_duration);
            state.approaches += 1;
        } else {
            state.approach_until = None;
        }
        Ok(())
    }

    async fn approach_get(&self) -> ScanbotResult<bool> {
        self.faults.check("approach_get")?;
        let mut state = self.state.lock();
        match state.approach_until {
            Some(until) if Instant::now() < until => Ok(true),
            Some(_) => {
                state.approach_until = None;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CurrentSensor for SimulatedInstrument {
    async fn current_get(&self) -> ScanbotResult<f64> {
        self.faults.check("current_get")?;
        Ok(self.state.lock().current)
    }
}

#[async_trait]
impl FollowMe for SimulatedInstrument {
    async fn folme_xy_get(&self) -> ScanbotResult<Point> {
        self.faults.check("folme_xy_get")?;
        Ok(self.state.lock().folme)
    }

    async fn folme_xy_set(&self, position: Point, wait: bool) -> ScanbotResult<()> {
        self.faults.check("folme_xy_set")?;
        self.state.lock().folme = position;
        if wait && self.faults.stalls("folme_xy_set") {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl TipShaper for SimulatedInstrument {
    async fn tip_shaper_props_get(&self) -> ScanbotResult<TipShaperProps> {
        self.faults.check("tip_shaper_props_get")?;
        Ok(self.state.lock().shaper_props)
    }

    async fn tip_shaper_props_set(&self, props: &TipShaperProps) -> ScanbotResult<()> {
        self.faults.check("tip_shaper_props_set")?;
        props.validate()?;
        self.state.lock().shaper_props = *props;
        Ok(())
    }

    async fn tip_shaper_start(&self, wait: bool, timeout: Duration) -> ScanbotResult<()> {
        self.faults.check("tip_shaper_start")?;
        let pulse_time = {
            let mut state = self.state.lock();
            let props = state.shaper_props;
            let position = state.folme;
            state.pulses.push(TipPulse { position, props });
            let (semi_x, semi_y) = state.imprint_shape;
            state.surface.add_imprint(Imprint {
                center: position,
                semi_x,
                semi_y,
                depth: 1e-10,
            });
            if props.restore_feedback {
                state.z_on = true;
            }
            props.switch_off_delay + props.lift_time1 + props.lift_time2 + props.lift_time3 + props.final_wait
        };
        if wait {
            let duration = Duration::from_secs_f64(pulse_time.max(0.0));
            if duration > timeout {
                sleep(timeout).await;
                return Err(ScanbotError::Timeout {
                    operation: "tip_shaper_start",
                    after: timeout,
                });
            }
            sleep(duration).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PiezoControl for SimulatedInstrument {
    async fn piezo_range_get(&self) -> ScanbotResult<PiezoRange> {
        self.faults.check("piezo_range_get")?;
        Ok(self.state.lock().range)
    }

    async fn drift_comp_get(&self) -> ScanbotResult<DriftCompensation> {
        self.faults.check("drift_comp_get")?;
        Ok(self.state.lock().drift_comp)
    }

    async fn drift_comp_set(&self, comp: &DriftCompensation) -> ScanbotResult<()> {
        self.faults.check("drift_comp_set")?;
        self.state.lock().drift_comp = *comp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultScenario;

    #[tokio::test(start_paused = true)]
    async fn test_scan_completes_and_saves() {
        let instrument = SimulatedInstrument::builder().series_name("demo_").build();
        instrument.scan_action(ScanAction::Start, ScanDirection::Up).await.unwrap();

        let partial = instrument.frame_data_grab(DEFAULT_CHANNEL, DataDirection::Forward).await.unwrap();
        assert!(partial.iter().any(|v| v.is_nan()));

        let wait = instrument.wait_end_of_scan(Duration::from_secs(10)).await.unwrap();
        assert!(wait.completed());
        assert_eq!(wait.file_path, Some(PathBuf::from("demo_001.sxm")));

        let full = instrument.frame_data_grab(DEFAULT_CHANNEL, DataDirection::Forward).await.unwrap();
        assert!(full.iter().all(|v| v.is_finite()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_while_paused() {
        let instrument = SimulatedInstrument::new();
        instrument.scan_action(ScanAction::Start, ScanDirection::Down).await.unwrap();
        instrument.scan_action(ScanAction::Pause, ScanDirection::Down).await.unwrap();
        let wait = instrument.wait_end_of_scan(Duration::from_secs(5)).await.unwrap();
        assert!(wait.timed_out);

        instrument.scan_action(ScanAction::Resume, ScanDirection::Down).await.unwrap();
        let wait = instrument.wait_end_of_scan(Duration::from_secs(5)).await.unwrap();
        assert!(wait.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_scan_has_no_file() {
        let instrument = SimulatedInstrument::new();
        instrument.scan_action(ScanAction::Start, ScanDirection::Up).await.unwrap();
        instrument.scan_action(ScanAction::Stop, ScanDirection::Up).await.unwrap();
        let wait = instrument.wait_end_of_scan(Duration::from_secs(1)).await.unwrap();
        assert!(wait.stopped());
        assert_eq!(instrument.saved_scans(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retract_relieves_crash_current() {
        let instrument = SimulatedInstrument::builder()
            .crash_current(10e-9)
            .retract_relief(2e-9)
            .build();
        instrument.motor_start_move(MotorDirection::ZPlus, 50, true).await.unwrap();
        assert!((instrument.current_get().await.unwrap() - 8e-9).abs() < 1e-15);
        assert_eq!(instrument.odometer().z, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tip_pulse_leaves_imprint_at_tip() {
        let instrument = SimulatedInstrument::new();
        let spot = Point::new(1e-9, -1e-9);
        instrument.folme_xy_set(spot, true).await.unwrap();
        instrument.tip_shaper_start(true, Duration::from_secs(30)).await.unwrap();
        assert_eq!(instrument.imprints()[0].center, spot);
        assert_eq!(instrument.tip_pulses().len(), 1);
    }

    #[tokio::test]
    async fn test_communication_loss() {
        let instrument = SimulatedInstrument::builder()
            .faults(FaultConfig::scenarios([FaultScenario::CommunicationLoss]))
            .build();
        let err = instrument.bias_get().await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
