//! The acquisition state machine.
//!
//! One worker thread lives as long as the [AcquisitionController]. It sleeps
//! on the condition variable until a run is requested, then loops over the
//! blocking SDK frame wait and hands each frame to the host buffer manager.
//! All state shared between the host thread and the worker is behind a
//! single mutex; the frame counter is an atomic so the host can poll it
//! without taking the lock.
//!
//! Host calls block on two handshakes: [AcquisitionController::start]
//! returns once the worker has picked up the run and
//! [AcquisitionController::stop] returns once the worker has torn it down
//! (capture stopped, frame buffer released, trigger timer stopped). Runs are
//! numbered so neither handshake can be missed when a run ends on its own
//! before the host thread is scheduled again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use hwif::{BufferCtrl, FrameInfo, TrigMode};
use tucam::{CaptureMode, Device, Frame, TriggerExposure, TucamSdk};

use crate::config::{DhyanaConfig, ExtTriggerMode, TriggerEdgeSetting};
use crate::status::{SessionStatus, Status};
use crate::trigger_timer::SoftTriggerTimer;
use crate::{Error, Result};

/// Parameters of the next acquisition, captured by the worker at start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcqParams {
    pub trig_mode: TrigMode,
    /// Exposure time in seconds, as last set by the host.
    pub exp_time: f64,
    /// Delay between frames in seconds.
    pub lat_time: f64,
    /// Number of frames, 0 for continuous acquisition.
    pub nb_frames: u64,
    pub ext_trigger: ExtTriggerMode,
    pub trigger_edge: TriggerEdgeSetting,
}

impl Default for AcqParams {
    fn default() -> Self {
        Self {
            trig_mode: TrigMode::IntTrig,
            exp_time: 0.01,
            lat_time: 0.0,
            nb_frames: 1,
            ext_trigger: ExtTriggerMode::default(),
            trigger_edge: TriggerEdgeSetting::default(),
        }
    }
}

impl AcqParams {
    fn capture_mode(&self) -> CaptureMode {
        match self.trig_mode {
            TrigMode::IntTrig => CaptureMode::TriggerSoftware,
            _ => self.ext_trigger.capture_mode(),
        }
    }
}

/// Timing and retry policy of the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    /// Sleep after arming the capture; the camera is not ready when
    /// `cap_start` returns.
    pub arm_settle: Duration,
    /// How often [AcquisitionController::stop] re-aborts the frame wait.
    pub abort_retry: Duration,
    /// Software trigger period in [TrigMode::IntTrig].
    pub trigger_period: Duration,
    /// Zero disables the limit.
    pub max_consecutive_wait_failures: u32,
}

impl From<&DhyanaConfig> for Timings {
    fn from(cfg: &DhyanaConfig) -> Self {
        Self {
            arm_settle: cfg.arm_settle(),
            abort_retry: cfg.abort_retry(),
            trigger_period: cfg.internal_trigger_period(),
            max_consecutive_wait_failures: cfg.max_consecutive_wait_failures,
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&DhyanaConfig::default())
    }
}

struct State {
    status: SessionStatus,
    params: AcqParams,
    /// Present while prepared and idle. Owned by the worker during a run.
    frame: Option<Frame>,
    cold_started: bool,
    timer: Option<SoftTriggerTimer>,
    /// Set by [AcquisitionController::start] while the capture is armed and
    /// the lock is released.
    arming: bool,
    run_requested: bool,
    running: bool,
    stop_requested: bool,
    quit: bool,
    /// Number of the last requested run.
    session: u64,
    /// Number of the last run picked up by the worker.
    acked_session: u64,
    /// Number of the last run torn down by the worker.
    completed_session: u64,
    worker_exited: bool,
}

impl State {
    fn is_active(&self) -> bool {
        self.arming || self.run_requested || self.running
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    frame_count: AtomicUsize,
}

/// Sets `worker_exited` when the worker ends, including by panic.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.state.lock().worker_exited = true;
        self.0.cond.notify_all();
    }
}

fn worker_gone() -> Error {
    Error::Thread("acquisition thread is not running".into())
}

/// Drives acquisitions on a TUCAM device.
pub struct AcquisitionController<S: TucamSdk + 'static> {
    shared: Arc<Shared>,
    device: Arc<Device<S>>,
    buffer: BufferCtrl,
    timings: Timings,
    worker: Option<JoinHandle<()>>,
}

impl<S: TucamSdk + 'static> AcquisitionController<S> {
    /// Create the controller and spawn its worker thread.
    pub fn new(
        device: Arc<Device<S>>,
        buffer: BufferCtrl,
        params: AcqParams,
        timings: Timings,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                status: SessionStatus::new(),
                params,
                frame: None,
                cold_started: false,
                timer: None,
                arming: false,
                run_requested: false,
                running: false,
                stop_requested: false,
                quit: false,
                session: 0,
                acked_session: 0,
                completed_session: 0,
                worker_exited: false,
            }),
            cond: Condvar::new(),
            frame_count: AtomicUsize::new(0),
        });

        let worker = {
            let shared = shared.clone();
            let device = device.clone();
            let buffer = buffer.clone();
            std::thread::Builder::new()
                .name(format!("dhyana-acq-{}", device.index()))
                .spawn(move || worker(shared, device, buffer, timings))?
        };

        Ok(Self {
            shared,
            device,
            buffer,
            timings,
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> &Arc<Device<S>> {
        &self.device
    }

    pub fn buffer(&self) -> &BufferCtrl {
        &self.buffer
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn params(&self) -> AcqParams {
        self.shared.state.lock().params
    }

    /// Change the parameters. A running acquisition keeps the values it was
    /// started with.
    pub fn update_params<F>(&self, f: F)
    where
        F: FnOnce(&mut AcqParams),
    {
        f(&mut self.shared.state.lock().params);
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().status.get()
    }

    /// Frames handed to the host since the last start.
    pub fn acquired_frame_count(&self) -> usize {
        self.shared.frame_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_active()
    }

    pub fn is_prepared(&self) -> bool {
        self.shared.state.lock().frame.is_some()
    }

    pub fn worker_thread_id(&self) -> Option<ThreadId> {
        self.worker.as_ref().map(|h| h.thread().id())
    }

    /// Program the trigger and allocate the SDK frame buffer.
    ///
    /// The buffer is allocated only once until the next acquisition has
    /// been torn down; the trigger is programmed on every call.
    pub fn prepare(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.is_active() {
            return Err(Error::AlreadyRunning);
        }

        if !state.cold_started {
            // the first capture after power up delivers no frame
            debug!("cold start");
            self.device.cap_start(CaptureMode::TriggerSoftware)?;
            self.device.cap_stop()?;
            state.cold_started = true;
        }

        self.program_trigger(&state.params)?;

        if state.frame.is_none() {
            let frame = self.device.buf_alloc()?;
            debug!("allocated {}x{} frame buffer", frame.width, frame.height);
            state.frame = Some(frame);
        }
        Ok(())
    }

    fn program_trigger(&self, params: &AcqParams) -> Result<()> {
        let mut attr = self.device.cap_trigger()?;
        attr.edge = params.trigger_edge.into();
        attr.delay = 0;
        attr.frames = 1;
        match params.trig_mode {
            TrigMode::IntTrig => {
                attr.mode = CaptureMode::TriggerSoftware;
                attr.exposure = TriggerExposure::ExposureTime;
            }
            TrigMode::ExtTrigMult => {
                attr.mode = params.ext_trigger.capture_mode();
                attr.exposure = TriggerExposure::ExposureTime;
            }
            TrigMode::ExtGate => {
                attr.mode = params.ext_trigger.capture_mode();
                attr.exposure = TriggerExposure::Width;
            }
            TrigMode::ExtTrigSingle => {
                attr.mode = params.ext_trigger.capture_mode();
                attr.exposure = TriggerExposure::ExposureTime;
                attr.frames = u32::try_from(params.nb_frames).unwrap_or(u32::MAX);
            }
            mode => {
                return Err(Error::NotSupported(format!("trigger mode {mode}")));
            }
        }
        debug!("trigger {:?}", attr);
        self.device.set_cap_trigger(&attr)?;
        Ok(())
    }

    /// Release a prepared frame buffer, e.g. because the ROI changed.
    pub fn release_buffer(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.is_active() {
            return Err(Error::Busy("acquisition running".into()));
        }
        if state.frame.take().is_some() {
            self.device.buf_release()?;
        }
        Ok(())
    }

    /// Arm the capture and hand the run to the worker.
    ///
    /// Returns once the worker has picked up the run. A [stop](Self::stop)
    /// issued while arming cancels the run before it starts.
    pub fn start(&self) -> Result<()> {
        let params = {
            let mut state = self.shared.state.lock();
            if state.worker_exited {
                return Err(worker_gone());
            }
            if state.is_active() {
                return Err(Error::AlreadyRunning);
            }
            if state.frame.is_none() {
                return Err(Error::NotPrepared);
            }
            if state.status.get() == Status::Fault {
                return Err(Error::Busy("in fault state, reset required".into()));
            }
            state.arming = true;
            state.stop_requested = false;
            state.params
        };

        let timer = match self.arm(&params) {
            Ok(timer) => timer,
            Err(e) => {
                self.end_arming(|_| {});
                return Err(e);
            }
        };

        let mut state = self.shared.state.lock();
        if state.stop_requested {
            drop(state);
            info!("stop requested while arming, acquisition not started");
            teardown(&self.device, timer, false);
            self.end_arming(|state| {
                state.stop_requested = false;
                state.status.set(Status::Ready);
            });
            return Ok(());
        }

        self.shared.frame_count.store(0, Ordering::SeqCst);
        self.buffer.set_start_timestamp(Utc::now());
        state.status.set(Status::Exposure);
        state.timer = timer;
        state.arming = false;
        state.run_requested = true;
        state.session += 1;
        let session = state.session;
        info!(
            "starting acquisition {session}: {} frames, {:?}, exposure {} s, latency {} s",
            params.nb_frames, params.trig_mode, params.exp_time, params.lat_time
        );
        self.shared.cond.notify_all();

        while state.acked_session < session {
            if state.worker_exited {
                return Err(worker_gone());
            }
            self.shared.cond.wait(&mut state);
        }
        Ok(())
    }

    /// Start the capture, let it settle and start the software trigger.
    ///
    /// Called without the lock. The settle time is cut short by a stop
    /// request, in which case no trigger timer is started.
    fn arm(&self, params: &AcqParams) -> Result<Option<SoftTriggerTimer>> {
        self.device.cap_start(params.capture_mode())?;

        if !self.timings.arm_settle.is_zero() {
            let deadline = Instant::now() + self.timings.arm_settle;
            let mut state = self.shared.state.lock();
            while !state.stop_requested {
                if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.stop_requested {
                return Ok(None);
            }
        }

        if params.trig_mode != TrigMode::IntTrig {
            return Ok(None);
        }
        match SoftTriggerTimer::start(
            self.device.clone(),
            self.timings.trigger_period,
            params.nb_frames,
        ) {
            Ok(timer) => Ok(Some(timer)),
            Err(e) => {
                if let Err(e2) = self.device.cap_stop() {
                    warn!("cap_stop after failed start: {e2}");
                }
                Err(e)
            }
        }
    }

    fn end_arming<F>(&self, f: F)
    where
        F: FnOnce(&mut State),
    {
        let mut state = self.shared.state.lock();
        f(&mut *state);
        state.arming = false;
        self.shared.cond.notify_all();
    }

    /// Stop the current acquisition and wait until it is torn down.
    ///
    /// When idle this only sets the status to [Status::Ready].
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.arming {
            state.stop_requested = true;
            self.shared.cond.notify_all();
            while state.arming {
                self.shared.cond.wait(&mut state);
            }
        }
        if !state.is_active() {
            state.status.set(Status::Ready);
            return Ok(());
        }

        let t0 = Instant::now();
        state.stop_requested = true;
        let session = state.session;
        self.shared.cond.notify_all();

        while state.completed_session < session {
            if state.worker_exited {
                return Err(worker_gone());
            }
            // the worker may enter the frame wait after any single abort
            MutexGuard::unlocked(&mut state, || {
                if let Err(e) = self.device.abort_wait() {
                    debug!("abort_wait: {e}");
                }
            });
            if state.completed_session >= session {
                break;
            }
            self.shared
                .cond
                .wait_for(&mut state, self.timings.abort_retry);
        }
        debug!("acquisition {session} stopped in {} ms", t0.elapsed().as_millis());
        Ok(())
    }

    /// Stop, then clear any fault.
    pub fn reset(&self) -> Result<()> {
        self.stop()?;
        self.shared.state.lock().status.force(Status::Ready);
        Ok(())
    }
}

impl<S: TucamSdk + 'static> Drop for AcquisitionController<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("stopping acquisition: {e}");
        }
        {
            let mut state = self.shared.state.lock();
            state.quit = true;
            state.stop_requested = true;
            self.shared.cond.notify_all();
        }
        if let Some(join_handle) = self.worker.take() {
            if join_handle.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
        let frame = self.shared.state.lock().frame.take();
        if frame.is_some() {
            if let Err(e) = self.device.buf_release() {
                warn!("buf_release: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    TargetReached,
    Stopped,
    HostStopped,
    Fault,
}

fn worker<S: TucamSdk>(
    shared: Arc<Shared>,
    device: Arc<Device<S>>,
    buffer: BufferCtrl,
    timings: Timings,
) {
    let _exit_guard = ExitGuard(shared.clone());
    let mut state = shared.state.lock();
    loop {
        while !state.run_requested && !state.quit {
            shared.cond.wait(&mut state);
        }
        if !state.run_requested {
            break;
        }

        let session = state.session;
        state.running = true;
        state.acked_session = session;
        shared.cond.notify_all();

        let frame = state.frame.take();
        let timer = state.timer.take();
        let params = state.params;
        let t0 = Instant::now();

        let end = MutexGuard::unlocked(&mut state, || match frame {
            Some(mut frame) => {
                let end = acquire(&shared, &device, &buffer, &timings, &mut frame, &params);
                teardown(&device, timer, true);
                end
            }
            None => {
                error!("acquisition started without frame buffer");
                teardown(&device, timer, false);
                RunEnd::Fault
            }
        });

        state.running = false;
        state.run_requested = false;
        state.stop_requested = false;
        if end == RunEnd::Fault {
            state.status.force(Status::Fault);
        } else {
            state.status.set(Status::Ready);
        }
        state.completed_session = session;
        shared.cond.notify_all();
        info!(
            "acquisition {session} ended ({end:?}) after {} frames in {} ms",
            shared.frame_count.load(Ordering::SeqCst),
            t0.elapsed().as_millis()
        );

        if state.quit {
            break;
        }
    }
    drop(state);
    debug!(
        "closing thread {:?} ({:?}) in {}:{}",
        std::thread::current().name(),
        std::thread::current().id(),
        file!(),
        line!()
    );
}

fn teardown<S: TucamSdk>(device: &Device<S>, timer: Option<SoftTriggerTimer>, release: bool) {
    if let Some(mut timer) = timer {
        timer.stop();
    }
    if let Err(e) = device.cap_stop() {
        warn!("cap_stop: {e}");
    }
    if release {
        if let Err(e) = device.buf_release() {
            warn!("buf_release: {e}");
        }
    }
}

fn acquire<S: TucamSdk>(
    shared: &Shared,
    device: &Device<S>,
    buffer: &BufferCtrl,
    timings: &Timings,
    frame: &mut Frame,
    params: &AcqParams,
) -> RunEnd {
    let mut failures = 0;
    loop {
        let n = shared.frame_count.load(Ordering::SeqCst);
        {
            let mut state = shared.state.lock();
            if state.stop_requested {
                return RunEnd::Stopped;
            }
            if params.nb_frames > 0 && n as u64 >= params.nb_frames {
                return RunEnd::TargetReached;
            }
            state.status.set(Status::Exposure);
        }

        match device.wait_for_frame(frame) {
            Ok(()) => {
                failures = 0;
                shared.state.lock().status.set(Status::Readout);
                {
                    let image = frame.image();
                    let mut dest = buffer.frame_buffer(n);
                    if dest.len() != image.len() {
                        warn!(
                            "frame {n}: {} bytes from camera, host buffer holds {}",
                            image.len(),
                            dest.len()
                        );
                    }
                    let len = dest.len().min(image.len());
                    dest[..len].copy_from_slice(&image[..len]);
                }
                shared.frame_count.store(n + 1, Ordering::SeqCst);
                let info = FrameInfo {
                    acq_frame_nb: n,
                    timestamp: Utc::now(),
                };
                trace!("frame {n} (camera index {})", frame.index);
                if !buffer.new_frame_ready(&info) {
                    info!("host requested stop after frame {n}");
                    return RunEnd::HostStopped;
                }

                let more = params.nb_frames == 0 || ((n + 1) as u64) < params.nb_frames;
                if params.lat_time > 0.0 && more {
                    let deadline = Instant::now() + Duration::from_secs_f64(params.lat_time);
                    let mut state = shared.state.lock();
                    state.status.set(Status::Latency);
                    while !state.stop_requested {
                        if shared.cond.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                }
            }
            Err(e) if e.is_abort() => {
                debug!("frame wait aborted");
            }
            Err(e) => {
                failures += 1;
                warn!("frame wait failed ({failures} in a row): {e}");
                if timings.max_consecutive_wait_failures > 0
                    && failures >= timings.max_consecutive_wait_failures
                {
                    error!("giving up after {failures} failed frame waits");
                    return RunEnd::Fault;
                }
            }
        }
    }
}
