//! In-process simulated TUCAM camera.
//!
//! Behaves like a Dhyana camera attached to the vendor API: frames are
//! produced at the exposure time once a software trigger arrives, every
//! `external_trigger_period` in the external trigger modes, or back to back
//! in free-running mode. [SimulatedSdk::stats] exposes call counters and
//! [SimulatedSdk::fail_next_waits] injects capture errors for tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    CapaId, CaptureMode, Frame, InfoId, InfoValue, OutputSignal, PropAttr, PropId, Result,
    ReturnCode, RoiAttr, SignalEdge, TriggerAttr, TriggerOutAttr, TucamError, TucamSdk,
};

const NUM_OUTPUT_PORTS: u32 = 3;
const FRAME_HEADER_BYTES: usize = 64;
const MAX_FAN_GEAR: i32 = 3;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub camera_count: u32,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub model: String,
    pub api_version: String,
    pub firmware_version: i32,
    /// Interval between frames in the external trigger modes.
    pub external_trigger_period: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            camera_count: 1,
            sensor_width: 2048,
            sensor_height: 2048,
            model: "Dhyana 4040 (simulated)".into(),
            api_version: "TUCAM 1.0.0 (simulated)".into(),
            firmware_version: 0x0102,
            external_trigger_period: Duration::from_millis(5),
        }
    }
}

/// Counters of SDK calls made on a [SimulatedSdk].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub buf_allocs: usize,
    pub buf_releases: usize,
    pub cap_starts: usize,
    pub cap_stops: usize,
    pub software_triggers: usize,
    pub aborts: usize,
    pub frames: usize,
}

struct SimState {
    initialized: bool,
    opened: bool,
    exposure_ms: f64,
    temperature_raw: f64,
    gain: f64,
    fan_gear: i32,
    roi: RoiAttr,
    trigger: TriggerAttr,
    trigger_out: Vec<TriggerOutAttr>,
    capture: Option<CaptureMode>,
    allocated: bool,
    pending_triggers: usize,
    abort_pending: bool,
    next_index: u32,
    fail_next_waits: usize,
    fail_next_alloc: bool,
    stats: SimStats,
}

struct SimInner {
    config: SimConfig,
    state: Mutex<SimState>,
    cond: Condvar,
}

/// A simulated camera implementing [TucamSdk].
///
/// Clones share the same camera, so a test can keep a clone to inspect
/// [SimStats] after handing the SDK to a device.
#[derive(Clone)]
pub struct SimulatedSdk {
    inner: Arc<SimInner>,
}

fn err(code: ReturnCode, call: &'static str) -> crate::Error {
    TucamError::new(code, call).into()
}

const EXPOSURE_ATTR: PropAttr = PropAttr {
    min: 0.0,
    max: 10_000.0,
    default: 10.0,
    step: 0.001,
};

// Raw set point units: the middle of the range is 0 degrees C.
const TEMPERATURE_ATTR: PropAttr = PropAttr {
    min: 0.0,
    max: 100.0,
    default: 40.0,
    step: 1.0,
};

const GAIN_ATTR: PropAttr = PropAttr {
    min: 0.0,
    max: 2.0,
    default: 1.0,
    step: 1.0,
};

fn check_range(attr: &PropAttr, value: f64, call: &'static str) -> Result<()> {
    if value < attr.min || value > attr.max || value.is_nan() {
        return Err(err(ReturnCode::OutOfRange, call));
    }
    Ok(())
}

impl SimulatedSdk {
    pub fn new(config: SimConfig) -> Self {
        let roi = RoiAttr {
            enable: false,
            h_offset: 0,
            v_offset: 0,
            width: config.sensor_width,
            height: config.sensor_height,
        };
        let trigger_out = (0..NUM_OUTPUT_PORTS)
            .map(|port| TriggerOutAttr {
                port,
                signal: OutputSignal::ExposureStart,
                edge: SignalEdge::Rising,
                delay: Some(0),
                width: Some(5000),
            })
            .collect();
        let state = SimState {
            initialized: false,
            opened: false,
            exposure_ms: EXPOSURE_ATTR.default,
            temperature_raw: TEMPERATURE_ATTR.default,
            gain: GAIN_ATTR.default,
            fan_gear: 0,
            roi,
            trigger: TriggerAttr::default(),
            trigger_out,
            capture: None,
            allocated: false,
            pending_triggers: 0,
            abort_pending: false,
            next_index: 0,
            fail_next_waits: 0,
            fail_next_alloc: false,
            stats: SimStats::default(),
        };
        Self {
            inner: Arc::new(SimInner {
                config,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> SimStats {
        self.inner.state.lock().stats.clone()
    }

    /// Make the next `n` frame waits fail with a timeout.
    pub fn fail_next_waits(&self, n: usize) {
        self.inner.state.lock().fail_next_waits = n;
    }

    /// Make the next buffer allocation fail.
    pub fn fail_next_alloc(&self) {
        self.inner.state.lock().fail_next_alloc = true;
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.state.lock().capture.is_some()
    }

    pub fn is_allocated(&self) -> bool {
        self.inner.state.lock().allocated
    }

    pub fn trigger_attr(&self) -> TriggerAttr {
        self.inner.state.lock().trigger
    }

    fn lock_open(&self, call: &'static str) -> Result<MutexGuard<'_, SimState>> {
        let state = self.inner.state.lock();
        if !state.initialized {
            return Err(err(ReturnCode::NotInit, call));
        }
        if !state.opened {
            return Err(err(ReturnCode::NotOpened, call));
        }
        Ok(state)
    }

    /// Wait on the condvar until `deadline`, returning early with an abort
    /// error if the wait is aborted or the capture is stopped.
    fn sleep_until(&self, state: &mut MutexGuard<'_, SimState>, deadline: Instant) -> Result<()> {
        loop {
            check_abort(state)?;
            if self.inner.cond.wait_until(state, deadline).timed_out() {
                return check_abort(state);
            }
        }
    }

    fn fill(state: &mut SimState, frame: &mut Frame) {
        let index = state.next_index;
        state.next_index = state.next_index.wrapping_add(1);
        frame.index = index;
        // horizontal 16-bit ramp offset by the frame index
        let row: Vec<u8> = (0..frame.width)
            .flat_map(|x| (x as u16).wrapping_add(index as u16).to_le_bytes())
            .collect();
        if !row.is_empty() {
            for chunk in frame.image_mut().chunks_mut(row.len()) {
                chunk.copy_from_slice(&row[..chunk.len()]);
            }
        }
        state.stats.frames += 1;
    }
}

fn check_abort(state: &mut SimState) -> Result<()> {
    if state.abort_pending {
        state.abort_pending = false;
        state.stats.aborts += 1;
        return Err(err(ReturnCode::Abort, "wait_for_frame"));
    }
    if state.capture.is_none() {
        return Err(err(ReturnCode::Abort, "wait_for_frame"));
    }
    Ok(())
}

impl Default for SimulatedSdk {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl TucamSdk for SimulatedSdk {
    fn api_init(&self) -> Result<u32> {
        let mut state = self.inner.state.lock();
        state.initialized = true;
        Ok(self.inner.config.camera_count)
    }

    fn api_uninit(&self) {
        let mut state = self.inner.state.lock();
        state.initialized = false;
        state.opened = false;
    }

    fn dev_open(&self, index: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.initialized {
            return Err(err(ReturnCode::NotInit, "dev_open"));
        }
        if index >= self.inner.config.camera_count {
            return Err(err(ReturnCode::NoCamera, "dev_open"));
        }
        if state.opened {
            return Err(err(ReturnCode::Busy, "dev_open"));
        }
        state.opened = true;
        Ok(())
    }

    fn dev_close(&self) {
        let mut state = self.inner.state.lock();
        state.opened = false;
        state.capture = None;
        self.inner.cond.notify_all();
    }

    fn dev_info(&self, id: InfoId) -> Result<InfoValue> {
        let _state = self.lock_open("dev_info")?;
        let config = &self.inner.config;
        Ok(match id {
            InfoId::CameraModel => InfoValue {
                text: config.model.clone(),
                value: 0,
            },
            InfoId::VersionApi => InfoValue {
                text: config.api_version.clone(),
                value: 0,
            },
            InfoId::VersionFirmware => InfoValue {
                text: format!("{:x}", config.firmware_version),
                value: config.firmware_version,
            },
        })
    }

    fn prop_attr(&self, id: PropId) -> Result<PropAttr> {
        let _state = self.lock_open("prop_attr")?;
        Ok(match id {
            PropId::ExposureTime => EXPOSURE_ATTR,
            PropId::Temperature => TEMPERATURE_ATTR,
            PropId::GlobalGain => GAIN_ATTR,
        })
    }

    fn prop_value(&self, id: PropId) -> Result<f64> {
        let state = self.lock_open("prop_value")?;
        Ok(match id {
            PropId::ExposureTime => state.exposure_ms,
            // the sensor is assumed to have settled on its set point
            PropId::Temperature => state.temperature_raw - TEMPERATURE_ATTR.max / 2.0,
            PropId::GlobalGain => state.gain,
        })
    }

    fn set_prop_value(&self, id: PropId, value: f64) -> Result<()> {
        let mut state = self.lock_open("set_prop_value")?;
        match id {
            PropId::ExposureTime => {
                check_range(&EXPOSURE_ATTR, value, "set_prop_value")?;
                state.exposure_ms = value;
            }
            PropId::Temperature => {
                check_range(&TEMPERATURE_ATTR, value, "set_prop_value")?;
                state.temperature_raw = value;
            }
            PropId::GlobalGain => {
                check_range(&GAIN_ATTR, value, "set_prop_value")?;
                state.gain = value.round();
            }
        }
        Ok(())
    }

    fn capa_value(&self, id: CapaId) -> Result<i32> {
        let state = self.lock_open("capa_value")?;
        Ok(match id {
            CapaId::FanGear => state.fan_gear,
            CapaId::Resolution => 0,
        })
    }

    fn set_capa_value(&self, id: CapaId, value: i32) -> Result<()> {
        let mut state = self.lock_open("set_capa_value")?;
        match id {
            CapaId::FanGear => {
                if !(0..=MAX_FAN_GEAR).contains(&value) {
                    return Err(err(ReturnCode::OutOfRange, "set_capa_value"));
                }
                state.fan_gear = value;
            }
            CapaId::Resolution => {
                if value != 0 {
                    return Err(err(ReturnCode::OutOfRange, "set_capa_value"));
                }
            }
        }
        Ok(())
    }

    fn buf_alloc(&self) -> Result<Frame> {
        let mut state = self.lock_open("buf_alloc")?;
        if state.fail_next_alloc {
            state.fail_next_alloc = false;
            return Err(err(ReturnCode::NoMemory, "buf_alloc"));
        }
        if state.allocated {
            return Err(err(ReturnCode::Busy, "buf_alloc"));
        }
        let (width, height) = if state.roi.enable {
            (state.roi.width, state.roi.height)
        } else {
            (self.inner.config.sensor_width, self.inner.config.sensor_height)
        };
        state.allocated = true;
        state.stats.buf_allocs += 1;
        Ok(Frame::new(width, height, 2, FRAME_HEADER_BYTES))
    }

    fn buf_release(&self) -> Result<()> {
        let mut state = self.lock_open("buf_release")?;
        if !state.allocated {
            return Err(err(ReturnCode::NotInit, "buf_release"));
        }
        state.allocated = false;
        state.stats.buf_releases += 1;
        Ok(())
    }

    fn cap_trigger(&self) -> Result<TriggerAttr> {
        let state = self.lock_open("cap_trigger")?;
        Ok(state.trigger)
    }

    fn set_cap_trigger(&self, attr: &TriggerAttr) -> Result<()> {
        let mut state = self.lock_open("set_cap_trigger")?;
        if state.capture.is_some() {
            return Err(err(ReturnCode::Busy, "set_cap_trigger"));
        }
        state.trigger = *attr;
        Ok(())
    }

    fn cap_start(&self, mode: CaptureMode) -> Result<()> {
        let mut state = self.lock_open("cap_start")?;
        if state.capture.is_some() {
            return Err(err(ReturnCode::Busy, "cap_start"));
        }
        state.capture = Some(mode);
        state.pending_triggers = 0;
        state.abort_pending = false;
        state.stats.cap_starts += 1;
        Ok(())
    }

    fn cap_stop(&self) -> Result<()> {
        let mut state = self.lock_open("cap_stop")?;
        state.capture = None;
        state.pending_triggers = 0;
        state.abort_pending = false;
        state.stats.cap_stops += 1;
        self.inner.cond.notify_all();
        Ok(())
    }

    fn wait_for_frame(&self, frame: &mut Frame) -> Result<()> {
        let mut state = self.lock_open("wait_for_frame")?;
        if !state.allocated {
            return Err(err(ReturnCode::NotInit, "wait_for_frame"));
        }
        let mode = match state.capture {
            Some(mode) => mode,
            None => return Err(err(ReturnCode::NotInit, "wait_for_frame")),
        };
        check_abort(&mut state)?;
        if state.fail_next_waits > 0 {
            state.fail_next_waits -= 1;
            return Err(err(ReturnCode::Timeout, "wait_for_frame"));
        }

        match mode {
            CaptureMode::TriggerSoftware => loop {
                check_abort(&mut state)?;
                if state.pending_triggers > 0 {
                    state.pending_triggers -= 1;
                    break;
                }
                self.inner.cond.wait(&mut state);
            },
            CaptureMode::Sequence => {}
            _ => {
                let deadline = Instant::now() + self.inner.config.external_trigger_period;
                self.sleep_until(&mut state, deadline)?;
            }
        }

        let exposure = Duration::from_secs_f64(state.exposure_ms.max(0.0) / 1000.0);
        let deadline = Instant::now() + exposure;
        self.sleep_until(&mut state, deadline)?;

        Self::fill(&mut state, frame);
        Ok(())
    }

    fn abort_wait(&self) -> Result<()> {
        let mut state = self.lock_open("abort_wait")?;
        state.abort_pending = true;
        self.inner.cond.notify_all();
        Ok(())
    }

    fn do_software_trigger(&self) -> Result<()> {
        let mut state = self.lock_open("do_software_trigger")?;
        if state.capture != Some(CaptureMode::TriggerSoftware) {
            return Err(err(ReturnCode::NotSupported, "do_software_trigger"));
        }
        state.pending_triggers += 1;
        state.stats.software_triggers += 1;
        self.inner.cond.notify_all();
        Ok(())
    }

    fn roi(&self) -> Result<RoiAttr> {
        let state = self.lock_open("roi")?;
        Ok(state.roi)
    }

    fn set_roi(&self, attr: &RoiAttr) -> Result<()> {
        let mut state = self.lock_open("set_roi")?;
        if state.capture.is_some() {
            return Err(err(ReturnCode::Busy, "set_roi"));
        }
        if attr.enable {
            let config = &self.inner.config;
            if attr.width == 0 || attr.height == 0 {
                return Err(err(ReturnCode::InvalidParam, "set_roi"));
            }
            if attr.h_offset as u64 + attr.width as u64 > config.sensor_width as u64
                || attr.v_offset as u64 + attr.height as u64 > config.sensor_height as u64
            {
                return Err(err(ReturnCode::OutOfRange, "set_roi"));
            }
            state.roi = *attr;
        } else {
            state.roi = RoiAttr {
                enable: false,
                h_offset: 0,
                v_offset: 0,
                width: self.inner.config.sensor_width,
                height: self.inner.config.sensor_height,
            };
        }
        Ok(())
    }

    fn trigger_out(&self, port: u32) -> Result<TriggerOutAttr> {
        let state = self.lock_open("trigger_out")?;
        state
            .trigger_out
            .get(port as usize)
            .copied()
            .ok_or_else(|| err(ReturnCode::InvalidParam, "trigger_out"))
    }

    fn set_trigger_out(&self, attr: &TriggerOutAttr) -> Result<()> {
        let mut state = self.lock_open("set_trigger_out")?;
        let slot = state
            .trigger_out
            .get_mut(attr.port as usize)
            .ok_or_else(|| err(ReturnCode::InvalidParam, "set_trigger_out"))?;
        let mut new = *attr;
        // unspecified timings keep the current value
        new.delay = attr.delay.or(slot.delay);
        new.width = attr.width.or(slot.width);
        *slot = new;
        Ok(())
    }
}
