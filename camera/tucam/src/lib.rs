//! Interface to the Tucsen TUCAM camera SDK.
//!
//! The SDK is a blocking, synchronous C API addressed through a device
//! handle. [TucamSdk] describes the subset of that API used by camera
//! plugins. A binding to the vendor library implements it; [sim::SimulatedSdk]
//! implements it in-process for tests and demonstrations.
//!
//! [Device] owns an opened camera: it initializes the API and opens the
//! device on construction and closes both when dropped.

pub mod sim;

use tracing::debug;

// ---------------------------
// errors

/// Return codes of the TUCAM API other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Failure,
    NoMemory,
    NoResource,
    NoModule,
    NoDriver,
    NoCamera,
    NotInit,
    NotOpened,
    InvalidParam,
    InvalidIdProp,
    InvalidIdCapa,
    InvalidIdInfo,
    OutOfRange,
    NotSupported,
    Busy,
    Timeout,
    Abort,
    DriverFailure,
}

impl ReturnCode {
    pub fn as_str(&self) -> &'static str {
        use ReturnCode::*;
        match self {
            Failure => "TUCAMRET_FAILURE",
            NoMemory => "TUCAMRET_NO_MEMORY",
            NoResource => "TUCAMRET_NO_RESOURCE",
            NoModule => "TUCAMRET_NO_MODULE",
            NoDriver => "TUCAMRET_NO_DRIVER",
            NoCamera => "TUCAMRET_NO_CAMERA",
            NotInit => "TUCAMRET_NOT_INIT",
            NotOpened => "TUCAMRET_NOT_OPENED",
            InvalidParam => "TUCAMRET_INVALID_PARAM",
            InvalidIdProp => "TUCAMRET_INVALID_IDPROP",
            InvalidIdCapa => "TUCAMRET_INVALID_IDCAPA",
            InvalidIdInfo => "TUCAMRET_INVALID_IDINFO",
            OutOfRange => "TUCAMRET_OUT_OF_RANGE",
            NotSupported => "TUCAMRET_NOT_SUPPORT",
            Busy => "TUCAMRET_BUSY",
            Timeout => "TUCAMRET_TIMEOUT",
            Abort => "TUCAMRET_ABORT",
            DriverFailure => "TUCAMRET_FAILURE_DRIVER",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("TUCAM error: {} in {call}", .code.as_str())]
pub struct TucamError {
    pub code: ReturnCode,
    pub call: &'static str,
}

impl TucamError {
    pub fn new(code: ReturnCode, call: &'static str) -> Self {
        Self { code, call }
    }

    /// True if a blocking wait returned because of [TucamSdk::abort_wait].
    pub fn is_abort(&self) -> bool {
        self.code == ReturnCode::Abort
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Tucam {
        #[from]
        source: TucamError,
    },
    #[error("no camera found")]
    NoCamera,
    #[error("camera index {index} not available ({count} cameras found)")]
    NoSuchCamera { index: u32, count: u32 },
}

impl Error {
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Tucam { source } if source.is_abort())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! tucam_call {
    ($expr: expr) => {{
        debug!("calling: {} {}:{}", stringify!($expr), file!(), line!());
        let result = $expr;
        if let Err(e) = &result {
            debug!("  error: {}", e);
        }
        result
    }};
}

// ---------------------------
// identifiers

/// Floating point properties (`TUIDP_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropId {
    /// Exposure time in milliseconds.
    ExposureTime,
    /// Sensor temperature set point, in the raw units of the camera.
    Temperature,
    GlobalGain,
}

/// Integer capabilities (`TUIDC_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapaId {
    FanGear,
    Resolution,
}

/// Device information entries (`TUIDI_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoId {
    CameraModel,
    VersionApi,
    VersionFirmware,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoValue {
    pub text: String,
    pub value: i32,
}

/// Range and default of a property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropAttr {
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub step: f64,
}

/// Capture mode passed to [TucamSdk::cap_start] (`TUCCM_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Free running.
    Sequence,
    TriggerStandard,
    TriggerSynchronous,
    TriggerGlobal,
    TriggerSoftware,
}

/// How the exposure length is determined in trigger modes (`TUCTE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerExposure {
    /// The exposure time property.
    ExposureTime,
    /// The width of the trigger pulse.
    Width,
}

/// Active edge of the trigger input (`TUCTD_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerAttr {
    pub mode: CaptureMode,
    pub exposure: TriggerExposure,
    pub edge: TriggerEdge,
    /// Number of frames per trigger.
    pub frames: u32,
    /// Delay in microseconds.
    pub delay: u32,
}

impl Default for TriggerAttr {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Sequence,
            exposure: TriggerExposure::ExposureTime,
            edge: TriggerEdge::Rising,
            frames: 1,
            delay: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiAttr {
    pub enable: bool,
    pub h_offset: u32,
    pub v_offset: u32,
    pub width: u32,
    pub height: u32,
}

/// Signal routed to an output trigger port (`TUOPT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    /// Copy of the trigger input.
    TrigIn,
    /// Exposure start (rolling shutter).
    ExposureStart,
    /// Global exposure.
    GlobalExposure,
    ReadEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEdge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutAttr {
    pub port: u32,
    pub signal: OutputSignal,
    pub edge: SignalEdge,
    /// Delay in microseconds, `None` keeps the camera default.
    pub delay: Option<u32>,
    /// Pulse width in microseconds, `None` keeps the camera default.
    pub width: Option<u32>,
}

// ---------------------------
// frame

/// Frame descriptor filled by [TucamSdk::wait_for_frame].
///
/// Allocated with [TucamSdk::buf_alloc] for the ROI current at that time.
#[derive(Debug, Clone)]
pub struct Frame {
    buffer: Vec<u8>,
    /// Offset of the image data in `buffer` (after the frame header).
    pub offset: usize,
    /// Size of the image data in bytes.
    pub img_size: usize,
    pub width: u32,
    pub height: u32,
    pub elem_bytes: u32,
    /// Frame index assigned by the camera.
    pub index: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, elem_bytes: u32, header: usize) -> Self {
        let img_size = width as usize * height as usize * elem_bytes as usize;
        Self {
            buffer: vec![0u8; header + img_size],
            offset: header,
            img_size,
            width,
            height,
            elem_bytes,
            index: 0,
        }
    }

    /// The image data.
    pub fn image(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.img_size]
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        let range = self.offset..self.offset + self.img_size;
        &mut self.buffer[range]
    }
}

// ---------------------------
// SDK

/// The TUCAM API for one camera.
///
/// All calls block until the camera answers. Implementations synchronize
/// internally, so calls take `&self`; in particular [TucamSdk::abort_wait]
/// must be callable while another thread is blocked in
/// [TucamSdk::wait_for_frame].
pub trait TucamSdk: Send + Sync {
    /// Initialize the API, returning the number of cameras found.
    fn api_init(&self) -> Result<u32>;
    fn api_uninit(&self);
    fn dev_open(&self, index: u32) -> Result<()>;
    fn dev_close(&self);

    fn dev_info(&self, id: InfoId) -> Result<InfoValue>;

    fn prop_attr(&self, id: PropId) -> Result<PropAttr>;
    fn prop_value(&self, id: PropId) -> Result<f64>;
    fn set_prop_value(&self, id: PropId, value: f64) -> Result<()>;

    fn capa_value(&self, id: CapaId) -> Result<i32>;
    fn set_capa_value(&self, id: CapaId, value: i32) -> Result<()>;

    /// Allocate the frame buffer for the current ROI.
    fn buf_alloc(&self) -> Result<Frame>;
    fn buf_release(&self) -> Result<()>;

    fn cap_trigger(&self) -> Result<TriggerAttr>;
    fn set_cap_trigger(&self, attr: &TriggerAttr) -> Result<()>;
    fn cap_start(&self, mode: CaptureMode) -> Result<()>;
    fn cap_stop(&self) -> Result<()>;

    /// Block until the next frame is captured into `frame`.
    fn wait_for_frame(&self, frame: &mut Frame) -> Result<()>;
    /// Make a pending or the next [TucamSdk::wait_for_frame] return with
    /// [ReturnCode::Abort].
    fn abort_wait(&self) -> Result<()>;
    fn do_software_trigger(&self) -> Result<()>;

    fn roi(&self) -> Result<RoiAttr>;
    fn set_roi(&self, attr: &RoiAttr) -> Result<()>;

    fn trigger_out(&self, port: u32) -> Result<TriggerOutAttr>;
    fn set_trigger_out(&self, attr: &TriggerOutAttr) -> Result<()>;
}

/// An opened camera.
pub struct Device<S: TucamSdk> {
    sdk: S,
    index: u32,
}

fn _test_device_is_send() {
    // Compile-time test to ensure Device implements Send and Sync.
    fn implements<T: Send + Sync>() {}
    implements::<Device<sim::SimulatedSdk>>();
}

impl<S: TucamSdk> Device<S> {
    /// Initialize the API and open camera `index`.
    pub fn open(sdk: S, index: u32) -> Result<Self> {
        let count = tucam_call!(sdk.api_init())?;
        if count == 0 {
            sdk.api_uninit();
            return Err(Error::NoCamera);
        }
        if index >= count {
            sdk.api_uninit();
            return Err(Error::NoSuchCamera { index, count });
        }
        if let Err(e) = tucam_call!(sdk.dev_open(index)) {
            sdk.api_uninit();
            return Err(e);
        }
        debug!("opened TUCAM camera {index} of {count}");
        Ok(Self { sdk, index })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn dev_info(&self, id: InfoId) -> Result<InfoValue> {
        tucam_call!(self.sdk.dev_info(id))
    }
    pub fn prop_attr(&self, id: PropId) -> Result<PropAttr> {
        tucam_call!(self.sdk.prop_attr(id))
    }
    pub fn prop_value(&self, id: PropId) -> Result<f64> {
        tucam_call!(self.sdk.prop_value(id))
    }
    pub fn set_prop_value(&self, id: PropId, value: f64) -> Result<()> {
        tucam_call!(self.sdk.set_prop_value(id, value))
    }
    pub fn capa_value(&self, id: CapaId) -> Result<i32> {
        tucam_call!(self.sdk.capa_value(id))
    }
    pub fn set_capa_value(&self, id: CapaId, value: i32) -> Result<()> {
        tucam_call!(self.sdk.set_capa_value(id, value))
    }
    pub fn buf_alloc(&self) -> Result<Frame> {
        tucam_call!(self.sdk.buf_alloc())
    }
    pub fn buf_release(&self) -> Result<()> {
        tucam_call!(self.sdk.buf_release())
    }
    pub fn cap_trigger(&self) -> Result<TriggerAttr> {
        tucam_call!(self.sdk.cap_trigger())
    }
    pub fn set_cap_trigger(&self, attr: &TriggerAttr) -> Result<()> {
        tucam_call!(self.sdk.set_cap_trigger(attr))
    }
    pub fn cap_start(&self, mode: CaptureMode) -> Result<()> {
        tucam_call!(self.sdk.cap_start(mode))
    }
    pub fn cap_stop(&self) -> Result<()> {
        tucam_call!(self.sdk.cap_stop())
    }
    /// Not traced: called once per frame.
    pub fn wait_for_frame(&self, frame: &mut Frame) -> Result<()> {
        self.sdk.wait_for_frame(frame)
    }
    pub fn abort_wait(&self) -> Result<()> {
        tucam_call!(self.sdk.abort_wait())
    }
    /// Not traced: called once per frame.
    pub fn do_software_trigger(&self) -> Result<()> {
        self.sdk.do_software_trigger()
    }
    pub fn roi(&self) -> Result<RoiAttr> {
        tucam_call!(self.sdk.roi())
    }
    pub fn set_roi(&self, attr: &RoiAttr) -> Result<()> {
        tucam_call!(self.sdk.set_roi(attr))
    }
    pub fn trigger_out(&self, port: u32) -> Result<TriggerOutAttr> {
        tucam_call!(self.sdk.trigger_out(port))
    }
    pub fn set_trigger_out(&self, attr: &TriggerOutAttr) -> Result<()> {
        tucam_call!(self.sdk.set_trigger_out(attr))
    }
}

impl<S: TucamSdk> Drop for Device<S> {
    fn drop(&mut self) {
        debug!("closing TUCAM camera {}", self.index);
        self.sdk.dev_close();
        self.sdk.api_uninit();
    }
}
