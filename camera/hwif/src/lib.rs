//! Contract between an image acquisition host and a camera plugin.
//!
//! A plugin exposes a set of capabilities ([Capability]) through
//! [HwInterface]: detector information, synchronization, buffer control,
//! region of interest and binning. The host drives acquisition through the
//! lifecycle calls on [HwInterface] and receives frames through the
//! [BufferCtrl] frame buffer manager, which it owns.

use serde::{Deserialize, Serialize};

mod buffer;
pub use buffer::{BufferCtrl, FrameCallback, FrameInfo};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("hardware error: {0}")]
    HardwareError(String),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::HardwareError(orig.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::HardwareError(msg)
    }
}

// ---------------------------
// geometry

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Rectangular sub-region of the sensor.
///
/// A region with an empty size is *inactive*, which means "full frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub top_left: Point,
    pub size: Size,
}

impl Roi {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            top_left: Point { x, y },
            size: Size { width, height },
        }
    }

    /// The inactive region, interpreted as full frame.
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn full_frame(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn is_active(&self) -> bool {
        !self.size.is_empty()
    }

    /// The first column and row past the region.
    pub fn bottom_right(&self) -> (u64, u64) {
        (
            self.top_left.x as u64 + self.size.width as u64,
            self.top_left.y as u64 + self.size.height as u64,
        )
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{},{}>-{}", self.top_left.x, self.top_left.y, self.size)
    }
}

/// Binning factors. Only the horizontal and vertical multipliers are known
/// to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    pub x: u32,
    pub y: u32,
}

impl Bin {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
    pub const fn identity() -> Self {
        Self { x: 1, y: 1 }
    }
    pub fn is_identity(&self) -> bool {
        self.x == 1 && self.y == 1
    }
}

impl Default for Bin {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Display for Bin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

// ---------------------------
// image format

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    Bpp8,
    Bpp12,
    Bpp16,
    Bpp32,
}

impl ImageType {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            ImageType::Bpp8 => 1,
            ImageType::Bpp12 | ImageType::Bpp16 => 2,
            ImageType::Bpp32 => 4,
        }
    }
}

// use Debug to impl Display
impl std::fmt::Display for ImageType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

/// Dimensions of one frame in the host buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDim {
    pub size: Size,
    pub image_type: ImageType,
}

impl FrameDim {
    pub fn new(size: Size, image_type: ImageType) -> Self {
        Self { size, image_type }
    }

    /// Number of bytes needed to store one frame.
    pub fn mem_size(&self) -> usize {
        self.size.width as usize * self.size.height as usize * self.image_type.bytes_per_pixel()
    }
}

// ---------------------------
// synchronization

/// How exposures are initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrigMode {
    /// Software started, the detector paces the frames.
    IntTrig,
    /// One software trigger per frame.
    IntTrigMult,
    /// One external trigger starts the whole sequence.
    ExtTrigSingle,
    /// One external trigger per frame.
    ExtTrigMult,
    /// Exposure lasts as long as the external gate signal.
    ExtGate,
    /// External trigger ends the exposure and starts readout.
    ExtTrigReadout,
}

impl TrigMode {
    pub fn variants() -> &'static [Self] {
        &[
            TrigMode::IntTrig,
            TrigMode::IntTrigMult,
            TrigMode::ExtTrigSingle,
            TrigMode::ExtTrigMult,
            TrigMode::ExtGate,
            TrigMode::ExtTrigReadout,
        ]
    }
}

// use Debug to impl Display
impl std::fmt::Display for TrigMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

/// Valid exposure and latency time ranges, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRanges {
    pub min_exp_time: f64,
    pub max_exp_time: f64,
    pub min_lat_time: f64,
    pub max_lat_time: f64,
}

/// Detector status as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwStatus {
    Ready,
    Exposure,
    Readout,
    Latency,
    Fault,
}

// use Debug to impl Display
impl std::fmt::Display for HwStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    SoftReset,
    HardReset,
}

// ---------------------------
// control objects

pub trait DetInfoCtrl: Send + Sync {
    fn max_image_size(&self) -> Size;
    fn detector_image_size(&self) -> Size;
    fn def_image_type(&self) -> ImageType;
    fn cur_image_type(&self) -> Result<ImageType>;
    fn set_cur_image_type(&self, image_type: ImageType) -> Result<()>;
    /// Pixel size in meters (x, y).
    fn pixel_size(&self) -> (f64, f64);
    fn detector_type(&self) -> String;
    fn detector_model(&self) -> Result<String>;
}

pub trait SyncCtrl: Send + Sync {
    fn check_trig_mode(&self, mode: TrigMode) -> bool;
    fn set_trig_mode(&self, mode: TrigMode) -> Result<()>;
    fn trig_mode(&self) -> TrigMode;

    /// value given in seconds
    fn set_exp_time(&self, exp_time: f64) -> Result<()>;
    /// value given in seconds
    fn exp_time(&self) -> Result<f64>;

    /// value given in seconds
    fn set_lat_time(&self, lat_time: f64) -> Result<()>;
    /// value given in seconds
    fn lat_time(&self) -> f64;

    /// Number of frames to acquire, 0 meaning "until stopped".
    fn set_nb_hw_frames(&self, nb_frames: i64) -> Result<()>;
    fn nb_hw_frames(&self) -> u64;

    fn valid_ranges(&self) -> ValidRanges;
}

pub trait RoiCtrl: Send + Sync {
    /// Return the region the hardware would actually use for `set_roi`.
    fn check_roi(&self, set_roi: &Roi) -> Result<Roi>;
    fn set_roi(&self, set_roi: &Roi) -> Result<()>;
    fn roi(&self) -> Result<Roi>;
}

pub trait BinCtrl: Send + Sync {
    /// Return the binning the hardware would actually use for `bin`.
    fn check_bin(&self, bin: &Bin) -> Result<Bin>;
    fn set_bin(&self, bin: &Bin) -> Result<()>;
    fn bin(&self) -> Bin;
}

/// One entry of the capability list returned by [HwInterface::cap_list].
#[derive(Clone, Copy)]
pub enum Capability<'a> {
    DetInfo(&'a dyn DetInfoCtrl),
    Sync(&'a dyn SyncCtrl),
    Buffer(&'a BufferCtrl),
    Roi(&'a dyn RoiCtrl),
    Bin(&'a dyn BinCtrl),
}

impl<'a> Capability<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::DetInfo(_) => "DetInfo",
            Capability::Sync(_) => "Sync",
            Capability::Buffer(_) => "Buffer",
            Capability::Roi(_) => "Roi",
            Capability::Bin(_) => "Bin",
        }
    }
}

impl<'a> std::fmt::Debug for Capability<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capability::{}", self.name())
    }
}

/// The device-control contract a camera plugin implements for the host.
pub trait HwInterface: Send + Sync {
    fn cap_list(&self) -> Vec<Capability<'_>>;

    fn reset(&self, reset_level: ResetLevel) -> Result<()>;
    fn prepare_acq(&self) -> Result<()>;
    fn start_acq(&self) -> Result<()>;
    fn stop_acq(&self) -> Result<()>;

    fn status(&self) -> HwStatus;
    fn nb_hw_acquired_frames(&self) -> usize;

    fn det_info(&self) -> Option<&dyn DetInfoCtrl> {
        self.cap_list().into_iter().find_map(|c| match c {
            Capability::DetInfo(x) => Some(x),
            _ => None,
        })
    }
    fn sync(&self) -> Option<&dyn SyncCtrl> {
        self.cap_list().into_iter().find_map(|c| match c {
            Capability::Sync(x) => Some(x),
            _ => None,
        })
    }
    fn buffer(&self) -> Option<&BufferCtrl> {
        self.cap_list().into_iter().find_map(|c| match c {
            Capability::Buffer(x) => Some(x),
            _ => None,
        })
    }
    fn roi_ctrl(&self) -> Option<&dyn RoiCtrl> {
        self.cap_list().into_iter().find_map(|c| match c {
            Capability::Roi(x) => Some(x),
            _ => None,
        })
    }
    fn bin_ctrl(&self) -> Option<&dyn BinCtrl> {
        self.cap_list().into_iter().find_map(|c| match c {
            Capability::Bin(x) => Some(x),
            _ => None,
        })
    }
}
