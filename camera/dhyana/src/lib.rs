//! Camera plugin for Tucsen Dhyana scientific cameras.
//!
//! [Camera] owns an opened TUCAM device and exposes its properties. Frames
//! are acquired by an [AcquisitionController], which runs one long-lived
//! worker thread that blocks in the SDK frame wait and copies each frame
//! into the host's [hwif::BufferCtrl]. [Interface] implements the host
//! contract [hwif::HwInterface] on top of a [Camera].
//!
//! ```no_run
//! use dhyana::{Camera, DhyanaConfig, Interface};
//! use hwif::{BufferCtrl, HwInterface};
//!
//! # fn main() -> anyhow::Result<()> {
//! let sdk = tucam::sim::SimulatedSdk::default();
//! let camera = Camera::new(sdk, BufferCtrl::default(), DhyanaConfig::default())?;
//! let interface = Interface::new(camera);
//! interface.prepare_acq()?;
//! interface.start_acq()?;
//! # Ok(())
//! # }
//! ```

use hwif::Size;

mod acquisition;
mod camera;
mod config;
mod interface;
mod status;
mod trigger_timer;

pub use acquisition::{AcqParams, AcquisitionController, Timings};
pub use camera::Camera;
pub use config::{DhyanaConfig, ExtTriggerMode, GlobalGain, RoiConstraint, TriggerEdgeSetting};
pub use interface::{BinCtrlObj, DetInfoCtrlObj, Interface, RoiCtrlObj, SyncCtrlObj};
pub use status::Status;

/// Reported by [hwif::DetInfoCtrl::detector_type].
pub const DETECTOR_TYPE: &str = "Tucsen - Dhyana";

/// Sensor size in pixels.
pub const DETECTOR_SIZE: Size = Size::new(2048, 2048);

/// Pixel pitch in meters, identical in x and y.
pub const PIXEL_SIZE: f64 = 11.0e-6;

/// Longest accepted exposure and latency time, in seconds.
pub const MAX_EXP_TIME: f64 = 10.0;
pub const MAX_LAT_TIME: f64 = 10.0;

/// Number of output trigger ports on the camera.
pub const NUM_OUTPUT_PORTS: u32 = 3;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Tucam {
        #[from]
        source: tucam::Error,
    },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("acquisition already running")]
    AlreadyRunning,
    #[error("acquisition not prepared")]
    NotPrepared,
    #[error("camera busy: {0}")]
    Busy(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("acquisition thread error: {0}")]
    Thread(String),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl From<tucam::TucamError> for Error {
    fn from(orig: tucam::TucamError) -> Self {
        Error::Tucam {
            source: orig.into(),
        }
    }
}

impl From<Error> for hwif::Error {
    fn from(orig: Error) -> Self {
        match orig {
            Error::InvalidValue(msg) | Error::Config(msg) => hwif::Error::InvalidValue(msg),
            Error::NotSupported(msg) => hwif::Error::NotSupported(msg),
            Error::TomlDe { source } => hwif::Error::InvalidValue(source.to_string()),
            e => hwif::Error::HardwareError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
