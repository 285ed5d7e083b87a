use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use hwif::{Bin, BufferCtrl, ImageType, Roi, Size, TrigMode, ValidRanges};
use tucam::{
    CapaId, Device, InfoId, OutputSignal, PropId, RoiAttr, SignalEdge, TriggerOutAttr, TucamSdk,
};

use crate::acquisition::{AcqParams, AcquisitionController, Timings};
use crate::config::{DhyanaConfig, ExtTriggerMode, GlobalGain, RoiConstraint, TriggerEdgeSetting};
use crate::status::Status;
use crate::{
    Error, Result, DETECTOR_SIZE, DETECTOR_TYPE, MAX_EXP_TIME, MAX_LAT_TIME, NUM_OUTPUT_PORTS,
    PIXEL_SIZE,
};

/// An opened Dhyana camera.
pub struct Camera<S: TucamSdk + 'static> {
    device: Arc<Device<S>>,
    acq: AcquisitionController<S>,
    roi_constraint: Option<RoiConstraint>,
    temperature_target: Mutex<Option<f64>>,
}

fn _test_camera_is_send() {
    // Compile-time test to ensure Camera implements Send and Sync.
    fn implements<T: Send + Sync>() {}
    implements::<Camera<tucam::sim::SimulatedSdk>>();
}

impl<S: TucamSdk + 'static> Camera<S> {
    /// Open the camera selected by `config` and apply its settings.
    ///
    /// Frames will be delivered into `buffer`.
    pub fn new(sdk: S, buffer: BufferCtrl, config: DhyanaConfig) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(Device::open(sdk, config.camera_index)?);
        let model = device.dev_info(InfoId::CameraModel)?.text;
        info!("opened camera {}: {model}", config.camera_index);

        let params = AcqParams {
            exp_time: device.prop_value(PropId::ExposureTime)? / 1000.0,
            ext_trigger: config.trigger_mode,
            trigger_edge: config.trigger_edge,
            ..Default::default()
        };
        let acq = AcquisitionController::new(
            device.clone(),
            buffer,
            params,
            Timings::from(&config),
        )?;

        let camera = Self {
            device,
            acq,
            roi_constraint: config.roi_constraint,
            temperature_target: Mutex::new(None),
        };
        if let Some(temp) = config.temperature_target {
            camera.set_temperature_target(temp)?;
        }
        if let Some(speed) = config.fan_speed {
            camera.set_fan_speed(speed)?;
        }
        if let Some(gain) = config.global_gain {
            camera.set_global_gain(gain)?;
        }
        Ok(camera)
    }

    pub fn acquisition(&self) -> &AcquisitionController<S> {
        &self.acq
    }

    pub fn device(&self) -> &Device<S> {
        &self.device
    }

    pub fn buffer(&self) -> &BufferCtrl {
        self.acq.buffer()
    }

    pub fn prepare_acq(&self) -> Result<()> {
        self.acq.prepare()
    }

    pub fn start_acq(&self) -> Result<()> {
        self.acq.start()
    }

    pub fn stop_acq(&self) -> Result<()> {
        self.acq.stop()
    }

    pub fn reset(&self) -> Result<()> {
        self.acq.reset()
    }

    pub fn status(&self) -> Status {
        self.acq.status()
    }

    pub fn nb_hw_acquired_frames(&self) -> usize {
        self.acq.acquired_frame_count()
    }

    // ---------------------------
    // detector info

    pub fn detector_type(&self) -> &'static str {
        DETECTOR_TYPE
    }

    pub fn detector_model(&self) -> Result<String> {
        Ok(self.device.dev_info(InfoId::CameraModel)?.text)
    }

    pub fn detector_image_size(&self) -> Size {
        DETECTOR_SIZE
    }

    /// Pixel size in meters.
    pub fn pixel_size(&self) -> (f64, f64) {
        (PIXEL_SIZE, PIXEL_SIZE)
    }

    pub fn image_type(&self) -> ImageType {
        ImageType::Bpp16
    }

    pub fn set_image_type(&self, image_type: ImageType) -> Result<()> {
        match image_type {
            ImageType::Bpp16 => Ok(()),
            other => Err(Error::NotSupported(format!("image type {other}"))),
        }
    }

    // ---------------------------
    // synchronization

    pub fn check_trig_mode(&self, mode: TrigMode) -> bool {
        matches!(
            mode,
            TrigMode::IntTrig | TrigMode::ExtTrigMult | TrigMode::ExtGate
        )
    }

    /// Takes effect at the next prepare.
    pub fn set_trig_mode(&self, mode: TrigMode) -> Result<()> {
        if !self.check_trig_mode(mode) {
            return Err(Error::InvalidValue(format!("trigger mode {mode}")));
        }
        self.acq.update_params(|p| p.trig_mode = mode);
        Ok(())
    }

    pub fn trig_mode(&self) -> TrigMode {
        self.acq.params().trig_mode
    }

    /// Set the exposure time in seconds.
    pub fn set_exp_time(&self, exp_time: f64) -> Result<()> {
        if !(0.0..=MAX_EXP_TIME).contains(&exp_time) {
            return Err(Error::InvalidValue(format!(
                "exposure time {exp_time} s outside [0, {MAX_EXP_TIME}]"
            )));
        }
        self.device
            .set_prop_value(PropId::ExposureTime, exp_time * 1000.0)?;
        self.acq.update_params(|p| p.exp_time = exp_time);
        Ok(())
    }

    /// The exposure time in seconds, read from the camera.
    pub fn exp_time(&self) -> Result<f64> {
        Ok(self.device.prop_value(PropId::ExposureTime)? / 1000.0)
    }

    pub fn set_lat_time(&self, lat_time: f64) -> Result<()> {
        if !(0.0..=MAX_LAT_TIME).contains(&lat_time) {
            return Err(Error::InvalidValue(format!(
                "latency time {lat_time} s outside [0, {MAX_LAT_TIME}]"
            )));
        }
        self.acq.update_params(|p| p.lat_time = lat_time);
        Ok(())
    }

    pub fn lat_time(&self) -> f64 {
        self.acq.params().lat_time
    }

    /// Number of frames of the next acquisition, 0 for continuous.
    pub fn set_nb_frames(&self, nb_frames: i64) -> Result<()> {
        let nb_frames = u64::try_from(nb_frames)
            .map_err(|_| Error::InvalidValue(format!("number of frames {nb_frames}")))?;
        self.acq.update_params(|p| p.nb_frames = nb_frames);
        Ok(())
    }

    pub fn nb_frames(&self) -> u64 {
        self.acq.params().nb_frames
    }

    pub fn valid_ranges(&self) -> ValidRanges {
        ValidRanges {
            min_exp_time: 0.0,
            max_exp_time: MAX_EXP_TIME,
            min_lat_time: 0.0,
            max_lat_time: MAX_LAT_TIME,
        }
    }

    /// Hardware scheme used by the external trigger modes.
    pub fn set_ext_trigger_mode(&self, mode: ExtTriggerMode) {
        self.acq.update_params(|p| p.ext_trigger = mode);
    }

    pub fn ext_trigger_mode(&self) -> ExtTriggerMode {
        self.acq.params().ext_trigger
    }

    pub fn set_trigger_edge(&self, edge: TriggerEdgeSetting) {
        self.acq.update_params(|p| p.trigger_edge = edge);
    }

    pub fn trigger_edge(&self) -> TriggerEdgeSetting {
        self.acq.params().trigger_edge
    }

    // ---------------------------
    // region of interest

    /// The region the camera would use for `roi`.
    pub fn check_roi(&self, roi: &Roi) -> Result<Roi> {
        if !roi.is_active() {
            return Ok(Roi::full_frame(DETECTOR_SIZE));
        }
        let (right, bottom) = roi.bottom_right();
        if right > DETECTOR_SIZE.width as u64 || bottom > DETECTOR_SIZE.height as u64 {
            return Err(Error::InvalidValue(format!(
                "ROI {roi} outside of the {DETECTOR_SIZE} detector"
            )));
        }
        Ok(match &self.roi_constraint {
            Some(c) => c.apply(roi, DETECTOR_SIZE),
            None => *roi,
        })
    }

    /// Program the ROI. A prepared frame buffer is released so that the next
    /// prepare allocates one of the new size.
    pub fn set_roi(&self, roi: &Roi) -> Result<()> {
        let roi = self.check_roi(roi)?;
        self.acq.release_buffer()?;
        let attr = if roi == Roi::full_frame(DETECTOR_SIZE) {
            RoiAttr {
                enable: false,
                h_offset: 0,
                v_offset: 0,
                width: DETECTOR_SIZE.width,
                height: DETECTOR_SIZE.height,
            }
        } else {
            RoiAttr {
                enable: true,
                h_offset: roi.top_left.x,
                v_offset: roi.top_left.y,
                width: roi.size.width,
                height: roi.size.height,
            }
        };
        debug!("set ROI {roi}");
        self.device.set_roi(&attr)?;
        Ok(())
    }

    pub fn roi(&self) -> Result<Roi> {
        let attr = self.device.roi()?;
        Ok(if attr.enable {
            Roi::new(attr.h_offset, attr.v_offset, attr.width, attr.height)
        } else {
            Roi::full_frame(DETECTOR_SIZE)
        })
    }

    // ---------------------------
    // binning

    pub fn check_bin(&self, bin: &Bin) -> Result<Bin> {
        if !bin.is_identity() {
            return Err(Error::NotSupported(format!("binning {bin}")));
        }
        Ok(*bin)
    }

    pub fn set_bin(&self, bin: &Bin) -> Result<()> {
        self.check_bin(bin)?;
        Ok(())
    }

    pub fn bin(&self) -> Bin {
        Bin::identity()
    }

    // ---------------------------
    // cooling, gain and versions

    /// Set the sensor temperature target in degrees C.
    ///
    /// The camera property is offset so that the middle of its range is 0.
    pub fn set_temperature_target(&self, temp: f64) -> Result<()> {
        let attr = self.device.prop_attr(PropId::Temperature)?;
        let middle = (attr.max / 2.0).trunc();
        let raw = temp + middle;
        if raw < attr.min || raw > attr.max || raw.is_nan() {
            return Err(Error::InvalidValue(format!(
                "temperature target {temp} out of range [{}, {}]",
                attr.min - middle,
                attr.max - middle
            )));
        }
        self.device.set_prop_value(PropId::Temperature, raw)?;
        *self.temperature_target.lock() = Some(temp);
        Ok(())
    }

    /// The last target set, if any.
    pub fn temperature_target(&self) -> Option<f64> {
        *self.temperature_target.lock()
    }

    /// Current sensor temperature in degrees C.
    pub fn temperature(&self) -> Result<f64> {
        Ok(self.device.prop_value(PropId::Temperature)?)
    }

    pub fn set_fan_speed(&self, speed: i32) -> Result<()> {
        self.device.set_capa_value(CapaId::FanGear, speed)?;
        Ok(())
    }

    pub fn fan_speed(&self) -> Result<i32> {
        Ok(self.device.capa_value(CapaId::FanGear)?)
    }

    pub fn set_global_gain(&self, gain: GlobalGain) -> Result<()> {
        self.device
            .set_prop_value(PropId::GlobalGain, gain.prop_value())?;
        Ok(())
    }

    pub fn global_gain(&self) -> Result<GlobalGain> {
        let value = self.device.prop_value(PropId::GlobalGain)?;
        GlobalGain::from_prop_value(value)
            .ok_or_else(|| Error::InvalidValue(format!("global gain value {value}")))
    }

    pub fn sdk_version(&self) -> Result<String> {
        Ok(self.device.dev_info(InfoId::VersionApi)?.text)
    }

    pub fn firmware_version(&self) -> Result<String> {
        Ok(self.device.dev_info(InfoId::VersionFirmware)?.value.to_string())
    }

    // ---------------------------
    // output trigger signals

    fn check_port(port: u32) -> Result<()> {
        if port >= NUM_OUTPUT_PORTS {
            return Err(Error::InvalidValue(format!(
                "output port {port}, valid range is [0-{}]",
                NUM_OUTPUT_PORTS - 1
            )));
        }
        Ok(())
    }

    /// Route `signal` to output `port`. Delay and width are in microseconds;
    /// `None` keeps the current value.
    pub fn set_output_signal(
        &self,
        port: u32,
        signal: OutputSignal,
        edge: SignalEdge,
        delay: Option<u32>,
        width: Option<u32>,
    ) -> Result<()> {
        Self::check_port(port)?;
        self.device.set_trigger_out(&TriggerOutAttr {
            port,
            signal,
            edge,
            delay,
            width,
        })?;
        Ok(())
    }

    pub fn output_signal(&self, port: u32) -> Result<TriggerOutAttr> {
        Self::check_port(port)?;
        Ok(self.device.trigger_out(port)?)
    }
}
