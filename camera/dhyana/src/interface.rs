use std::sync::Arc;

use hwif::{
    Bin, BinCtrl, BufferCtrl, Capability, DetInfoCtrl, FrameDim, HwInterface, HwStatus,
    ImageType, ResetLevel, Roi, RoiCtrl, Size, SyncCtrl, TrigMode, ValidRanges,
};
use tracing::info;
use tucam::TucamSdk;

use crate::Camera;

pub struct DetInfoCtrlObj<S: TucamSdk + 'static> {
    cam: Arc<Camera<S>>,
}

impl<S: TucamSdk + 'static> DetInfoCtrl for DetInfoCtrlObj<S> {
    fn max_image_size(&self) -> Size {
        self.cam.detector_image_size()
    }
    fn detector_image_size(&self) -> Size {
        self.cam.detector_image_size()
    }
    fn def_image_type(&self) -> ImageType {
        ImageType::Bpp16
    }
    fn cur_image_type(&self) -> hwif::Result<ImageType> {
        Ok(self.cam.image_type())
    }
    fn set_cur_image_type(&self, image_type: ImageType) -> hwif::Result<()> {
        Ok(self.cam.set_image_type(image_type)?)
    }
    fn pixel_size(&self) -> (f64, f64) {
        self.cam.pixel_size()
    }
    fn detector_type(&self) -> String {
        self.cam.detector_type().to_string()
    }
    fn detector_model(&self) -> hwif::Result<String> {
        Ok(self.cam.detector_model()?)
    }
}

pub struct SyncCtrlObj<S: TucamSdk + 'static> {
    cam: Arc<Camera<S>>,
}

impl<S: TucamSdk + 'static> SyncCtrl for SyncCtrlObj<S> {
    fn check_trig_mode(&self, mode: TrigMode) -> bool {
        self.cam.check_trig_mode(mode)
    }
    fn set_trig_mode(&self, mode: TrigMode) -> hwif::Result<()> {
        Ok(self.cam.set_trig_mode(mode)?)
    }
    fn trig_mode(&self) -> TrigMode {
        self.cam.trig_mode()
    }
    fn set_exp_time(&self, exp_time: f64) -> hwif::Result<()> {
        Ok(self.cam.set_exp_time(exp_time)?)
    }
    fn exp_time(&self) -> hwif::Result<f64> {
        Ok(self.cam.exp_time()?)
    }
    fn set_lat_time(&self, lat_time: f64) -> hwif::Result<()> {
        Ok(self.cam.set_lat_time(lat_time)?)
    }
    fn lat_time(&self) -> f64 {
        self.cam.lat_time()
    }
    fn set_nb_hw_frames(&self, nb_frames: i64) -> hwif::Result<()> {
        Ok(self.cam.set_nb_frames(nb_frames)?)
    }
    fn nb_hw_frames(&self) -> u64 {
        self.cam.nb_frames()
    }
    fn valid_ranges(&self) -> ValidRanges {
        self.cam.valid_ranges()
    }
}

pub struct RoiCtrlObj<S: TucamSdk + 'static> {
    cam: Arc<Camera<S>>,
}

impl<S: TucamSdk + 'static> RoiCtrl for RoiCtrlObj<S> {
    fn check_roi(&self, set_roi: &Roi) -> hwif::Result<Roi> {
        Ok(self.cam.check_roi(set_roi)?)
    }
    fn set_roi(&self, set_roi: &Roi) -> hwif::Result<()> {
        Ok(self.cam.set_roi(set_roi)?)
    }
    fn roi(&self) -> hwif::Result<Roi> {
        Ok(self.cam.roi()?)
    }
}

pub struct BinCtrlObj<S: TucamSdk + 'static> {
    cam: Arc<Camera<S>>,
}

impl<S: TucamSdk + 'static> BinCtrl for BinCtrlObj<S> {
    fn check_bin(&self, bin: &Bin) -> hwif::Result<Bin> {
        Ok(self.cam.check_bin(bin)?)
    }
    fn set_bin(&self, bin: &Bin) -> hwif::Result<()> {
        Ok(self.cam.set_bin(bin)?)
    }
    fn bin(&self) -> Bin {
        self.cam.bin()
    }
}

/// The host-facing side of a [Camera].
pub struct Interface<S: TucamSdk + 'static> {
    cam: Arc<Camera<S>>,
    det_info: DetInfoCtrlObj<S>,
    sync: SyncCtrlObj<S>,
    roi: RoiCtrlObj<S>,
    bin: BinCtrlObj<S>,
}

impl<S: TucamSdk + 'static> Interface<S> {
    pub fn new(camera: Camera<S>) -> Self {
        let cam = Arc::new(camera);
        Self {
            det_info: DetInfoCtrlObj { cam: cam.clone() },
            sync: SyncCtrlObj { cam: cam.clone() },
            roi: RoiCtrlObj { cam: cam.clone() },
            bin: BinCtrlObj { cam: cam.clone() },
            cam,
        }
    }

    pub fn camera(&self) -> &Camera<S> {
        &self.cam
    }

    fn buffer_ctrl(&self) -> &BufferCtrl {
        self.cam.buffer()
    }
}

impl<S: TucamSdk + 'static> HwInterface for Interface<S> {
    fn cap_list(&self) -> Vec<Capability<'_>> {
        vec![
            Capability::DetInfo(&self.det_info),
            Capability::Sync(&self.sync),
            Capability::Buffer(self.buffer_ctrl()),
            Capability::Roi(&self.roi),
            Capability::Bin(&self.bin),
        ]
    }

    fn reset(&self, reset_level: ResetLevel) -> hwif::Result<()> {
        info!("reset ({reset_level:?})");
        self.cam.reset()?;
        let buffer = self.buffer_ctrl();
        buffer.set_frame_dim(FrameDim::new(
            self.det_info.max_image_size(),
            self.det_info.def_image_type(),
        ));
        buffer.set_nb_concat_frames(1)?;
        buffer.set_nb_buffers(1)?;
        Ok(())
    }

    fn prepare_acq(&self) -> hwif::Result<()> {
        // host buffers follow the ROI programmed in the camera
        let roi = self.cam.roi()?;
        self.buffer_ctrl()
            .set_frame_dim(FrameDim::new(roi.size, self.cam.image_type()));
        Ok(self.cam.prepare_acq()?)
    }

    fn start_acq(&self) -> hwif::Result<()> {
        Ok(self.cam.start_acq()?)
    }

    fn stop_acq(&self) -> hwif::Result<()> {
        Ok(self.cam.stop_acq()?)
    }

    fn status(&self) -> HwStatus {
        self.cam.status().into()
    }

    fn nb_hw_acquired_frames(&self) -> usize {
        self.cam.nb_hw_acquired_frames()
    }
}
