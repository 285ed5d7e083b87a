use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use crate::{Error, FrameDim, ImageType, Result, Size};

/// Information passed to the host with every new frame.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// The frame number counted since the acquisition was started.
    pub acq_frame_nb: usize,
    /// The time at which the frame was handed to the host.
    pub timestamp: DateTime<Utc>,
}

/// Receives frame-ready notifications.
///
/// The return value requests continuation: returning `false` asks the plugin
/// to end the acquisition (e.g. because the host ran out of buffers).
///
/// The callback runs on the plugin's acquisition thread while the buffer
/// manager is locked, so it must not call back into the [BufferCtrl].
pub trait FrameCallback: Send {
    fn new_frame_ready(&mut self, info: &FrameInfo, data: &[u8]) -> bool;
}

impl<F> FrameCallback for F
where
    F: FnMut(&FrameInfo, &[u8]) -> bool + Send,
{
    fn new_frame_ready(&mut self, info: &FrameInfo, data: &[u8]) -> bool {
        (self)(info, data)
    }
}

struct Inner {
    frame_dim: FrameDim,
    nb_buffers: usize,
    nb_concat_frames: usize,
    buffers: Vec<Vec<u8>>,
    start_timestamp: Option<DateTime<Utc>>,
    callback: Option<Box<dyn FrameCallback>>,
    last_acquired_frame: Option<usize>,
}

impl Inner {
    fn slot_index(&self, acq_frame_nb: usize) -> usize {
        acq_frame_nb % self.nb_buffers
    }

    fn reallocate(&mut self) {
        let mem_size = self.frame_dim.mem_size();
        self.buffers = (0..self.nb_buffers).map(|_| vec![0u8; mem_size]).collect();
    }
}

/// Standard soft frame buffer manager owned by the host.
///
/// Holds a ring of `nb_buffers` frame buffers of [FrameDim] each. Plugins copy
/// frame `n` into [BufferCtrl::frame_buffer] and then announce it with
/// [BufferCtrl::new_frame_ready]. This is a cheaply cloneable handle; clones
/// share the same buffers.
#[derive(Clone)]
pub struct BufferCtrl {
    inner: Arc<Mutex<Inner>>,
}

fn _test_buffer_ctrl_is_send() {
    // Compile-time test to ensure BufferCtrl implements Send and Sync.
    fn implements<T: Send + Sync>() {}
    implements::<BufferCtrl>();
}

impl BufferCtrl {
    pub fn new(frame_dim: FrameDim) -> Self {
        let mut inner = Inner {
            frame_dim,
            nb_buffers: 1,
            nb_concat_frames: 1,
            buffers: Vec::new(),
            start_timestamp: None,
            callback: None,
            last_acquired_frame: None,
        };
        inner.reallocate();
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn set_frame_dim(&self, frame_dim: FrameDim) {
        let mut inner = self.inner.lock();
        if inner.frame_dim != frame_dim {
            debug!("frame dim {:?} -> {:?}", inner.frame_dim, frame_dim);
            inner.frame_dim = frame_dim;
            inner.reallocate();
        }
    }

    pub fn frame_dim(&self) -> FrameDim {
        self.inner.lock().frame_dim
    }

    pub fn set_nb_buffers(&self, nb_buffers: usize) -> Result<()> {
        if nb_buffers == 0 {
            return Err(Error::InvalidValue(
                "at least one frame buffer is required".into(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.nb_buffers != nb_buffers {
            inner.nb_buffers = nb_buffers;
            inner.reallocate();
        }
        Ok(())
    }

    pub fn nb_buffers(&self) -> usize {
        self.inner.lock().nb_buffers
    }

    pub fn set_nb_concat_frames(&self, nb_concat_frames: usize) -> Result<()> {
        if nb_concat_frames != 1 {
            return Err(Error::NotSupported(format!(
                "{nb_concat_frames} concatenated frames"
            )));
        }
        self.inner.lock().nb_concat_frames = nb_concat_frames;
        Ok(())
    }

    pub fn nb_concat_frames(&self) -> usize {
        self.inner.lock().nb_concat_frames
    }

    pub fn set_start_timestamp(&self, timestamp: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.start_timestamp = Some(timestamp);
        inner.last_acquired_frame = None;
    }

    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().start_timestamp
    }

    /// Number of the last frame announced since the start timestamp was set.
    pub fn last_acquired_frame(&self) -> Option<usize> {
        self.inner.lock().last_acquired_frame
    }

    pub fn register_callback<CB>(&self, callback: CB)
    where
        CB: FrameCallback + 'static,
    {
        self.inner.lock().callback = Some(Box::new(callback));
    }

    pub fn unregister_callback(&self) {
        self.inner.lock().callback = None;
    }

    /// Mutable access to the slot receiving frame `acq_frame_nb`.
    pub fn frame_buffer(&self, acq_frame_nb: usize) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            let idx = inner.slot_index(acq_frame_nb);
            inner.buffers[idx].as_mut_slice()
        })
    }

    /// Announce that frame `info.acq_frame_nb` has been written.
    ///
    /// Returns `false` if the registered callback asked to stop.
    pub fn new_frame_ready(&self, info: &FrameInfo) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.last_acquired_frame = Some(info.acq_frame_nb);
        let idx = inner.slot_index(info.acq_frame_nb);
        match inner.callback.as_mut() {
            Some(cb) => cb.new_frame_ready(info, &inner.buffers[idx]),
            None => true,
        }
    }
}

impl Default for BufferCtrl {
    fn default() -> Self {
        Self::new(FrameDim::new(Size::new(1, 1), ImageType::Bpp16))
    }
}
