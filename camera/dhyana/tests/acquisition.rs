use std::sync::mpsc;
use std::time::{Duration, Instant};

use test_log::test;

use dhyana::{Camera, DhyanaConfig, Error, Status};
use hwif::{BufferCtrl, FrameDim, FrameInfo, ImageType, Roi, Size, TrigMode};
use tucam::sim::SimulatedSdk;
use tucam::{CaptureMode, TriggerExposure};

const ROI: Roi = Roi::new(0, 0, 64, 32);

fn fast_config() -> DhyanaConfig {
    DhyanaConfig {
        internal_trigger_period_ms: 5,
        arm_settle_ms: 0,
        abort_retry_ms: 5,
        max_consecutive_wait_failures: 3,
        ..Default::default()
    }
}

fn open_with(config: DhyanaConfig) -> (SimulatedSdk, Camera<SimulatedSdk>) {
    let sdk = SimulatedSdk::default();
    let buffer = BufferCtrl::new(FrameDim::new(ROI.size, ImageType::Bpp16));
    buffer.set_nb_buffers(4).unwrap();
    let cam = Camera::new(sdk.clone(), buffer, config).unwrap();
    cam.set_roi(&ROI).unwrap();
    cam.set_exp_time(0.001).unwrap();
    (sdk, cam)
}

fn open() -> (SimulatedSdk, Camera<SimulatedSdk>) {
    open_with(fast_config())
}

/// Wait until the acquisition has ended by itself.
fn wait_idle(cam: &Camera<SimulatedSdk>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while cam.acquisition().is_running() {
        assert!(Instant::now() < deadline, "acquisition did not end");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn start_then_stop_without_frames() {
    let (sdk, cam) = open_with(DhyanaConfig {
        internal_trigger_period_ms: 60_000,
        ..fast_config()
    });
    cam.set_nb_frames(10).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    cam.stop_acq().unwrap();
    assert!(cam.nb_hw_acquired_frames() <= 10);
    assert_eq!(cam.status(), Status::Ready);
    assert!(!sdk.is_capturing());
    assert!(!sdk.is_allocated());
}

#[test]
fn prepare_allocates_once() {
    let (sdk, cam) = open();
    cam.prepare_acq().unwrap();
    cam.prepare_acq().unwrap();
    assert_eq!(sdk.stats().buf_allocs, 1);
    assert!(cam.acquisition().is_prepared());
    drop(cam);
    let stats = sdk.stats();
    assert_eq!(stats.buf_allocs, stats.buf_releases);
}

#[test]
fn start_requires_prepare() {
    let (_sdk, cam) = open();
    assert!(matches!(cam.start_acq(), Err(Error::NotPrepared)));
    // stop is harmless in any state
    cam.stop_acq().unwrap();
    cam.stop_acq().unwrap();
    assert_eq!(cam.status(), Status::Ready);
}

#[test]
fn five_frames() {
    let (sdk, cam) = open();
    let (tx, rx) = mpsc::channel();
    cam.buffer()
        .register_callback(move |info: &FrameInfo, data: &[u8]| {
            tx.send((info.acq_frame_nb, data.len())).unwrap();
            true
        });
    cam.set_nb_frames(5).unwrap();
    cam.set_lat_time(0.0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);

    let seen: Vec<_> = rx.try_iter().collect();
    let expected: Vec<_> = (0..5).map(|n| (n, 64 * 32 * 2)).collect();
    assert_eq!(seen, expected);
    assert_eq!(cam.nb_hw_acquired_frames(), 5);
    assert_eq!(cam.status(), Status::Ready);
    assert_eq!(cam.buffer().last_acquired_frame(), Some(4));

    let stats = sdk.stats();
    assert_eq!(stats.frames, 5);
    assert_eq!(stats.buf_allocs, 1);
    assert_eq!(stats.buf_releases, 1);
    assert!(!cam.acquisition().is_prepared());
}

#[test]
fn frames_are_copied_to_host_buffer() {
    let (_sdk, cam) = open();
    cam.set_nb_frames(2).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    // second frame: the ramp starts at the frame index
    let data = cam.buffer().frame_buffer(1);
    assert_eq!(&data[..6], &[1, 0, 2, 0, 3, 0]);
}

#[test]
fn stop_continuous_acquisition_after_third_frame() {
    let (_sdk, cam) = open_with(DhyanaConfig {
        internal_trigger_period_ms: 20,
        ..fast_config()
    });
    let (tx, rx) = mpsc::channel();
    cam.buffer()
        .register_callback(move |info: &FrameInfo, _data: &[u8]| {
            let _ = tx.send(info.acq_frame_nb);
            true
        });
    cam.set_nb_frames(0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    for expected in 0..3 {
        let n = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(n, expected);
    }
    cam.stop_acq().unwrap();
    let count = cam.nb_hw_acquired_frames();
    assert!((3..=4).contains(&count), "{count} frames");
    assert_eq!(cam.status(), Status::Ready);
}

#[test]
fn host_can_end_acquisition() {
    let (sdk, cam) = open();
    cam.buffer()
        .register_callback(|info: &FrameInfo, _data: &[u8]| info.acq_frame_nb < 1);
    cam.set_nb_frames(0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 2);
    assert_eq!(cam.status(), Status::Ready);
    assert!(!sdk.is_capturing());
    assert_eq!(sdk.stats().buf_releases, 1);
}

#[test]
fn start_while_running_is_refused() {
    let (_sdk, cam) = open();
    cam.set_nb_frames(0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    assert!(matches!(cam.start_acq(), Err(Error::AlreadyRunning)));
    assert!(matches!(cam.prepare_acq(), Err(Error::AlreadyRunning)));
    cam.stop_acq().unwrap();
    assert!(!cam.acquisition().is_running());
}

/// A camera whose start spends a while arming, so other calls can overlap it.
fn open_slow_arming() -> (SimulatedSdk, Camera<SimulatedSdk>) {
    open_with(DhyanaConfig {
        arm_settle_ms: 300,
        ..fast_config()
    })
}

#[test]
fn stop_while_arming_cancels_the_run() {
    let (sdk, cam) = open_slow_arming();
    cam.set_nb_frames(0).unwrap();
    cam.prepare_acq().unwrap();

    std::thread::scope(|s| {
        let starter = s.spawn(|| cam.start_acq());
        std::thread::sleep(Duration::from_millis(100));
        assert!(matches!(cam.start_acq(), Err(Error::AlreadyRunning)));
        assert!(matches!(cam.prepare_acq(), Err(Error::AlreadyRunning)));

        cam.stop_acq().unwrap();
        assert!(!cam.acquisition().is_running());
        assert!(!sdk.is_capturing());
        starter.join().unwrap().unwrap();
    });

    // nothing was handed to the worker
    std::thread::sleep(Duration::from_millis(50));
    assert!(!cam.acquisition().is_running());
    assert_eq!(cam.nb_hw_acquired_frames(), 0);
    assert_eq!(cam.status(), Status::Ready);
    let stats = sdk.stats();
    assert_eq!(stats.cap_starts, stats.cap_stops);

    // still prepared
    assert!(cam.acquisition().is_prepared());
    cam.set_nb_frames(2).unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 2);
    assert_eq!(cam.status(), Status::Ready);
}

#[test]
fn roi_change_while_arming_is_refused() {
    let (sdk, cam) = open_slow_arming();
    cam.set_nb_frames(3).unwrap();
    cam.prepare_acq().unwrap();

    std::thread::scope(|s| {
        let starter = s.spawn(|| cam.start_acq());
        std::thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            cam.set_roi(&Roi::new(0, 0, 32, 32)),
            Err(Error::Busy(_))
        ));
        starter.join().unwrap().unwrap();
    });

    wait_idle(&cam);
    assert_eq!(cam.status(), Status::Ready);
    assert_eq!(cam.nb_hw_acquired_frames(), 3);
    assert_eq!(cam.roi().unwrap(), ROI);
    let stats = sdk.stats();
    assert_eq!(stats.buf_allocs, 1);
    assert_eq!(stats.buf_allocs, stats.buf_releases);
}

#[test]
fn hundred_cycles_use_one_worker() {
    let (sdk, cam) = open();
    let worker = cam.acquisition().worker_thread_id();
    assert!(worker.is_some());
    let (tx, rx) = mpsc::channel();
    cam.buffer()
        .register_callback(move |_info: &FrameInfo, _data: &[u8]| {
            let _ = tx.send(std::thread::current().id());
            true
        });
    cam.set_nb_frames(0).unwrap();
    for _ in 0..100 {
        cam.prepare_acq().unwrap();
        cam.start_acq().unwrap();
        cam.stop_acq().unwrap();
        assert_eq!(cam.status(), Status::Ready);
    }
    assert_eq!(cam.acquisition().worker_thread_id(), worker);
    for id in rx.try_iter() {
        assert_eq!(Some(id), worker);
    }
    let stats = sdk.stats();
    assert_eq!(stats.buf_allocs, 100);
    assert_eq!(stats.buf_releases, 100);
    // one extra start and stop for the cold start
    assert_eq!(stats.cap_starts, 101);
    assert_eq!(stats.cap_stops, 101);
}

#[test]
fn repeated_wait_failures_fault_until_reset() {
    let (sdk, cam) = open();
    cam.set_nb_frames(0).unwrap();
    sdk.fail_next_waits(1000);
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.status(), Status::Fault);
    assert!(!sdk.is_capturing());

    // stop does not clear a fault
    cam.stop_acq().unwrap();
    assert_eq!(cam.status(), Status::Fault);
    cam.prepare_acq().unwrap();
    assert!(matches!(cam.start_acq(), Err(Error::Busy(_))));

    cam.reset().unwrap();
    assert_eq!(cam.status(), Status::Ready);
    sdk.fail_next_waits(0);
    cam.set_nb_frames(1).unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 1);
    assert_eq!(cam.status(), Status::Ready);
}

#[test]
fn transient_wait_failures_are_skipped() {
    let (sdk, cam) = open();
    cam.set_nb_frames(3).unwrap();
    sdk.fail_next_waits(2);
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 3);
    assert_eq!(cam.status(), Status::Ready);
}

#[test]
fn latency_between_frames() {
    let (_sdk, cam) = open();
    cam.set_nb_frames(3).unwrap();
    cam.set_lat_time(0.02).unwrap();
    cam.prepare_acq().unwrap();
    let t0 = Instant::now();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 3);
    // two latency periods, none after the last frame
    assert!(t0.elapsed() >= Duration::from_millis(40));
}

#[test]
fn stop_interrupts_latency() {
    let (_sdk, cam) = open();
    cam.set_nb_frames(0).unwrap();
    cam.set_lat_time(10.0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while cam.nb_hw_acquired_frames() == 0 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    let t0 = Instant::now();
    cam.stop_acq().unwrap();
    assert!(t0.elapsed() < Duration::from_secs(5));
    assert_eq!(cam.nb_hw_acquired_frames(), 1);
}

#[test]
fn external_trigger_modes() {
    let (sdk, cam) = open();
    cam.set_trig_mode(TrigMode::ExtTrigMult).unwrap();
    cam.set_nb_frames(3).unwrap();
    cam.prepare_acq().unwrap();
    let attr = sdk.trigger_attr();
    assert_eq!(attr.mode, CaptureMode::TriggerStandard);
    assert_eq!(attr.exposure, TriggerExposure::ExposureTime);
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 3);
    assert_eq!(sdk.stats().software_triggers, 0);

    cam.set_trig_mode(TrigMode::ExtGate).unwrap();
    cam.set_ext_trigger_mode(dhyana::ExtTriggerMode::Global);
    cam.prepare_acq().unwrap();
    let attr = sdk.trigger_attr();
    assert_eq!(attr.mode, CaptureMode::TriggerGlobal);
    assert_eq!(attr.exposure, TriggerExposure::Width);
}

#[test]
fn internal_trigger_fires_one_trigger_per_frame() {
    let (sdk, cam) = open();
    cam.set_nb_frames(4).unwrap();
    cam.prepare_acq().unwrap();
    assert_eq!(sdk.trigger_attr().mode, CaptureMode::TriggerSoftware);
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 4);
    assert_eq!(sdk.stats().software_triggers, 4);
}

#[test]
fn drop_while_running() {
    let (sdk, cam) = open();
    cam.set_nb_frames(0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    drop(cam);
    let stats = sdk.stats();
    assert_eq!(stats.buf_allocs, stats.buf_releases);
    assert_eq!(stats.cap_starts, stats.cap_stops);
}

#[test]
fn host_buffer_smaller_than_frame() {
    let sdk = SimulatedSdk::default();
    let buffer = BufferCtrl::new(FrameDim::new(Size::new(8, 8), ImageType::Bpp16));
    let cam = Camera::new(sdk, buffer, fast_config()).unwrap();
    cam.set_roi(&Roi::new(0, 0, 16, 16)).unwrap();
    cam.set_exp_time(0.0).unwrap();
    cam.prepare_acq().unwrap();
    cam.start_acq().unwrap();
    wait_idle(&cam);
    assert_eq!(cam.nb_hw_acquired_frames(), 1);
}
