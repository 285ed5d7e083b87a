use std::time::Duration;

use test_log::test;

use tucam::sim::{SimConfig, SimulatedSdk};
use tucam::{CaptureMode, Device, Error, InfoId, PropId, ReturnCode, RoiAttr, TucamSdk};

fn open() -> (SimulatedSdk, Device<SimulatedSdk>) {
    let sdk = SimulatedSdk::new(SimConfig {
        external_trigger_period: Duration::from_millis(2),
        ..Default::default()
    });
    let device = Device::open(sdk.clone(), 0).unwrap();
    (sdk, device)
}

fn code(e: &Error) -> Option<ReturnCode> {
    match e {
        Error::Tucam { source } => Some(source.code),
        _ => None,
    }
}

#[test]
fn open_requires_camera() {
    let sdk = SimulatedSdk::new(SimConfig {
        camera_count: 0,
        ..Default::default()
    });
    assert!(matches!(Device::open(sdk, 0), Err(Error::NoCamera)));

    let sdk = SimulatedSdk::default();
    assert!(matches!(
        Device::open(sdk, 3),
        Err(Error::NoSuchCamera { index: 3, count: 1 })
    ));
}

#[test]
fn device_closes_on_drop() {
    let (sdk, device) = open();
    assert!(device.dev_info(InfoId::CameraModel).is_ok());
    drop(device);
    let e = sdk.dev_info(InfoId::CameraModel).unwrap_err();
    assert_eq!(code(&e), Some(ReturnCode::NotInit));
}

#[test]
fn software_triggered_frames() -> anyhow::Result<()> {
    let (sdk, device) = open();
    device.set_prop_value(PropId::ExposureTime, 1.0)?;
    let mut frame = device.buf_alloc()?;
    assert_eq!((frame.width, frame.height), (2048, 2048));
    device.cap_start(CaptureMode::TriggerSoftware)?;

    device.do_software_trigger()?;
    device.wait_for_frame(&mut frame)?;
    assert_eq!(frame.index, 0);
    device.do_software_trigger()?;
    device.wait_for_frame(&mut frame)?;
    assert_eq!(frame.index, 1);
    // ramp along the row, offset by the frame index
    assert_eq!(&frame.image()[..4], &[1, 0, 2, 0]);

    device.cap_stop()?;
    device.buf_release()?;
    let stats = sdk.stats();
    assert_eq!(stats.software_triggers, 2);
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.buf_allocs, stats.buf_releases);
    Ok(())
}

#[test]
fn abort_is_latched_until_next_wait() -> anyhow::Result<()> {
    let (_sdk, device) = open();
    let mut frame = device.buf_alloc()?;
    device.cap_start(CaptureMode::TriggerSoftware)?;

    // abort before anyone waits
    device.abort_wait()?;
    let e = device.wait_for_frame(&mut frame).unwrap_err();
    assert!(e.is_abort());

    device.cap_stop()?;
    device.buf_release()?;
    Ok(())
}

#[test]
fn abort_wakes_blocked_wait() -> anyhow::Result<()> {
    let (_sdk, device) = open();
    let device = std::sync::Arc::new(device);
    let mut frame = device.buf_alloc()?;
    device.cap_start(CaptureMode::TriggerSoftware)?;

    let waiter = {
        let device = device.clone();
        std::thread::spawn(move || {
            let result = device.wait_for_frame(&mut frame);
            result.map_err(|e| e.is_abort())
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    device.abort_wait()?;
    assert_eq!(waiter.join().unwrap(), Err(true));

    device.cap_stop()?;
    device.buf_release()?;
    Ok(())
}

#[test]
fn external_mode_is_periodic() -> anyhow::Result<()> {
    let (_sdk, device) = open();
    device.set_prop_value(PropId::ExposureTime, 0.0)?;
    let mut frame = device.buf_alloc()?;
    device.cap_start(CaptureMode::TriggerStandard)?;
    for i in 0..3 {
        device.wait_for_frame(&mut frame)?;
        assert_eq!(frame.index, i);
    }
    device.cap_stop()?;
    device.buf_release()?;
    Ok(())
}

#[test]
fn injected_failures() -> anyhow::Result<()> {
    let (sdk, device) = open();
    sdk.fail_next_alloc();
    let e = device.buf_alloc().unwrap_err();
    assert_eq!(code(&e), Some(ReturnCode::NoMemory));

    let mut frame = device.buf_alloc()?;
    device.cap_start(CaptureMode::Sequence)?;
    sdk.fail_next_waits(2);
    for _ in 0..2 {
        let e = device.wait_for_frame(&mut frame).unwrap_err();
        assert_eq!(code(&e), Some(ReturnCode::Timeout));
        assert!(!e.is_abort());
    }
    device.wait_for_frame(&mut frame)?;
    device.cap_stop()?;
    device.buf_release()?;
    Ok(())
}

#[test]
fn roi_sets_frame_size() -> anyhow::Result<()> {
    let (_sdk, device) = open();
    let roi = RoiAttr {
        enable: true,
        h_offset: 16,
        v_offset: 8,
        width: 64,
        height: 32,
    };
    device.set_roi(&roi)?;
    assert_eq!(device.roi()?, roi);
    let frame = device.buf_alloc()?;
    assert_eq!(frame.image().len(), 64 * 32 * 2);
    device.buf_release()?;

    let outside = RoiAttr {
        h_offset: 2040,
        ..roi
    };
    let e = device.set_roi(&outside).unwrap_err();
    assert_eq!(code(&e), Some(ReturnCode::OutOfRange));
    assert_eq!(device.roi()?, roi);
    Ok(())
}

#[test]
fn property_ranges() -> anyhow::Result<()> {
    let (_sdk, device) = open();
    let attr = device.prop_attr(PropId::Temperature)?;
    let e = device
        .set_prop_value(PropId::Temperature, attr.max + 1.0)
        .unwrap_err();
    assert_eq!(code(&e), Some(ReturnCode::OutOfRange));
    device.set_prop_value(PropId::Temperature, attr.max / 2.0 - 10.0)?;
    assert_eq!(device.prop_value(PropId::Temperature)?, -10.0);
    Ok(())
}
