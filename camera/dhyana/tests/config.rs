use std::io::Write;

use dhyana::{DhyanaConfig, Error, ExtTriggerMode, GlobalGain, RoiConstraint, TriggerEdgeSetting};

#[test]
fn defaults() {
    let cfg = DhyanaConfig::from_toml_str("").unwrap();
    assert_eq!(cfg, DhyanaConfig::default());
    assert_eq!(cfg.internal_trigger_period_ms, 999);
    assert_eq!(cfg.arm_settle_ms, 100);
    assert_eq!(cfg.max_consecutive_wait_failures, 10);
}

#[test]
fn full_config() {
    let buf = r#"
        camera_index = 1
        internal_trigger_period_ms = 500
        arm_settle_ms = 20
        temperature_target = -10.0
        fan_speed = 2
        global_gain = "high"
        trigger_mode = "synchronous"
        trigger_edge = "falling"

        [roi_constraint]
        alignment = 8
        min_size = 16
    "#;
    let cfg = DhyanaConfig::from_toml_str(buf).unwrap();
    assert_eq!(cfg.camera_index, 1);
    assert_eq!(cfg.internal_trigger_period_ms, 500);
    assert_eq!(cfg.arm_settle_ms, 20);
    assert_eq!(cfg.abort_retry_ms, 50);
    assert_eq!(cfg.temperature_target, Some(-10.0));
    assert_eq!(cfg.fan_speed, Some(2));
    assert_eq!(cfg.global_gain, Some(GlobalGain::High));
    assert_eq!(cfg.trigger_mode, ExtTriggerMode::Synchronous);
    assert_eq!(cfg.trigger_edge, TriggerEdgeSetting::Falling);
    assert_eq!(
        cfg.roi_constraint,
        Some(RoiConstraint {
            alignment: 8,
            min_size: 16
        })
    );

    // via toml::Value so tables are written after plain values
    let value = toml::Value::try_from(&cfg).unwrap();
    let serialized = toml::to_string(&value).unwrap();
    assert_eq!(DhyanaConfig::from_toml_str(&serialized).unwrap(), cfg);
}

#[test]
fn unknown_keys_are_rejected() {
    let result = DhyanaConfig::from_toml_str("exposure_time = 3\n");
    assert!(matches!(result, Err(Error::TomlDe { .. })));
    let result = DhyanaConfig::from_toml_str("[roi_constraint]\nalign = 4\n");
    assert!(matches!(result, Err(Error::TomlDe { .. })));
}

#[test]
fn invalid_values_are_rejected() {
    let result = DhyanaConfig::from_toml_str("[roi_constraint]\nalignment = 6\n");
    assert!(matches!(result, Err(Error::Config(_))));
    let result = DhyanaConfig::from_toml_str("abort_retry_ms = 0\n");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn from_path() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "fan_speed = 3")?;
    let cfg = DhyanaConfig::from_path(file.path())?;
    assert_eq!(cfg.fan_speed, Some(3));

    let missing = file.path().with_extension("missing");
    assert!(matches!(
        DhyanaConfig::from_path(missing),
        Err(Error::Io { .. })
    ));
    Ok(())
}
