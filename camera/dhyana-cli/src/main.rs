use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use dhyana::{Camera, DhyanaConfig, Interface};
use hwif::{BufferCtrl, FrameInfo, HwInterface, HwStatus, ResetLevel, Roi, TrigMode};
use tucam::sim::{SimConfig, SimulatedSdk};

/// Acquire frames from a Tucsen Dhyana camera (simulated)
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Interval of the simulated external trigger, in milliseconds
    #[arg(long, global = true, default_value_t = 100)]
    sim_trigger_period_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print detector information
    Info,
    /// Run one acquisition and log every frame
    Record(RecordArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Trigger {
    Internal,
    External,
    Gate,
}

impl From<Trigger> for TrigMode {
    fn from(orig: Trigger) -> Self {
        match orig {
            Trigger::Internal => TrigMode::IntTrig,
            Trigger::External => TrigMode::ExtTrigMult,
            Trigger::Gate => TrigMode::ExtGate,
        }
    }
}

#[derive(Debug, clap::Args)]
struct RecordArgs {
    /// Number of frames, 0 to acquire until `duration` has elapsed
    #[arg(short, long, default_value_t = 10)]
    num_frames: u64,

    /// Exposure time in seconds
    #[arg(short, long, default_value_t = 0.01)]
    exposure: f64,

    /// Latency between frames in seconds
    #[arg(short, long, default_value_t = 0.0)]
    latency: f64,

    #[arg(short, long, value_enum, default_value_t = Trigger::Internal)]
    trigger: Trigger,

    /// Number of host frame buffers
    #[arg(short, long, default_value_t = 2)]
    buffers: usize,

    /// Region of interest as `x,y,width,height`
    #[arg(long, value_parser = parse_roi)]
    roi: Option<Roi>,

    /// Length of a continuous acquisition, in seconds
    #[arg(long, default_value_t = 5.0)]
    duration: f64,
}

fn parse_roi(s: &str) -> Result<Roi, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<u32>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
        [x, y, width, height] => Ok(Roi::new(*x, *y, *width, *height)),
        _ => Err(format!("expected x,y,width,height, got {s:?}")),
    }
}

fn open(cli: &Cli, buffer: BufferCtrl) -> anyhow::Result<Camera<SimulatedSdk>> {
    let cfg = match &cli.config {
        Some(path) => DhyanaConfig::from_path(path)
            .with_context(|| format!("while reading configuration {}", path.display()))?,
        None => DhyanaConfig::default(),
    };
    let sdk = SimulatedSdk::new(SimConfig {
        external_trigger_period: Duration::from_millis(cli.sim_trigger_period_ms),
        ..Default::default()
    });
    Ok(Camera::new(sdk, buffer, cfg)?)
}

fn print_info(cli: &Cli) -> anyhow::Result<()> {
    let cam = open(cli, BufferCtrl::default())?;
    let (px, py) = cam.pixel_size();
    println!("type:        {}", cam.detector_type());
    println!("model:       {}", cam.detector_model()?);
    println!("size:        {}", cam.detector_image_size());
    println!("pixel size:  {} x {} um", px * 1e6, py * 1e6);
    println!("SDK:         {}", cam.sdk_version()?);
    println!("firmware:    {}", cam.firmware_version()?);
    println!("temperature: {} C", cam.temperature()?);
    println!("fan speed:   {}", cam.fan_speed()?);
    println!("gain:        {:?}", cam.global_gain()?);
    Ok(())
}

fn record(cli: &Cli, args: &RecordArgs) -> anyhow::Result<()> {
    let buffer = BufferCtrl::default();
    let hw = Interface::new(open(cli, buffer.clone())?);
    hw.reset(ResetLevel::SoftReset)?;
    buffer.set_nb_buffers(args.buffers)?;

    if let Some(roi) = &args.roi {
        hw.roi_ctrl().context("no ROI control")?.set_roi(roi)?;
    }
    let sync = hw.sync().context("no sync control")?;
    sync.set_trig_mode(args.trigger.into())?;
    sync.set_exp_time(args.exposure)?;
    sync.set_lat_time(args.latency)?;
    sync.set_nb_hw_frames(i64::try_from(args.num_frames)?)?;

    let (tx, rx) = mpsc::channel();
    buffer.register_callback(move |info: &FrameInfo, data: &[u8]| {
        let first = data.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]));
        tx.send((info.acq_frame_nb, info.timestamp, first)).is_ok()
    });

    hw.prepare_acq()?;
    hw.start_acq()?;
    let t0 = Instant::now();
    let duration = Duration::from_secs_f64(args.duration.max(0.0));

    let mut received = 0;
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok((n, timestamp, first)) => {
                received += 1;
                info!("frame {n} at {timestamp}, first pixel {first:?}");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if hw.status() == HwStatus::Fault {
            hw.stop_acq()?;
            anyhow::bail!("acquisition failed after {received} frames");
        }
        if args.num_frames > 0 && received >= args.num_frames {
            break;
        }
        if args.num_frames == 0 && t0.elapsed() >= duration {
            break;
        }
    }
    hw.stop_acq()?;
    buffer.unregister_callback();
    info!(
        "recorded {} frames in {:.3} s",
        hw.nb_hw_acquired_frames(),
        t0.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = env_tracing_logger::initiate_logging(&env_tracing_logger::LogConfig {
        default_directive: "info",
        file: cli.log_file.as_deref(),
        console: true,
    })
    .map_err(|e| anyhow::anyhow!(e))?;
    debug!("{:?}", cli);

    match &cli.command {
        Command::Info => print_info(&cli),
        Command::Record(args) => record(&cli, args),
    }
}
