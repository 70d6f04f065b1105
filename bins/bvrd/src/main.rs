//! bvrd — main daemon for the car control runtime.
//!
//! Default mode wires every worker crate together and runs until a
//! shutdown signal arrives. The hidden `detect-child` subcommand is the
//! same binary re-invoked by [`godetect::GoDetectProxy`] as its
//! subprocess-isolated classifier; it speaks the proxy's length-framed
//! stdin/stdout protocol and never touches normal logging output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DispatcherSection {
    max_queued_drive_commands: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { max_queued_drive_commands: 16 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ConsoleSection {
    socket_path: PathBuf,
    http_bind_addr: String,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        let defaults = console::ConsoleConfig::default();
        Self { socket_path: defaults.socket_path, http_bind_addr: defaults.http_bind_addr }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RecordingSection {
    directory: PathBuf,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self { directory: PathBuf::from("./recordings") }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LogSection {
    directory: PathBuf,
    level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self { directory: PathBuf::from("/var/log/carpilot"), level: "info".to_string() }
    }
}

/// Top-level configuration file (`carpilot.toml` by default). The
/// camera-related keys live under `MOTOR.cameras` rather than a
/// separate section: [`motor::MotorConfig`] already carries the
/// per-camera width/height/fps/flip/cache-life fields this daemon's
/// single camera rig needs.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "UPPERCASE")]
struct FileConfig {
    autopilot: autopilot::AutopilotConfig,
    motor: motor::MotorConfig,
    dispatcher: DispatcherSection,
    console: ConsoleSection,
    recording: RecordingSection,
    log: LogSection,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            Ok(config)
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Ok(FileConfig::default())
        }
    }

    /// Deploy-time overrides for the handful of keys that vary by rig
    /// and are awkward to template into a checked-in TOML file.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CARPILOT_I2C_PATH") {
            self.motor.i2c_path = path;
        }
        if let Ok(index) = std::env::var("CARPILOT_CAMERA_INDEX") {
            if let (Some(camera), Ok(index)) = (self.motor.cameras.first_mut(), index.parse()) {
                camera.index = index;
            }
        }
        if let Ok(path) = std::env::var("CARPILOT_SOCKET_PATH") {
            self.console.socket_path = PathBuf::from(path);
        }
        if let Ok(addr) = std::env::var("CARPILOT_HTTP_BIND_ADDR") {
            self.console.http_bind_addr = addr;
        }
        if let Ok(level) = std::env::var("CARPILOT_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}

#[derive(Parser)]
#[command(name = "bvrd", about = "Car control runtime daemon")]
struct Args {
    #[command(subcommand)]
    command: Option<SubCommand>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "./carpilot.toml")]
    config: PathBuf,

    /// Overrides LOG.level from the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Swap the real I2C motor bus for the in-memory mock, bypassing
    /// the Linux-only platform check. For development off the car.
    #[arg(long)]
    mock: bool,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Subprocess entry point for go-sign classification, invoked by
    /// this same binary via `GoDetectProxy`. Not a user-facing command.
    #[command(hide = true)]
    DetectChild,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if matches!(args.command, Some(SubCommand::DetectChild)) {
        return run_detect_child();
    }

    let mut config = FileConfig::load(&args.config)?;
    config.apply_env_overrides();
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let _log_guard = init_logging(&config.log.directory, &log_level)?;
    info!(path = %args.config.display(), mock = args.mock, "starting carpilot daemon");

    let lifecycle = Arc::new(state::LifeCycle::new("carpilot"));
    let autodrive_started = Arc::new(AtomicBool::new(false));

    // The bus and the camera rig are brought up independently: MotorModel
    // owns the PCA9685 bus, while the dashboard pipeline needs its own
    // CameraCache handle to the capture thread. Clearing `cameras` here
    // keeps MotorModel from opening the same device a second time.
    let mut bus_config = config.motor.clone();
    bus_config.cameras.clear();
    let mut motor_model = motor::MotorModel::new(bus_config);
    motor_model
        .begin(true, args.mock)
        .context("failed to bring up the motor bus")?;

    let camera_config = config.motor.cameras.first().cloned().unwrap_or_default();
    let (camera_cache, _camera_handle) = camera::spawn_capture_thread(camera_config.clone())
        .context("failed to start camera capture")?;

    let dashboard = dashboard::DashboardPipeline::new(
        camera_config.fps as f64,
        camera_cache,
        camera_config.flipped,
        autodrive_started.clone(),
        lifecycle.clone(),
        Arc::new(dashboard::SystemClock::new()),
    );

    let godetect_proxy = godetect::GoDetectProxy::new(godetect::GoDetectConfig::default(), autodrive_started.clone());
    dashboard.register_editor(types::Priority::HIGH, Arc::new(godetect::GoDetectEditor::new(godetect_proxy.clone())));
    dashboard.register_editor(types::Priority::NORMAL, Arc::new(dashboard::TrackViewEditor::default()));
    let godetect_handle = godetect_proxy.spawn_worker(lifecycle.clone());

    let dispatcher = dispatch::Dispatcher::new(
        config.dispatcher.max_queued_drive_commands,
        lifecycle.clone(),
        motor_model,
        kinematics::KinematicConfig::default(),
    );

    // No autonomous pilot modules ship with this daemon; external pilot
    // crates register themselves here once they exist.
    let (pilots, pilot_handles) = pilot::PilotRegistry::build(
        vec![],
        dashboard.clone(),
        lifecycle.clone(),
        Duration::from_secs_f64(config.autopilot.response_timeout),
    );

    let arbiter = autopilot::Arbiter::new(
        config.autopilot,
        dispatcher.clone(),
        pilots,
        dashboard.clone(),
        lifecycle.clone(),
        autodrive_started.clone(),
    );

    let runtime = autopilot::Runtime::new(lifecycle.clone(), dashboard.clone(), dispatcher, arbiter.clone(), pilot_handles);
    runtime.start();

    let console_config = console::ConsoleConfig {
        socket_path: config.console.socket_path,
        http_bind_addr: config.console.http_bind_addr,
        recording_directory: config.recording.directory,
    };
    let console = console::Console::new(console_config, arbiter, dashboard);

    let unix_task = tokio::spawn(console.clone().run_unix_socket());
    let http_task = tokio::spawn(console.clone().run_http());

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    runtime.stop();
    godetect_proxy.shutdown();
    let _ = godetect_handle.join();
    unix_task.abort();
    http_task.abort();

    Ok(())
}

/// Initialize logging with stdout and rolling file output.
///
/// Returns a guard that must be held for the lifetime of the program to
/// ensure logs are properly flushed on shutdown.
fn init_logging(log_dir: &Path, level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Error: cannot create log directory '{}': {}", log_dir.display(), e);
        eprintln!();
        eprintln!("Try a writable log directory, e.g.:");
        eprintln!();
        eprintln!("  bvrd --mock --config ./carpilot.toml");
        eprintln!();
        return Err(e.into());
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "bvrd.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bvrd={level},autopilot={level},dispatch={level}")));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false);
    let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking_file).with_ansi(false).with_target(true);

    tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();

    Ok(guard)
}

/// Wire contract with [`godetect::GoDetectProxy`]: one JSON object per
/// frame, length-prefixed the same way the frame itself arrived.
#[derive(Serialize)]
struct DetectResult {
    detected: bool,
    rect: Option<types::Rect>,
    candidate_count: u32,
    elapsed_s: f64,
}

/// Mean brightness above this (of 255) counts as a detected go-sign.
/// A placeholder stand-in for a trained classifier: the runtime does
/// not own image understanding, only the IPC contract around it.
const BRIGHTNESS_THRESHOLD: f64 = 160.0;

fn classify(payload: &[u8]) -> DetectResult {
    let started = Instant::now();
    let decoded = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg);

    let (detected, rect, candidate_count) = match decoded {
        Ok(image) => {
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            let mean = mean_brightness(&rgb);
            let detected = mean > BRIGHTNESS_THRESHOLD;
            let rect = detected.then(|| types::Rect {
                x: (width / 4) as i32,
                y: (height / 4) as i32,
                width: (width / 2) as i32,
                height: (height / 2) as i32,
            });
            (detected, rect, detected as u32)
        }
        Err(e) => {
            warn!(?e, "detect-child failed to decode frame");
            (false, None, 0)
        }
    };

    DetectResult { detected, rect, candidate_count, elapsed_s: started.elapsed().as_secs_f64() }
}

fn mean_brightness(rgb: &image::RgbImage) -> f64 {
    let pixels = rgb.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&b| b as f64).sum::<f64>() / pixels.len() as f64
}

/// Reads length-framed JPEG frames from stdin and writes length-framed
/// JSON [`DetectResult`]s back, until stdin closes or a zero-length
/// frame arrives. Never touches `tracing`: stdout is the wire, not a
/// log stream.
fn run_detect_child() -> Result<()> {
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();

    loop {
        let mut len_bytes = [0u8; 4];
        if stdin.read_exact(&mut len_bytes).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            break;
        }

        let mut payload = vec![0u8; len];
        stdin.read_exact(&mut payload)?;

        let result = classify(&payload);
        let response = serde_json::to_vec(&result)?;
        stdout.write_all(&(response.len() as u32).to_le_bytes())?;
        stdout.write_all(&response)?;
        stdout.flush()?;
    }

    Ok(())
}
