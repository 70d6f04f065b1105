//! External mutation surfaces.
//!
//! Both surfaces below are thin protocol adapters: they parse an
//! incoming message and call exactly one of the Arbiter's narrow
//! mutation methods, never touching the Dispatcher, pilots, or
//! Dashboard pipeline directly. Status responses read the latest
//! published [`types::Dashboard`] (minus its raw frame).

use autopilot::Arbiter;
use dashboard::DashboardPipeline;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};
use types::{Dashboard, Rect, TriState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub socket_path: PathBuf,
    pub http_bind_addr: String,
    pub recording_directory: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/carpilot.sock"),
            http_bind_addr: "0.0.0.0:8080".to_string(),
            recording_directory: PathBuf::from("./recordings"),
        }
    }
}

const STEERING_STEP_DEG: f64 = 5.0;
const THROTTLE_STEP: f64 = 0.1;

#[derive(Serialize)]
struct StatusJson {
    timestamp: f64,
    ready_to_go: TriState,
    started: bool,
    frame_width: u32,
    frame_height: u32,
    frame_rate: f64,
    focused_rect: Option<Rect>,
}

fn status_json(dashboard: &Dashboard) -> StatusJson {
    StatusJson {
        timestamp: dashboard.timestamp,
        ready_to_go: dashboard.ready_to_go,
        started: dashboard.started,
        frame_width: dashboard.frame_width,
        frame_height: dashboard.frame_height,
        frame_rate: dashboard.frame_rate,
        focused_rect: dashboard.focused_rect,
    }
}

pub struct Console {
    config: ConsoleConfig,
    arbiter: Arc<Arbiter>,
    dashboard: Arc<DashboardPipeline>,
}

impl Console {
    pub fn new(config: ConsoleConfig, arbiter: Arc<Arbiter>, dashboard: Arc<DashboardPipeline>) -> Arc<Self> {
        Arc::new(Self { config, arbiter, dashboard })
    }

    fn snapshot_status(&self) -> Option<StatusJson> {
        self.dashboard.latest().map(|d| status_json(&d))
    }

    fn drive_or_warn(&self, steering: f64, throttle: f64) {
        if let Err(e) = self.arbiter.drive(steering, throttle) {
            warn!(?e, "console drive command rejected");
        }
    }

    /// Accept and serve UNIX-socket keystroke clients until the socket
    /// is removed out from under the listener (runtime shutdown).
    pub async fn run_unix_socket(self: Arc<Self>) -> Result<(), Error> {
        let _ = std::fs::remove_file(&self.config.socket_path);
        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!(path = ?self.config.socket_path, "console keystroke socket listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let console = self.clone();
            tokio::spawn(async move {
                if let Err(e) = console.handle_keystroke_client(stream).await {
                    debug!(?e, "keystroke client disconnected");
                }
            });
        }
    }

    async fn handle_keystroke_client(self: Arc<Self>, stream: UnixStream) -> Result<(), Error> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut steering = 0.0f64;
        let mut throttle = 0.0f64;

        writer.write_all(b"carpilot console; type 'help' for commands\n").await?;

        while let Some(line) = lines.next_line().await? {
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            match command {
                "up" => {
                    throttle = (throttle + THROTTLE_STEP).min(1.0);
                    self.drive_or_warn(steering, throttle);
                }
                "down" => {
                    throttle = (throttle - THROTTLE_STEP).max(-1.0);
                    self.drive_or_warn(steering, throttle);
                }
                "left" => {
                    steering = (steering - STEERING_STEP_DEG).max(-90.0);
                    self.drive_or_warn(steering, throttle);
                }
                "right" => {
                    steering = (steering + STEERING_STEP_DEG).min(90.0);
                    self.drive_or_warn(steering, throttle);
                }
                "brake" => {
                    steering = 0.0;
                    throttle = 0.0;
                    self.drive_or_warn(steering, throttle);
                }
                "autodrive" => {
                    if self.dashboard.latest().map(|d| d.started).unwrap_or(false) {
                        self.arbiter.stop_autodrive();
                    } else {
                        self.arbiter.start_autodrive();
                    }
                }
                "remotecontrol" => {
                    self.arbiter.enable_remote_control();
                }
                "status" => {
                    let status = self.snapshot_status();
                    let line = serde_json::to_string(&status).unwrap_or_default();
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                "quit" => break,
                "help" => {
                    writer
                        .write_all(b"up down left right brake autodrive remotecontrol status quit help\n")
                        .await?;
                }
                other => {
                    warn!(command = other, "unrecognized console keystroke");
                    writer.write_all(b"?\n").await?;
                }
            }
        }
        Ok(())
    }

    pub async fn run_http(self: Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.http_bind_addr.as_str()).await?;
        info!(addr = %self.config.http_bind_addr, "console HTTP surface listening");

        loop {
            let (stream, addr) = listener.accept().await?;
            let console = self.clone();
            tokio::spawn(async move {
                if let Err(e) = console.handle_http_connection(stream).await {
                    debug!(?addr, ?e, "HTTP connection error");
                }
            });
        }
    }

    async fn handle_http_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<(), Error> {
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("/").to_string();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).await?;
            if header == "\r\n" || header.is_empty() {
                break;
            }
            if let Some(value) = header.strip_prefix("Content-Length:").or_else(|| header.strip_prefix("content-length:")) {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body).await?;
        }

        let response = self.route(&method, &path, &body);
        write_half.write_all(&response.header).await?;
        write_half.write_all(&response.body).await?;
        Ok(())
    }

    fn route(&self, method: &str, path: &str, body: &[u8]) -> HttpResponse {
        match (method, path) {
            ("GET", "/status") => json_response(&self.snapshot_status()),
            ("POST", "/drive") => {
                #[derive(Deserialize)]
                struct DriveBody {
                    steering: f64,
                    throttle: f64,
                }
                match serde_json::from_slice::<DriveBody>(body) {
                    Ok(drive) => {
                        self.drive_or_warn(drive.steering, drive.throttle);
                        json_response(&self.snapshot_status())
                    }
                    Err(e) => error_response(400, &e.to_string()),
                }
            }
            ("POST", "/autodrive/start") => {
                self.arbiter.start_autodrive();
                json_response(&self.snapshot_status())
            }
            ("POST", "/autodrive/stop") => {
                self.arbiter.stop_autodrive();
                json_response(&self.snapshot_status())
            }
            ("POST", "/remote-control/enable") => {
                self.arbiter.enable_remote_control();
                json_response(&self.snapshot_status())
            }
            ("POST", "/remote-control/disable") => {
                self.arbiter.disable_remote_control();
                json_response(&self.snapshot_status())
            }
            ("POST", "/recording/start") => match self.arbiter.start_recording(&self.config.recording_directory) {
                Ok(()) => json_response(&self.snapshot_status()),
                Err(e) => error_response(500, &e.to_string()),
            },
            ("POST", "/recording/stop") => {
                self.arbiter.stop_recording();
                json_response(&self.snapshot_status())
            }
            ("GET", "/snapshot") => match self.dashboard.latest().and_then(|d| d.frame.clone()) {
                Some(frame) => match camera::encode_jpeg(&frame, 80) {
                    Ok(jpeg) => jpeg_response(jpeg),
                    Err(e) => error_response(500, &e.to_string()),
                },
                None => error_response(404, "no frame available"),
            },
            _ => error_response(404, "not found"),
        }
    }
}

struct HttpResponse {
    header: Vec<u8>,
    body: Vec<u8>,
}

fn json_response<T: Serialize>(value: &T) -> HttpResponse {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    HttpResponse { header: header.into_bytes(), body }
}

fn error_response(status: u16, message: &str) -> HttpResponse {
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let body = serde_json::json!({ "error": message }).to_string().into_bytes();
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    HttpResponse { header: header.into_bytes(), body }
}

fn jpeg_response(jpeg: Vec<u8>) -> HttpResponse {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    HttpResponse { header: header.into_bytes(), body: jpeg }
}
