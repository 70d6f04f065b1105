//! Subprocess-isolated go-sign perception.
//!
//! [`GoDetectProxy`] marshals camera frames to a classifier hosted in a
//! separate child process over length-framed pipes, and participates in
//! the dashboard pipeline as a HIGH-priority editor. Isolating the
//! classifier in its own process means a crash or hang there can't take
//! the control loop down with it; the proxy just respawns on next
//! demand.

use camera::encode_jpeg;
use dashboard::Editor;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use types::{Dashboard, Frame, Priority, Rect, TriState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("child process io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("child pipe framing error: {0}")]
    Framing(String),
    #[error("encoding frame for child: {0}")]
    Encode(#[from] camera::CameraError),
}

#[derive(Debug, Clone)]
pub struct GoDetectConfig {
    pub child_exe: PathBuf,
    pub child_args: Vec<String>,
    pub jpeg_quality: u8,
}

impl Default for GoDetectConfig {
    fn default() -> Self {
        Self {
            child_exe: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("carpilotd")),
            child_args: vec!["detect-child".to_string()],
            jpeg_quality: 70,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GoDetectResult {
    detected: bool,
    rect: Option<Rect>,
    #[allow(dead_code)]
    candidate_count: u32,
    #[allow(dead_code)]
    elapsed_s: f64,
}

struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

struct Known {
    ready_to_go: TriState,
    focused_rect: Option<Rect>,
}

pub struct GoDetectProxy {
    config: GoDetectConfig,
    child: Mutex<Option<ChildHandle>>,
    pending: Mutex<Option<Frame>>,
    known: Mutex<Known>,
    autodrive_started: Arc<AtomicBool>,
    running: AtomicBool,
}

impl GoDetectProxy {
    pub fn new(config: GoDetectConfig, autodrive_started: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            child: Mutex::new(None),
            pending: Mutex::new(None),
            known: Mutex::new(Known { ready_to_go: TriState::Unknown, focused_rect: None }),
            autodrive_started,
            running: AtomicBool::new(true),
        })
    }

    fn quiesced(&self) -> bool {
        self.autodrive_started.load(Ordering::Relaxed)
    }

    /// Replace whatever frame is pending with `frame` (drop-intermediate,
    /// keep-latest). A no-op while quiesced.
    fn offer_frame(&self, frame: Frame) {
        if self.quiesced() {
            return;
        }
        *self.pending.lock().unwrap() = Some(frame);
    }

    fn spawn_child(&self) -> Result<ChildHandle, Error> {
        let mut child = Command::new(&self.config.child_exe)
            .args(&self.config.child_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        info!(exe = ?self.config.child_exe, "go-detect child spawned");
        Ok(ChildHandle { child, stdin, stdout })
    }

    fn round_trip(&self, frame: &Frame) -> Result<GoDetectResult, Error> {
        let payload = encode_jpeg(frame, self.config.jpeg_quality)?;

        let mut guard = self.child.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.spawn_child()?);
        }
        let handle = guard.as_mut().unwrap();

        let write_result = write_frame(&mut handle.stdin, &payload)
            .and_then(|_| read_frame(&mut handle.stdout));

        match write_result {
            Ok(response) if !response.is_empty() => {
                serde_json::from_slice(&response).map_err(|e| Error::Framing(e.to_string()))
            }
            Ok(_) => Err(Error::Framing("child sent zero-length frame (EOF)".to_string())),
            Err(e) => Err(e),
        }
    }

    fn kill_child(&self) {
        if let Some(mut handle) = self.child.lock().unwrap().take() {
            terminate_child(&mut handle.child);
        }
    }

    /// Drain any pending frame and block briefly when there is nothing
    /// to do. Intended to run on its own dedicated thread.
    pub fn run_worker(self: &Arc<Self>, lifecycle: &state::LifeCycle) {
        info!("go-detect proxy started");
        while lifecycle.is_running() && self.running.load(Ordering::Relaxed) {
            let frame = self.pending.lock().unwrap().take();
            let Some(frame) = frame else {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            };

            match self.round_trip(&frame) {
                Ok(result) => {
                    let mut known = self.known.lock().unwrap();
                    known.ready_to_go = if result.detected { TriState::Yes } else { TriState::No };
                    known.focused_rect = result.rect;
                    debug!(detected = result.detected, "go-detect round trip complete");
                }
                Err(e) => {
                    warn!(?e, "go-detect round trip failed, killing child for respawn");
                    self.kill_child();
                }
            }
        }
        self.kill_child();
        info!("go-detect proxy stopped");
    }

    pub fn spawn_worker(self: &Arc<Self>, lifecycle: Arc<state::LifeCycle>) -> std::thread::JoinHandle<()> {
        let proxy = self.clone();
        std::thread::spawn(move || proxy.run_worker(&lifecycle))
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn write_frame(stdin: &mut ChildStdin, payload: &[u8]) -> Result<(), Error> {
    let len = payload.len() as u32;
    stdin.write_all(&len.to_le_bytes())?;
    stdin.write_all(payload)?;
    stdin.flush()?;
    Ok(())
}

fn read_frame(stdout: &mut ChildStdout) -> Result<Vec<u8>, Error> {
    let mut len_bytes = [0u8; 4];
    stdout.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len];
    stdout.read_exact(&mut buf)?;
    Ok(buf)
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// SIGINT, wait, SIGTERM, wait, SIGKILL.
fn terminate_child(child: &mut Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(pid, libc::SIGINT);
    }
    if wait_for_exit(child, Duration::from_millis(300)) {
        return;
    }
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    if wait_for_exit(child, Duration::from_millis(300)) {
        return;
    }
    warn!(pid, "go-detect child unresponsive to SIGINT/SIGTERM, sending SIGKILL");
    let _ = child.kill();
    let _ = child.wait();
}

/// Bridges [`GoDetectProxy`] into the dashboard pipeline's editor chain.
/// Runs at HIGH priority so `ready_to_go`/`focused_rect` are settled
/// before lower-priority editors (e.g. track-view overlays) run.
pub struct GoDetectEditor(Arc<GoDetectProxy>);

impl GoDetectEditor {
    pub fn new(proxy: Arc<GoDetectProxy>) -> Self {
        Self(proxy)
    }
}

impl Editor for GoDetectEditor {
    fn name(&self) -> &str {
        "godetect"
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }

    fn edit(&self, dashboard: &mut Dashboard) -> bool {
        if let Some(frame) = dashboard.frame.clone() {
            self.0.offer_frame(frame);
        }
        let known = self.0.known.lock().unwrap();
        dashboard.ready_to_go = known.ready_to_go;
        dashboard.focused_rect = known.focused_rect;
        false
    }
}
