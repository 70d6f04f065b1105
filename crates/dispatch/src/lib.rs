//! Coalescing drive-command queue.
//!
//! [`Dispatcher`] owns a bounded FIFO of [`types::DispatcherRequest`]
//! and a single worker thread that pops one request at a time and
//! writes it to the [`motor::MotorModel`]. The device write happens
//! with the queue lock released, so a slow bus write never blocks a
//! producer trying to submit the next command.

use state::LifeCycle;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use types::{DriveCommand, DispatcherRequest, Wheel, WheelPwms};

#[derive(Error, Debug)]
pub enum Error {
    #[error("dispatcher is not running")]
    NotRunning,
}

struct Queue {
    items: VecDeque<DispatcherRequest>,
}

pub struct Dispatcher {
    max_queued: usize,
    queue: Mutex<Queue>,
    not_empty: Condvar,
    not_full: Condvar,
    lifecycle: Arc<LifeCycle>,
    motor: Mutex<motor::MotorModel>,
    kinematics: kinematics::KinematicConfig,
}

impl Dispatcher {
    pub fn new(
        max_queued: usize,
        lifecycle: Arc<LifeCycle>,
        motor: motor::MotorModel,
        kinematics: kinematics::KinematicConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_queued: max_queued.max(1),
            queue: Mutex::new(Queue { items: VecDeque::new() }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            lifecycle,
            motor: Mutex::new(motor),
            kinematics,
        })
    }

    /// Submit a drive command for `now` (seconds, monotonic-ish clock
    /// shared with the rest of the runtime).
    ///
    /// An `override` command truncates the queue and jumps the line.
    /// Otherwise, a command matching the current tail's kind and
    /// params exactly coalesces into it (bumping its count) instead of
    /// growing the queue. A genuinely new command blocks the caller
    /// until a slot frees up or the runtime leaves `STARTED`.
    pub fn submit(&self, now: f64, command: DriveCommand) -> Result<(), Error> {
        let mut guard = self.queue.lock().unwrap();

        if command.is_override() {
            guard.items.clear();
            guard.items.push_back(DispatcherRequest::new(now, command));
            self.not_empty.notify_one();
            return Ok(());
        }

        if let Some(tail) = guard.items.back_mut() {
            if tail.matches(&command) {
                tail.coalesce(now);
                return Ok(());
            }
        }

        while guard.items.len() >= self.max_queued {
            if !self.lifecycle.is_running() {
                return Err(Error::NotRunning);
            }
            guard = self
                .not_full
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap()
                .0;
        }

        if !self.lifecycle.is_running() {
            return Err(Error::NotRunning);
        }

        guard.items.push_back(DispatcherRequest::new(now, command));
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until the queue is empty, or `timeout` elapses. Returns
    /// `true` iff the queue reached empty within the budget.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.queue.lock().unwrap();
        loop {
            if guard.items.is_empty() {
                return true;
            }
            match deadline {
                None => guard = self.not_full.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return guard.items.is_empty();
                    }
                    guard = self.not_full.wait_timeout(guard, deadline - now).unwrap().0;
                }
            }
        }
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().items.len()
    }

    /// Run the pop-apply loop until the runtime leaves `STARTED`.
    /// Intended to run on its own dedicated thread.
    pub fn run_worker(self: &Arc<Self>) {
        info!("dispatcher worker started");
        while self.lifecycle.is_running() {
            let request = {
                let mut guard = self.queue.lock().unwrap();
                loop {
                    if let Some(request) = guard.items.pop_front() {
                        self.not_full.notify_one();
                        break Some(request);
                    }
                    if !self.lifecycle.is_running() {
                        break None;
                    }
                    guard = self
                        .not_empty
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap()
                        .0;
                }
            };

            let Some(request) = request else { break };
            self.apply(&request.params);
        }
        info!("dispatcher worker stopped");
    }

    pub fn spawn_worker(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let dispatcher = self.clone();
        std::thread::spawn(move || dispatcher.run_worker())
    }

    /// Haptic/audible startup or shutdown feedback, issued directly
    /// from the control boundary rather than through the queue.
    pub fn vibrate(&self, count: u32, interval_s: f64) {
        self.motor.lock().unwrap().vibrate(count, interval_s);
    }

    fn apply(&self, command: &DriveCommand) {
        let pwms = match command {
            DriveCommand::SteeringThrottle { steering, throttle, flipped, .. } => {
                kinematics::map(*steering, *throttle, *flipped, &self.kinematics)
            }
            DriveCommand::Pwm { pwms, .. } => *pwms,
        };
        self.write_pwms(&pwms);
    }

    fn write_pwms(&self, pwms: &WheelPwms) {
        let mut motor = self.motor.lock().unwrap();
        for wheel in Wheel::ALL {
            if !motor.set_motor(wheel, pwms.get(wheel)) {
                warn!(?wheel, "dispatcher: transient motor write failure");
            }
        }
    }
}
