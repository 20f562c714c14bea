use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{
    config::Config,
    error::{ConfigError, SnapshotError},
};

/// One 60 Hz frame of virtual time.
pub const FRAME_NS: i64 = 16_666_667;
pub const FRAME_US: u64 = 16_667;
/// Virtual time run per step when not throttled.
pub const NO_WAIT_SLICE_NS: i64 = 5_000_000;
/// Consecutive late frames before a redraw is forced.
pub const MAX_SKIP: u32 = 20;
const REPORT_US: u64 = 1_000_000;

/// What to do after a slice of emulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pace {
    pub redraw: bool,
    /// Wall time to wait before the next slice.
    pub sleep_us: u64,
    /// Achieved speed in percent, once per wall second.
    pub report: Option<u32>,
}

/// Wall-clock pacing arithmetic. Times are microseconds from any fixed origin.
#[derive(Clone, Debug)]
pub struct Pacer {
    no_wait: bool,
    refresh_timing: u32,
    /// Wall deadline of the frame being run.
    next_us: u64,
    frame: u64,
    skipped: u32,
    last_draw_us: u64,
    report_start_us: u64,
    report_virtual_ns: i64,
}

impl Pacer {
    pub fn new(config: &Config) -> Self {
        Self {
            no_wait: config.no_wait,
            refresh_timing: config.refresh_timing.max(1),
            next_us: 0,
            frame: 0,
            skipped: 0,
            last_draw_us: 0,
            report_start_us: 0,
            report_virtual_ns: 0,
        }
    }

    /// Resynchronise to `now_us`, forgetting any lag.
    pub fn start(&mut self, now_us: u64) {
        self.next_us = now_us;
        self.skipped = 0;
        self.last_draw_us = now_us;
        self.report_start_us = now_us;
        self.report_virtual_ns = 0;
    }

    pub fn no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn set_no_wait(&mut self, no_wait: bool, now_us: u64) {
        self.no_wait = no_wait;
        self.start(now_us);
    }

    pub fn set_refresh_timing(&mut self, frames: u32) {
        self.refresh_timing = frames.max(1);
    }

    /// Virtual time to run before the next call to [`after_slice`](Self::after_slice).
    pub fn slice_ns(&self) -> i64 {
        if self.no_wait {
            NO_WAIT_SLICE_NS
        } else {
            FRAME_NS
        }
    }

    pub fn after_slice(&mut self, ran_ns: i64, now_us: u64) -> Pace {
        let mut pace = if self.no_wait {
            self.after_no_wait(now_us)
        } else {
            self.after_frame(now_us)
        };
        self.report_virtual_ns += ran_ns;
        let wall_us = now_us.saturating_sub(self.report_start_us);
        if wall_us >= REPORT_US {
            let virtual_ms = (self.report_virtual_ns / 1_000_000).max(0) as u64;
            let wall_ms = wall_us / 1000;
            pace.report = Some((virtual_ms * 100 / wall_ms) as u32);
            self.report_start_us = now_us;
            self.report_virtual_ns = 0;
        }
        pace
    }

    fn after_frame(&mut self, now_us: u64) -> Pace {
        self.frame += 1;
        self.next_us += FRAME_US;
        if now_us < self.next_us {
            self.skipped = 0;
            return Pace {
                redraw: self.frame % self.refresh_timing as u64 == 0,
                sleep_us: self.next_us - now_us,
                report: None,
            };
        }

        self.skipped += 1;
        if self.skipped >= MAX_SKIP {
            tracing::debug!("[LOOP] {} frames late, resynchronising", self.skipped);
            self.skipped = 0;
            self.next_us = now_us;
            return Pace {
                redraw: true,
                ..Pace::default()
            };
        }
        Pace::default()
    }

    fn after_no_wait(&mut self, now_us: u64) -> Pace {
        let redraw = now_us.saturating_sub(self.last_draw_us) >= FRAME_US;
        if redraw {
            self.last_draw_us = now_us;
        }
        Pace {
            redraw,
            ..Pace::default()
        }
    }
}

/// What the loop drives. Implemented by [`Machine`](crate::machine::Machine).
pub trait Emulated {
    /// Advance virtual time; returns the time actually run.
    fn proceed_ns(&mut self, ns: i64) -> i64;

    fn reset(&mut self);

    fn set_speed(&mut self, _percent: u32) {}

    fn save_snapshot(&self) -> Result<Vec<u8>, SnapshotError>;

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), SnapshotError>;

    fn apply_config(&mut self, config: &Config) -> Result<(), ConfigError>;
}

/// Requests to the loop thread. Those carrying a sender get their result back
/// on it.
#[derive(Clone, Debug)]
pub enum LoopCommand {
    Reset,
    SetSpeed(u32),
    SetNoWait(bool),
    Pause,
    Resume,
    Stop,
    SaveSnapshot(Sender<Result<Vec<u8>, SnapshotError>>),
    LoadSnapshot(Vec<u8>, Sender<Result<(), SnapshotError>>),
    ApplyConfig(Config, Sender<Result<(), ConfigError>>),
}

/// Paces a machine on its own thread.
///
/// The machine is built on the loop thread by the factory, so it never
/// crosses threads. Other threads reach it through [`LoopCommand`]s, which the
/// loop runs between bursts with the shared lock held, the same lock every
/// burst holds. [`lock`](Self::lock) keeps the machine between bursts while
/// the caller works on state it shares with the redraw callback.
pub struct EmulationLoop {
    commands: Sender<LoopCommand>,
    lock: Arc<Mutex<()>>,
    speed: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl EmulationLoop {
    pub fn spawn<M, F, R>(config: &Config, factory: F, mut on_redraw: R) -> anyhow::Result<Self>
    where
        M: Emulated + 'static,
        F: FnOnce() -> anyhow::Result<M> + Send + 'static,
        R: FnMut(&mut M) + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<anyhow::Result<()>>(1);
        let lock = Arc::new(Mutex::new(()));
        let speed = Arc::new(AtomicU32::new(0));
        let pacer = Pacer::new(config);

        let thread = {
            let lock = lock.clone();
            let speed = speed.clone();
            thread::Builder::new()
                .name("emulation".into())
                .spawn(move || {
                    let machine = match factory() {
                        Ok(machine) => {
                            let _ = ready_tx.send(Ok(()));
                            machine
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let mut runner = Runner {
                        machine,
                        pacer,
                        commands: cmd_rx,
                        lock,
                        speed,
                        origin: Instant::now(),
                        paused: false,
                    };
                    runner.run(&mut on_redraw);
                })
                .context("spawning emulation thread")?
        };

        let ready = ready_rx
            .recv()
            .map_err(|_| anyhow!("emulation thread exited during start-up"));
        match ready.and_then(|r| r) {
            Ok(()) => {
                tracing::info!("[LOOP] Started");
                Ok(Self {
                    commands: cmd_tx,
                    lock,
                    speed,
                    thread: Some(thread),
                })
            }
            Err(e) => {
                let _ = thread.join();
                Err(e.context("building machine"))
            }
        }
    }

    pub fn send(&self, cmd: LoopCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    fn request<T>(&self, cmd: LoopCommand, reply: Receiver<T>) -> anyhow::Result<T> {
        if !self.send(cmd) {
            bail!("emulation loop is not running");
        }
        reply
            .recv()
            .map_err(|_| anyhow!("emulation loop stopped before replying"))
    }

    /// Save the running machine between two bursts.
    pub fn save_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Ok(self.request(LoopCommand::SaveSnapshot(tx), rx)??)
    }

    pub fn load_snapshot(&self, data: Vec<u8>) -> anyhow::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Ok(self.request(LoopCommand::LoadSnapshot(data, tx), rx)??)
    }

    pub fn apply_config(&self, config: Config) -> anyhow::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Ok(self.request(LoopCommand::ApplyConfig(config, tx), rx)??)
    }

    /// Hold off the loop between bursts.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last achieved speed in percent, 0 until the first report.
    pub fn speed_percent(&self) -> u32 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        let _ = self.commands.send(LoopCommand::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("[LOOP] Emulation thread panicked");
            }
            tracing::info!("[LOOP] Stopped");
        }
    }
}

impl Drop for EmulationLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner<M> {
    machine: M,
    pacer: Pacer,
    commands: Receiver<LoopCommand>,
    lock: Arc<Mutex<()>>,
    speed: Arc<AtomicU32>,
    origin: Instant,
    paused: bool,
}

impl<M: Emulated> Runner<M> {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn guard(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
        lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn run(&mut self, on_redraw: &mut dyn FnMut(&mut M)) {
        self.pacer.start(self.now_us());
        loop {
            // drain what is queued; a paused loop blocks here
            loop {
                let cmd = if self.paused {
                    self.commands.recv().map_err(|_| TryRecvError::Disconnected)
                } else {
                    self.commands.try_recv()
                };
                match cmd {
                    Ok(cmd) => {
                        if !self.handle(cmd) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let ns = self.pacer.slice_ns();
            let ran = {
                let _guard = Self::guard(&self.lock);
                self.machine.proceed_ns(ns)
            };
            let pace = self.pacer.after_slice(ran, self.now_us());
            if pace.redraw {
                on_redraw(&mut self.machine);
            }
            if let Some(speed) = pace.report {
                tracing::debug!("[LOOP] Speed {}%", speed);
                self.speed.store(speed, Ordering::Relaxed);
            }
            if pace.sleep_us > 0 {
                match self
                    .commands
                    .recv_timeout(Duration::from_micros(pace.sleep_us))
                {
                    Ok(cmd) => {
                        if !self.handle(cmd) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }

    /// Returns false when the loop should end.
    fn handle(&mut self, cmd: LoopCommand) -> bool {
        tracing::debug!("[LOOP] {:?}", cmd);
        match cmd {
            LoopCommand::Reset => {
                let _guard = Self::guard(&self.lock);
                self.machine.reset();
            }
            LoopCommand::SetSpeed(percent) => {
                let _guard = Self::guard(&self.lock);
                self.machine.set_speed(percent);
            }
            LoopCommand::SetNoWait(no_wait) => {
                let now = self.now_us();
                self.pacer.set_no_wait(no_wait, now);
            }
            LoopCommand::Pause => self.paused = true,
            LoopCommand::Resume => {
                self.paused = false;
                let now = self.now_us();
                self.pacer.start(now);
            }
            LoopCommand::Stop => return false,
            LoopCommand::SaveSnapshot(reply) => {
                let saved = {
                    let _guard = Self::guard(&self.lock);
                    self.machine.save_snapshot()
                };
                let _ = reply.send(saved);
            }
            LoopCommand::LoadSnapshot(data, reply) => {
                let loaded = {
                    let _guard = Self::guard(&self.lock);
                    self.machine.load_snapshot(&data)
                };
                if loaded.is_ok() {
                    let now = self.now_us();
                    self.pacer.start(now);
                }
                let _ = reply.send(loaded);
            }
            LoopCommand::ApplyConfig(config, reply) => {
                let applied = {
                    let _guard = Self::guard(&self.lock);
                    self.machine.apply_config(&config)
                };
                if applied.is_ok() {
                    self.pacer.set_refresh_timing(config.refresh_timing);
                    if config.no_wait != self.pacer.no_wait() {
                        let now = self.now_us();
                        self.pacer.set_no_wait(config.no_wait, now);
                    }
                }
                let _ = reply.send(applied);
            }
        }
        true
    }
}
