use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::device::DeviceKey;

/// Capacity of the event pool.
pub const MAX_EVENTS: usize = 16;

pub type TimeFn<D> = fn(&mut D, u32);

type Callback = Rc<dyn Fn(u32)>;

/// Runs the CPU for a slice of virtual time.
pub trait Executor {
    /// Execute for up to `ns` nanoseconds and return how long was actually run.
    ///
    /// Implementations that step instruction by instruction should keep going
    /// only while [`Scheduler::burst_remaining_ns`] is positive and report
    /// progress with [`Scheduler::consume_ns`], so events added mid-burst cut
    /// the burst short.
    fn execute_ns(&mut self, sched: &Scheduler, ns: i64) -> i64;

    /// Change the rate the executor runs the CPU at, in kHz.
    fn set_clock_khz(&mut self, _khz: u32) {}

    fn reset(&mut self) {}
}

/// Executor with nothing attached: virtual time passes, no code runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleExecutor;

impl Executor for IdleExecutor {
    fn execute_ns(&mut self, sched: &Scheduler, ns: i64) -> i64 {
        let ns = ns.min(sched.burst_remaining_ns()).max(0);
        sched.consume_ns(ns);
        ns
    }
}

/// Handle to a pool slot. Carries the allocation generation so a handle kept
/// after its one-shot fired cannot disturb whoever owns the slot now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHandle {
    slot: usize,
    generation: u32,
}

#[derive(Default)]
struct Event {
    owner: Option<DeviceKey>,
    callback: Option<Callback>,
    arg: u32,
    time: i64,
    interval: i64,
    generation: u32,
}

impl Event {
    fn is_live(&self) -> bool {
        self.callback.is_some()
    }
}

/// Virtual-time event scheduler.
///
/// Time is kept in nanoseconds. `proceed_ns` runs the executor in bursts that
/// end at the nearest pending deadline, then fires every due event from the
/// highest slot index down to the lowest.
pub struct Scheduler {
    events: RefCell<Vec<Event>>,
    generation: Cell<u32>,
    /// Time at the start of the current burst.
    time: Cell<i64>,
    /// Time executed so far inside the current burst.
    progress: Cell<i64>,
    /// Scheduled end of the current burst.
    burst_end: Cell<i64>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events = self.events.borrow();
        let live: Vec<(usize, i64, i64)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_live())
            .map(|(i, e)| (i, e.time, e.interval))
            .collect();
        f.debug_struct("Scheduler")
            .field("time", &self.time.get())
            .field("progress", &self.progress.get())
            .field("burst_end", &self.burst_end.get())
            .field("live", &live)
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            events: RefCell::new((0..MAX_EVENTS).map(|_| Event::default()).collect()),
            generation: Cell::new(0),
            time: Cell::new(0),
            progress: Cell::new(0),
            burst_end: Cell::new(0),
        }
    }

    /// Drop every event and restart the clock at zero.
    pub fn clear(&self) {
        for ev in self.events.borrow_mut().iter_mut() {
            ev.callback = None;
            ev.owner = None;
        }
        self.time.set(0);
        self.progress.set(0);
        self.burst_end.set(0);
    }

    /// Current virtual time, including progress inside a running burst.
    pub fn now_ns(&self) -> i64 {
        self.time.get() + self.progress.get()
    }

    pub fn burst_remaining_ns(&self) -> i64 {
        self.burst_end.get() - self.now_ns()
    }

    /// Account for time executed inside the current burst.
    pub fn consume_ns(&self, ns: i64) {
        self.progress.set(self.progress.get() + ns);
    }

    /// Advance virtual time by `ns`, interleaving the executor with due events.
    ///
    /// Returns the time actually executed. This exceeds `ns` when the executor
    /// overruns its last burst (an instruction that cannot be split). The
    /// overrun is not paid back by the next call, so [`now_ns`](Self::now_ns)
    /// always equals the sum of the returned values, not of the requests.
    pub fn proceed_ns(&self, ns: i64, exec: &mut dyn Executor) -> i64 {
        let mut left = ns;
        while left > 0 {
            let slice = self.nearest_deadline(left);

            self.progress.set(0);
            self.burst_end.set(self.time.get() + slice);
            let executed = if slice > 0 {
                match exec.execute_ns(self, slice) {
                    n if n > 0 => n,
                    _ => {
                        tracing::warn!("[SCHED] Executor made no progress, skipping {} ns", slice);
                        slice
                    }
                }
            } else {
                0
            };
            self.time.set(self.time.get() + executed);
            self.progress.set(0);
            self.burst_end.set(self.time.get());
            left -= executed;

            self.fire_due();
        }
        ns - left
    }

    /// Register an event `ns` from now.
    ///
    /// # Panics
    /// When all [`MAX_EVENTS`] slots are live. Dropping an event would corrupt
    /// the emulated hardware, so exhaustion is treated as a wiring bug.
    pub fn add_event_ns<D: 'static>(
        &self,
        ns: i64,
        dev: &Weak<RefCell<D>>,
        func: TimeFn<D>,
        arg: u32,
        repeat: bool,
    ) -> EventHandle {
        match self.try_add_event_ns(ns, dev, func, arg, repeat) {
            Some(handle) => handle,
            None => panic!(
                "scheduler event pool exhausted ({} slots): {:?}",
                MAX_EVENTS, self
            ),
        }
    }

    /// Like [`add_event_ns`](Self::add_event_ns) but reports a full pool as `None`.
    pub fn try_add_event_ns<D: 'static>(
        &self,
        ns: i64,
        dev: &Weak<RefCell<D>>,
        func: TimeFn<D>,
        arg: u32,
        repeat: bool,
    ) -> Option<EventHandle> {
        let slot = self.events.borrow().iter().position(|e| !e.is_live())?;
        let generation = self.next_generation();
        self.arm(slot, generation, ns, dev, func, arg, repeat);
        Some(EventHandle { slot, generation })
    }

    /// Re-arm the slot behind `handle` in place.
    ///
    /// If the slot has since been handed to someone else, a fresh slot is
    /// allocated instead. Returns the handle now describing the event.
    pub fn set_event_ns<D: 'static>(
        &self,
        handle: EventHandle,
        ns: i64,
        dev: &Weak<RefCell<D>>,
        func: TimeFn<D>,
        arg: u32,
        repeat: bool,
    ) -> EventHandle {
        let ours = self
            .events
            .borrow()
            .get(handle.slot)
            .map(|e| e.generation == handle.generation)
            .unwrap_or(false);
        if !ours {
            return self.add_event_ns(ns, dev, func, arg, repeat);
        }
        self.arm(handle.slot, handle.generation, ns, dev, func, arg, repeat);
        handle
    }

    /// Cancel one event. Returns false if the handle no longer names a live event.
    pub fn del_event(&self, handle: EventHandle) -> bool {
        let mut events = self.events.borrow_mut();
        match events.get_mut(handle.slot) {
            Some(ev) if ev.generation == handle.generation && ev.is_live() => {
                ev.callback = None;
                ev.owner = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel every event registered by `owner`. Returns whether any was live.
    pub fn del_events_of(&self, owner: DeviceKey) -> bool {
        let mut removed = false;
        for ev in self.events.borrow_mut().iter_mut() {
            if ev.is_live() && ev.owner == Some(owner) {
                ev.callback = None;
                ev.owner = None;
                removed = true;
            }
        }
        removed
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.events
            .borrow()
            .get(handle.slot)
            .map(|e| e.generation == handle.generation && e.is_live())
            .unwrap_or(false)
    }

    /// Absolute deadline of a live event.
    pub fn deadline_ns(&self, handle: EventHandle) -> Option<i64> {
        self.events
            .borrow()
            .get(handle.slot)
            .filter(|e| e.generation == handle.generation && e.is_live())
            .map(|e| e.time)
    }

    pub fn live_events(&self) -> usize {
        self.events.borrow().iter().filter(|e| e.is_live()).count()
    }

    fn next_generation(&self) -> u32 {
        let g = self.generation.get().wrapping_add(1);
        self.generation.set(g);
        g
    }

    #[allow(clippy::too_many_arguments)]
    fn arm<D: 'static>(
        &self,
        slot: usize,
        generation: u32,
        ns: i64,
        dev: &Weak<RefCell<D>>,
        func: TimeFn<D>,
        arg: u32,
        repeat: bool,
    ) {
        debug_assert!(ns > 0, "event scheduled {} ns from now", ns);
        let deadline = self.now_ns() + ns;
        {
            let mut events = self.events.borrow_mut();
            let ev = &mut events[slot];
            ev.owner = Some(DeviceKey::of_weak(dev));
            ev.callback = Some(bind(dev, func));
            ev.arg = arg;
            ev.time = deadline;
            ev.interval = if repeat { ns } else { 0 };
            ev.generation = generation;
        }

        // Cut a running burst short so the new event is not overrun.
        if self.burst_end.get() - deadline > 0 {
            tracing::trace!(
                "[SCHED] Shorten burst {} -> {}",
                self.burst_end.get(),
                deadline
            );
            self.burst_end.set(deadline);
        }
    }

    fn nearest_deadline(&self, limit: i64) -> i64 {
        let time = self.time.get();
        self.events
            .borrow()
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.time - time)
            .fold(limit, i64::min)
            .max(0)
    }

    fn fire_due(&self) {
        let time = self.time.get();
        for slot in (0..MAX_EVENTS).rev() {
            let due = {
                let mut events = self.events.borrow_mut();
                let ev = &mut events[slot];
                match &ev.callback {
                    Some(cb) if ev.time - time <= 0 => {
                        let cb = cb.clone();
                        if ev.interval == 0 {
                            ev.callback = None;
                            ev.owner = None;
                        } else {
                            ev.time += ev.interval;
                        }
                        Some((cb, ev.arg))
                    }
                    _ => None,
                }
            };
            if let Some((cb, arg)) = due {
                cb(arg);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn bind<D: 'static>(dev: &Weak<RefCell<D>>, func: TimeFn<D>) -> Callback {
    let dev = dev.clone();
    Rc::new(move |arg| match dev.upgrade() {
        Some(dev) => func(&mut dev.borrow_mut(), arg),
        None => tracing::warn!("[SCHED] Event fired for a dropped device"),
    })
}
