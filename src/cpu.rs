use std::{fmt, rc::Rc};

use crate::{
    io_bus::IoBus,
    memory_bus::MemoryBus,
    scheduler::{Executor, Scheduler},
};

/// An instruction-stepping CPU core.
///
/// The core owns whatever view of the machine it needs (usually a
/// [`SystemBus`]); the executor only asks it to step and counts clocks.
pub trait Cpu {
    /// Run one instruction (or interrupt acknowledge) and return the clocks it took.
    fn step(&mut self) -> u32;

    fn reset(&mut self);

    /// Drive the maskable interrupt line.
    fn irq(&mut self, asserted: bool);
}

/// The CPU's view of memory and I/O space.
#[derive(Clone)]
pub struct SystemBus {
    mem: Rc<MemoryBus>,
    io: Rc<IoBus>,
}

impl SystemBus {
    pub fn new(mem: Rc<MemoryBus>, io: Rc<IoBus>) -> Self {
        Self { mem, io }
    }

    pub fn read_byte(&self, address: u16) -> u8 {
        self.mem.read8(address as u32)
    }

    pub fn write_byte(&mut self, address: u16, value: u8) {
        self.mem.write8(address as u32, value)
    }

    /// Wait states of the page holding `address`.
    pub fn wait(&self, address: u16) -> u32 {
        self.mem.wait(address as u32)
    }

    /// The address bus high byte is not decoded, only the low 8 bits select a port.
    pub fn port_in(&self, port: u16) -> u8 {
        self.io.input((port & 0xff) as u32)
    }

    pub fn port_out(&mut self, port: u16, value: u8) {
        self.io.output((port & 0xff) as u32, value)
    }
}

impl fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBus")
            .field("pages", &self.mem.page_count())
            .field("ports", &self.io.bank_count())
            .finish()
    }
}

/// Runs a [`Cpu`] inside scheduler bursts at a fixed clock rate.
#[derive(Debug)]
pub struct CpuExecutor<C> {
    cpu: C,
    clock_khz: u32,
    /// Leftover of the clocks -> ns conversion, in units of 1/clock_khz ns.
    remainder: u64,
    clocks: u64,
}

impl<C: Cpu> CpuExecutor<C> {
    pub fn new(cpu: C, clock_khz: u32) -> Self {
        Self {
            cpu,
            clock_khz: clock_khz.max(1),
            remainder: 0,
            clocks: 0,
        }
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn clock_khz(&self) -> u32 {
        self.clock_khz
    }

    /// Total clocks run since the last reset.
    pub fn clocks(&self) -> u64 {
        self.clocks
    }

    fn clocks_to_ns(&mut self, clocks: u32) -> i64 {
        let total = clocks as u64 * 1_000_000 + self.remainder;
        self.remainder = total % self.clock_khz as u64;
        (total / self.clock_khz as u64) as i64
    }
}

impl<C: Cpu> Executor for CpuExecutor<C> {
    fn execute_ns(&mut self, sched: &Scheduler, _ns: i64) -> i64 {
        let start = sched.now_ns();
        // The burst end moves in when a device schedules an earlier event.
        while sched.burst_remaining_ns() > 0 {
            let clocks = self.cpu.step().max(1);
            self.clocks += clocks as u64;
            let ns = self.clocks_to_ns(clocks);
            sched.consume_ns(ns);
        }
        sched.now_ns() - start
    }

    fn set_clock_khz(&mut self, khz: u32) {
        tracing::debug!("[CPU] Clock {} kHz -> {} kHz", self.clock_khz, khz);
        self.clock_khz = khz.max(1);
        self.remainder = 0;
    }

    fn reset(&mut self) {
        self.cpu.reset();
        self.remainder = 0;
        self.clocks = 0;
    }
}
