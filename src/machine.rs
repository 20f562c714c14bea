use std::{cell::RefCell, rc::Rc};

use anyhow::bail;

use crate::{
    cd_drive::CdDrive,
    cdif::Cdif,
    config::Config,
    cpu::SystemBus,
    crtc::Crtc,
    device::DeviceRef,
    device_list::DeviceList,
    dma::{DmaAccess, Pd8257},
    emulation_loop::Emulated,
    error::{ConfigError, SnapshotError, TapeError},
    io_bus::{Connector, IoBus},
    memory::MainMemory,
    memory_bus::MemoryBus,
    ports,
    scheduler::{Executor, IdleExecutor, Scheduler},
    snapshot::{ConfigShadow, Snapshot},
    sound::{Beep, SoundMixer},
    tape::TapeManager,
};

/// A PC-8801 core: buses, scheduler and the built-in devices.
///
/// Everything here lives on the emulation thread. Whole-machine operations
/// (reset, snapshots, configuration) are plain `&mut self` calls; the
/// emulation loop serialises them with its bursts.
pub struct Machine {
    config: Config,
    sched: Rc<Scheduler>,
    io: Rc<IoBus>,
    mem: Rc<MemoryBus>,
    devices: DeviceList,
    executor: Box<dyn Executor>,
    main_memory: Rc<RefCell<MainMemory>>,
    dmac: Rc<RefCell<Pd8257>>,
    crtc: Rc<RefCell<Crtc>>,
    tape: Rc<RefCell<TapeManager>>,
    beep: Rc<RefCell<Beep>>,
    cdif: Option<Rc<RefCell<Cdif>>>,
    mixer: SoundMixer,
}

impl Machine {
    fn install(&mut self, device: DeviceRef, connectors: &[Connector]) -> anyhow::Result<()> {
        let id = device.borrow().id();
        if !self.io.connect(&device, connectors) {
            self.io.disconnect(&device);
            bail!("device {} does not fit the I/O bus", id);
        }
        self.devices.add(device);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.sched
    }

    pub fn io_bus(&self) -> &Rc<IoBus> {
        &self.io
    }

    pub fn memory_bus(&self) -> &Rc<MemoryBus> {
        &self.mem
    }

    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    /// The CPU's view of the machine, for building a CPU core.
    pub fn system_bus(&self) -> SystemBus {
        SystemBus::new(self.mem.clone(), self.io.clone())
    }

    pub fn main_memory(&self) -> &Rc<RefCell<MainMemory>> {
        &self.main_memory
    }

    pub fn dmac(&self) -> &Rc<RefCell<Pd8257>> {
        &self.dmac
    }

    pub fn crtc(&self) -> &Rc<RefCell<Crtc>> {
        &self.crtc
    }

    pub fn tape(&self) -> &Rc<RefCell<TapeManager>> {
        &self.tape
    }

    pub fn beep(&self) -> &Rc<RefCell<Beep>> {
        &self.beep
    }

    pub fn cdif(&self) -> Option<&Rc<RefCell<Cdif>>> {
        self.cdif.as_ref()
    }

    /// Replace the CPU executor. The new one is reset and clocked from the
    /// current configuration.
    pub fn set_executor(&mut self, mut executor: Box<dyn Executor>) {
        executor.set_clock_khz(self.config.effective_clock_khz());
        executor.reset();
        self.executor = executor;
    }

    pub fn now_ns(&self) -> i64 {
        self.sched.now_ns()
    }

    /// Run the machine for `ns` of virtual time.
    pub fn proceed_ns(&mut self, ns: i64) -> i64 {
        self.sched.proceed_ns(ns, self.executor.as_mut())
    }

    /// Power-on reset: remap memory and broadcast on the reset line.
    pub fn reset(&mut self) {
        tracing::info!("[MACHINE] Reset");
        self.mem.reset();
        self.io.output(ports::RESET, 0);
        self.executor.reset();
    }

    pub fn apply_config(&mut self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;
        if config.cd_enabled != self.cdif.is_some() {
            tracing::warn!("[MACHINE] CD interface presence only changes on rebuild");
        }
        self.executor.set_clock_khz(config.effective_clock_khz());
        self.crtc
            .borrow_mut()
            .set_high_resolution(config.high_resolution);
        if config.sound_rate != self.mixer.rate() {
            self.mixer.set_rate(config.sound_rate);
        }
        self.config = config.clone();
        tracing::debug!("[MACHINE] Config applied: {:?}", self.config);
        Ok(())
    }

    pub fn open_tape(&mut self, image: &[u8]) -> Result<(), TapeError> {
        self.tape.borrow_mut().open(image)
    }

    pub fn insert_cd(&mut self, drive: Box<dyn CdDrive>) -> anyhow::Result<()> {
        let Some(cdif) = self.cdif.as_ref() else {
            bail!("CD interface not enabled");
        };
        cdif.borrow_mut().attach(drive)?;
        Ok(())
    }

    pub fn eject_cd(&mut self) {
        if let Some(cdif) = self.cdif.as_ref() {
            cdif.borrow_mut().detach();
        }
    }

    /// Render `frames` samples from every sound source.
    pub fn mix_sound(&mut self, frames: usize) -> Vec<i32> {
        self.mixer.mix(frames)
    }

    pub fn save_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let body = self.devices.save_status();
        let snap = Snapshot::new(ConfigShadow::of(&self.config), body);
        let bytes = snap.encode(self.config.compress_snapshots)?;
        tracing::info!("[MACHINE] Snapshot saved, {} bytes", bytes.len());
        Ok(bytes)
    }

    /// Restore a snapshot. On any error the machine keeps its prior state.
    pub fn load_snapshot(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let snap = Snapshot::decode(data)?;
        self.devices.check_status(&snap.body)?;

        let backup = self.devices.save_status();
        if let Err(e) = self.devices.load_status(&snap.body) {
            tracing::warn!("[MACHINE] Snapshot rejected ({}), restoring", e);
            if let Err(e) = self.devices.load_status(&backup) {
                tracing::error!("[MACHINE] Could not restore prior state: {}", e);
            }
            return Err(e.into());
        }

        let mut config = self.config.clone();
        snap.config.apply(&mut config);
        if let Err(e) = self.apply_config(&config) {
            tracing::warn!("[MACHINE] Snapshot configuration ignored: {}", e);
        }
        tracing::info!("[MACHINE] Snapshot loaded");
        Ok(())
    }
}

impl Emulated for Machine {
    fn proceed_ns(&mut self, ns: i64) -> i64 {
        Machine::proceed_ns(self, ns)
    }

    fn reset(&mut self) {
        Machine::reset(self)
    }

    fn set_speed(&mut self, percent: u32) {
        let mut config = self.config.clone();
        config.speed_percent = percent;
        if let Err(e) = self.apply_config(&config) {
            tracing::warn!("[MACHINE] Speed {}% rejected: {}", percent, e);
        }
    }

    fn save_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        Machine::save_snapshot(self)
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        Machine::load_snapshot(self, data)
    }

    fn apply_config(&mut self, config: &Config) -> Result<(), ConfigError> {
        Machine::apply_config(self, config)
    }
}

/// Assembles a [`Machine`].
#[derive(Default)]
pub struct MachineBuilder {
    config: Config,
    rom: Vec<u8>,
    cd_drive: Option<Box<dyn CdDrive>>,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// BASIC ROM image mapped at 0x0000.
    pub fn rom(&mut self, data: &[u8]) -> &mut Self {
        self.rom = data.to_vec();
        self
    }

    /// Drive inserted at start-up; implies a CD interface.
    pub fn cd_drive(&mut self, drive: Box<dyn CdDrive>) -> &mut Self {
        self.config.cd_enabled = true;
        self.cd_drive = Some(drive);
        self
    }

    pub fn build(&mut self) -> anyhow::Result<Machine> {
        self.config.validate()?;
        let config = self.config.clone();
        tracing::info!("[MACHINE] Building with {:?}", config);

        let sched = Rc::new(Scheduler::new());
        let io = Rc::new(IoBus::new(ports::PORT_COUNT));
        let mem = Rc::new(MemoryBus::default());

        let main_memory = MainMemory::new(mem.clone(), &self.rom);
        let dmac = Rc::new(RefCell::new(Pd8257::new(mem.clone())));
        let crtc = Crtc::new(sched.clone(), io.clone(), dmac.clone());
        let tape = TapeManager::new(sched.clone(), io.clone());
        let beep = Beep::new();
        let cd_dma: Rc<RefCell<dyn DmaAccess>> = dmac.clone();
        let cdif = config
            .cd_enabled
            .then(|| Cdif::new(sched.clone(), Some(cd_dma)));

        let mut machine = Machine {
            config: config.clone(),
            sched,
            io,
            mem,
            devices: DeviceList::new(),
            executor: Box::new(IdleExecutor),
            main_memory: main_memory.clone(),
            dmac: dmac.clone(),
            crtc: crtc.clone(),
            tape: tape.clone(),
            beep: beep.clone(),
            cdif: cdif.clone(),
            mixer: SoundMixer::new(config.sound_rate),
        };

        machine.install(main_memory, MainMemory::CONNECTORS)?;
        machine.install(dmac, Pd8257::CONNECTORS)?;
        machine.install(crtc, Crtc::CONNECTORS)?;
        machine.install(tape, TapeManager::CONNECTORS)?;
        machine.install(beep.clone(), Beep::CONNECTORS)?;
        if let Some(cdif) = cdif {
            machine.install(cdif.clone(), Cdif::CONNECTORS)?;
            if let Some(drive) = self.cd_drive.take() {
                cdif.borrow_mut().attach(drive)?;
            }
        }
        if !machine.mixer.connect(beep) {
            tracing::warn!("[MACHINE] Beeper not mixed at {} Hz", config.sound_rate);
        }

        machine.apply_config(&config)?;
        machine.reset();
        Ok(machine)
    }
}
