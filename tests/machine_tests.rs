use std::{
    cell::Cell,
    collections::VecDeque,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use pc88core::{
    crtc::{A_DEFAULT, LINE_NS_24K},
    device_list::HEADER_SIZE,
    snapshot::{ConfigShadow, Snapshot},
    ports, Config, Cpu, CpuExecutor, EmulationLoop, LoopCommand, Machine, MachineBuilder,
    SnapshotError, StatusError, SystemBus,
};
use tracing_subscriber::fmt;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let fmt_subscriber = fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
        .expect("Unable to set global tracing subscriber");
}

/// A CPU that plays back a list of `OUT` instructions, then idles.
struct Script {
    bus: SystemBus,
    outs: VecDeque<(u16, u8)>,
    steps: Rc<Cell<u32>>,
}

impl Script {
    fn new(bus: SystemBus, outs: VecDeque<(u16, u8)>) -> (Self, Rc<Cell<u32>>) {
        let steps = Rc::new(Cell::new(0));
        let script = Self {
            bus,
            outs,
            steps: steps.clone(),
        };
        (script, steps)
    }
}

impl Cpu for Script {
    fn step(&mut self) -> u32 {
        self.steps.set(self.steps.get() + 1);
        match self.outs.pop_front() {
            Some((port, value)) => {
                self.bus.port_out(port, value);
                11
            }
            None => 4,
        }
    }

    fn reset(&mut self) {}

    fn irq(&mut self, _asserted: bool) {}
}

const TEXT_VRAM: u16 = 0xf300;
const ROW_BYTES: usize = 120;

/// Text screen setup as BASIC does it: DMA channel 2 with auto-load from
/// channel 3, then CRTC RESET and START DISPLAY.
fn screen_setup() -> VecDeque<(u16, u8)> {
    let len = (ROW_BYTES * 25) as u16;
    let count = 0x8000 | (len - 1);
    let [alo, ahi] = TEXT_VRAM.to_le_bytes();
    let [clo, chi] = count.to_le_bytes();
    VecDeque::from(vec![
        (0x68, 0x00),
        (0x64, alo),
        (0x64, ahi),
        (0x65, clo),
        (0x65, chi),
        (0x66, alo),
        (0x66, ahi),
        (0x67, clo),
        (0x67, chi),
        (0x68, 0x44),
        (0x51, 0x00),
        (0x50, 0x4e),
        (0x50, 0x18),
        (0x50, 0x07),
        (0x50, 0x00),
        (0x50, 0x53),
        (0x51, 0x20),
    ])
}

fn fill_text(machine: &Machine) {
    let mem = machine.memory_bus();
    for y in 0..25 {
        let row = TEXT_VRAM as u32 + (y * ROW_BYTES) as u32;
        for x in 0..80 {
            mem.write8(row + x, b'0' + (y % 10) as u8);
        }
        for a in 0..20 {
            mem.write8(row + 80 + a * 2, 80);
            mem.write8(row + 81 + a * 2, 0x00);
        }
    }
}

#[test]
fn test_cpu_programs_text_screen() {
    let mut machine = MachineBuilder::new().build().unwrap();
    fill_text(&machine);
    let (script, _) = Script::new(machine.system_bus(), screen_setup());
    machine.set_executor(Box::new(CpuExecutor::new(script, 3993)));

    let frame_ns = machine.crtc().borrow().frame_ns();
    machine.proceed_ns(4 * frame_ns);

    let crtc = machine.crtc().borrow();
    assert!(crtc.frames() >= 3);
    let attr = (A_DEFAULT as u16) << 8;
    for y in 0..25 {
        assert_eq!(crtc.cell(0, y), (b'0' + (y % 10) as u8) as u16 | attr);
        assert_eq!(crtc.cell(79, y), (b'0' + (y % 10) as u8) as u16 | attr);
    }
    // channel 2 reloads from channel 3 at the end of every frame
    assert_eq!(machine.dmac().borrow().address(2), TEXT_VRAM);
}

#[test]
fn test_snapshot_round_trip_restores_memory_and_banks() {
    let mut machine = MachineBuilder::new().build().unwrap();
    let mem = machine.memory_bus().clone();
    mem.write8(0x9000, 0x12);
    machine.io_bus().output(ports::GVRAM_SEL2, 0);
    mem.write8(0xc000, 0x77);
    machine.proceed_ns(1_000_000);

    let saved = machine.save_snapshot().unwrap();
    let frames = machine.crtc().borrow().frames();

    mem.write8(0x9000, 0x34);
    machine.io_bus().output(ports::GVRAM_MAIN, 0);
    mem.write8(0xc000, 0x01);

    machine.load_snapshot(&saved).unwrap();
    assert_eq!(mem.read8(0x9000), 0x12);
    assert_eq!(machine.main_memory().borrow().gvram_plane(), Some(2));
    assert_eq!(mem.read8(0xc000), 0x77);
    machine.io_bus().output(ports::GVRAM_MAIN, 0);
    assert_eq!(mem.read8(0xc000), 0x00);

    // frame counting is not part of the state
    assert_eq!(machine.crtc().borrow().frames(), frames);
}

#[test]
fn test_uncompressed_snapshot_loads() {
    let config = Config {
        compress_snapshots: false,
        ..Config::default()
    };
    let mut machine = MachineBuilder::new().config(config).build().unwrap();
    machine.memory_bus().write8(0x8800, 0x5a);
    let saved = machine.save_snapshot().unwrap();
    assert_eq!(
        saved.len(),
        pc88core::snapshot::HEADER_SIZE + machine.devices().status_size()
    );

    machine.memory_bus().write8(0x8800, 0x00);
    machine.load_snapshot(&saved).unwrap();
    assert_eq!(machine.memory_bus().read8(0x8800), 0x5a);
}

#[test]
fn test_broken_snapshot_leaves_machine_untouched() {
    let mut machine = MachineBuilder::new().build().unwrap();
    machine.memory_bus().write8(0x9000, 0x12);
    let mut body = machine.devices().save_status();
    body.truncate(body.len() - HEADER_SIZE);
    let broken = Snapshot::new(ConfigShadow::of(machine.config()), body)
        .encode(true)
        .unwrap();

    machine.memory_bus().write8(0x9000, 0x34);
    let err = machine.load_snapshot(&broken).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Status(StatusError::Unterminated)
    ));
    assert_eq!(machine.memory_bus().read8(0x9000), 0x34);

    assert!(matches!(
        machine.load_snapshot(b"PC88CORE"),
        Err(SnapshotError::BadMagic)
    ));
}

#[test]
fn test_snapshot_carries_configuration() {
    let source = MachineBuilder::new()
        .config(Config {
            high_resolution: true,
            cpu_clock_khz: 7987,
            ..Config::default()
        })
        .build()
        .unwrap();
    let saved = source.save_snapshot().unwrap();

    let mut target = MachineBuilder::new().build().unwrap();
    target.load_snapshot(&saved).unwrap();
    assert!(target.config().high_resolution);
    assert_eq!(target.config().cpu_clock_khz, 7987);
    assert_eq!(target.crtc().borrow().line_ns(), LINE_NS_24K);
}

#[test]
fn test_unknown_devices_in_snapshot_are_skipped() {
    let with_cd = MachineBuilder::new()
        .config(Config {
            cd_enabled: true,
            ..Config::default()
        })
        .build()
        .unwrap();
    assert!(with_cd.cdif().is_some());
    with_cd.memory_bus().write8(0x9000, 0x42);
    let saved = with_cd.save_snapshot().unwrap();

    let mut plain = MachineBuilder::new().build().unwrap();
    plain.load_snapshot(&saved).unwrap();
    assert_eq!(plain.memory_bus().read8(0x9000), 0x42);
    assert!(plain.cdif().is_none());
}

#[test]
fn test_beeper_reaches_the_mixer() {
    let mut machine = MachineBuilder::new().build().unwrap();
    assert!(machine.mix_sound(64).iter().all(|&s| s == 0));

    machine.io_bus().output(ports::SYSTEM_STATUS, ports::STATUS_BEEP);
    let samples = machine.mix_sound(441);
    let high = samples.iter().filter(|&&s| s > 0).count();
    // 2400 Hz at 44.1 kHz: half of every period is high
    assert!((200..=241).contains(&high), "{} high samples", high);

    machine.reset();
    assert!(machine.mix_sound(64).iter().all(|&s| s == 0));
}

#[test]
fn test_speed_scales_cpu_clock() {
    let mut machine = MachineBuilder::new().build().unwrap();
    let (script, steps) = Script::new(machine.system_bus(), VecDeque::new());
    machine.set_executor(Box::new(CpuExecutor::new(script, 3993)));

    // 4 clocks per idle step at 3993 kHz
    machine.proceed_ns(1_000_000);
    let full = steps.get();
    assert!((995..=1_000).contains(&full), "{} steps", full);

    let half = Config {
        speed_percent: 50,
        ..Config::default()
    };
    machine.apply_config(&half).unwrap();
    assert_eq!(machine.config().effective_clock_khz(), 1996);
    steps.set(0);
    machine.proceed_ns(1_000_000);
    let slow = steps.get();
    assert!((495..=501).contains(&slow), "{} steps", slow);
}

#[test]
fn test_emulation_loop_drives_machine() {
    let frames = Arc::new(AtomicU64::new(0));
    let seen = frames.clone();
    let config = Config {
        no_wait: true,
        ..Config::default()
    };
    let factory_config = config.clone();
    let mut emu = EmulationLoop::spawn(
        &config,
        move || MachineBuilder::new().config(factory_config).build(),
        move |machine: &mut Machine| {
            let n = machine.crtc().borrow().frames();
            seen.store(n, Ordering::Relaxed);
        },
    )
    .unwrap();

    for _ in 0..5_000 {
        if frames.load(Ordering::Relaxed) >= 10 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(frames.load(Ordering::Relaxed) >= 10);

    assert!(emu.send(LoopCommand::SetSpeed(200)));
    assert!(emu.send(LoopCommand::Reset));
    assert!(emu.send(LoopCommand::Pause));
    assert!(emu.is_running());
    emu.stop();
    assert!(!emu.is_running());
}
