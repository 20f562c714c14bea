use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use pc88core::{
    device::{Descriptor, Device, DeviceId, DeviceKey, DeviceRef},
    io_bus::{active, Connector},
    memory::GVRAM_BASE,
    ports, MachineBuilder, MemoryBus, Ram,
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

/// Expansion board that banks its own RAM over 0xc000-0xffff.
struct Expansion {
    this: Weak<RefCell<Expansion>>,
    mem: Rc<MemoryBus>,
    ram: Ram,
}

impl Expansion {
    fn new(mem: Rc<MemoryBus>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                mem,
                ram: Ram::filled(0x4000, 0xe5),
            })
        })
    }

    fn key(&self) -> DeviceKey {
        DeviceKey::of_weak(&self.this)
    }

    fn claim(&self) {
        self.mem.set_owner(GVRAM_BASE, 0x4000, Some(self.key()));
        self.mem
            .set_memorys2(GVRAM_BASE, 0x4000, &self.ram, 0, self.key());
    }

    fn release(&self, main: &Ram) {
        self.mem
            .set_memorys2(GVRAM_BASE, 0x4000, main, GVRAM_BASE as usize, self.key());
        self.mem.set_owner(GVRAM_BASE, 0x4000, None);
    }
}

/// DIP switches sharing the system status port with the CRTC.
struct Switches {
    value: u8,
}

impl Switches {
    const DESCRIPTOR: Descriptor<Switches> = Descriptor {
        inputs: &[Switches::read],
        outputs: &[],
    };

    const CONNECTORS: &'static [Connector] = &[Connector::input(ports::SYSTEM_STATUS, 0)];

    fn read(&mut self, _port: u32) -> u8 {
        active(self.value, 0x03)
    }
}

impl Device for Switches {
    fn id(&self) -> DeviceId {
        DeviceId::new(b"DIPS")
    }

    fn input(&mut self, func: usize, port: u32) -> u8 {
        Self::DESCRIPTOR.input(self, func, port)
    }
}

#[test]
fn test_gvram_select_respects_foreign_owner() {
    let machine = MachineBuilder::new().build().unwrap();
    let mem = machine.memory_bus().clone();
    let main_ram = machine.main_memory().borrow().ram().clone();
    mem.write8(0xc000, 0x11);
    assert_eq!(main_ram.read(0xc000), 0x11);

    let ext = Expansion::new(mem.clone());
    ext.borrow().claim();
    assert_eq!(mem.read8(0xc000), 0xe5);

    // the plane select must not take the range away from the board
    machine.io_bus().output(ports::GVRAM_SEL0, 0);
    assert_eq!(mem.read8(0xc000), 0xe5);
    mem.write8(0xc001, 0x22);
    assert_eq!(ext.borrow().ram.read(1), 0x22);

    ext.borrow().release(&main_ram);
    assert_eq!(mem.read8(0xc000), 0x11);

    machine.io_bus().output(ports::GVRAM_SEL1, 0);
    mem.write8(0xc000, 0x33);
    let plane = machine.main_memory().borrow().gvram(1).unwrap().clone();
    assert_eq!(plane.read(0), 0x33);
    assert_eq!(main_ram.read(0xc000), 0x11);

    machine.io_bus().output(ports::GVRAM_MAIN, 0);
    assert_eq!(mem.read8(0xc000), 0x11);
    assert_eq!(mem.read_owner(0xc000), None);
}

#[test]
fn test_gated_mapping_leaves_other_owner_alone() {
    let mem = Rc::new(MemoryBus::default());
    let a = Expansion::new(mem.clone());
    let b = Expansion::new(mem.clone());
    b.borrow().ram.fill(0x5a);

    a.borrow().claim();
    // b is not the owner, its gated map is dropped
    mem.set_memorys2(GVRAM_BASE, 0x4000, &b.borrow().ram, 0, b.borrow().key());
    assert_eq!(mem.read8(0xd000), 0xe5);
    assert_eq!(mem.read_owner(0xd000), Some(a.borrow().key()));
}

#[test]
fn test_status_port_is_wired_and() {
    let mut machine = MachineBuilder::new().build().unwrap();
    let switches = Rc::new(RefCell::new(Switches { value: 0x01 }));
    let switches_dyn: DeviceRef = switches.clone();
    assert!(machine
        .io_bus()
        .connect(&switches_dyn, Switches::CONNECTORS));
    assert_eq!(machine.io_bus().input_count(ports::SYSTEM_STATUS), 2);

    // outside retrace the CRTC pulls bit 5 low, the switches bit 1
    assert!(!machine.crtc().borrow().vrtc());
    assert_eq!(machine.io_bus().input(ports::SYSTEM_STATUS), 0xdd);

    let crtc = machine.crtc().clone();
    while !crtc.borrow().vrtc() {
        machine.proceed_ns(100_000);
    }
    assert_eq!(machine.io_bus().input(ports::SYSTEM_STATUS), 0xfd);

    switches.borrow_mut().value = 0x03;
    assert_eq!(machine.io_bus().input(ports::SYSTEM_STATUS), 0xff);
}

#[test]
fn test_virtual_lines_are_not_cpu_visible() {
    let machine = MachineBuilder::new().build().unwrap();
    let mut bus = machine.system_bus();
    // the CPU only decodes the low byte, so 0x101 selects port 0x01
    assert_eq!(bus.port_in(0x0101), machine.io_bus().input(0x01));
    bus.port_out(0x0131, 0x02);
    assert!(!machine.main_memory().borrow().rom_enabled());
}
