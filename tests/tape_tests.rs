use std::{cell::RefCell, rc::Rc};

use pc88core::{
    device::{Descriptor, Device, DeviceId, DeviceRef},
    io_bus::Connector,
    ports,
    tape::{build_t88, ticks_to_ns, Tag, TagKind, TapeManager, TYPE_600BAUD},
    IdleExecutor, IoBus, MachineBuilder, Scheduler,
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

/// Stands in for the serial interface: logs every byte off the tape.
struct Receiver {
    sched: Rc<Scheduler>,
    bytes: Vec<(u8, i64)>,
}

impl Receiver {
    const DESCRIPTOR: Descriptor<Receiver> = Descriptor {
        inputs: &[],
        outputs: &[Receiver::on_data],
    };

    const CONNECTORS: &'static [Connector] = &[Connector::output(ports::CMT_DATA, 0)];

    fn new(sched: &Rc<Scheduler>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            sched: sched.clone(),
            bytes: Vec::new(),
        }))
    }

    fn on_data(&mut self, _port: u32, data: u8) {
        let now = self.sched.now_ns();
        self.bytes.push((data, now));
    }
}

impl Device for Receiver {
    fn id(&self) -> DeviceId {
        DeviceId::new(b"SIO ")
    }

    fn output(&mut self, func: usize, port: u32, data: u8) {
        Self::DESCRIPTOR.output(self, func, port, data)
    }
}

fn image() -> Vec<u8> {
    build_t88(&[
        Tag {
            kind: TagKind::Blank,
            pos: 0,
            tick: 100,
        },
        Tag {
            kind: TagKind::Data {
                kind: 0x0100,
                bytes: vec![0xaa, 0x55, 0x01],
            },
            pos: 100,
            tick: 132,
        },
        Tag {
            kind: TagKind::Data {
                kind: TYPE_600BAUD,
                bytes: vec![0x7f],
            },
            pos: 232,
            tick: 88,
        },
    ])
}

struct Deck {
    sched: Rc<Scheduler>,
    io: Rc<IoBus>,
    tape: Rc<RefCell<TapeManager>>,
    rx: Rc<RefCell<Receiver>>,
}

impl Deck {
    fn new() -> Self {
        let sched = Rc::new(Scheduler::new());
        let io = Rc::new(IoBus::new(ports::PORT_COUNT));
        let tape = TapeManager::new(sched.clone(), io.clone());
        let rx = Receiver::new(&sched);
        let tape_dyn: DeviceRef = tape.clone();
        let rx_dyn: DeviceRef = rx.clone();
        assert!(io.connect(&tape_dyn, TapeManager::CONNECTORS));
        assert!(io.connect(&rx_dyn, Receiver::CONNECTORS));
        tape.borrow_mut().open(&image()).unwrap();
        Self {
            sched,
            io,
            tape,
            rx,
        }
    }

    fn run(&self, ns: i64) {
        self.sched.proceed_ns(ns, &mut IdleExecutor);
    }
}

#[test]
fn test_bytes_arrive_at_baud_rate() {
    let deck = Deck::new();
    deck.io.output(ports::SYSTEM_CTRL, ports::SYS_MOTOR);
    deck.run(200_000_000);

    let blank = ticks_to_ns(100);
    let byte = ticks_to_ns(44);
    let slow = ticks_to_ns(88);
    let rx = deck.rx.borrow();
    assert_eq!(
        rx.bytes,
        vec![
            (0xaa, blank + byte),
            (0x55, blank + 2 * byte),
            (0x01, blank + 3 * byte),
            (0x7f, blank + 3 * byte + slow),
        ]
    );
    assert_eq!(deck.sched.live_events(), 0);
}

#[test]
fn test_motor_off_keeps_byte_phase() {
    let deck = Deck::new();
    deck.io.output(ports::SYSTEM_CTRL, ports::SYS_MOTOR);
    // 20 ticks into the first byte
    deck.run(ticks_to_ns(100) + ticks_to_ns(20) + 1);
    deck.io.output(ports::SYSTEM_CTRL, 0);
    assert!(!deck.tape.borrow().motor());
    deck.run(100_000_000);
    assert!(deck.rx.borrow().bytes.is_empty());

    let resumed = deck.sched.now_ns();
    deck.io.output(ports::SYSTEM_CTRL, ports::SYS_MOTOR);
    deck.run(ticks_to_ns(30));
    let rx = deck.rx.borrow();
    assert_eq!(rx.bytes.len(), 1);
    assert_eq!(rx.bytes[0], (0xaa, resumed + ticks_to_ns(24)));
}

#[test]
fn test_seek_and_position() {
    let deck = Deck::new();
    let mut tape = deck.tape.borrow_mut();
    assert_eq!(tape.position(), 0);
    tape.seek(100 + 44).unwrap();
    assert_eq!(tape.position(), 144);
    drop(tape);

    deck.io.output(ports::SYSTEM_CTRL, ports::SYS_MOTOR);
    deck.run(ticks_to_ns(44));
    assert_eq!(deck.rx.borrow().bytes[0].0, 0x55);
}

#[test]
fn test_tape_state_survives_snapshot() {
    let mut machine = MachineBuilder::new().build().unwrap();
    machine.open_tape(&image()).unwrap();
    machine.io_bus().output(ports::SYSTEM_CTRL, ports::SYS_MOTOR);
    machine.proceed_ns(ticks_to_ns(100) + ticks_to_ns(44) + ticks_to_ns(10));
    let saved = machine.save_snapshot().unwrap();
    let pos = machine.tape().borrow().position();

    machine.proceed_ns(ticks_to_ns(200));
    assert_ne!(machine.tape().borrow().position(), pos);

    machine.load_snapshot(&saved).unwrap();
    assert_eq!(machine.tape().borrow().position(), pos);
    assert!(machine.tape().borrow().motor());
}
