use std::{cell::RefCell, rc::Rc};

use derivative::Derivative;

use crate::device::{DeviceKey, DeviceRef};

/// Number of ports in a plain 8-bit I/O space.
pub const PORT_BANKS_8BIT: usize = 0x100;

/// Combine a driver's value with the set of bits it actually drives.
///
/// Undriven lines float high, so a device answering only some bits of a
/// shared port returns `active(data, bits)` and the bus ANDs all answers.
pub const fn active(data: u8, bits: u8) -> u8 {
    (data & bits) | !bits
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortRule {
    In,
    Out,
    /// Marks the port as having bus-visible side effects.
    Sync,
}

/// One line of a device's connection table: port, direction and the ordinal
/// of the handler in the device's descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connector {
    pub port: u32,
    pub rule: PortRule,
    pub func: usize,
}

impl Connector {
    pub const fn input(port: u32, func: usize) -> Self {
        Self {
            port,
            rule: PortRule::In,
            func,
        }
    }

    pub const fn output(port: u32, func: usize) -> Self {
        Self {
            port,
            rule: PortRule::Out,
            func,
        }
    }

    pub const fn sync(port: u32) -> Self {
        Self {
            port,
            rule: PortRule::Sync,
            func: 0,
        }
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
struct Handler {
    #[derivative(Debug = "ignore")]
    device: DeviceRef,
    key: DeviceKey,
    func: usize,
}

/// Registration chains of one port. The chains are replaced wholesale on
/// (dis)connect so an access in flight keeps iterating the list it started with.
#[derive(Debug, Clone)]
struct Bank {
    inputs: Rc<[Handler]>,
    outputs: Rc<[Handler]>,
    sync: bool,
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            inputs: Rc::from(Vec::new()),
            outputs: Rc::from(Vec::new()),
            sync: false,
        }
    }
}

impl Bank {
    fn push(chain: &Rc<[Handler]>, handler: Handler) -> Rc<[Handler]> {
        chain.iter().cloned().chain(std::iter::once(handler)).collect()
    }

    fn without(chain: &Rc<[Handler]>, key: DeviceKey) -> Rc<[Handler]> {
        chain.iter().filter(|h| h.key != key).cloned().collect()
    }
}

/// Port space where any number of devices may share a port.
///
/// Reads AND together every registered answer (wired bus, undriven = 1),
/// writes go to every registered handler in registration order.
#[derive(Debug)]
pub struct IoBus {
    banks: RefCell<Vec<Bank>>,
}

impl IoBus {
    pub fn new(nbanks: usize) -> Self {
        Self {
            banks: RefCell::new(vec![Bank::default(); nbanks]),
        }
    }

    pub fn bank_count(&self) -> usize {
        self.banks.borrow().len()
    }

    /// Register `device` on every port named in `connectors`.
    ///
    /// Returns false at the first connector naming a port outside the bus.
    /// Connectors processed before it stay registered; callers disconnect the
    /// device on failure.
    pub fn connect(&self, device: &DeviceRef, connectors: &[Connector]) -> bool {
        let key = DeviceKey::of(device);
        let mut banks = self.banks.borrow_mut();
        for c in connectors {
            let Some(bank) = banks.get_mut(c.port as usize) else {
                tracing::error!(
                    "[IOBUS] Port {:03X} out of range ({} banks)",
                    c.port,
                    banks.len()
                );
                return false;
            };
            let handler = Handler {
                device: device.clone(),
                key,
                func: c.func,
            };
            match c.rule {
                PortRule::In => bank.inputs = Bank::push(&bank.inputs, handler),
                PortRule::Out => bank.outputs = Bank::push(&bank.outputs, handler),
                PortRule::Sync => bank.sync = true,
            }
        }
        true
    }

    /// Remove every registration of `device`. Returns whether anything was removed.
    pub fn disconnect(&self, device: &DeviceRef) -> bool {
        self.disconnect_key(DeviceKey::of(device))
    }

    pub fn disconnect_key(&self, key: DeviceKey) -> bool {
        let mut removed = false;
        for bank in self.banks.borrow_mut().iter_mut() {
            if bank.inputs.iter().any(|h| h.key == key) {
                bank.inputs = Bank::without(&bank.inputs, key);
                removed = true;
            }
            if bank.outputs.iter().any(|h| h.key == key) {
                bank.outputs = Bank::without(&bank.outputs, key);
                removed = true;
            }
        }
        removed
    }

    pub fn input(&self, port: u32) -> u8 {
        let Some(chain) = self.input_chain(port) else {
            return active(0xff, 0xff);
        };
        let mut data = 0xff;
        for h in chain.iter() {
            data &= h.device.borrow_mut().input(h.func, port);
        }
        tracing::trace!("[IOBUS] IN  {:03X} = {:02X}", port, data);
        data
    }

    pub fn output(&self, port: u32, data: u8) {
        let Some(chain) = self.output_chain(port) else {
            return;
        };
        tracing::trace!("[IOBUS] OUT {:03X} <- {:02X}", port, data);
        for h in chain.iter() {
            h.device.borrow_mut().output(h.func, port, data);
        }
    }

    pub fn is_sync_port(&self, port: u32) -> bool {
        self.banks
            .borrow()
            .get(port as usize)
            .map(|b| b.sync)
            .unwrap_or(false)
    }

    /// Number of devices answering reads on `port`.
    pub fn input_count(&self, port: u32) -> usize {
        self.banks
            .borrow()
            .get(port as usize)
            .map(|b| b.inputs.len())
            .unwrap_or(0)
    }

    pub fn output_count(&self, port: u32) -> usize {
        self.banks
            .borrow()
            .get(port as usize)
            .map(|b| b.outputs.len())
            .unwrap_or(0)
    }

    fn input_chain(&self, port: u32) -> Option<Rc<[Handler]>> {
        let banks = self.banks.borrow();
        debug_assert!(
            (port as usize) < banks.len(),
            "I/O read from port {:#x} outside the bus",
            port
        );
        banks
            .get(port as usize)
            .filter(|b| !b.inputs.is_empty())
            .map(|b| b.inputs.clone())
    }

    fn output_chain(&self, port: u32) -> Option<Rc<[Handler]>> {
        let banks = self.banks.borrow();
        debug_assert!(
            (port as usize) < banks.len(),
            "I/O write to port {:#x} outside the bus",
            port
        );
        banks
            .get(port as usize)
            .filter(|b| !b.outputs.is_empty())
            .map(|b| b.outputs.clone())
    }
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new(PORT_BANKS_8BIT)
    }
}
