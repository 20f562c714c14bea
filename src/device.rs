use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

/// Four character device tag, packed little-endian (`b"CRTC"` -> `0x43545243`).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The all-zero id terminates a save-state stream and is never a valid device.
    pub const NONE: DeviceId = DeviceId(0);

    pub const fn new(tag: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*tag))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.to_le_bytes() {
            let c = b as char;
            write!(f, "{}", if c.is_ascii_graphic() || c == ' ' { c } else { '.' })?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId(\"{}\")", self)
    }
}

/// Address identity of a shared instance.
///
/// Bus chains, scheduler slots and memory page owners all remember *who*
/// registered them without keeping the instance alive, so they compare by
/// the address of the shared allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceKey(usize);

impl DeviceKey {
    pub fn of<T: ?Sized>(rc: &Rc<T>) -> Self {
        Self(Rc::as_ptr(rc) as *const () as usize)
    }

    pub fn of_weak<T>(weak: &Weak<T>) -> Self {
        Self(weak.as_ptr() as *const () as usize)
    }

    /// A key not tied to any allocation, for owners that are not devices.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

pub type InFn<D> = fn(&mut D, u32) -> u8;
pub type OutFn<D> = fn(&mut D, u32, u8);

/// Port dispatch table of a device type.
///
/// `inputs[n]` / `outputs[n]` are the handlers a [`Connector`](crate::io_bus::Connector)
/// refers to by ordinal `n`. The ordinals are the contract between the bus and
/// the device, so entries are only ever appended.
pub struct Descriptor<D: 'static> {
    pub inputs: &'static [InFn<D>],
    pub outputs: &'static [OutFn<D>],
}

impl<D> Descriptor<D> {
    pub fn input(&self, dev: &mut D, func: usize, port: u32) -> u8 {
        match self.inputs.get(func) {
            Some(handler) => handler(dev, port),
            None => {
                tracing::warn!("[DEV] No input handler #{} (port {:03X})", func, port);
                0xff
            }
        }
    }

    pub fn output(&self, dev: &mut D, func: usize, port: u32, data: u8) {
        match self.outputs.get(func) {
            Some(handler) => handler(dev, port, data),
            None => {
                tracing::warn!(
                    "[DEV] No output handler #{} (port {:03X} <- {:02X})",
                    func,
                    port,
                    data
                );
            }
        }
    }
}

/// A unit of emulated hardware as seen by the buses and the save-state list.
pub trait Device {
    fn id(&self) -> DeviceId;

    /// Dispatch an input handler by descriptor ordinal.
    fn input(&mut self, _func: usize, _port: u32) -> u8 {
        0xff
    }

    /// Dispatch an output handler by descriptor ordinal.
    fn output(&mut self, _func: usize, _port: u32, _data: u8) {}

    /// Size of the opaque state blob; zero means the device keeps no state.
    fn status_size(&self) -> usize {
        0
    }

    fn save_status(&self, _buf: &mut [u8]) -> bool {
        false
    }

    fn load_status(&mut self, _buf: &[u8]) -> bool {
        false
    }
}

pub type DeviceRef = Rc<RefCell<dyn Device>>;

/// Copy a plain-old-data state struct into a device status buffer.
pub fn write_status<T: bytemuck::Pod>(status: &T, buf: &mut [u8]) -> bool {
    let bytes = bytemuck::bytes_of(status);
    match buf.get_mut(..bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

/// Read a plain-old-data state struct back from a (possibly unaligned) buffer.
pub fn read_status<T: bytemuck::Pod>(buf: &[u8]) -> Option<T> {
    buf.get(..std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
}
