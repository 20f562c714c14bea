use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use bytemuck::{Pod, Zeroable};
use derivative::Derivative;

use crate::{
    device::{read_status, write_status, Descriptor, Device, DeviceId, DeviceKey},
    io_bus::Connector,
    memory_bus::{MemoryBus, Ram},
    ports,
};

pub const ROM_SIZE: usize = 0x8000;
pub const RAM_SIZE: usize = 0x10000;
pub const GVRAM_PLANES: usize = 3;
pub const GVRAM_PLANE_SIZE: usize = 0x4000;

pub const TEXT_WINDOW_BASE: u32 = 0x8000;
pub const TEXT_WINDOW_LEN: u32 = 0x400;
pub const GVRAM_BASE: u32 = 0xc000;

/// Port 0x31 bit 1: RAM instead of ROM in the lower 32 KiB.
const MMODE_RAM: u8 = 0x02;
const MAIN_RAM: u8 = 0xff;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct State {
    port31: u8,
    text_window: u8,
    /// Selected plane, `MAIN_RAM` when none.
    gvram_sel: u8,
    _pad: u8,
}

const STATE_SIZE: usize = std::mem::size_of::<State>();
const STATUS_SIZE: usize = STATE_SIZE + RAM_SIZE + GVRAM_PLANES * GVRAM_PLANE_SIZE;

/// Main memory map: ROM/RAM switch on port 0x31, the 1 KiB text window at
/// 0x8000 positioned by port 0x70, and the graphic planes banked over
/// 0xC000-0xFFFF by ports 0x5c-0x5f.
///
/// The graphic bank claims its pages through the bus owner tags, so it never
/// replaces a mapping some other device holds there.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MainMemory {
    #[derivative(Debug = "ignore")]
    this: Weak<RefCell<MainMemory>>,
    #[derivative(Debug = "ignore")]
    mem: Rc<MemoryBus>,
    #[derivative(Debug = "ignore")]
    rom: Ram,
    #[derivative(Debug = "ignore")]
    ram: Ram,
    #[derivative(Debug = "ignore")]
    gvram: [Ram; GVRAM_PLANES],
    port31: u8,
    text_window: u8,
    gvram_sel: Option<usize>,
}

impl MainMemory {
    pub const ID: DeviceId = DeviceId::new(b"MEM1");

    const DESCRIPTOR: Descriptor<MainMemory> = Descriptor {
        inputs: &[MainMemory::in_text_window],
        outputs: &[
            MainMemory::out_mode,
            MainMemory::out_text_window,
            MainMemory::out_gvram_sel,
            MainMemory::out_gvram_main,
            MainMemory::on_reset,
        ],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::input(ports::TEXT_WINDOW, 0),
        Connector::output(ports::MEMORY_MODE, 0),
        Connector::output(ports::TEXT_WINDOW, 1),
        Connector::output(ports::GVRAM_SEL0, 2),
        Connector::output(ports::GVRAM_SEL1, 2),
        Connector::output(ports::GVRAM_SEL2, 2),
        Connector::output(ports::GVRAM_MAIN, 3),
        Connector::output(ports::RESET, 4),
    ];

    /// `rom` fills the lower 32 KiB; anything short of that reads 0xff.
    pub fn new(mem: Rc<MemoryBus>, rom: &[u8]) -> Rc<RefCell<Self>> {
        let rom_ram = Ram::filled(ROM_SIZE, 0xff);
        rom_ram.load(0, &rom[..rom.len().min(ROM_SIZE)]);
        let memory = Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                mem,
                rom: rom_ram,
                ram: Ram::new(RAM_SIZE),
                gvram: std::array::from_fn(|_| Ram::new(GVRAM_PLANE_SIZE)),
                port31: 0,
                text_window: 0,
                gvram_sel: None,
            })
        });
        memory.borrow().map_all();
        memory
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn gvram(&self, plane: usize) -> Option<&Ram> {
        self.gvram.get(plane)
    }

    pub fn rom_enabled(&self) -> bool {
        self.port31 & MMODE_RAM == 0
    }

    pub fn text_window(&self) -> u8 {
        self.text_window
    }

    pub fn gvram_plane(&self) -> Option<usize> {
        self.gvram_sel
    }

    fn key(&self) -> DeviceKey {
        DeviceKey::of_weak(&self.this)
    }

    /// Rebuild every page this device maps.
    pub fn map_all(&self) {
        self.mem.set_memorys(0, GVRAM_BASE, &self.ram, 0);
        self.update_rom();
        self.update_gvram();
    }

    fn update_rom(&self) {
        if self.rom_enabled() {
            self.mem.set_read_memorys(0, ROM_SIZE as u32, &self.rom, 0);
            self.mem.set_funcs(
                TEXT_WINDOW_BASE,
                TEXT_WINDOW_LEN,
                &self.this,
                MainMemory::read_window,
                MainMemory::write_window,
            );
        } else {
            self.mem.set_read_memorys(0, ROM_SIZE as u32, &self.ram, 0);
            self.mem.set_memorys(
                TEXT_WINDOW_BASE,
                TEXT_WINDOW_LEN,
                &self.ram,
                TEXT_WINDOW_BASE as usize,
            );
        }
    }

    fn update_gvram(&self) {
        let key = self.key();
        let len = GVRAM_PLANE_SIZE as u32;
        let owner = self.mem.read_owner(GVRAM_BASE);
        if owner.is_some_and(|o| o != key) {
            tracing::warn!("[MEM] GVRAM bank held by another device");
            return;
        }
        match self.gvram_sel {
            Some(plane) => {
                self.mem.set_owner(GVRAM_BASE, len, Some(key));
                self.mem
                    .set_memorys2(GVRAM_BASE, len, &self.gvram[plane], 0, key);
            }
            None if owner == Some(key) => {
                self.mem
                    .set_memorys2(GVRAM_BASE, len, &self.ram, GVRAM_BASE as usize, key);
                self.mem.set_owner(GVRAM_BASE, len, None);
            }
            None => {
                self.mem
                    .set_memorys(GVRAM_BASE, len, &self.ram, GVRAM_BASE as usize);
            }
        }
    }

    fn window_offset(&self, addr: u32) -> usize {
        (((self.text_window as usize) << 8) + (addr & (TEXT_WINDOW_LEN - 1)) as usize)
            & (RAM_SIZE - 1)
    }

    fn read_window(&mut self, addr: u32) -> u8 {
        self.ram.read(self.window_offset(addr))
    }

    fn write_window(&mut self, addr: u32, data: u8) {
        self.ram.write(self.window_offset(addr), data);
    }

    // -- ports --

    fn in_text_window(&mut self, _port: u32) -> u8 {
        self.text_window
    }

    fn out_mode(&mut self, _port: u32, data: u8) {
        let changed = (self.port31 ^ data) & MMODE_RAM != 0;
        self.port31 = data;
        if changed {
            tracing::trace!("[MEM] Lower bank {}", if self.rom_enabled() { "ROM" } else { "RAM" });
            self.update_rom();
        }
    }

    fn out_text_window(&mut self, _port: u32, data: u8) {
        self.text_window = data;
    }

    fn out_gvram_sel(&mut self, port: u32, _data: u8) {
        let plane = (port - ports::GVRAM_SEL0) as usize;
        if self.gvram_sel != Some(plane) {
            self.gvram_sel = Some(plane);
            self.update_gvram();
        }
    }

    fn out_gvram_main(&mut self, _port: u32, _data: u8) {
        if self.gvram_sel.is_some() {
            self.gvram_sel = None;
            self.update_gvram();
        }
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.port31 = 0;
        self.text_window = 0;
        self.gvram_sel = None;
        self.map_all();
    }
}

impl Device for MainMemory {
    fn id(&self) -> DeviceId {
        Self::ID
    }

    fn input(&mut self, func: usize, port: u32) -> u8 {
        Self::DESCRIPTOR.input(self, func, port)
    }

    fn output(&mut self, func: usize, port: u32, data: u8) {
        Self::DESCRIPTOR.output(self, func, port, data)
    }

    fn status_size(&self) -> usize {
        STATUS_SIZE
    }

    fn save_status(&self, buf: &mut [u8]) -> bool {
        if buf.len() < STATUS_SIZE {
            return false;
        }
        let st = State {
            port31: self.port31,
            text_window: self.text_window,
            gvram_sel: self.gvram_sel.map_or(MAIN_RAM, |p| p as u8),
            _pad: 0,
        };
        let (head, body) = buf.split_at_mut(STATE_SIZE);
        write_status(&st, head);
        let (ram, mut planes) = body.split_at_mut(RAM_SIZE);
        ram.copy_from_slice(&self.ram.to_vec());
        for plane in &self.gvram {
            let (dst, rest) = planes.split_at_mut(GVRAM_PLANE_SIZE);
            dst.copy_from_slice(&plane.to_vec());
            planes = rest;
        }
        true
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        if buf.len() < STATUS_SIZE {
            return false;
        }
        let Some(st) = read_status::<State>(buf) else {
            return false;
        };
        let gvram_sel = match st.gvram_sel as usize {
            p if p < GVRAM_PLANES => Some(p),
            _ if st.gvram_sel == MAIN_RAM => None,
            _ => return false,
        };
        let body = &buf[STATE_SIZE..];
        self.ram.load(0, &body[..RAM_SIZE]);
        for (n, plane) in self.gvram.iter().enumerate() {
            let start = RAM_SIZE + n * GVRAM_PLANE_SIZE;
            plane.load(0, &body[start..start + GVRAM_PLANE_SIZE]);
        }
        self.port31 = st.port31;
        self.text_window = st.text_window;
        self.gvram_sel = gvram_sel;
        self.map_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Rc<MemoryBus>, Rc<RefCell<MainMemory>>) {
        let mem = Rc::new(MemoryBus::default());
        let rom: Vec<u8> = (0..ROM_SIZE).map(|i| (i >> 8) as u8).collect();
        let main = MainMemory::new(mem.clone(), &rom);
        (mem, main)
    }

    #[test]
    fn test_rom_ram_switch() {
        let (mem, main) = setup();
        mem.write8(0x1234, 0xaa);
        assert_eq!(mem.read8(0x1234), 0x12);

        main.borrow_mut().out_mode(ports::MEMORY_MODE, MMODE_RAM);
        assert_eq!(mem.read8(0x1234), 0xaa);
        main.borrow_mut().out_mode(ports::MEMORY_MODE, 0);
        assert_eq!(mem.read8(0x1234), 0x12);
    }

    #[test]
    fn test_text_window() {
        let (mem, main) = setup();
        main.borrow().ram().write(0xf3c8, 0x41);
        main.borrow_mut().out_text_window(ports::TEXT_WINDOW, 0xf3);
        assert_eq!(mem.read8(0x80c8), 0x41);
        mem.write8(0x80c9, 0x42);
        assert_eq!(main.borrow().ram().read(0xf3c9), 0x42);

        // RAM mode maps 0x8000 straight through
        main.borrow_mut().out_mode(ports::MEMORY_MODE, MMODE_RAM);
        assert_eq!(mem.read8(0x80c8), main.borrow().ram().read(0x80c8));
    }

    #[test]
    fn test_gvram_banking_respects_owner() {
        let (mem, main) = setup();
        mem.write8(0xc000, 0x11);
        main.borrow_mut().out_gvram_sel(ports::GVRAM_SEL1, 0);
        assert_eq!(mem.read_owner(0xc000), Some(main.borrow().key()));
        mem.write8(0xc000, 0x22);
        assert_eq!(main.borrow().gvram(1).unwrap().read(0), 0x22);
        main.borrow_mut().out_gvram_main(ports::GVRAM_MAIN, 0);
        assert_eq!(mem.read8(0xc000), 0x11);
        assert_eq!(mem.read_owner(0xc000), None);

        // another device takes the bank; plane selects leave it alone
        let other = DeviceKey::from_raw(0x1000);
        let window = Ram::filled(GVRAM_PLANE_SIZE, 0x77);
        mem.set_owner(GVRAM_BASE, GVRAM_PLANE_SIZE as u32, Some(other));
        mem.set_memorys2(GVRAM_BASE, GVRAM_PLANE_SIZE as u32, &window, 0, other);
        main.borrow_mut().out_gvram_sel(ports::GVRAM_SEL0, 0);
        assert_eq!(mem.read8(0xc000), 0x77);
    }

    #[test]
    fn test_status_round_trip() {
        let (mem, main) = setup();
        main.borrow_mut().out_mode(ports::MEMORY_MODE, MMODE_RAM);
        main.borrow_mut().out_gvram_sel(ports::GVRAM_SEL2, 0);
        mem.write8(0x0100, 0x5a);
        mem.write8(0xc010, 0xa5);

        let mut buf = vec![0u8; main.borrow().status_size()];
        assert!(main.borrow().save_status(&mut buf));

        let (mem2, copy) = setup();
        assert!(copy.borrow_mut().load_status(&buf));
        assert!(!copy.borrow().rom_enabled());
        assert_eq!(copy.borrow().gvram_plane(), Some(2));
        assert_eq!(mem2.read8(0x0100), 0x5a);
        assert_eq!(mem2.read8(0xc010), 0xa5);
    }
}
