use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use crate::{
    device::{read_status, write_status, Descriptor, Device, DeviceId},
    io_bus::Connector,
    memory_bus::MemoryBus,
    ports,
};

/// Block transfer service used by devices that move data without the CPU.
///
/// Both calls return the number of bytes actually moved; a short count means
/// the channel ran dry or is disabled, and the caller treats it as an under-run.
pub trait DmaAccess {
    /// Memory to device.
    fn request_read(&mut self, bank: usize, dest: &mut [u8]) -> usize;
    /// Device to memory.
    fn request_write(&mut self, bank: usize, data: &[u8]) -> usize;
}

const MODE_TC_STOP: u8 = 0x20;
const MODE_AUTO_LOAD: u8 = 0x40;

const XFER_WRITE: u16 = 0b01;
const XFER_READ: u16 = 0b10;

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Pod, Zeroable)]
struct Channel {
    address: u16,
    /// bits 15:14 transfer direction, bits 13:0 byte count - 1
    count: u16,
    base_address: u16,
    base_count: u16,
}

impl Channel {
    fn direction(&self) -> u16 {
        self.count >> 14
    }

    fn length(&self) -> usize {
        (self.count & 0x3fff) as usize + 1
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Pod, Zeroable)]
struct Status {
    channels: [Channel; 4],
    mode: u8,
    tc: u8,
    /// channels that reached terminal count and have nothing left to move
    exhausted: u8,
    /// bit0 flip-flop, bit1 update flag
    flags: u8,
}

/// μPD8257 DMA controller at ports 0x60-0x68.
///
/// Address and count registers are written LSB then MSB through a shared
/// flip-flop. The mode register enables channels (bits 0-3), stops a
/// channel at terminal count (bit 5) and reloads channel 2 from channel 3
/// when it completes (bit 6, used for the text screen).
pub struct Pd8257 {
    mem: Rc<MemoryBus>,
    stat: Status,
}

impl Pd8257 {
    pub const ID: DeviceId = DeviceId::new(b"DMAC");

    const DESCRIPTOR: Descriptor<Pd8257> = Descriptor {
        inputs: &[Pd8257::read_reg],
        outputs: &[Pd8257::write_reg, Pd8257::on_reset],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::input(ports::DMAC_BASE, 0),
        Connector::input(ports::DMAC_BASE + 1, 0),
        Connector::input(ports::DMAC_BASE + 2, 0),
        Connector::input(ports::DMAC_BASE + 3, 0),
        Connector::input(ports::DMAC_BASE + 4, 0),
        Connector::input(ports::DMAC_BASE + 5, 0),
        Connector::input(ports::DMAC_BASE + 6, 0),
        Connector::input(ports::DMAC_BASE + 7, 0),
        Connector::input(ports::DMAC_MODE, 0),
        Connector::output(ports::DMAC_BASE, 0),
        Connector::output(ports::DMAC_BASE + 1, 0),
        Connector::output(ports::DMAC_BASE + 2, 0),
        Connector::output(ports::DMAC_BASE + 3, 0),
        Connector::output(ports::DMAC_BASE + 4, 0),
        Connector::output(ports::DMAC_BASE + 5, 0),
        Connector::output(ports::DMAC_BASE + 6, 0),
        Connector::output(ports::DMAC_BASE + 7, 0),
        Connector::output(ports::DMAC_MODE, 0),
        Connector::output(ports::RESET, 1),
    ];

    pub fn new(mem: Rc<MemoryBus>) -> Self {
        Self {
            mem,
            stat: Status::default(),
        }
    }

    pub fn reset(&mut self) {
        self.stat = Status::default();
    }

    pub fn mode(&self) -> u8 {
        self.stat.mode
    }

    pub fn address(&self, bank: usize) -> u16 {
        self.stat.channels[bank & 3].address
    }

    /// Bytes left on a channel before terminal count.
    pub fn remaining(&self, bank: usize) -> usize {
        let bank = bank & 3;
        if self.stat.exhausted & (1 << bank) != 0 {
            0
        } else {
            self.stat.channels[bank].length()
        }
    }

    fn read_reg(&mut self, port: u32) -> u8 {
        let offset = port - ports::DMAC_BASE;
        if offset >= 8 {
            let mut status = self.stat.tc & 0x0f;
            if self.stat.flags & 2 != 0 {
                status |= 0x10;
            }
            // terminal count flags clear on read, the update flag does not
            self.stat.tc = 0;
            return status;
        }
        let ch = &self.stat.channels[(offset / 2) as usize];
        let reg = if offset & 1 != 0 { ch.count } else { ch.address };
        let byte = if self.stat.flags & 1 != 0 {
            (reg >> 8) as u8
        } else {
            reg as u8
        };
        self.stat.flags ^= 1;
        byte
    }

    fn write_reg(&mut self, port: u32, data: u8) {
        let offset = port - ports::DMAC_BASE;
        if offset >= 8 {
            tracing::debug!("[DMAC] Mode {:02X}", data);
            self.stat.mode = data;
            self.stat.flags = 0;
            self.stat.tc = 0;
            return;
        }
        let bank = (offset / 2) as usize;
        let msb = self.stat.flags & 1 != 0;
        let ch = &mut self.stat.channels[bank];
        let reg = if offset & 1 != 0 {
            &mut ch.count
        } else {
            &mut ch.address
        };
        *reg = if msb {
            (*reg & 0x00ff) | ((data as u16) << 8)
        } else {
            (*reg & 0xff00) | data as u16
        };
        ch.base_address = ch.address;
        ch.base_count = ch.count;
        if offset & 1 != 0 {
            self.stat.exhausted &= !(1 << bank);
        }
        self.stat.flags ^= 1;
        if msb {
            tracing::trace!(
                "[DMAC] Ch{} addr {:04X} count {:04X}",
                bank,
                ch.address,
                ch.count
            );
        }
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.reset();
    }

    /// Work out how much of a request channel `bank` can serve.
    fn claim(&self, bank: usize, want: usize, direction: u16) -> Option<(u16, usize)> {
        if bank > 3 || self.stat.mode & (1 << bank) == 0 {
            return None;
        }
        let ch = &self.stat.channels[bank];
        if ch.direction() != direction {
            tracing::trace!("[DMAC] Ch{} not set up for direction {}", bank, direction);
            return None;
        }
        let n = want.min(self.remaining(bank));
        (n > 0).then_some((ch.address, n))
    }

    fn advance(&mut self, bank: usize, n: usize) {
        let left = self.remaining(bank) - n;
        let ch = &mut self.stat.channels[bank];
        ch.address = ch.address.wrapping_add(n as u16);
        if left > 0 {
            ch.count = (ch.count & 0xc000) | (left as u16 - 1);
            return;
        }

        self.stat.tc |= 1 << bank;
        if bank == 2 && self.stat.mode & MODE_AUTO_LOAD != 0 {
            let reload = self.stat.channels[3];
            let ch = &mut self.stat.channels[2];
            ch.address = reload.base_address;
            ch.count = reload.base_count;
            self.stat.flags |= 2;
            return;
        }
        self.stat.exhausted |= 1 << bank;
        if self.stat.mode & MODE_TC_STOP != 0 {
            self.stat.mode &= !(1 << bank);
        }
    }
}

impl DmaAccess for Pd8257 {
    fn request_read(&mut self, bank: usize, dest: &mut [u8]) -> usize {
        let Some((addr, n)) = self.claim(bank, dest.len(), XFER_READ) else {
            return 0;
        };
        for (i, b) in dest[..n].iter_mut().enumerate() {
            *b = self.mem.read8(addr.wrapping_add(i as u16) as u32);
        }
        self.advance(bank, n);
        n
    }

    fn request_write(&mut self, bank: usize, data: &[u8]) -> usize {
        let Some((addr, n)) = self.claim(bank, data.len(), XFER_WRITE) else {
            return 0;
        };
        for (i, b) in data[..n].iter().enumerate() {
            self.mem.write8(addr.wrapping_add(i as u16) as u32, *b);
        }
        self.advance(bank, n);
        n
    }
}

impl Device for Pd8257 {
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
        std::mem::size_of::<Status>()
    }

    fn save_status(&self, buf: &mut [u8]) -> bool {
        write_status(&self.stat, buf)
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        match read_status::<Status>(buf) {
            Some(stat) => {
                self.stat = stat;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_bus::Ram;

    fn setup() -> (Pd8257, Ram) {
        let mem = Rc::new(MemoryBus::default());
        let ram = Ram::new(0x10000);
        mem.set_memorys(0, 0x10000, &ram, 0);
        (Pd8257::new(mem), ram)
    }

    fn program(dma: &mut Pd8257, bank: u32, addr: u16, count: u16) {
        let base = ports::DMAC_BASE + bank * 2;
        dma.write_reg(base, addr as u8);
        dma.write_reg(base, (addr >> 8) as u8);
        dma.write_reg(base + 1, count as u8);
        dma.write_reg(base + 1, (count >> 8) as u8);
    }

    #[test]
    fn test_flip_flop_registers() {
        let (mut dma, _) = setup();
        program(&mut dma, 1, 0xf3c8, 0x8bbf);
        assert_eq!(dma.read_reg(ports::DMAC_BASE + 2), 0xc8);
        assert_eq!(dma.read_reg(ports::DMAC_BASE + 2), 0xf3);
        assert_eq!(dma.read_reg(ports::DMAC_BASE + 3), 0xbf);
        assert_eq!(dma.read_reg(ports::DMAC_BASE + 3), 0x8b);
    }

    #[test]
    fn test_read_until_terminal_count() {
        let (mut dma, ram) = setup();
        ram.load(0x1000, &[1, 2, 3, 4]);
        program(&mut dma, 2, 0x1000, 0x8000 | 3);
        dma.write_reg(ports::DMAC_MODE, 0x04 | MODE_TC_STOP);

        let mut buf = [0u8; 3];
        assert_eq!(dma.request_read(2, &mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(dma.request_read(2, &mut buf), 1);
        assert_eq!(buf[0], 4);
        assert_eq!(dma.read_reg(ports::DMAC_MODE) & 0x04, 0x04);
        assert_eq!(dma.mode() & 0x04, 0);
        assert_eq!(dma.request_read(2, &mut buf), 0);
    }

    #[test]
    fn test_disabled_or_wrong_direction_underruns() {
        let (mut dma, _) = setup();
        program(&mut dma, 1, 0x2000, 0x4000 | 15);
        let mut buf = [0u8; 4];
        assert_eq!(dma.request_write(1, &buf), 0);
        dma.write_reg(ports::DMAC_MODE, 0x02);
        assert_eq!(dma.request_read(1, &mut buf), 0);
        buf.copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(dma.request_write(1, &buf), 4);
    }

    #[test]
    fn test_auto_load_reloads_channel_two() {
        let (mut dma, ram) = setup();
        ram.load(0x3000, &[0xaa, 0xbb]);
        program(&mut dma, 2, 0x3000, 0x8000 | 1);
        program(&mut dma, 3, 0x3000, 0x8000 | 1);
        dma.write_reg(ports::DMAC_MODE, 0x04 | MODE_AUTO_LOAD);

        let mut buf = [0u8; 2];
        for _ in 0..3 {
            assert_eq!(dma.request_read(2, &mut buf), 2);
            assert_eq!(buf, [0xaa, 0xbb]);
        }
        assert_eq!(dma.read_reg(ports::DMAC_MODE) & 0x10, 0x10);
    }

    #[test]
    fn test_state_round_trip() {
        let (mut dma, _) = setup();
        program(&mut dma, 0, 0x1234, 0x8010);
        dma.write_reg(ports::DMAC_MODE, 0x01);
        let mut blob = vec![0; dma.status_size()];
        assert!(dma.save_status(&mut blob));

        let (mut other, _) = setup();
        assert!(other.load_status(&blob));
        assert_eq!(other.address(0), 0x1234);
        assert_eq!(other.remaining(0), 0x11);
        assert_eq!(other.mode(), 0x01);
    }
}
