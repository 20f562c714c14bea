use crate::memory_bus::MemoryBus;

/// Frames per second of CD audio time.
pub const CD_FRAMES: u32 = 75;
/// LBA 0 sits two seconds into the disc.
pub const MSF_OFFSET: u32 = 150;

pub fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

pub fn from_bcd(bcd: u8) -> u8 {
    (bcd >> 4) * 10 + (bcd & 0x0f)
}

/// Minute/second/frame of an LBA, in binary.
pub fn lba_to_msf(lba: u32) -> (u8, u8, u8) {
    let t = lba + MSF_OFFSET;
    let m = t / (60 * CD_FRAMES);
    let s = (t / CD_FRAMES) % 60;
    let f = t % CD_FRAMES;
    (m.min(99) as u8, s as u8, f as u8)
}

pub fn msf_to_lba(m: u8, s: u8, f: u8) -> u32 {
    ((m as u32 * 60 + s as u32) * CD_FRAMES + f as u32).saturating_sub(MSF_OFFSET)
}

/// MSF of an LBA as three BCD bytes.
pub fn lba_to_bcd_msf(lba: u32) -> [u8; 3] {
    let (m, s, f) = lba_to_msf(lba);
    [to_bcd(m), to_bcd(s), to_bcd(f)]
}

/// Dump `start..end` of the bus address space, 16 bytes per line.
pub fn hexdump(mem: &MemoryBus, start: u32, end: u32) -> String {
    let mut str = String::new();
    let mut addr = start;
    while addr < end {
        let mut line = format!("{:04x}: ", addr);
        let mut chars = String::new();
        for _ in 0..16 {
            if addr < end {
                let byte = mem.read8(addr);
                line.push_str(&format!("{:02x} ", byte));
                let c = byte as char;
                chars.push(if c.is_ascii_graphic() || c == ' ' {
                    c
                } else {
                    '.'
                });
                addr += 1;
            }
        }

        let dump_line = format!("{:<54} {}\n", line, chars);
        str.push_str(&dump_line);
    }

    str
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_bus::Ram;

    #[test]
    fn test_bcd() {
        assert_eq!(to_bcd(42), 0x42);
        assert_eq!(from_bcd(0x99), 99);
        assert_eq!(from_bcd(to_bcd(7)), 7);
    }

    #[test]
    fn test_msf() {
        assert_eq!(lba_to_msf(0), (0, 2, 0));
        assert_eq!(lba_to_bcd_msf(4350), [0x01, 0x00, 0x00]);
        assert_eq!(msf_to_lba(1, 0, 0), 4350);
    }

    #[test]
    fn test_hexdump() {
        let mem = MemoryBus::default();
        let ram = Ram::from_bytes(b"PC-8801 mkII SR ");
        mem.set_read_memory(0, &ram, 0);
        let dump = hexdump(&mem, 0, 16);
        assert!(dump.starts_with("0000: 50 43 2d"));
        assert!(dump.trim_end().ends_with("PC-8801 mkII SR"));
    }
}
