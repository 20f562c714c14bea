//! I/O port map.
//!
//! Ports below 0x100 are the CPU-visible ones. Ports above are virtual signal
//! lines: devices notify each other by writing to them on the same bus.

/// Write: bit0 80 columns, bit1 monochrome, bit3 cassette motor.
pub const SYSTEM_CTRL: u32 = 0x30;
/// Write: bit1 selects 64K RAM mode (ROM banked out).
pub const MEMORY_MODE: u32 = 0x31;
/// Read: bit5 VRTC. Write: bit5 beep, bit7 sing.
pub const SYSTEM_STATUS: u32 = 0x40;

pub const CRTC_PARAM: u32 = 0x50;
pub const CRTC_CMD: u32 = 0x51;

/// Writes to 0x5c..0x5e select a graphics plane, 0x5f selects main RAM.
pub const GVRAM_SEL0: u32 = 0x5c;
pub const GVRAM_SEL1: u32 = 0x5d;
pub const GVRAM_SEL2: u32 = 0x5e;
pub const GVRAM_MAIN: u32 = 0x5f;

/// Channel n address at `DMAC_BASE + 2n`, count at `DMAC_BASE + 2n + 1`.
pub const DMAC_BASE: u32 = 0x60;
pub const DMAC_MODE: u32 = 0x68;

/// Text window offset (high byte of the 1K window address).
pub const TEXT_WINDOW: u32 = 0x70;

pub const CDIF_CTRL: u32 = 0x90;
pub const CDIF_DATA: u32 = 0x91;
/// Bit0 enables DMA transfers for read data.
pub const CDIF_DMA: u32 = 0x94;

/// Machine reset. Every device clearing state on reset listens here.
pub const RESET: u32 = 0x100;
/// VRTC line from the CRTC, 1 during vertical retrace.
pub const VRTC: u32 = 0x101;
/// Bytes read off the cassette, towards the serial interface.
pub const CMT_DATA: u32 = 0x102;

/// Size of the port space including the virtual lines.
pub const PORT_COUNT: usize = 0x110;

pub const SYS_80COLUMN: u8 = 0x01;
pub const SYS_MONO: u8 = 0x02;
pub const SYS_MOTOR: u8 = 0x08;

pub const STATUS_VRTC: u8 = 0x20;
pub const STATUS_BEEP: u8 = 0x20;
pub const STATUS_SING: u8 = 0x80;
