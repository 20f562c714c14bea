use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use bytemuck::{Pod, Zeroable};
use derivative::Derivative;

use crate::{
    device::{read_status, write_status, Descriptor, Device, DeviceId},
    dma::DmaAccess,
    io_bus::{active, Connector, IoBus},
    ports,
    scheduler::{EventHandle, Scheduler, TimeFn},
};

pub const MAX_COLS: usize = 80;
pub const MAX_ROWS: usize = 64;

/// Raster time in 15 kHz (200 line) mode.
pub const LINE_NS_15K: i64 = 62_580;
/// Raster time in 24 kHz (400 line) mode.
pub const LINE_NS_24K: i64 = 40_280;
pub const FRAME_LINES_15K: i64 = 262;
pub const FRAME_LINES_24K: i64 = 448;

/// DMA channel feeding the text screen.
pub const DMA_BANK: usize = 2;

pub const STATUS_LPEN: u8 = 0x01;
/// Special control byte seen.
pub const STATUS_N: u8 = 0x02;
pub const STATUS_E: u8 = 0x04;
/// DMA under-run.
pub const STATUS_U: u8 = 0x08;
/// Video enable.
pub const STATUS_VE: u8 = 0x10;

const ATTR_SPECIAL: u8 = 0x20;
const ATTR_COLOR: u8 = 0x40;
const ATTR_NONE: u8 = 0x80;

// internal attribute byte
pub const A_REVERSE: u8 = 0x01;
pub const A_SECRET: u8 = 0x02;
pub const A_UPPERLINE: u8 = 0x04;
pub const A_UNDERLINE: u8 = 0x08;
pub const A_GRAPHIC: u8 = 0x10;
/// White, no decoration.
pub const A_DEFAULT: u8 = 0xe0;

/// Empty cell: NUL character in the default attribute.
pub const BLANK: u16 = (A_DEFAULT as u16) << 8;

const FRAME_DMA_STOP: u8 = 0x01;
const FRAME_HIDE: u8 = 0x02;

const NO_COMMAND: u8 = 0xff;

/// Decode a μPD3301 attribute code into the internal attribute byte.
///
/// In color mode a code with bit 3 set is a color specifier that replaces
/// the color bits and keeps the decoration bits of `attr`; any other code
/// keeps the color and replaces the decoration. Mono codes always carry
/// every decoration bit. Blinking text is made secret during the off phase.
pub fn decode_attr(code: u8, attr: u8, color: bool, blink_off: bool) -> u8 {
    let mut attr = if !color {
        0xe0 | ((code >> 3) & 0x10) | ((code >> 2) & 0x0d) | ((code & 1) << 1)
    } else if code & 0x08 != 0 {
        return (attr & 0x0f) | (code & 0xf0);
    } else {
        (attr & 0xf0) | ((code >> 2) & 0x0d) | ((code & 1) << 1)
    };
    if code & 0x02 != 0 && blink_off {
        attr |= A_SECRET;
    }
    attr
}

/// Changed area of the screen, in character cells, end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Region {
    fn union(self, other: Region) -> Region {
        Region {
            top: self.top.min(other.top),
            bottom: self.bottom.max(other.bottom),
            left: self.left.min(other.left),
            right: self.right.max(other.right),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub x: u8,
    pub y: u8,
    pub block: bool,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct State {
    status: u8,
    cmd: u8,
    pcount: u8,
    width: u8,
    height: u8,
    lines_per_char: u8,
    blink_rate: u8,
    cursor_type: u8,
    skip_line: u8,
    vretrace: u8,
    hretrace: u8,
    attr_mode: u8,
    attr_per_line: u8,
    dma_char: u8,
    reverse: u8,
    int_mask: u8,
    cursor_on: u8,
    cursor_x: u8,
    cursor_y: u8,
    sys_ctrl: u8,
    bank: u8,
    row: u8,
    vrtc: u8,
    blink_count: u8,
    frame_flags: u8,
    row_attr: u8,
}

impl Default for State {
    fn default() -> Self {
        Self {
            status: 0,
            cmd: NO_COMMAND,
            pcount: 0,
            width: 80,
            height: 25,
            lines_per_char: 8,
            blink_rate: 1,
            cursor_type: 0,
            skip_line: 0,
            vretrace: 7,
            hretrace: 0,
            attr_mode: ATTR_COLOR,
            attr_per_line: 20,
            dma_char: 0,
            reverse: 0,
            int_mask: 0,
            cursor_on: 0,
            cursor_x: 0,
            cursor_y: 0,
            sys_ctrl: ports::SYS_80COLUMN,
            bank: 0,
            row: 0,
            vrtc: 0,
            blink_count: 0,
            frame_flags: 0,
            row_attr: A_DEFAULT,
        }
    }
}

/// μPD3301 CRT controller.
///
/// The host programs it through a command port (0x51) and a parameter port
/// (0x50). Frame timing runs off scheduler events: `start_display` opens a
/// frame, `expand_line` fetches one character row per row time over DMA
/// channel 2, and the last row ends the frame, raises VRTC and flips the
/// double-buffered cell cache.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Crtc {
    #[derivative(Debug = "ignore")]
    this: Weak<RefCell<Crtc>>,
    #[derivative(Debug = "ignore")]
    sched: Rc<Scheduler>,
    #[derivative(Debug = "ignore")]
    bus: Rc<IoBus>,
    #[derivative(Debug = "ignore")]
    dma: Rc<RefCell<dyn DmaAccess>>,
    st: State,
    high_resolution: bool,
    #[derivative(Debug = "ignore")]
    cache: [Vec<u16>; 2],
    event: Option<EventHandle>,
    /// Region changed in the frame being expanded.
    pending: Option<Region>,
    /// Region changed since the renderer last asked.
    dirty: Option<Region>,
    refresh_all: bool,
    frames: u64,
}

impl Crtc {
    pub const ID: DeviceId = DeviceId::new(b"CRTC");

    const DESCRIPTOR: Descriptor<Crtc> = Descriptor {
        inputs: &[Crtc::in_param, Crtc::in_status, Crtc::in_vrtc],
        outputs: &[
            Crtc::out_param,
            Crtc::out_command,
            Crtc::out_sys_ctrl,
            Crtc::on_reset,
        ],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::input(ports::CRTC_PARAM, 0),
        Connector::input(ports::CRTC_CMD, 1),
        Connector::input(ports::SYSTEM_STATUS, 2),
        Connector::output(ports::CRTC_PARAM, 0),
        Connector::output(ports::CRTC_CMD, 1),
        Connector::output(ports::SYSTEM_CTRL, 2),
        Connector::output(ports::RESET, 3),
        Connector::sync(ports::CRTC_PARAM),
        Connector::sync(ports::CRTC_CMD),
    ];

    pub fn new(
        sched: Rc<Scheduler>,
        bus: Rc<IoBus>,
        dma: Rc<RefCell<dyn DmaAccess>>,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                sched,
                bus,
                dma,
                st: State::default(),
                high_resolution: false,
                cache: [vec![BLANK; MAX_COLS * MAX_ROWS], vec![BLANK; MAX_COLS * MAX_ROWS]],
                event: None,
                pending: None,
                dirty: None,
                refresh_all: true,
                frames: 0,
            })
        })
    }

    /// Return to power-on register values and restart frame timing.
    pub fn reset(&mut self) {
        tracing::debug!("[CRTC] Reset");
        let sys_ctrl = self.st.sys_ctrl;
        self.st = State {
            sys_ctrl,
            ..State::default()
        };
        self.set_vrtc(false);
        self.refresh_all = true;
        self.restart_timing();
    }

    /// Cancel pending frame events and open a fresh frame one row from now.
    pub fn restart_timing(&mut self) {
        self.st.row = 0;
        let ns = self.row_ns();
        self.schedule(ns, Crtc::start_display, false);
    }

    pub fn set_high_resolution(&mut self, high: bool) {
        if self.high_resolution != high {
            tracing::info!("[CRTC] {} kHz mode", if high { 24 } else { 15 });
            self.high_resolution = high;
            self.refresh_all = true;
        }
    }

    pub fn status(&self) -> u8 {
        self.st.status
    }

    pub fn vrtc(&self) -> bool {
        self.st.vrtc != 0
    }

    pub fn width(&self) -> usize {
        self.st.width as usize
    }

    pub fn height(&self) -> usize {
        self.st.height as usize
    }

    pub fn lines_per_char(&self) -> usize {
        self.st.lines_per_char as usize
    }

    pub fn is_80_columns(&self) -> bool {
        self.st.sys_ctrl & ports::SYS_80COLUMN != 0
    }

    pub fn is_mono(&self) -> bool {
        self.st.sys_ctrl & ports::SYS_MONO != 0
    }

    /// Frames completed since power-on.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn line_ns(&self) -> i64 {
        if self.high_resolution {
            LINE_NS_24K
        } else {
            LINE_NS_15K
        }
    }

    pub fn row_ns(&self) -> i64 {
        self.line_ns() * self.st.lines_per_char as i64
    }

    pub fn frame_ns(&self) -> i64 {
        let lines = if self.high_resolution {
            FRAME_LINES_24K
        } else {
            FRAME_LINES_15K
        };
        self.line_ns() * lines
    }

    /// Vertical retrace length: the part of the frame the visible rows leave.
    pub fn vretrace_ns(&self) -> i64 {
        let rows = self.row_ns() * self.st.height as i64;
        (self.frame_ns() - rows).max(self.row_ns())
    }

    /// Cells of the last completed frame, `MAX_COLS` per row, char | attr << 8.
    pub fn frame(&self) -> &[u16] {
        &self.cache[(self.st.bank ^ 1) as usize]
    }

    pub fn cell(&self, x: usize, y: usize) -> u16 {
        self.frame()[y * MAX_COLS + x]
    }

    /// Take the area changed since the last call.
    pub fn take_dirty(&mut self) -> Option<Region> {
        self.dirty.take()
    }

    /// Cursor to draw, if it is on and in the visible blink phase.
    pub fn cursor(&self) -> Option<Cursor> {
        if self.st.cursor_on == 0 || self.st.status & STATUS_VE == 0 {
            return None;
        }
        let blinking = self.st.cursor_type & 1 != 0;
        if blinking && self.blink_off() {
            return None;
        }
        Some(Cursor {
            x: self.st.cursor_x,
            y: self.st.cursor_y,
            block: self.st.cursor_type & 2 != 0,
        })
    }

    /// Attribute decode with the current color mode and blink phase.
    pub fn change_attr(&self, code: u8, attr: u8) -> u8 {
        decode_attr(
            code,
            attr,
            self.st.attr_mode & ATTR_COLOR != 0,
            self.blink_off(),
        )
    }

    fn blink_period(&self) -> u8 {
        32 * (self.st.blink_rate + 1)
    }

    fn blink_off(&self) -> bool {
        let period = self.blink_period() as u32;
        self.st.blink_count as u32 >= period * 3 / 4
    }

    fn schedule(&mut self, ns: i64, func: TimeFn<Crtc>, repeat: bool) {
        if let Some(handle) = self.event.take() {
            self.sched.del_event(handle);
        }
        self.event = Some(
            self.sched
                .add_event_ns(ns.max(1), &self.this, func, 0, repeat),
        );
    }

    fn set_vrtc(&mut self, on: bool) {
        self.st.vrtc = on as u8;
        self.bus.output(ports::VRTC, on as u8);
    }

    // -- ports --

    /// Light pen position. No pen is wired, so it reads as zero.
    fn in_param(&mut self, _port: u32) -> u8 {
        0
    }

    fn in_status(&mut self, _port: u32) -> u8 {
        self.st.status
    }

    fn in_vrtc(&mut self, _port: u32) -> u8 {
        let data = if self.st.vrtc != 0 {
            ports::STATUS_VRTC
        } else {
            0
        };
        active(data, ports::STATUS_VRTC)
    }

    fn out_command(&mut self, _port: u32, data: u8) {
        self.st.cmd = data >> 5;
        self.st.pcount = 0;
        match self.st.cmd {
            0 => {
                tracing::debug!("[CRTC] RESET");
                self.st.status &= !STATUS_VE;
                self.refresh_all = true;
            }
            1 => {
                self.st.reverse = data & 1;
                self.st.status = (self.st.status | STATUS_VE) & !STATUS_U;
                self.refresh_all = true;
                tracing::debug!("[CRTC] START DISPLAY reverse={}", data & 1);
            }
            2 => self.st.int_mask = data & 3,
            3 => self.st.status &= !STATUS_LPEN,
            4 => self.st.cursor_on = data & 1,
            5 => self.st.status &= !(STATUS_N | STATUS_E),
            6 => self.st.status &= !(STATUS_N | STATUS_E | STATUS_U | STATUS_LPEN),
            _ => tracing::trace!("[CRTC] Ignored command {:02X}", data),
        }
    }

    fn out_param(&mut self, _port: u32, data: u8) {
        match (self.st.cmd, self.st.pcount) {
            (0, 0) => {
                self.st.dma_char = data >> 7;
                self.st.width = ((data & 0x7f) + 2).min(MAX_COLS as u8);
            }
            (0, 1) => {
                self.st.blink_rate = data >> 6;
                self.st.height = ((data & 0x3f) + 1).min(MAX_ROWS as u8);
            }
            (0, 2) => {
                self.st.skip_line = data >> 7;
                self.st.cursor_type = (data >> 5) & 3;
                self.st.lines_per_char = (data & 0x1f) + 1;
            }
            (0, 3) => {
                self.st.vretrace = (data >> 5) + 1;
                self.st.hretrace = (data & 0x1f) + 2;
            }
            (0, 4) => {
                self.st.attr_mode = data & 0xe0;
                self.st.attr_per_line = (data & 0x1f) + 1;
                tracing::debug!(
                    "[CRTC] {}x{} lines/char={} attr mode={:02X} attrs/line={}",
                    self.st.width,
                    self.st.height,
                    self.st.lines_per_char,
                    self.st.attr_mode,
                    self.st.attr_per_line
                );
            }
            (4, 0) => self.st.cursor_x = data,
            (4, 1) => self.st.cursor_y = data,
            _ => {
                tracing::trace!(
                    "[CRTC] Stray parameter {:02X} (cmd {:02X} #{})",
                    data,
                    self.st.cmd,
                    self.st.pcount
                );
                return;
            }
        }
        self.st.pcount += 1;
    }

    fn out_sys_ctrl(&mut self, _port: u32, data: u8) {
        let mask = ports::SYS_80COLUMN | ports::SYS_MONO;
        if (self.st.sys_ctrl ^ data) & mask != 0 {
            self.refresh_all = true;
        }
        self.st.sys_ctrl = data;
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.reset();
    }

    // -- frame timing --

    fn start_display(&mut self, _arg: u32) {
        self.set_vrtc(false);
        self.st.row = 0;
        self.st.frame_flags = 0;
        self.st.row_attr = A_DEFAULT;
        self.st.blink_count = (self.st.blink_count + 1) % self.blink_period();
        let ns = self.row_ns();
        self.schedule(ns, Crtc::expand_line, true);
    }

    fn expand_line(&mut self, _arg: u32) {
        let row = self.st.row as usize;
        if row < self.st.height as usize {
            self.expand_line_sub(row);
        }
        self.st.row += 1;
        if self.st.row as usize >= self.st.height as usize {
            self.expand_line_end();
        }
    }

    fn expand_line_end(&mut self) {
        self.set_vrtc(true);
        self.frames += 1;

        let frame = if self.refresh_all {
            self.refresh_all = false;
            Some(Region {
                top: 0,
                bottom: self.st.height as usize,
                left: 0,
                right: self.st.width as usize,
            })
        } else {
            self.pending
        };
        self.pending = None;
        if let Some(region) = frame {
            self.dirty = Some(match self.dirty {
                Some(d) => d.union(region),
                None => region,
            });
        }

        self.st.bank ^= 1;
        let ns = self.vretrace_ns();
        self.schedule(ns, Crtc::start_display, false);
    }

    fn row_bytes(&self) -> usize {
        let attrs = if self.st.attr_mode & ATTR_NONE != 0 {
            0
        } else {
            self.st.attr_per_line as usize * 2
        };
        self.st.width as usize + attrs
    }

    /// Fetch and decode one character row into the current cache bank.
    fn expand_line_sub(&mut self, row: usize) {
        let width = self.st.width as usize;
        let mut cells = [BLANK; MAX_COLS];

        let fetching = self.st.status & STATUS_VE != 0
            && self.st.frame_flags & (FRAME_DMA_STOP | FRAME_HIDE) == 0;
        if fetching {
            let n = self.row_bytes();
            let mut buf = [0u8; 256];
            let got = self.dma.borrow_mut().request_read(DMA_BANK, &mut buf[..n]);
            if got < n {
                tracing::warn!("[CRTC] DMA under-run on row {} ({}/{} bytes)", row, got, n);
                self.st.status = (self.st.status | STATUS_U) & !STATUS_VE;
                self.st.frame_flags |= FRAME_DMA_STOP;
                self.refresh_all = true;
            } else {
                self.decode_row(&buf[..n], &mut cells[..width]);
            }
        }

        let bank = self.st.bank as usize;
        let start = row * MAX_COLS;
        let prev = &self.cache[bank ^ 1][start..start + width];
        let first = prev.iter().zip(&cells[..width]).position(|(a, b)| a != b);
        if let Some(left) = first {
            let right = width
                - prev
                    .iter()
                    .zip(&cells[..width])
                    .rev()
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
            let region = Region {
                top: row,
                bottom: row + 1,
                left,
                right,
            };
            self.pending = Some(match self.pending {
                Some(p) => p.union(region),
                None => region,
            });
        }
        self.cache[bank][start..start + width].copy_from_slice(&cells[..width]);
    }

    fn decode_row(&mut self, buf: &[u8], cells: &mut [u16]) {
        let width = cells.len();
        let (chars, attrs) = buf.split_at(width);

        let mut pairs: Vec<(u8, u8)> = attrs.chunks_exact(2).map(|p| (p[0], p[1])).collect();
        if self.st.attr_mode & ATTR_SPECIAL != 0 {
            if let Some(&(_, code)) = pairs.last() {
                if code & 0xfc == 0x60 {
                    tracing::trace!("[CRTC] Special control {:02X}", code);
                    self.st.status |= STATUS_N;
                    self.st.frame_flags |= code & (FRAME_DMA_STOP | FRAME_HIDE);
                    pairs.pop();
                }
            }
        }
        pairs.sort_by_key(|&(pos, _)| pos & 0x7f);

        let mut attr = self.st.row_attr;
        let mut next = pairs.iter().peekable();
        let hide = self.st.frame_flags & FRAME_HIDE != 0;
        for (x, cell) in cells.iter_mut().enumerate() {
            while let Some(&&(pos, code)) = next.peek() {
                if (pos & 0x7f) as usize > x {
                    break;
                }
                attr = self.change_attr(code, attr);
                next.next();
            }
            let shown = if self.st.reverse != 0 {
                attr ^ A_REVERSE
            } else {
                attr
            };
            *cell = if hide {
                BLANK
            } else {
                chars[x] as u16 | (shown as u16) << 8
            };
        }
        // attributes past the last column still take effect for the next row
        for &(_, code) in next {
            attr = self.change_attr(code, attr);
        }
        self.st.row_attr = attr;
    }
}

impl Device for Crtc {
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
        std::mem::size_of::<State>()
    }

    fn save_status(&self, buf: &mut [u8]) -> bool {
        write_status(&self.st, buf)
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        let Some(st) = read_status::<State>(buf) else {
            return false;
        };
        self.st = st;
        self.refresh_all = true;
        self.pending = None;
        let vrtc = self.st.vrtc != 0;
        self.bus.output(ports::VRTC, vrtc as u8);
        if vrtc {
            let ns = self.vretrace_ns();
            self.schedule(ns, Crtc::start_display, false);
        } else {
            self.restart_timing();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_attribute_vector() {
        assert_eq!(decode_attr(3, 4, false, false), 0xe2);
        assert_eq!(decode_attr(3, 4, false, true), 0xe2);
    }

    #[test]
    fn test_color_attribute_vectors() {
        assert_eq!(decode_attr(0x04, 0, true, false), 0x01);
        assert_eq!(decode_attr(0xe8, 0x01, true, false), 0xe1);
        // a decoration code keeps the color bits
        assert_eq!(decode_attr(0x20, 0x80, true, false), 0x88);
    }

    #[test]
    fn test_blink_makes_secret_in_off_phase() {
        assert_eq!(decode_attr(0x02, 0xe0, true, false), 0xe0);
        assert_eq!(decode_attr(0x02, 0xe0, true, true), 0xe0 | A_SECRET);
    }

    #[test]
    fn test_region_union() {
        let a = Region {
            top: 1,
            bottom: 2,
            left: 5,
            right: 10,
        };
        let b = Region {
            top: 4,
            bottom: 5,
            left: 0,
            right: 3,
        };
        assert_eq!(
            a.union(b),
            Region {
                top: 1,
                bottom: 5,
                left: 0,
                right: 10
            }
        );
    }
}
