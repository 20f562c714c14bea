use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use bytemuck::{Pod, Zeroable};
use derivative::Derivative;

use crate::{
    device::{read_status, write_status, Descriptor, Device, DeviceId},
    error::TapeError,
    io_bus::{Connector, IoBus},
    ports,
    scheduler::{EventHandle, Scheduler},
};

pub const T88_MAGIC: &[u8; 24] = b"PC-8801 Tape Image(T88)\0";
pub const T88_VERSION: u16 = 0x0100;

/// Tape time base.
pub const TICK_HZ: i64 = 4800;
pub const TICKS_PER_BYTE_1200: i64 = 44;
pub const TICKS_PER_BYTE_600: i64 = 88;
/// Data type written at 600 baud.
pub const TYPE_600BAUD: u16 = 0x01cc;
/// Shortest pause kept over a motor off/on cycle.
pub const MIN_RESUME_TICKS: i64 = 10;

const TAG_END: u16 = 0;
const TAG_VERSION: u16 = 1;
const TAG_BLANK: u16 = 0x100;
const TAG_DATA: u16 = 0x101;
const TAG_SPACE: u16 = 0x102;
const TAG_MARK: u16 = 0x103;

pub fn ticks_to_ns(ticks: i64) -> i64 {
    ticks * 1_000_000_000 / TICK_HZ
}

pub fn ns_to_ticks(ns: i64) -> i64 {
    ns * TICK_HZ / 1_000_000_000
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagKind {
    Version(u16),
    Blank,
    Space,
    Mark,
    Data { kind: u16, bytes: Vec<u8> },
    End,
}

/// One timed record of a T88 image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub kind: TagKind,
    /// Start position in ticks.
    pub pos: u32,
    /// Length in ticks.
    pub tick: u32,
}

impl Tag {
    fn ticks_per_byte(&self) -> i64 {
        match self.kind {
            TagKind::Data {
                kind: TYPE_600BAUD, ..
            } => TICKS_PER_BYTE_600,
            _ => TICKS_PER_BYTE_1200,
        }
    }
}

fn u16_at(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Split a T88 image into tags. Parsing stops at the End tag; unknown tag
/// ids are skipped.
pub fn parse_t88(image: &[u8]) -> Result<Vec<Tag>, TapeError> {
    if image.get(..T88_MAGIC.len()) != Some(&T88_MAGIC[..]) {
        return Err(TapeError::BadMagic);
    }
    let mut tags = Vec::new();
    let mut at = T88_MAGIC.len();
    loop {
        let (Some(id), Some(len)) = (u16_at(image, at), u16_at(image, at + 2)) else {
            return Err(TapeError::Truncated(at));
        };
        let body = image
            .get(at + 4..at + 4 + len as usize)
            .ok_or(TapeError::Truncated(at))?;
        let timed = |kind| -> Result<Tag, TapeError> {
            Ok(Tag {
                kind,
                pos: u32_at(body, 0).ok_or(TapeError::Truncated(at))?,
                tick: u32_at(body, 4).ok_or(TapeError::Truncated(at))?,
            })
        };
        match id {
            TAG_END => {
                tags.push(Tag {
                    kind: TagKind::End,
                    pos: 0,
                    tick: 0,
                });
                return Ok(tags);
            }
            TAG_VERSION => tags.push(Tag {
                kind: TagKind::Version(u16_at(body, 0).ok_or(TapeError::Truncated(at))?),
                pos: 0,
                tick: 0,
            }),
            TAG_BLANK => tags.push(timed(TagKind::Blank)?),
            TAG_SPACE => tags.push(timed(TagKind::Space)?),
            TAG_MARK => tags.push(timed(TagKind::Mark)?),
            TAG_DATA => {
                let length = u16_at(body, 8).ok_or(TapeError::Truncated(at))? as usize;
                let kind = u16_at(body, 10).ok_or(TapeError::Truncated(at))?;
                let bytes = body
                    .get(12..12 + length)
                    .ok_or(TapeError::Truncated(at))?
                    .to_vec();
                tags.push(timed(TagKind::Data { kind, bytes })?);
            }
            other => tracing::debug!("[CMT] Skipping unknown tag {:04X}", other),
        }
        at += 4 + len as usize;
    }
}

/// Build a T88 image from tags. Version and End tags are added.
pub fn build_t88(tags: &[Tag]) -> Vec<u8> {
    let mut out = T88_MAGIC.to_vec();
    let mut push = |id: u16, body: &[u8]| {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(body);
    };
    push(TAG_VERSION, &T88_VERSION.to_le_bytes());
    for tag in tags {
        let mut body = Vec::new();
        body.extend_from_slice(&tag.pos.to_le_bytes());
        body.extend_from_slice(&tag.tick.to_le_bytes());
        let id = match &tag.kind {
            TagKind::Blank => TAG_BLANK,
            TagKind::Space => TAG_SPACE,
            TagKind::Mark => TAG_MARK,
            TagKind::Data { kind, bytes } => {
                body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                body.extend_from_slice(&kind.to_le_bytes());
                body.extend_from_slice(bytes);
                TAG_DATA
            }
            TagKind::Version(_) | TagKind::End => continue,
        };
        push(id, &body);
    }
    push(TAG_END, &[]);
    out
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct State {
    cursor: u32,
    offset: u32,
    /// Ticks left on the interrupted timer, 0 for none.
    remaining: u32,
    motor: u32,
}

/// Cassette deck playing a T88 image.
///
/// The tag cursor advances on scheduler timers: a data tag emits one byte per
/// timer on the `CMT_DATA` line, other tags just take their length in ticks.
/// Turning the motor off freezes the pending timer, turning it back on
/// resumes it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TapeManager {
    #[derivative(Debug = "ignore")]
    this: Weak<RefCell<TapeManager>>,
    #[derivative(Debug = "ignore")]
    sched: Rc<Scheduler>,
    #[derivative(Debug = "ignore")]
    bus: Rc<IoBus>,
    #[derivative(Debug = "ignore")]
    tags: Vec<Tag>,
    cursor: usize,
    offset: usize,
    motor: bool,
    remaining: i64,
    event: Option<EventHandle>,
    timer_start: i64,
    timer_ticks: i64,
}

impl TapeManager {
    pub const ID: DeviceId = DeviceId::new(b"TAPE");

    const DESCRIPTOR: Descriptor<TapeManager> = Descriptor {
        inputs: &[],
        outputs: &[TapeManager::out_sys_ctrl, TapeManager::on_reset],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::output(ports::SYSTEM_CTRL, 0),
        Connector::output(ports::RESET, 1),
    ];

    pub fn new(sched: Rc<Scheduler>, bus: Rc<IoBus>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                sched,
                bus,
                tags: Vec::new(),
                cursor: 0,
                offset: 0,
                motor: false,
                remaining: 0,
                event: None,
                timer_start: 0,
                timer_ticks: 0,
            })
        })
    }

    /// Mount an image and rewind it.
    pub fn open(&mut self, image: &[u8]) -> Result<(), TapeError> {
        let tags = parse_t88(image)?;
        self.close();
        self.tags = tags;
        if let Err(e) = self.rewind() {
            self.tags.clear();
            return Err(e);
        }
        tracing::info!("[CMT] Mounted tape, {} tags", self.tags.len());
        Ok(())
    }

    pub fn close(&mut self) {
        self.cancel_timer();
        self.tags.clear();
        self.cursor = 0;
        self.offset = 0;
        self.remaining = 0;
    }

    pub fn is_open(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn motor(&self) -> bool {
        self.motor
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Back to the first tag after the version tag.
    pub fn rewind(&mut self) -> Result<(), TapeError> {
        if self.tags.is_empty() {
            return Err(TapeError::NoTape);
        }
        if self.tags[0].kind != TagKind::Version(T88_VERSION) {
            tracing::warn!("[CMT] Version tag mismatch: {:?}", self.tags[0].kind);
            return Err(TapeError::Version);
        }
        self.cancel_timer();
        self.cursor = 1;
        self.offset = 0;
        self.remaining = 0;
        if self.motor {
            self.process_tags();
        }
        Ok(())
    }

    /// Move to tape position `pos` (ticks).
    pub fn seek(&mut self, pos: u32) -> Result<(), TapeError> {
        self.rewind()?;
        let Some(idx) = self
            .tags
            .iter()
            .rposition(|t| {
                t.pos <= pos && !matches!(t.kind, TagKind::Version(_) | TagKind::End)
            })
        else {
            return Ok(());
        };
        self.cancel_timer();
        self.cursor = idx;
        let tag = &self.tags[idx];
        self.offset = match &tag.kind {
            TagKind::Data { bytes, .. } => {
                let n = (pos - tag.pos) as i64 / tag.ticks_per_byte();
                (n as usize).min(bytes.len())
            }
            _ => 0,
        };
        tracing::debug!("[CMT] Seek {} -> tag {} +{}", pos, self.cursor, self.offset);
        if self.motor {
            self.process_tags();
        }
        Ok(())
    }

    /// Current tape position in ticks.
    pub fn position(&self) -> u32 {
        match self.tags.get(self.cursor) {
            Some(tag @ Tag {
                kind: TagKind::Data { .. },
                ..
            }) => tag.pos + (self.offset as i64 * tag.ticks_per_byte()) as u32,
            Some(tag) => tag.pos,
            None => 0,
        }
    }

    pub fn set_motor(&mut self, on: bool) {
        if self.motor == on {
            return;
        }
        self.motor = on;
        if on {
            tracing::debug!("[CMT] Motor on, resume after {} ticks", self.remaining);
            if self.remaining > 0 {
                let ticks = self.remaining;
                self.remaining = 0;
                self.set_timer(ticks);
            } else {
                self.process_tags();
            }
        } else {
            self.remaining = self.pending_ticks();
            self.cancel_timer();
            tracing::debug!("[CMT] Motor off, {} ticks pending", self.remaining);
        }
    }

    fn pending_ticks(&self) -> i64 {
        match self.event {
            Some(handle) if self.sched.is_pending(handle) => {
                let elapsed = ns_to_ticks(self.sched.now_ns() - self.timer_start);
                (self.timer_ticks - elapsed).max(MIN_RESUME_TICKS)
            }
            _ => 0,
        }
    }

    fn set_timer(&mut self, ticks: i64) {
        self.cancel_timer();
        self.timer_start = self.sched.now_ns();
        self.timer_ticks = ticks;
        self.event = Some(self.sched.add_event_ns(
            ticks_to_ns(ticks).max(1),
            &self.this,
            TapeManager::timer,
            0,
            false,
        ));
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.event.take() {
            self.sched.del_event(handle);
        }
    }

    /// Arm the timer for whatever the tag under the cursor needs next.
    fn process_tags(&mut self) {
        while let Some(tag) = self.tags.get(self.cursor) {
            match &tag.kind {
                TagKind::End => {
                    tracing::debug!("[CMT] End of tape");
                    return;
                }
                TagKind::Version(_) => {}
                TagKind::Data { bytes, .. } => {
                    if self.offset < bytes.len() {
                        let ticks = tag.ticks_per_byte();
                        self.set_timer(ticks);
                        return;
                    }
                }
                TagKind::Blank | TagKind::Space | TagKind::Mark => {
                    if tag.tick > 0 {
                        let ticks = tag.tick as i64;
                        self.set_timer(ticks);
                        return;
                    }
                }
            }
            self.cursor += 1;
            self.offset = 0;
        }
    }

    fn timer(&mut self, _arg: u32) {
        self.event = None;
        let Some(tag) = self.tags.get(self.cursor) else {
            return;
        };
        match &tag.kind {
            TagKind::Data { bytes, .. } => {
                if let Some(&b) = bytes.get(self.offset) {
                    tracing::trace!("[CMT] Send {:02X}", b);
                    self.bus.output(ports::CMT_DATA, b);
                }
                self.offset += 1;
                if self.offset >= bytes.len() {
                    self.cursor += 1;
                    self.offset = 0;
                }
            }
            _ => {
                self.cursor += 1;
                self.offset = 0;
            }
        }
        if self.motor {
            self.process_tags();
        }
    }

    fn out_sys_ctrl(&mut self, _port: u32, data: u8) {
        self.set_motor(data & ports::SYS_MOTOR != 0);
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.set_motor(false);
    }
}

impl Device for TapeManager {
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
        let remaining = if self.motor {
            self.pending_ticks()
        } else {
            self.remaining
        };
        let st = State {
            cursor: self.cursor as u32,
            offset: self.offset as u32,
            remaining: remaining as u32,
            motor: self.motor as u32,
        };
        write_status(&st, buf)
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        let Some(st) = read_status::<State>(buf) else {
            return false;
        };
        self.cancel_timer();
        self.cursor = (st.cursor as usize).min(self.tags.len());
        self.offset = st.offset as usize;
        self.remaining = st.remaining as i64;
        self.motor = false;
        self.set_motor(st.motor != 0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_bad_magic() {
        assert_eq!(parse_t88(b"not a tape"), Err(TapeError::BadMagic));
    }

    #[test]
    fn test_parse_round_trip() {
        let tags = vec![
            Tag {
                kind: TagKind::Blank,
                pos: 0,
                tick: 100,
            },
            Tag {
                kind: TagKind::Data {
                    kind: 0x100,
                    bytes: vec![0xd3, 0xd3],
                },
                pos: 100,
                tick: 88,
            },
        ];
        let parsed = parse_t88(&build_t88(&tags)).unwrap();
        assert_eq!(parsed[0].kind, TagKind::Version(T88_VERSION));
        assert_eq!(&parsed[1..3], &tags[..]);
        assert_eq!(parsed[3].kind, TagKind::End);
    }

    #[test]
    fn test_truncated_tag() {
        let mut image = build_t88(&[]);
        image.truncate(image.len() - 2);
        assert!(matches!(parse_t88(&image), Err(TapeError::Truncated(_))));
    }

    #[test]
    fn test_baud_rate_by_type() {
        let slow = Tag {
            kind: TagKind::Data {
                kind: TYPE_600BAUD,
                bytes: vec![],
            },
            pos: 0,
            tick: 0,
        };
        assert_eq!(slow.ticks_per_byte(), 88);
        let fast = Tag {
            kind: TagKind::Data {
                kind: 0x100,
                bytes: vec![],
            },
            ..slow
        };
        assert_eq!(fast.ticks_per_byte(), 44);
    }
}
