use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::TryRecvError;
use derivative::Derivative;

use crate::{
    cd_control::{Address, CdCommand, CdControl, CdReply},
    cd_drive::{AudioStatus, CdDrive, SECTOR_SIZE},
    device::{read_status, write_status, Descriptor, Device, DeviceId},
    dma::DmaAccess,
    io_bus::Connector,
    ports,
    scheduler::{EventHandle, Scheduler},
    utils::{from_bcd, lba_to_bcd_msf, to_bcd, CD_FRAMES},
};

pub const BSY: u8 = 0x80;
pub const REQ: u8 = 0x40;
pub const MSG: u8 = 0x20;
pub const CD: u8 = 0x10;
pub const IO: u8 = 0x08;

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK: u8 = 0x02;

pub const SENSE_NONE: u8 = 0x00;
pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_ABORTED: u8 = 0x0b;

/// DMA channel used for read data.
pub const DMA_BANK: usize = 1;

/// How often the worker's completion queue is checked while waiting.
const POLL_NS: i64 = 100_000;

const CTRL_SEL: u8 = 0x01;
const CTRL_RESET: u8 = 0x80;

/// Handshake phase of the CD interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Selected, not yet asking for the command.
    Cmd1,
    /// Waiting for the first command byte.
    Cmd2,
    /// Collecting the rest of the command block.
    Param,
    Exec,
    /// Command is with the worker thread.
    Wait,
    /// Short result bytes to the host.
    Result,
    Status,
    /// Sector data to the host.
    Send,
    /// Message byte.
    End,
    /// Data from the host.
    Recv,
}

impl Phase {
    /// Bus signals presented on port 0x90.
    pub fn signals(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Cmd1 | Phase::Exec | Phase::Wait => BSY,
            Phase::Cmd2 | Phase::Param => BSY | REQ | CD,
            Phase::Result | Phase::Send => BSY | REQ | IO,
            Phase::Status => BSY | REQ | CD | IO,
            Phase::End => BSY | REQ | MSG | CD | IO,
            Phase::Recv => BSY | REQ,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct State {
    sense: u8,
    dma_mode: u8,
    status_byte: u8,
    _pad: u8,
}

fn be16(b: &[u8]) -> u32 {
    (b[0] as u32) << 8 | b[1] as u32
}

fn be32(b: &[u8]) -> u32 {
    (b[0] as u32) << 24 | (b[1] as u32) << 16 | (b[2] as u32) << 8 | b[3] as u32
}

/// Play position field of the NEC audio commands; bits 6-7 of byte 9 pick
/// the format.
fn audio_address(cdb: &[u8]) -> Address {
    match cdb[9] & 0xc0 {
        0x40 => Address::Msf(from_bcd(cdb[2]), from_bcd(cdb[3]), from_bcd(cdb[4])),
        0x80 => Address::Track(from_bcd(cdb[2])),
        _ => Address::Lba((cdb[3] as u32) << 16 | (cdb[4] as u32) << 8 | cdb[5] as u32),
    }
}

/// Relative time as three BCD bytes, without the lead-in offset.
fn bcd_time(sectors: u32) -> [u8; 3] {
    let m = (sectors / (60 * CD_FRAMES)).min(99) as u8;
    let s = ((sectors / CD_FRAMES) % 60) as u8;
    let f = (sectors % CD_FRAMES) as u8;
    [to_bcd(m), to_bcd(s), to_bcd(f)]
}

/// Host-facing side of the CD-ROM interface (ports 0x90-0x94).
///
/// Only the emulation thread touches this state. Media commands go to the
/// [`CdControl`] worker; while in [`Phase::Wait`] a polling event drains its
/// completions and only the one matching the outstanding request moves the
/// phase on.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cdif {
    #[derivative(Debug = "ignore")]
    this: Weak<RefCell<Cdif>>,
    #[derivative(Debug = "ignore")]
    sched: Rc<Scheduler>,
    #[derivative(Debug = "ignore")]
    dma: Option<Rc<RefCell<dyn DmaAccess>>>,
    control: Option<CdControl>,
    phase: Phase,
    cmdbuf: [u8; 16],
    cmdlen: usize,
    cmdpos: usize,
    #[derivative(Debug = "ignore")]
    data: Vec<u8>,
    datapos: usize,
    recv_len: usize,
    status_byte: u8,
    sense: u8,
    dma_mode: bool,
    waiting: Option<u32>,
    poll: Option<EventHandle>,
}

impl Cdif {
    pub const ID: DeviceId = DeviceId::new(b"CDIF");

    const DESCRIPTOR: Descriptor<Cdif> = Descriptor {
        inputs: &[Cdif::in_status, Cdif::in_data],
        outputs: &[Cdif::out_ctrl, Cdif::out_data, Cdif::out_dma, Cdif::on_reset],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::input(ports::CDIF_CTRL, 0),
        Connector::input(ports::CDIF_DATA, 1),
        Connector::output(ports::CDIF_CTRL, 0),
        Connector::output(ports::CDIF_DATA, 1),
        Connector::output(ports::CDIF_DMA, 2),
        Connector::output(ports::RESET, 3),
        Connector::sync(ports::CDIF_CTRL),
        Connector::sync(ports::CDIF_DATA),
    ];

    pub fn new(
        sched: Rc<Scheduler>,
        dma: Option<Rc<RefCell<dyn DmaAccess>>>,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                sched,
                dma,
                control: None,
                phase: Phase::Idle,
                cmdbuf: [0; 16],
                cmdlen: 0,
                cmdpos: 0,
                data: Vec::new(),
                datapos: 0,
                recv_len: 0,
                status_byte: STATUS_GOOD,
                sense: SENSE_NONE,
                dma_mode: false,
                waiting: None,
                poll: None,
            })
        })
    }

    /// Connect a drive, starting its worker thread.
    pub fn attach(&mut self, drive: Box<dyn CdDrive>) -> std::io::Result<()> {
        self.detach();
        self.control = Some(CdControl::spawn(drive)?);
        tracing::info!("[CDIF] Drive attached");
        Ok(())
    }

    pub fn detach(&mut self) {
        self.reset_controller();
        if self.control.take().is_some() {
            tracing::info!("[CDIF] Drive detached");
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Data buffer of the current or last command.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status_byte(&self) -> u8 {
        self.status_byte
    }

    pub fn sense(&self) -> u8 {
        self.sense
    }

    pub fn reset_controller(&mut self) {
        self.stop_poll();
        // a completion still in flight no longer matches anything
        self.waiting = None;
        self.phase = Phase::Idle;
        self.cmdpos = 0;
        self.cmdlen = 0;
        self.data.clear();
        self.datapos = 0;
        self.recv_len = 0;
        self.status_byte = STATUS_GOOD;
        self.sense = SENSE_NONE;
    }

    // -- ports --

    fn in_status(&mut self, _port: u32) -> u8 {
        self.phase.signals()
    }

    fn in_data(&mut self, _port: u32) -> u8 {
        match self.phase {
            Phase::Result | Phase::Send => {
                let byte = self.data.get(self.datapos).copied().unwrap_or(0);
                self.datapos += 1;
                if self.datapos >= self.data.len() {
                    self.phase = Phase::Status;
                }
                byte
            }
            Phase::Status => {
                self.phase = Phase::End;
                self.status_byte
            }
            Phase::End => {
                tracing::trace!("[CDIF] Command {:02X} complete", self.cmdbuf[0]);
                self.phase = Phase::Idle;
                0
            }
            _ => 0xff,
        }
    }

    fn out_ctrl(&mut self, _port: u32, data: u8) {
        if data & CTRL_RESET != 0 {
            tracing::debug!("[CDIF] Bus reset");
            self.reset_controller();
            return;
        }
        let sel = data & CTRL_SEL != 0;
        match (self.phase, sel) {
            (Phase::Idle, true) => self.phase = Phase::Cmd1,
            (Phase::Cmd1, false) => {
                self.phase = Phase::Cmd2;
                self.cmdpos = 0;
            }
            _ => {}
        }
    }

    fn out_data(&mut self, _port: u32, data: u8) {
        match self.phase {
            Phase::Cmd2 => {
                self.cmdbuf = [0; 16];
                self.cmdbuf[0] = data;
                // group 0 commands are six bytes long, the rest ten
                self.cmdlen = if data >> 5 == 0 { 6 } else { 10 };
                self.cmdpos = 1;
                self.phase = Phase::Param;
            }
            Phase::Param => {
                self.cmdbuf[self.cmdpos] = data;
                self.cmdpos += 1;
                if self.cmdpos >= self.cmdlen {
                    self.phase = Phase::Exec;
                    self.execute_command();
                }
            }
            Phase::Recv => {
                self.data.push(data);
                if self.data.len() >= self.recv_len {
                    self.enter_status(STATUS_GOOD);
                }
            }
            _ => tracing::trace!("[CDIF] Stray data {:02X} in {:?}", data, self.phase),
        }
    }

    fn out_dma(&mut self, _port: u32, data: u8) {
        self.dma_mode = data & 1 != 0;
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.reset_controller();
        self.dma_mode = false;
    }

    // -- command processing --

    fn check_condition(&mut self, sense: u8) {
        tracing::debug!(
            "[CDIF] Command {:02X} check condition, sense {:02X}",
            self.cmdbuf[0],
            sense
        );
        self.sense = sense;
        self.data.clear();
        self.status_byte = STATUS_CHECK;
        self.phase = Phase::Status;
    }

    fn enter_status(&mut self, status: u8) {
        self.status_byte = status;
        self.phase = Phase::Status;
    }

    fn enter_data(&mut self, phase: Phase, data: Vec<u8>) {
        self.data = data;
        self.datapos = 0;
        self.status_byte = STATUS_GOOD;
        self.phase = if self.data.is_empty() {
            Phase::Status
        } else {
            phase
        };
    }

    fn decode(&self) -> Option<CdCommand> {
        let cdb = &self.cmdbuf;
        let cmd = match cdb[0] {
            0x00 => CdCommand::TestUnitReady,
            0x08 => CdCommand::Read {
                lba: (cdb[1] as u32 & 0x1f) << 16 | be16(&cdb[2..4]),
                count: if cdb[4] == 0 { 256 } else { cdb[4] as u32 },
            },
            0x28 => CdCommand::Read {
                lba: be32(&cdb[2..6]),
                count: be16(&cdb[7..9]),
            },
            0xd8 => CdCommand::AudioStart {
                start: audio_address(cdb),
                play: cdb[1] & 1 != 0,
            },
            0xd9 => CdCommand::AudioStop {
                end: audio_address(cdb),
            },
            0xda => CdCommand::Pause,
            0xdd => CdCommand::SubchannelQ,
            0xde => CdCommand::ReadToc,
            _ => return None,
        };
        Some(cmd)
    }

    fn execute_command(&mut self) {
        tracing::debug!("[CDIF] Command {:02X?}", &self.cmdbuf[..self.cmdlen]);
        self.data.clear();
        match self.cmdbuf[0] {
            0x03 => return self.request_sense(),
            0x15 => {
                // MODE SELECT: take the parameter list, nothing to configure
                self.recv_len = self.cmdbuf[4] as usize;
                self.phase = if self.recv_len == 0 {
                    Phase::Status
                } else {
                    Phase::Recv
                };
                self.status_byte = STATUS_GOOD;
                return;
            }
            _ => {}
        }

        let Some(cmd) = self.decode() else {
            return self.check_condition(SENSE_ILLEGAL_REQUEST);
        };
        let Some(control) = self.control.as_mut() else {
            return self.check_condition(SENSE_NOT_READY);
        };
        let Some(seq) = control.send(cmd) else {
            return self.check_condition(SENSE_NOT_READY);
        };
        self.waiting = Some(seq);
        self.phase = Phase::Wait;
        self.start_poll();
    }

    fn request_sense(&mut self) {
        let asc = match self.sense {
            SENSE_NOT_READY => 0x3a,
            SENSE_MEDIUM_ERROR => 0x11,
            SENSE_ILLEGAL_REQUEST => 0x20,
            _ => 0x00,
        };
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = self.sense;
        sense[7] = 10;
        sense[12] = asc;
        let alloc = match self.cmdbuf[4] {
            0 => 4,
            n => n as usize,
        };
        sense.truncate(alloc);
        self.sense = SENSE_NONE;
        self.enter_data(Phase::Result, sense);
    }

    fn start_poll(&mut self) {
        self.stop_poll();
        self.poll = Some(
            self.sched
                .add_event_ns(POLL_NS, &self.this, Cdif::poll, 0, true),
        );
    }

    fn stop_poll(&mut self) {
        if let Some(handle) = self.poll.take() {
            self.sched.del_event(handle);
        }
    }

    fn poll(&mut self, _arg: u32) {
        loop {
            let next = match self.control.as_ref() {
                Some(control) => control.try_recv(),
                None => Err(TryRecvError::Disconnected),
            };
            match next {
                Ok(done) if self.phase == Phase::Wait && Some(done.seq) == self.waiting => {
                    self.waiting = None;
                    self.stop_poll();
                    self.complete(done.reply);
                    return;
                }
                Ok(done) => {
                    tracing::debug!("[CDIF] Dropping stale completion #{}", done.seq);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stop_poll();
                    if self.waiting.take().is_some() && self.phase == Phase::Wait {
                        tracing::error!(
                            "[CDIF] Worker stopped during command {:02X}",
                            self.cmdbuf[0]
                        );
                        self.check_condition(SENSE_ABORTED);
                    }
                    return;
                }
            }
        }
        if self.waiting.is_none() {
            self.stop_poll();
        }
    }

    fn complete(&mut self, reply: CdReply) {
        let op = self.cmdbuf[0];
        match (op, reply) {
            (0x00, CdReply::Ready(true)) => self.enter_status(STATUS_GOOD),
            (0x00, CdReply::Ready(false)) => self.check_condition(SENSE_NOT_READY),
            (0x08 | 0x28, CdReply::Data(data)) => self.complete_read(data),
            (0xde, CdReply::Toc(Some(toc))) => {
                let result = match self.cmdbuf[1] {
                    0 => Some(vec![to_bcd(toc.first), to_bcd(toc.last()), 0, 0]),
                    1 => {
                        let [m, s, f] = lba_to_bcd_msf(toc.lead_out);
                        Some(vec![m, s, f, 0])
                    }
                    2 => toc.track(from_bcd(self.cmdbuf[2])).map(|t| {
                        let [m, s, f] = lba_to_bcd_msf(t.start);
                        vec![m, s, f, t.control]
                    }),
                    _ => None,
                };
                match result {
                    Some(data) => self.enter_data(Phase::Result, data),
                    None => self.check_condition(SENSE_ILLEGAL_REQUEST),
                }
            }
            (0xdd, CdReply::SubQ(Some(q))) => {
                let status = match q.status {
                    AudioStatus::Playing => 0x00,
                    AudioStatus::Paused => 0x01,
                    AudioStatus::Stopped => 0x03,
                };
                let rel = bcd_time(q.relative);
                let abs = lba_to_bcd_msf(q.absolute);
                let mut data = vec![
                    status,
                    q.control,
                    to_bcd(q.track),
                    to_bcd(q.index),
                    rel[0],
                    rel[1],
                    rel[2],
                    abs[0],
                    abs[1],
                    abs[2],
                ];
                if self.cmdbuf[1] != 0 {
                    data.truncate(self.cmdbuf[1] as usize);
                }
                self.enter_data(Phase::Result, data);
            }
            (_, CdReply::Done(true)) => self.enter_status(STATUS_GOOD),
            (_, CdReply::Done(false) | CdReply::Toc(None) | CdReply::SubQ(None)) => {
                self.check_condition(SENSE_NOT_READY)
            }
            (op, reply) => {
                tracing::warn!("[CDIF] Unexpected reply to {:02X}: {:?}", op, reply);
                self.check_condition(SENSE_ABORTED);
            }
        }
    }

    fn complete_read(&mut self, data: Vec<u8>) {
        let expected = match self.decode() {
            Some(CdCommand::Read { count, .. }) => count as usize * SECTOR_SIZE,
            _ => 0,
        };
        let short = data.len() < expected;

        if self.dma_mode {
            if let Some(dma) = self.dma.clone() {
                let moved = dma.borrow_mut().request_write(DMA_BANK, &data);
                tracing::debug!("[CDIF] DMA {} of {} bytes", moved, data.len());
                if moved < data.len() {
                    return self.check_condition(SENSE_ABORTED);
                }
                if short {
                    return self.check_condition(SENSE_MEDIUM_ERROR);
                }
                return self.enter_status(STATUS_GOOD);
            }
        }

        if short {
            if data.is_empty() {
                return self.check_condition(SENSE_MEDIUM_ERROR);
            }
            self.enter_data(Phase::Send, data);
            self.status_byte = STATUS_CHECK;
            self.sense = SENSE_MEDIUM_ERROR;
            return;
        }
        self.enter_data(Phase::Send, data);
    }
}

impl Device for Cdif {
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
        let st = State {
            sense: self.sense,
            dma_mode: self.dma_mode as u8,
            status_byte: self.status_byte,
            _pad: 0,
        };
        write_status(&st, buf)
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        let Some(st) = read_status::<State>(buf) else {
            return false;
        };
        // a command in progress does not survive; the host sees a bus free
        self.reset_controller();
        self.sense = st.sense;
        self.dma_mode = st.dma_mode != 0;
        self.status_byte = st.status_byte;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::IdleExecutor;

    fn command(cdif: &mut Cdif, cdb: &[u8]) {
        cdif.out_ctrl(ports::CDIF_CTRL, CTRL_SEL);
        assert_eq!(cdif.in_status(ports::CDIF_CTRL), BSY);
        cdif.out_ctrl(ports::CDIF_CTRL, 0);
        assert_eq!(cdif.in_status(ports::CDIF_CTRL), BSY | REQ | CD);
        for &b in cdb {
            cdif.out_data(ports::CDIF_DATA, b);
        }
    }

    #[test]
    fn test_no_drive_is_not_ready() {
        let sched = Rc::new(Scheduler::new());
        let cdif = Cdif::new(sched.clone(), None);
        let mut cdif = cdif.borrow_mut();

        command(&mut cdif, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(cdif.phase(), Phase::Status);
        assert_eq!(cdif.in_data(ports::CDIF_DATA), STATUS_CHECK);
        assert_eq!(cdif.in_status(ports::CDIF_CTRL), BSY | REQ | MSG | CD | IO);
        assert_eq!(cdif.in_data(ports::CDIF_DATA), 0);
        assert_eq!(cdif.phase(), Phase::Idle);

        command(&mut cdif, &[0x03, 0, 0, 0, 18, 0]);
        assert_eq!(cdif.phase(), Phase::Result);
        let sense: Vec<u8> = (0..18).map(|_| cdif.in_data(ports::CDIF_DATA)).collect();
        assert_eq!(sense[2], SENSE_NOT_READY);
        assert_eq!(sense[12], 0x3a);
        assert_eq!(cdif.phase(), Phase::Status);
        assert_eq!(cdif.in_data(ports::CDIF_DATA), STATUS_GOOD);
    }

    #[test]
    fn test_unknown_command_is_illegal() {
        let sched = Rc::new(Scheduler::new());
        let cdif = Cdif::new(sched, None);
        let mut cdif = cdif.borrow_mut();
        // group 6 opcode: ten byte block
        command(&mut cdif, &[0xc7, 0, 0, 0, 0, 0]);
        assert_eq!(cdif.phase(), Phase::Param);
        command_tail(&mut cdif, 4);
        assert_eq!(cdif.phase(), Phase::Status);
        assert_eq!(cdif.status_byte(), STATUS_CHECK);
        assert_eq!(cdif.sense(), SENSE_ILLEGAL_REQUEST);
    }

    fn command_tail(cdif: &mut Cdif, n: usize) {
        for _ in 0..n {
            cdif.out_data(ports::CDIF_DATA, 0);
        }
    }

    #[test]
    fn test_mode_select_receives_parameters() {
        let sched = Rc::new(Scheduler::new());
        let cdif = Cdif::new(sched, None);
        let mut cdif = cdif.borrow_mut();
        command(&mut cdif, &[0x15, 0, 0, 0, 2, 0]);
        assert_eq!(cdif.phase(), Phase::Recv);
        assert_eq!(cdif.in_status(ports::CDIF_CTRL), BSY | REQ);
        cdif.out_data(ports::CDIF_DATA, 0x12);
        cdif.out_data(ports::CDIF_DATA, 0x34);
        assert_eq!(cdif.phase(), Phase::Status);
    }

    #[test]
    fn test_bus_reset_abandons_wait() {
        let sched = Rc::new(Scheduler::new());
        let cdif = Cdif::new(sched.clone(), None);
        cdif.borrow_mut()
            .attach(Box::new(crate::cd_drive::ImageDrive::empty()))
            .unwrap();
        command(&mut cdif.borrow_mut(), &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(cdif.borrow().phase(), Phase::Wait);
        cdif.borrow_mut().out_ctrl(ports::CDIF_CTRL, CTRL_RESET);
        assert_eq!(cdif.borrow().phase(), Phase::Idle);

        // the late completion must not wake the controller
        for _ in 0..20 {
            sched.proceed_ns(POLL_NS, &mut IdleExecutor);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(cdif.borrow().phase(), Phase::Idle);
        assert_eq!(sched.live_events(), 0);
    }
}
