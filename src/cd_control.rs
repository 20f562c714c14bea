use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::cd_drive::{CdDrive, SubQ, Toc, SECTOR_SIZE};

/// Largest number of queued requests before `send` blocks.
const QUEUE_DEPTH: usize = 16;

/// Sectors reserved up front for a read; longer reads grow as they go.
const READ_RESERVE: u32 = 16;

/// Play position as the host addresses it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    Lba(u32),
    /// Binary minute, second, frame.
    Msf(u8, u8, u8),
    Track(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CdCommand {
    TestUnitReady,
    ReadToc,
    Read { lba: u32, count: u32 },
    /// Start audio at `start`; `play` false leaves it paused there.
    AudioStart { start: Address, play: bool },
    /// Move the end of the current play.
    AudioStop { end: Address },
    Pause,
    Stop,
    SubchannelQ,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CdReply {
    Ready(bool),
    Toc(Option<Toc>),
    /// Sectors read; shorter than requested when a read failed.
    Data(Vec<u8>),
    Done(bool),
    SubQ(Option<SubQ>),
}

/// Outcome of request `seq`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub seq: u32,
    pub reply: CdReply,
}

struct Request {
    seq: u32,
    cmd: CdCommand,
}

/// Owner of the CD worker thread.
///
/// Requests and completions travel over two FIFO channels, so completions
/// arrive in request order and never before `send` returned the sequence
/// number they carry.
pub struct CdControl {
    requests: Option<Sender<Request>>,
    completions: Receiver<Completion>,
    worker: Option<JoinHandle<()>>,
    next_seq: u32,
}

impl CdControl {
    pub fn spawn(drive: Box<dyn CdDrive>) -> std::io::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("cd-control".into())
            .spawn(move || Worker::new(drive).run(req_rx, done_tx))?;
        Ok(Self {
            requests: Some(req_tx),
            completions: done_rx,
            worker: Some(worker),
            next_seq: 1,
        })
    }

    /// Queue a command. Returns the sequence number its completion will carry,
    /// or `None` when the worker has stopped.
    pub fn send(&mut self, cmd: CdCommand) -> Option<u32> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        tracing::debug!("[CDCTL] #{} {:?}", seq, cmd);
        let sent = self
            .requests
            .as_ref()
            .map(|tx| tx.send(Request { seq, cmd }).is_ok())
            .unwrap_or(false);
        if !sent {
            tracing::error!("[CDCTL] Worker is gone, #{} dropped", seq);
            return None;
        }
        Some(seq)
    }

    /// Next completion. `Disconnected` means the worker has stopped and
    /// every completion it sent has been taken.
    pub fn try_recv(&self) -> Result<Completion, TryRecvError> {
        self.completions.try_recv()
    }
}

impl Drop for CdControl {
    fn drop(&mut self) {
        // closing the request channel ends the worker loop
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("[CDCTL] Worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for CdControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdControl")
            .field("next_seq", &self.next_seq)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

struct Worker {
    drive: Box<dyn CdDrive>,
    /// Start of the current or last play request.
    play_start: Option<u32>,
}

impl Worker {
    fn new(drive: Box<dyn CdDrive>) -> Self {
        Self {
            drive,
            play_start: None,
        }
    }

    fn run(mut self, requests: Receiver<Request>, done: Sender<Completion>) {
        for Request { seq, cmd } in requests.iter() {
            let reply = self.execute(cmd);
            if done.send(Completion { seq, reply }).is_err() {
                break;
            }
        }
        tracing::debug!("[CDCTL] Worker exit");
    }

    fn resolve(&mut self, addr: Address) -> Option<u32> {
        match addr {
            Address::Lba(lba) => Some(lba),
            Address::Msf(m, s, f) => Some(crate::utils::msf_to_lba(m, s, f)),
            Address::Track(n) => self.drive.toc()?.track(n).map(|t| t.start),
        }
    }

    fn execute(&mut self, cmd: CdCommand) -> CdReply {
        match cmd {
            CdCommand::TestUnitReady => CdReply::Ready(self.drive.toc().is_some()),
            CdCommand::ReadToc => CdReply::Toc(self.drive.toc()),
            CdCommand::Read { lba, count } => {
                let mut data = Vec::with_capacity(count.min(READ_RESERVE) as usize * SECTOR_SIZE);
                let mut sector = [0u8; SECTOR_SIZE];
                for n in 0..count {
                    if !self.drive.read_sector(lba + n, &mut sector) {
                        tracing::warn!("[CDCTL] Read error at {}", lba + n);
                        break;
                    }
                    data.extend_from_slice(&sector);
                }
                CdReply::Data(data)
            }
            CdCommand::AudioStart { start, play } => {
                let Some(toc) = self.drive.toc() else {
                    return CdReply::Done(false);
                };
                let Some(start) = self.resolve(start) else {
                    return CdReply::Done(false);
                };
                self.play_start = Some(start);
                let ok = self.drive.play_audio(start, toc.lead_out);
                CdReply::Done(ok && (play || self.drive.pause(true)))
            }
            CdCommand::AudioStop { end } => {
                let (Some(start), Some(end)) = (self.play_start, self.resolve(end)) else {
                    return CdReply::Done(false);
                };
                CdReply::Done(self.drive.play_audio(start, end))
            }
            CdCommand::Pause => CdReply::Done(self.drive.pause(true)),
            CdCommand::Stop => {
                self.play_start = None;
                CdReply::Done(self.drive.stop())
            }
            CdCommand::SubchannelQ => CdReply::SubQ(self.drive.subchannel_q()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cd_drive::ImageDrive;

    fn wait(control: &CdControl) -> Completion {
        for _ in 0..1000 {
            if let Ok(done) = control.try_recv() {
                return done;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("no completion");
    }

    #[test]
    fn test_completions_in_order() {
        let drive = ImageDrive::new(vec![0x11; SECTOR_SIZE * 2]);
        let mut control = CdControl::spawn(Box::new(drive)).unwrap();
        let a = control.send(CdCommand::TestUnitReady).unwrap();
        let b = control.send(CdCommand::Read { lba: 1, count: 1 }).unwrap();

        let first = wait(&control);
        assert_eq!(first.seq, a);
        assert_eq!(first.reply, CdReply::Ready(true));
        let second = wait(&control);
        assert_eq!(second.seq, b);
        match second.reply {
            CdReply::Data(data) => {
                assert_eq!(data.len(), SECTOR_SIZE);
                assert!(data.iter().all(|&b| b == 0x11));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_read_and_no_media() {
        let mut control = CdControl::spawn(Box::new(ImageDrive::empty())).unwrap();
        control.send(CdCommand::Read { lba: 0, count: 4 });
        assert_eq!(wait(&control).reply, CdReply::Data(Vec::new()));
        control.send(CdCommand::ReadToc);
        assert_eq!(wait(&control).reply, CdReply::Toc(None));
    }

    #[test]
    fn test_long_read_grows_with_data() {
        let drive = ImageDrive::new(vec![0x22; SECTOR_SIZE * 2]);
        let mut control = CdControl::spawn(Box::new(drive)).unwrap();
        control.send(CdCommand::Read { lba: 0, count: 0xffff });
        match wait(&control).reply {
            CdReply::Data(data) => {
                assert_eq!(data.len(), 2 * SECTOR_SIZE);
                assert!(data.capacity() <= READ_RESERVE as usize * SECTOR_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Fails the first time it is asked anything.
    struct Faulty;

    impl CdDrive for Faulty {
        fn toc(&mut self) -> Option<Toc> {
            panic!("drive fault");
        }

        fn read_sector(&mut self, _lba: u32, _buf: &mut [u8; SECTOR_SIZE]) -> bool {
            false
        }

        fn play_audio(&mut self, _start: u32, _end: u32) -> bool {
            false
        }

        fn pause(&mut self, _pause: bool) -> bool {
            false
        }

        fn stop(&mut self) -> bool {
            false
        }

        fn subchannel_q(&mut self) -> Option<SubQ> {
            None
        }
    }

    #[test]
    fn test_dead_worker_is_reported() {
        let mut control = CdControl::spawn(Box::new(Faulty)).unwrap();
        assert!(control.send(CdCommand::ReadToc).is_some());
        for _ in 0..1000 {
            match control.try_recv() {
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(1)),
                Ok(done) => panic!("unexpected {:?}", done),
            }
        }
        assert_eq!(control.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(control.send(CdCommand::TestUnitReady), None);
    }
}
