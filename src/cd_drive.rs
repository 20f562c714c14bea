use crate::utils::lba_to_msf;

pub const SECTOR_SIZE: usize = 2048;

/// Track control nibble for a data track.
pub const CONTROL_DATA: u8 = 0x04;
pub const CONTROL_AUDIO: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    /// First sector of the track.
    pub start: u32,
    pub control: u8,
}

/// Table of contents. Tracks are numbered from `first`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toc {
    pub first: u8,
    pub tracks: Vec<TrackInfo>,
    pub lead_out: u32,
}

impl Toc {
    pub fn last(&self) -> u8 {
        self.first + self.tracks.len().saturating_sub(1) as u8
    }

    pub fn track(&self, number: u8) -> Option<&TrackInfo> {
        number
            .checked_sub(self.first)
            .and_then(|i| self.tracks.get(i as usize))
    }

    /// Track number holding `lba`.
    pub fn track_of(&self, lba: u32) -> Option<u8> {
        self.tracks
            .iter()
            .rposition(|t| t.start <= lba)
            .map(|i| self.first + i as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioStatus {
    Playing,
    Paused,
    Stopped,
}

/// Q sub-channel snapshot of the current play position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubQ {
    pub status: AudioStatus,
    pub control: u8,
    pub track: u8,
    pub index: u8,
    /// Position relative to the track start, in sectors.
    pub relative: u32,
    pub absolute: u32,
}

/// Media access used by the CD interface worker thread. Calls may block.
pub trait CdDrive: Send {
    /// `None` when no disc is present.
    fn toc(&mut self) -> Option<Toc>;

    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> bool;

    /// Play audio from `start` up to, not including, `end`.
    fn play_audio(&mut self, start: u32, end: u32) -> bool;

    fn pause(&mut self, pause: bool) -> bool;

    fn stop(&mut self) -> bool;

    fn subchannel_q(&mut self) -> Option<SubQ>;
}

/// Disc image held in memory: one data track, or no disc at all.
///
/// Audio commands are tracked so the Q sub-channel reports a position, but
/// nothing is played.
#[derive(Debug, Default)]
pub struct ImageDrive {
    data: Option<Vec<u8>>,
    play: Option<(u32, u32)>,
    paused: bool,
}

impl ImageDrive {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            play: None,
            paused: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn sectors(&self) -> Option<u32> {
        self.data
            .as_ref()
            .map(|d| ((d.len() + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32)
    }
}

impl CdDrive for ImageDrive {
    fn toc(&mut self) -> Option<Toc> {
        let sectors = self.sectors()?;
        Some(Toc {
            first: 1,
            tracks: vec![TrackInfo {
                start: 0,
                control: CONTROL_DATA,
            }],
            lead_out: sectors,
        })
    }

    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> bool {
        let Some(data) = self.data.as_ref() else {
            return false;
        };
        let start = lba as usize * SECTOR_SIZE;
        if start >= data.len() {
            return false;
        }
        let end = (start + SECTOR_SIZE).min(data.len());
        buf.fill(0);
        buf[..end - start].copy_from_slice(&data[start..end]);
        true
    }

    fn play_audio(&mut self, start: u32, end: u32) -> bool {
        if self.data.is_none() || start >= end {
            return false;
        }
        tracing::debug!(
            "[CDROM] Play {:?} - {:?}",
            lba_to_msf(start),
            lba_to_msf(end)
        );
        self.play = Some((start, end));
        self.paused = false;
        true
    }

    fn pause(&mut self, pause: bool) -> bool {
        if self.play.is_none() {
            return false;
        }
        self.paused = pause;
        true
    }

    fn stop(&mut self) -> bool {
        self.play = None;
        self.paused = false;
        true
    }

    fn subchannel_q(&mut self) -> Option<SubQ> {
        self.data.as_ref()?;
        let (status, pos) = match self.play {
            Some((start, _)) if self.paused => (AudioStatus::Paused, start),
            Some((start, _)) => (AudioStatus::Playing, start),
            None => (AudioStatus::Stopped, 0),
        };
        Some(SubQ {
            status,
            control: CONTROL_DATA,
            track: 1,
            index: 1,
            relative: pos,
            absolute: pos,
        })
    }
}
