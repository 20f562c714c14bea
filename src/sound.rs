use std::{cell::RefCell, rc::Rc};

use bytemuck::{Pod, Zeroable};

use crate::{
    device::{read_status, write_status, Descriptor, Device, DeviceId, DeviceKey},
    io_bus::Connector,
    ports,
};

/// A generator the mixer pulls samples from.
pub trait SoundSource {
    /// Change the output sample rate. Returns false if the rate is unusable.
    fn set_rate(&mut self, rate: u32) -> bool;

    /// Add one mono sample per element of `dest`.
    fn mix(&mut self, dest: &mut [i32]);
}

pub type SoundSourceRef = Rc<RefCell<dyn SoundSource>>;

/// Sums every registered source into one buffer.
#[derive(Default)]
pub struct SoundMixer {
    sources: Vec<SoundSourceRef>,
    rate: u32,
}

impl SoundMixer {
    pub fn new(rate: u32) -> Self {
        Self {
            sources: Vec::new(),
            rate,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn connect(&mut self, source: SoundSourceRef) -> bool {
        if self
            .sources
            .iter()
            .any(|s| DeviceKey::of(s) == DeviceKey::of(&source))
        {
            return false;
        }
        if !source.borrow_mut().set_rate(self.rate) {
            tracing::warn!("[SOUND] Source rejected rate {}", self.rate);
            return false;
        }
        self.sources.push(source);
        true
    }

    pub fn disconnect(&mut self, source: &SoundSourceRef) -> bool {
        let key = DeviceKey::of(source);
        let before = self.sources.len();
        self.sources.retain(|s| DeviceKey::of(s) != key);
        self.sources.len() != before
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Apply a new rate to every source; sources that refuse it are dropped.
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        self.sources.retain(|s| {
            let ok = s.borrow_mut().set_rate(rate);
            if !ok {
                tracing::warn!("[SOUND] Dropping source that rejected rate {}", rate);
            }
            ok
        });
    }

    /// Render `frames` samples.
    pub fn mix(&mut self, frames: usize) -> Vec<i32> {
        let mut buf = vec![0i32; frames];
        for source in &self.sources {
            source.borrow_mut().mix(&mut buf);
        }
        buf
    }
}

pub const BEEP_HZ: u32 = 2400;
pub const BEEP_VOLUME: i32 = 4096;

const PORT40_BEEP: u8 = ports::STATUS_BEEP;
const PORT40_SING: u8 = ports::STATUS_SING;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct BeepState {
    port40: u8,
    _pad: [u8; 3],
    phase: u32,
}

/// Built-in beeper. Bit 5 of port 0x40 gates a fixed square wave, bit 7
/// drives the speaker level directly.
#[derive(Debug)]
pub struct Beep {
    port40: u8,
    /// 16.16 position within one wave period.
    phase: u32,
    step: u32,
}

impl Beep {
    pub const ID: DeviceId = DeviceId::new(b"BEEP");

    const DESCRIPTOR: Descriptor<Beep> = Descriptor {
        inputs: &[],
        outputs: &[Beep::out40, Beep::on_reset],
    };

    pub const CONNECTORS: &'static [Connector] = &[
        Connector::output(ports::SYSTEM_STATUS, 0),
        Connector::output(ports::RESET, 1),
    ];

    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            port40: 0,
            phase: 0,
            step: 0,
        }))
    }

    pub fn beep(&self) -> bool {
        self.port40 & PORT40_BEEP != 0
    }

    pub fn sing(&self) -> bool {
        self.port40 & PORT40_SING != 0
    }

    fn out40(&mut self, _port: u32, data: u8) {
        let changed = (self.port40 ^ data) & (PORT40_BEEP | PORT40_SING);
        if changed != 0 {
            tracing::trace!("[BEEP] {:02X}", data & (PORT40_BEEP | PORT40_SING));
        }
        self.port40 = data;
    }

    fn on_reset(&mut self, _port: u32, _data: u8) {
        self.port40 = 0;
        self.phase = 0;
    }
}

impl SoundSource for Beep {
    fn set_rate(&mut self, rate: u32) -> bool {
        if rate == 0 {
            return false;
        }
        let rate = rate as u64;
        self.step = ((((BEEP_HZ as u64) << 16) + rate / 2) / rate) as u32;
        true
    }

    fn mix(&mut self, dest: &mut [i32]) {
        let beep = self.beep();
        let sing = self.sing();
        if !beep && !sing {
            return;
        }
        for sample in dest.iter_mut() {
            let high = sing || (beep && self.phase & 0x8000 != 0);
            if high {
                *sample += BEEP_VOLUME;
            }
            self.phase = (self.phase + self.step) & 0xffff;
        }
    }
}

impl Device for Beep {
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
        std::mem::size_of::<BeepState>()
    }

    fn save_status(&self, buf: &mut [u8]) -> bool {
        let st = BeepState {
            port40: self.port40,
            _pad: [0; 3],
            phase: self.phase,
        };
        write_status(&st, buf)
    }

    fn load_status(&mut self, buf: &[u8]) -> bool {
        match read_status::<BeepState>(buf) {
            Some(st) => {
                self.port40 = st.port40;
                self.phase = st.phase & 0xffff;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dc(i32);

    impl SoundSource for Dc {
        fn set_rate(&mut self, rate: u32) -> bool {
            rate >= 8000
        }

        fn mix(&mut self, dest: &mut [i32]) {
            dest.iter_mut().for_each(|s| *s += self.0);
        }
    }

    #[test]
    fn test_mixer_sums_sources() {
        let mut mixer = SoundMixer::new(44100);
        let a: SoundSourceRef = Rc::new(RefCell::new(Dc(3)));
        let b: SoundSourceRef = Rc::new(RefCell::new(Dc(-1)));
        assert!(mixer.connect(a.clone()));
        assert!(!mixer.connect(a.clone()));
        assert!(mixer.connect(b.clone()));
        assert_eq!(mixer.mix(4), vec![2; 4]);

        assert!(mixer.disconnect(&b));
        assert_eq!(mixer.mix(2), vec![3; 2]);

        mixer.set_rate(4000);
        assert_eq!(mixer.source_count(), 0);
    }

    #[test]
    fn test_beep_square_wave() {
        let beep = Beep::new();
        beep.borrow_mut().set_rate(48000);
        let mut buf = vec![0; 20];
        beep.borrow_mut().mix(&mut buf);
        assert!(buf.iter().all(|&s| s == 0));

        beep.borrow_mut().out40(ports::SYSTEM_STATUS, PORT40_BEEP);
        beep.borrow_mut().mix(&mut buf);
        // 2400 Hz at 48 kHz: 20 samples per period, half of them high
        assert_eq!(buf.iter().filter(|&&s| s == BEEP_VOLUME).count(), 10);

        let mut sing = vec![0; 8];
        beep.borrow_mut().out40(ports::SYSTEM_STATUS, PORT40_SING);
        beep.borrow_mut().mix(&mut sing);
        assert_eq!(sing, vec![BEEP_VOLUME; 8]);
    }
}
