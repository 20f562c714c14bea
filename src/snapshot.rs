use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::{config::Config, error::SnapshotError};

pub const MAGIC: &[u8; 16] = b"PC88CORE SNAPSHT";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Header flag: body is zlib-compressed.
pub const FLAG_COMPRESSED: u16 = 0x0001;

pub const HEADER_SIZE: usize = 16 + 1 + 1 + 2 + 4 + 4 + 4 + 4;

/// Largest body a header may announce.
pub const MAX_BODY_LEN: usize = 16 << 20;

const CFG_HIGH_RESOLUTION: u32 = 0x01;
const CFG_NO_WAIT: u32 = 0x02;
const CFG_CD_ENABLED: u32 = 0x04;

/// Configuration fields stored alongside the machine state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigShadow {
    pub basic_mode: u32,
    pub cpu_clock_khz: u32,
    pub flags: u32,
}

impl ConfigShadow {
    pub fn of(config: &Config) -> Self {
        let mut flags = 0;
        if config.high_resolution {
            flags |= CFG_HIGH_RESOLUTION;
        }
        if config.no_wait {
            flags |= CFG_NO_WAIT;
        }
        if config.cd_enabled {
            flags |= CFG_CD_ENABLED;
        }
        Self {
            basic_mode: config.basic_mode,
            cpu_clock_khz: config.cpu_clock_khz,
            flags,
        }
    }

    /// Write the shadowed fields back into `config`.
    pub fn apply(&self, config: &mut Config) {
        config.basic_mode = self.basic_mode;
        config.cpu_clock_khz = self.cpu_clock_khz;
        config.high_resolution = self.flags & CFG_HIGH_RESOLUTION != 0;
        config.no_wait = self.flags & CFG_NO_WAIT != 0;
        config.cd_enabled = self.flags & CFG_CD_ENABLED != 0;
    }
}

/// A snapshot file: the header and the device state stream it wraps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub config: ConfigShadow,
    /// Device list stream, uncompressed.
    pub body: Vec<u8>,
}

impl Snapshot {
    pub fn new(config: ConfigShadow, body: Vec<u8>) -> Self {
        Self { config, body }
    }

    pub fn encode(&self, compress: bool) -> Result<Vec<u8>, SnapshotError> {
        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.body)?;
            encoder.finish()?
        } else {
            self.body.clone()
        };
        let flags = if compress { FLAG_COMPRESSED } else { 0 };

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION_MAJOR);
        out.push(VERSION_MINOR);
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.config.basic_mode.to_le_bytes());
        out.extend_from_slice(&self.config.cpu_clock_khz.to_le_bytes());
        out.extend_from_slice(&self.config.flags.to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        tracing::debug!(
            "[SNAP] Encoded {} bytes ({} body, compressed: {})",
            out.len(),
            self.body.len(),
            compress
        );
        Ok(out)
    }

    /// Parse a snapshot file. A newer minor version is accepted, a different
    /// major version is not.
    pub fn decode(data: &[u8]) -> Result<Self, SnapshotError> {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        if data.len() < HEADER_SIZE {
            return Err(SnapshotError::Truncated);
        }
        let (major, minor) = (data[16], data[17]);
        if major != VERSION_MAJOR {
            return Err(SnapshotError::Version { major, minor });
        }
        if minor > VERSION_MINOR {
            tracing::info!("[SNAP] Reading newer snapshot {}.{}", major, minor);
        }
        let flags = u16::from_le_bytes([data[18], data[19]]);
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let config = ConfigShadow {
            basic_mode: word(20),
            cpu_clock_khz: word(24),
            flags: word(28),
        };
        let body_len = word(32) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(SnapshotError::TooLarge(body_len));
        }
        let payload = &data[HEADER_SIZE..];

        let body = if flags & FLAG_COMPRESSED != 0 {
            // one byte past the announced length is enough to reject it
            let mut body = Vec::new();
            ZlibDecoder::new(payload)
                .take(body_len as u64 + 1)
                .read_to_end(&mut body)?;
            body
        } else {
            payload.to_vec()
        };
        if body.len() != body_len {
            return Err(SnapshotError::BodyLength {
                expected: body_len,
                found: body.len(),
            });
        }
        Ok(Self { config, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let config = Config {
            cpu_clock_khz: 7987,
            high_resolution: true,
            ..Config::default()
        };
        Snapshot::new(ConfigShadow::of(&config), vec![0x42; 300])
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode(false).unwrap();
        assert_eq!(&bytes[..16], MAGIC);
        assert_eq!(bytes[16], VERSION_MAJOR);
        assert_eq!(&bytes[18..20], &[0, 0]);
        assert_eq!(&bytes[24..28], &7987u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &CFG_HIGH_RESOLUTION.to_le_bytes());
        assert_eq!(&bytes[32..36], &300u32.to_le_bytes());
        assert_eq!(bytes.len(), HEADER_SIZE + 300);
    }

    #[test]
    fn test_compressed_body() {
        let snap = sample();
        let bytes = snap.encode(true).unwrap();
        assert!(bytes.len() < HEADER_SIZE + 300);
        assert_eq!(Snapshot::decode(&bytes).unwrap(), snap);
    }

    #[test]
    fn test_version_checks() {
        let mut bytes = sample().encode(false).unwrap();
        bytes[17] = VERSION_MINOR + 1;
        assert!(Snapshot::decode(&bytes).is_ok());

        bytes[16] = VERSION_MAJOR + 1;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::Version { major: 2, .. })
        ));
    }

    #[test]
    fn test_damaged_files() {
        assert!(matches!(Snapshot::decode(b"nope"), Err(SnapshotError::BadMagic)));
        let bytes = sample().encode(false).unwrap();
        assert!(matches!(
            Snapshot::decode(&bytes[..20]),
            Err(SnapshotError::Truncated)
        ));
        assert!(matches!(
            Snapshot::decode(&bytes[..100]),
            Err(SnapshotError::BodyLength { expected: 300, found: 64 })
        ));
    }

    #[test]
    fn test_inflated_body_is_bounded_by_header() {
        let mut bytes = sample().encode(true).unwrap();
        bytes[32..36].copy_from_slice(&16u32.to_le_bytes());
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::BodyLength { expected: 16, found: 17 })
        ));

        bytes[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(SnapshotError::TooLarge(len)) if len == u32::MAX as usize
        ));
    }

    #[test]
    fn test_config_shadow_apply() {
        let mut config = Config::default();
        sample().config.apply(&mut config);
        assert_eq!(config.cpu_clock_khz, 7987);
        assert!(config.high_resolution);
        assert!(!config.no_wait);
    }
}
