//! Persisted configuration record.
//!
//! The device keeps one fixed-size record in emulated EEPROM: identity
//! strings, the session IV, the temperature alarm threshold and the
//! sequencer defaults, guarded by two check words. An invalid record resets
//! to factory defaults on open; an invalid tunables block resets only the
//! tunables. The image header describing the running firmware is a build
//! constant, not part of the mutable record.

mod file;

pub use file::FileNv;

use byteorder::{BigEndian, ByteOrder};
use tracing::{info, warn};

use crate::crypto::{Iv, IV_SIZE};
use crate::error::{Error, Result, StorageError};
use crate::hal::NvMemory;
use crate::types::{FirmwareVersion, TriggerMode};

/// Size of the encoded record.
pub const RECORD_SIZE: usize = 1024;

/// Maximum identity string length (the field keeps a terminator byte).
pub const IDENTITY_MAX: usize = 31;

/// Factory value for uninitialized identity strings.
pub const IDENTITY_DEFAULT: &str = "NOT_INITIALIZED";

const IDENTITY_FIELD: usize = 32;

/// Guards the whole record; a mismatch means uninitialized or corrupt
/// storage.
const RECORD_CHECK_WORD: u32 = 0x5A1D_C3B7;

/// Guards the tunables block. Changing this value in a firmware release
/// resets the tunables to factory defaults on the next boot.
const CONFIG_CHECK_WORD: u32 = 0x7E24_91AF;

const CONFIG_OFFSET: usize = 128;

/// Magic word opening the image header.
pub const IMAGE_MAGIC: u32 = 0x91C7_42E5;

/// Header describing the running firmware image.
///
/// The image length and content hash are stamped by the release tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub schema_major: u16,
    pub schema_minor: u16,
    pub image_length: u32,
    pub content_hash: [u8; 32],
    pub version: FirmwareVersion,
}

impl ImageHeader {
    pub fn current() -> Self {
        Self {
            magic: IMAGE_MAGIC,
            schema_major: 1,
            schema_minor: 0,
            image_length: 0,
            content_hash: [0; 32],
            version: FirmwareVersion::CURRENT,
        }
    }
}

/// Persisted sequencer and supply tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConfig {
    pub trigger_mode: TriggerMode,
    pub trigger_pulse_ms: u16,
    pub max_channels: u8,
    pub voltage_mv: u16,
    pub current_ma: u16,
    pub led_on_ms: u16,
    pub led_off_ms: u16,
}

impl Default for StoredConfig {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::Pulsed,
            trigger_pulse_ms: 20,
            max_channels: 3,
            voltage_mv: 5000,
            current_ma: 500,
            led_on_ms: 400,
            led_off_ms: 100,
        }
    }
}

/// The full persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub hw_id: String,
    pub serial: String,
    pub iv: Iv,
    pub temp_threshold_deci: i16,
    pub config: StoredConfig,
}

impl Default for StorageRecord {
    fn default() -> Self {
        Self {
            hw_id: IDENTITY_DEFAULT.into(),
            serial: IDENTITY_DEFAULT.into(),
            iv: Iv::FACTORY,
            temp_threshold_deci: 550,
            config: StoredConfig::default(),
        }
    }
}

impl StorageRecord {
    /// Encode to the fixed on-storage layout. Identity strings are clamped
    /// to the field width; the store's setters reject overlong values before
    /// they get here.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        BigEndian::write_u32(&mut buf[0..4], RECORD_CHECK_WORD);
        write_identity(&mut buf[4..4 + IDENTITY_FIELD], &self.hw_id);
        write_identity(&mut buf[36..36 + IDENTITY_FIELD], &self.serial);
        buf[68..68 + IV_SIZE].copy_from_slice(self.iv.as_bytes());
        BigEndian::write_i16(&mut buf[84..86], self.temp_threshold_deci);
        // 86..128 reserved

        let c = &mut buf[CONFIG_OFFSET..];
        BigEndian::write_u32(&mut c[0..4], CONFIG_CHECK_WORD);
        c[4] = self.config.trigger_mode.to_wire();
        BigEndian::write_u16(&mut c[5..7], self.config.trigger_pulse_ms);
        c[7] = self.config.max_channels;
        BigEndian::write_u16(&mut c[8..10], self.config.voltage_mv);
        BigEndian::write_u16(&mut c[10..12], self.config.current_ma);
        BigEndian::write_u16(&mut c[12..14], self.config.led_on_ms);
        BigEndian::write_u16(&mut c[14..16], self.config.led_off_ms);
        buf
    }

    /// Decode a record.
    ///
    /// Returns the record and whether the tunables block was intact; a
    /// broken tunables block comes back as factory defaults. A broken record
    /// check word is an error and the caller resets everything.
    pub fn decode(data: &[u8]) -> std::result::Result<(Self, bool), StorageError> {
        if data.len() < RECORD_SIZE {
            return Err(StorageError::LayoutMismatch {
                expected: RECORD_SIZE,
                got: data.len(),
            });
        }
        if BigEndian::read_u32(&data[0..4]) != RECORD_CHECK_WORD {
            return Err(StorageError::InvalidRecord);
        }

        let hw_id = read_identity(&data[4..4 + IDENTITY_FIELD]);
        let serial = read_identity(&data[36..36 + IDENTITY_FIELD]);
        let iv = Iv::from_slice(&data[68..68 + IV_SIZE])
            .map_err(|_| StorageError::InvalidRecord)?;
        let temp_threshold_deci = BigEndian::read_i16(&data[84..86]);

        let c = &data[CONFIG_OFFSET..];
        let (config, config_intact) = if BigEndian::read_u32(&c[0..4]) == CONFIG_CHECK_WORD {
            (
                StoredConfig {
                    trigger_mode: TriggerMode::from_wire(c[4]),
                    trigger_pulse_ms: BigEndian::read_u16(&c[5..7]),
                    max_channels: c[7],
                    voltage_mv: BigEndian::read_u16(&c[8..10]),
                    current_ma: BigEndian::read_u16(&c[10..12]),
                    led_on_ms: BigEndian::read_u16(&c[12..14]),
                    led_off_ms: BigEndian::read_u16(&c[14..16]),
                },
                true,
            )
        } else {
            (StoredConfig::default(), false)
        };

        Ok((
            Self {
                hw_id,
                serial,
                iv,
                temp_threshold_deci,
                config,
            },
            config_intact,
        ))
    }
}

fn write_identity(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(IDENTITY_MAX);
    field[..len].copy_from_slice(&bytes[..len]);
}

fn read_identity(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// The configuration store: one in-memory record synchronized with the
/// non-volatile medium.
///
/// Saves are synchronous and block the calling command handler; callers
/// apply a new value to a live subsystem only after the save succeeded.
pub struct ConfigStore {
    mem: Box<dyn NvMemory>,
    record: StorageRecord,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Open the store, resetting to factory defaults when the record or its
    /// tunables block fail their check words.
    ///
    /// A medium smaller than the record layout is a structural mismatch and
    /// fatal: the firmware and its storage partition disagree.
    pub fn open(mut mem: Box<dyn NvMemory>) -> Result<Self> {
        if mem.capacity() < RECORD_SIZE {
            return Err(Error::Storage(StorageError::LayoutMismatch {
                expected: RECORD_SIZE,
                got: mem.capacity(),
            }));
        }

        let mut buf = vec![0u8; RECORD_SIZE];
        mem.read(&mut buf)?;

        let mut store = match StorageRecord::decode(&buf) {
            Ok((record, true)) => Self { mem, record },
            Ok((record, false)) => {
                warn!("tunables block invalid, resetting to factory defaults");
                let mut store = Self { mem, record };
                store.save().map_err(fatal_save)?;
                store
            }
            Err(StorageError::InvalidRecord) => {
                info!("storage uninitialized, writing factory defaults");
                let mut store = Self {
                    mem,
                    record: StorageRecord::default(),
                };
                store.save().map_err(fatal_save)?;
                store
            }
            Err(e) => return Err(e.into()),
        };

        // paranoia costs one read: the record must load back
        store.load()?;
        Ok(store)
    }

    /// Re-read the record from the medium.
    pub fn load(&mut self) -> std::result::Result<(), StorageError> {
        let mut buf = vec![0u8; RECORD_SIZE];
        self.mem.read(&mut buf)?;
        let (record, _) = StorageRecord::decode(&buf)?;
        self.record = record;
        Ok(())
    }

    /// Write the record to the medium.
    pub fn save(&mut self) -> std::result::Result<(), StorageError> {
        self.mem.write(&self.record.encode())
    }

    pub fn record(&self) -> &StorageRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut StorageRecord {
        &mut self.record
    }

    pub fn hw_id(&self) -> &str {
        &self.record.hw_id
    }

    /// Persist a new hardware id. Unchanged values skip the write.
    pub fn set_hw_id(&mut self, value: &str) -> std::result::Result<(), StorageError> {
        if value.len() > IDENTITY_MAX {
            return Err(StorageError::IdentityTooLong(value.len()));
        }
        if self.record.hw_id != value {
            self.record.hw_id = value.into();
            self.save()?;
        }
        Ok(())
    }

    pub fn serial(&self) -> &str {
        &self.record.serial
    }

    /// Persist a new serial number. Unchanged values skip the write.
    pub fn set_serial(&mut self, value: &str) -> std::result::Result<(), StorageError> {
        if value.len() > IDENTITY_MAX {
            return Err(StorageError::IdentityTooLong(value.len()));
        }
        if self.record.serial != value {
            self.record.serial = value.into();
            self.save()?;
        }
        Ok(())
    }

    pub fn iv(&self) -> Iv {
        self.record.iv
    }

    /// Persist a new session IV for future sessions.
    pub fn set_iv(&mut self, iv: Iv) -> std::result::Result<(), StorageError> {
        if self.record.iv != iv {
            self.record.iv = iv;
            self.save()?;
        }
        Ok(())
    }
}

fn fatal_save(e: StorageError) -> Error {
    Error::Fatal(format!("factory-default save failed: {e}"))
}
