//! Fixed-layout persisted configuration.
//!
//! Every field lives in its own slot at a fixed offset of a small byte image
//! and is NUL-terminated within that slot. Fresh flash reads back as `0xFF`,
//! an erased image as `0x00`; both decode to an empty string.

use log::warn;

use crate::{
    config::{DeviceConfig, NetworkCredentials, RemoteCredentials, ScheduleConfig},
    error::StoreError,
};

pub const STORE_SIZE: usize = 256;
pub const CONFIGURED_MAGIC: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub len: usize,
}

impl Slot {
    const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

pub const SLOT_WIFI_SSID: Slot = Slot::new(0, 33);
pub const SLOT_WIFI_PASSWORD: Slot = Slot::new(33, 65);
pub const SLOT_API_KEY: Slot = Slot::new(98, 65);
pub const SLOT_ATHLETE_ID: Slot = Slot::new(163, 17);
pub const SLOT_CONFIGURED: Slot = Slot::new(180, 1);
pub const SLOT_SCHEDULE_TIME: Slot = Slot::new(181, 6);
pub const SLOT_UTC_OFFSET: Slot = Slot::new(187, 4);

/// Byte-addressable durable storage. Writes may be buffered until `commit`.
pub trait ByteStore {
    fn len(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
    fn erase(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAM image of the store. Platform stores wrap one of these and flush it on commit.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A never-written image, as fresh flash reads.
    pub fn new() -> Self {
        Self {
            bytes: vec![0xFF; STORE_SIZE],
        }
    }

    /// Loads a previously flushed image; short images are padded as unwritten.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = vec![0xFF; STORE_SIZE];
        let len = raw.len().min(STORE_SIZE);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), StoreError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(StoreError::OutOfBounds { offset, len }),
        }
    }
}

impl ByteStore for MemoryStore {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.check(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        self.bytes.fill(0);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct ConfigStore<S> {
    backend: S,
}

impl<S: ByteStore> ConfigStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn load(&self) -> DeviceConfig {
        let mut config = DeviceConfig {
            network: self.load_network(),
            remote: RemoteCredentials {
                api_key: self.read_slot(SLOT_API_KEY),
                athlete_id: self.read_slot(SLOT_ATHLETE_ID),
            },
            schedule: self.load_schedule(),
        };
        config.sanitize();
        config
    }

    /// Station credentials are only trusted once the configured flag is set.
    pub fn load_network(&self) -> NetworkCredentials {
        let mut flag = [0_u8; 1];
        if let Err(err) = self.backend.read(SLOT_CONFIGURED.offset, &mut flag) {
            warn!("failed to read configured flag: {err}");
            return NetworkCredentials::default();
        }
        if flag[0] != CONFIGURED_MAGIC {
            return NetworkCredentials::default();
        }

        NetworkCredentials {
            ssid: self.read_slot(SLOT_WIFI_SSID),
            password: self.read_slot(SLOT_WIFI_PASSWORD),
        }
    }

    fn load_schedule(&self) -> ScheduleConfig {
        let mut schedule = ScheduleConfig::default();
        if let Some((hour, minute)) = ScheduleConfig::parse_time(&self.read_slot(SLOT_SCHEDULE_TIME))
        {
            schedule.hour = hour;
            schedule.minute = minute;
        }
        if let Some(offset) = ScheduleConfig::parse_offset(&self.read_slot(SLOT_UTC_OFFSET)) {
            schedule.utc_offset_hours = offset;
        }
        schedule
    }

    pub fn save_network(&mut self, creds: &NetworkCredentials) -> Result<(), StoreError> {
        self.write_slot(SLOT_WIFI_SSID, creds.ssid.trim())?;
        self.write_slot(SLOT_WIFI_PASSWORD, &creds.password)?;
        self.backend
            .write(SLOT_CONFIGURED.offset, &[CONFIGURED_MAGIC])?;
        self.backend.commit()
    }

    pub fn save_remote(&mut self, creds: &RemoteCredentials) -> Result<(), StoreError> {
        self.write_slot(SLOT_API_KEY, &creds.api_key)?;
        self.write_slot(SLOT_ATHLETE_ID, &creds.athlete_id)?;
        self.backend.commit()
    }

    pub fn save_schedule(&mut self, schedule: &ScheduleConfig) -> Result<(), StoreError> {
        self.write_slot(SLOT_SCHEDULE_TIME, &schedule.time_string())?;
        self.write_slot(SLOT_UTC_OFFSET, &schedule.offset_string())?;
        self.backend.commit()
    }

    pub fn erase_all(&mut self) -> Result<(), StoreError> {
        self.backend.erase()?;
        self.backend.commit()
    }

    fn read_slot(&self, slot: Slot) -> String {
        let mut raw = vec![0_u8; slot.len];
        if let Err(err) = self.backend.read(slot.offset, &mut raw) {
            warn!("failed to read store slot at {}: {err}", slot.offset);
            return String::new();
        }
        if raw[0] == 0xFF {
            return String::new();
        }

        let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    fn write_slot(&mut self, slot: Slot, value: &str) -> Result<(), StoreError> {
        let mut end = value.len().min(slot.len - 1);
        while !value.is_char_boundary(end) {
            end -= 1;
        }

        let mut raw = vec![0_u8; slot.len];
        raw[..end].copy_from_slice(&value.as_bytes()[..end]);
        self.backend.write(slot.offset, &raw)
    }
}
