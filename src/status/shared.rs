//! Shared Status Snapshot
//!
//! A fixed-layout, packed, version-prefixed record exposed to out-of-process
//! readers through a memory-mapped file. The byte layout is a compatibility
//! surface:
//!
//! ```text
//! offset  size  field
//! 0       4     magic      u32 LE  0x43455452
//! 4       4     version    u32 LE  1
//! 8       1     protection_active       u8
//! 9       4     active_incident_count   u32 LE
//! 13      4     total_incident_count    u32 LE
//! 17      4     total_event_count       u32 LE
//! 21      4     highest_risk_score      u32 LE
//! 25      8     engine_uptime_ms        u64 LE
//! 33      8     last_updated_ms         u64 LE
//! 41      1     process_monitor_active  u8
//! 42      1     file_monitor_active     u8
//! 43      1     network_monitor_active  u8
//! 44      1     registry_monitor_active u8
//! 45      32    engine_version          char[32], NUL-terminated
//! ```

use memmap2::{Mmap, MmapMut};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

pub const SHARED_STATUS_MAGIC: u32 = 0x4345_5452;
pub const SHARED_STATUS_VERSION: u32 = 1;
pub const SHARED_STATUS_SIZE: usize = 77;

const VERSION_FIELD_LEN: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedStatus {
    pub protection_active: bool,
    pub active_incident_count: u32,
    pub total_incident_count: u32,
    pub total_event_count: u32,
    pub highest_risk_score: u32,
    pub engine_uptime_ms: u64,
    pub last_updated_ms: u64,
    pub process_monitor_active: bool,
    pub file_monitor_active: bool,
    pub network_monitor_active: bool,
    pub registry_monitor_active: bool,
    pub engine_version: String,
}

impl SharedStatus {
    pub fn to_bytes(&self) -> [u8; SHARED_STATUS_SIZE] {
        let mut buf = [0u8; SHARED_STATUS_SIZE];
        buf[0..4].copy_from_slice(&SHARED_STATUS_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SHARED_STATUS_VERSION.to_le_bytes());
        buf[8] = self.protection_active as u8;
        buf[9..13].copy_from_slice(&self.active_incident_count.to_le_bytes());
        buf[13..17].copy_from_slice(&self.total_incident_count.to_le_bytes());
        buf[17..21].copy_from_slice(&self.total_event_count.to_le_bytes());
        buf[21..25].copy_from_slice(&self.highest_risk_score.to_le_bytes());
        buf[25..33].copy_from_slice(&self.engine_uptime_ms.to_le_bytes());
        buf[33..41].copy_from_slice(&self.last_updated_ms.to_le_bytes());
        buf[41] = self.process_monitor_active as u8;
        buf[42] = self.file_monitor_active as u8;
        buf[43] = self.network_monitor_active as u8;
        buf[44] = self.registry_monitor_active as u8;

        // NUL-terminated, truncated to 31 bytes of payload
        let version_bytes = self.engine_version.as_bytes();
        let len = version_bytes.len().min(VERSION_FIELD_LEN - 1);
        buf[45..45 + len].copy_from_slice(&version_bytes[..len]);
        buf
    }

    /// Parse a snapshot, validating magic and version first.
    pub fn from_bytes(buf: &[u8]) -> Option<SharedStatus> {
        if buf.len() < SHARED_STATUS_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let version = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        if magic != SHARED_STATUS_MAGIC || version != SHARED_STATUS_VERSION {
            return None;
        }

        let version_field = &buf[45..45 + VERSION_FIELD_LEN];
        let nul = version_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_FIELD_LEN);
        let engine_version = String::from_utf8_lossy(&version_field[..nul]).into_owned();

        Some(SharedStatus {
            protection_active: buf[8] != 0,
            active_incident_count: u32::from_le_bytes(buf[9..13].try_into().ok()?),
            total_incident_count: u32::from_le_bytes(buf[13..17].try_into().ok()?),
            total_event_count: u32::from_le_bytes(buf[17..21].try_into().ok()?),
            highest_risk_score: u32::from_le_bytes(buf[21..25].try_into().ok()?),
            engine_uptime_ms: u64::from_le_bytes(buf[25..33].try_into().ok()?),
            last_updated_ms: u64::from_le_bytes(buf[33..41].try_into().ok()?),
            process_monitor_active: buf[41] != 0,
            file_monitor_active: buf[42] != 0,
            network_monitor_active: buf[43] != 0,
            registry_monitor_active: buf[44] != 0,
            engine_version,
        })
    }
}

/// Writer side of the snapshot, owned by the supervising loop.
pub struct StatusWriter {
    mmap: MmapMut,
}

impl StatusWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(SHARED_STATUS_SIZE as u64)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        log::info!("Status snapshot mapped at {}", path.display());
        Ok(Self { mmap })
    }

    pub fn update(&mut self, status: &SharedStatus) -> io::Result<()> {
        self.mmap[..SHARED_STATUS_SIZE].copy_from_slice(&status.to_bytes());
        self.mmap.flush()
    }
}

/// Read-only view used by out-of-process clients.
pub struct StatusReader {
    mmap: Mmap,
}

impl StatusReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    /// `None` when the record fails magic/version validation.
    pub fn read(&self) -> Option<SharedStatus> {
        SharedStatus::from_bytes(&self.mmap)
    }
}
