// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Shared-memory status block.
//!
//! The daemon publishes its state through a small memory-mapped file next
//! to the pid file, so that status queries work without waking the daemon.
//! The record carries its size and a duplicated CRC32; readers accept the
//! block only when all three agree. On shutdown the writer zeroes the size
//! and bumps one CRC so that stale readers notice and re-open.

use {
    amlogic_afr_protocols::{Error, Result},
    memmap2::MmapMut,
    std::{
        fs::{self, OpenOptions},
        path::{Path, PathBuf},
    },
    tracing::warn,
};

/// File name of the status block, placed in the directory of the pid file.
pub const IPC_FILE_NAME: &str = "afr.ipc";

const BLOCK_SIZE: usize = 60;

const OFFS_SIZE: usize = 0;
const OFFS_VERSION: usize = 4;
const OFFS_VER_SUFFIX: usize = 8;
const OFFS_BDATE: usize = 16;
const OFFS_ENABLED: usize = 40;
const OFFS_SWITCHED: usize = 41;
const OFFS_BLACKENED: usize = 42;
const OFFS_CURRENT_HZ: usize = 44;
const OFFS_ORIGINAL_HZ: usize = 48;
const OFFS_CRC32: usize = 52;
const OFFS_CRC32_COPY: usize = 56;

pub fn build_date() -> &'static str {
    option_env!("AFR_BUILD_DATE").unwrap_or("unknown")
}

pub fn version() -> (u8, u8, u8) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// The state fields published by the service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub enabled: bool,
    pub switched: bool,
    pub blackened: bool,
    pub current_hz: i32,
    pub original_hz: i32,
}

/// A validated status block read back from the file.
#[derive(Debug)]
pub struct StatusRecord {
    pub version: (u8, u8, u8),
    pub build_date: String,
    pub status: ServiceStatus,
    pub crc32: u32,
}

fn serialize_u32(val: u32, raw: &mut [u8], offset: usize) {
    raw[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
}

fn deserialize_u32(raw: &[u8], offset: usize) -> u32 {
    let mut quadlet = [0; 4];
    quadlet.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_ne_bytes(quadlet)
}

fn serialize_label(label: &str, raw: &mut [u8], offset: usize, len: usize) {
    let bytes = label.as_bytes();
    let count = bytes.len().min(len);
    raw[offset..offset + count].copy_from_slice(&bytes[..count]);
}

fn deserialize_label(raw: &[u8], offset: usize, len: usize) -> String {
    let field = &raw[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn block_crc(raw: &[u8]) -> u32 {
    crc32fast::hash(&raw[..OFFS_CRC32])
}

/// The writer side of the status block. Dropping it invalidates the block
/// and removes the file.
pub struct ShmemWriter {
    map: MmapMut,
    path: PathBuf,
}

impl ShmemWriter {
    pub fn create(dir: &Path) -> Result<ShmemWriter> {
        if !dir.exists() {
            let _ = fs::create_dir_all(dir);
        }

        let path = dir.join(IPC_FILE_NAME);
        let label = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|err| Error::transient_io(&label, err))?;
        file.set_len(BLOCK_SIZE as u64)
            .map_err(|err| Error::transient_io(&label, err))?;

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|err| Error::transient_io(&label, err))?;

        Ok(ShmemWriter { map, path })
    }

    /// Publish a new state; returns the CRC32 stamp of the block.
    pub fn update(&mut self, status: &ServiceStatus) -> u32 {
        let mut block = [0u8; BLOCK_SIZE];

        serialize_u32(BLOCK_SIZE as u32, &mut block, OFFS_SIZE);
        let (major, minor, micro) = version();
        block[OFFS_VERSION] = major;
        block[OFFS_VERSION + 1] = minor;
        block[OFFS_VERSION + 2] = micro;
        serialize_label(env!("CARGO_PKG_VERSION"), &mut block, OFFS_VER_SUFFIX, 8);
        serialize_label(build_date(), &mut block, OFFS_BDATE, 24);
        block[OFFS_ENABLED] = status.enabled as u8;
        block[OFFS_SWITCHED] = status.switched as u8;
        block[OFFS_BLACKENED] = status.blackened as u8;
        serialize_u32(status.current_hz as u32, &mut block, OFFS_CURRENT_HZ);
        serialize_u32(status.original_hz as u32, &mut block, OFFS_ORIGINAL_HZ);

        let crc = block_crc(&block);
        serialize_u32(crc, &mut block, OFFS_CRC32);
        serialize_u32(crc, &mut block, OFFS_CRC32_COPY);

        self.map[..].copy_from_slice(&block);
        if let Err(err) = self.map.flush() {
            warn!("failed to sync status block: {}", err);
        }

        crc
    }

    // Force readers to re-open: zero the size, torque one CRC.
    fn finalize(&mut self) {
        let crc = deserialize_u32(&self.map, OFFS_CRC32);
        serialize_u32(0, &mut self.map, OFFS_SIZE);
        serialize_u32(crc.wrapping_add(1), &mut self.map, OFFS_CRC32);
        let _ = self.map.flush();
    }
}

impl Drop for ShmemWriter {
    fn drop(&mut self) {
        self.finalize();
        let _ = fs::remove_file(&self.path);
    }
}

/// Read and validate the status block left by a running service.
pub fn read(dir: &Path) -> Result<StatusRecord> {
    let path = dir.join(IPC_FILE_NAME);
    let label = path.display().to_string();

    let raw = fs::read(&path).map_err(|err| Error::transient_io(&label, err))?;
    if raw.len() < BLOCK_SIZE {
        return Err(Error::Parse(format!("status block too short: {}", raw.len())));
    }
    let raw = &raw[..BLOCK_SIZE];

    if deserialize_u32(raw, OFFS_SIZE) != BLOCK_SIZE as u32 {
        return Err(Error::Parse("status block size mismatch".to_string()));
    }

    let crc = deserialize_u32(raw, OFFS_CRC32);
    if crc != deserialize_u32(raw, OFFS_CRC32_COPY) || crc != block_crc(raw) {
        return Err(Error::Parse("status block checksum mismatch".to_string()));
    }

    Ok(StatusRecord {
        version: (raw[OFFS_VERSION], raw[OFFS_VERSION + 1], raw[OFFS_VERSION + 2]),
        build_date: deserialize_label(raw, OFFS_BDATE, 24),
        status: ServiceStatus {
            enabled: raw[OFFS_ENABLED] != 0,
            switched: raw[OFFS_SWITCHED] != 0,
            blackened: raw[OFFS_BLACKENED] != 0,
            current_hz: deserialize_u32(raw, OFFS_CURRENT_HZ) as i32,
            original_hz: deserialize_u32(raw, OFFS_ORIGINAL_HZ) as i32,
        },
        crc32: crc,
    })
}
