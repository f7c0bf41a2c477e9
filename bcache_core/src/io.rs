//! Bios and block devices.
//!
//! Devices complete on the submitting thread; the pipeline measures latency
//! around `submit` for congestion accounting. Backends: an in-memory device
//! for tests and smoke runs, and a file-backed device.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;

use crate::errcode::{ErrCode, Result};

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

bitflags! {
    #[derive(Default)]
    pub struct BioFlags: u32 {
        const SYNC     = 1 << 0;
        const PREFLUSH = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
    Discard,
    Flush,
}

#[derive(Debug)]
pub struct Bio {
    pub op: BioOp,
    pub sector: u64,
    pub data: Vec<u8>,
    /// Sector count for data-less ops (discard).
    pub nr_sectors: u32,
    pub flags: BioFlags,
}

impl Bio {
    pub fn read(sector: u64, nr_sectors: u32) -> Bio {
        Bio {
            op: BioOp::Read,
            sector,
            data: vec![0u8; (nr_sectors as usize) << SECTOR_SHIFT],
            nr_sectors,
            flags: BioFlags::empty(),
        }
    }

    pub fn write(sector: u64, data: Vec<u8>) -> Bio {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        let nr_sectors = (data.len() >> SECTOR_SHIFT) as u32;
        Bio {
            op: BioOp::Write,
            sector,
            data,
            nr_sectors,
            flags: BioFlags::empty(),
        }
    }

    pub fn discard(sector: u64, nr_sectors: u32) -> Bio {
        Bio {
            op: BioOp::Discard,
            sector,
            data: Vec::new(),
            nr_sectors,
            flags: BioFlags::empty(),
        }
    }

    pub fn flush() -> Bio {
        Bio {
            op: BioOp::Flush,
            sector: 0,
            data: Vec::new(),
            nr_sectors: 0,
            flags: BioFlags::empty(),
        }
    }

    pub fn sectors(&self) -> u32 {
        self.nr_sectors
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + self.nr_sectors as u64
    }
}

pub trait BlockDevice: Send + Sync {
    fn size_sectors(&self) -> u64;
    fn submit(&self, bio: &mut Bio) -> Result<()>;
    fn supports_discard(&self) -> bool {
        false
    }
}

/// Submit and report elapsed microseconds, for the congestion metric.
pub fn submit_timed(dev: &dyn BlockDevice, bio: &mut Bio) -> (Result<()>, u64) {
    let start = Instant::now();
    let ret = dev.submit(bio);
    (ret, start.elapsed().as_micros() as u64)
}

/// RAM-backed device. Supports injected latency and one-shot failures for
/// congestion and error-path tests.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    size_sectors: u64,
    discard: bool,
    delay_us: AtomicU64,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
}

impl MemDevice {
    pub fn new(size_sectors: u64) -> MemDevice {
        MemDevice {
            data: Mutex::new(vec![0u8; (size_sectors as usize) << SECTOR_SHIFT]),
            size_sectors,
            discard: true,
            delay_us: AtomicU64::new(0),
            fail_reads: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
        }
    }

    pub fn set_delay_us(&self, us: u64) {
        self.delay_us.store(us, Ordering::Relaxed);
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl BlockDevice for MemDevice {
    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn supports_discard(&self) -> bool {
        self.discard
    }

    fn submit(&self, bio: &mut Bio) -> Result<()> {
        let delay = self.delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_micros(delay));
        }

        if bio.end_sector() > self.size_sectors {
            debug!("mem device: bio past end of device: {:?}", bio.op);
            return Err(ErrCode::IO);
        }

        let off = (bio.sector as usize) << SECTOR_SHIFT;
        match bio.op {
            BioOp::Read => {
                if Self::take_failure(&self.fail_reads) {
                    return Err(ErrCode::IO);
                }
                let data = self.data.lock();
                let len = bio.data.len();
                bio.data.copy_from_slice(&data[off..off + len]);
            }
            BioOp::Write => {
                if Self::take_failure(&self.fail_writes) {
                    return Err(ErrCode::IO);
                }
                let mut data = self.data.lock();
                data[off..off + bio.data.len()].copy_from_slice(&bio.data);
            }
            BioOp::Discard => {
                let len = (bio.nr_sectors as usize) << SECTOR_SHIFT;
                let mut data = self.data.lock();
                data[off..off + len].fill(0);
            }
            BioOp::Flush => {}
        }
        Ok(())
    }
}

/// File-backed device; sectors map 1:1 onto file offsets.
pub struct FileDevice {
    file: File,
    size_sectors: u64,
}

impl FileDevice {
    pub fn open(file: File) -> std::io::Result<FileDevice> {
        let len = file.metadata()?.len();
        Ok(FileDevice {
            file,
            size_sectors: len >> SECTOR_SHIFT,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn submit(&self, bio: &mut Bio) -> Result<()> {
        if bio.end_sector() > self.size_sectors {
            return Err(ErrCode::IO);
        }
        let off = bio.sector << SECTOR_SHIFT;
        let ret = match bio.op {
            BioOp::Read => self.file.read_exact_at(&mut bio.data, off),
            BioOp::Write => self.file.write_all_at(&bio.data, off),
            BioOp::Discard => {
                let zeroes = vec![0u8; (bio.nr_sectors as usize) << SECTOR_SHIFT];
                self.file.write_all_at(&zeroes, off)
            }
            BioOp::Flush => self.file.sync_data(),
        };
        ret.map_err(|e| {
            debug!("file device I/O error: {e}");
            ErrCode::IO
        })
    }
}

const ERROR_SHIFT: u32 = 20;

/// Moving-window error count with configurable half-life, fixed point so
/// the decay is smooth. `level` is the integer error count after decay.
pub struct IoErrorAccounting {
    /// Fixed-point error mass, `level << ERROR_SHIFT`.
    errors: AtomicU64,
    last: Mutex<Instant>,
}

impl IoErrorAccounting {
    pub fn new() -> IoErrorAccounting {
        IoErrorAccounting {
            errors: AtomicU64::new(0),
            last: Mutex::new(Instant::now()),
        }
    }

    fn decay(&self, halflife_us: u64) {
        if halflife_us == 0 {
            return;
        }
        let mut last = self.last.lock();
        let elapsed_us = last.elapsed().as_micros() as u64;
        if elapsed_us < halflife_us / 8 {
            return;
        }
        *last = Instant::now();
        let halvings = (elapsed_us as f64) / (halflife_us as f64);
        let cur = self.errors.load(Ordering::Relaxed);
        let decayed = ((cur as f64) * 0.5f64.powf(halvings)) as u64;
        self.errors.store(decayed, Ordering::Relaxed);
    }

    /// Count one error; returns the post-decay integer level.
    pub fn count_error(&self, halflife_us: u64) -> u64 {
        self.decay(halflife_us);
        let v = self
            .errors
            .fetch_add(1 << ERROR_SHIFT, Ordering::Relaxed)
            + (1 << ERROR_SHIFT);
        v >> ERROR_SHIFT
    }

    pub fn level(&self, halflife_us: u64) -> u64 {
        self.decay(halflife_us);
        self.errors.load(Ordering::Relaxed) >> ERROR_SHIFT
    }
}

impl Default for IoErrorAccounting {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_roundtrip() {
        let dev = MemDevice::new(64);
        let payload = vec![0xabu8; 2 * SECTOR_SIZE];
        let mut w = Bio::write(4, payload.clone());
        dev.submit(&mut w).unwrap();

        let mut r = Bio::read(4, 2);
        dev.submit(&mut r).unwrap();
        assert_eq!(r.data, payload);
    }

    #[test]
    fn mem_device_discard_zeroes() {
        let dev = MemDevice::new(64);
        let mut w = Bio::write(0, vec![0xffu8; SECTOR_SIZE]);
        dev.submit(&mut w).unwrap();
        let mut d = Bio::discard(0, 1);
        dev.submit(&mut d).unwrap();
        let mut r = Bio::read(0, 1);
        dev.submit(&mut r).unwrap();
        assert!(r.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn mem_device_bounds_check() {
        let dev = MemDevice::new(8);
        let mut r = Bio::read(7, 2);
        assert_eq!(dev.submit(&mut r), Err(ErrCode::IO));
    }

    #[test]
    fn injected_read_failures_are_one_shot() {
        let dev = MemDevice::new(8);
        dev.fail_next_reads(1);
        let mut r = Bio::read(0, 1);
        assert_eq!(dev.submit(&mut r), Err(ErrCode::IO));
        let mut r = Bio::read(0, 1);
        assert!(dev.submit(&mut r).is_ok());
    }

    #[test]
    fn file_device_roundtrip() {
        let f = tempfile::tempfile().unwrap();
        f.set_len(64 * SECTOR_SIZE as u64).unwrap();
        let dev = FileDevice::open(f).unwrap();

        let payload = vec![0x5au8; SECTOR_SIZE];
        let mut w = Bio::write(10, payload.clone());
        dev.submit(&mut w).unwrap();
        let mut r = Bio::read(10, 1);
        dev.submit(&mut r).unwrap();
        assert_eq!(r.data, payload);
    }

    #[test]
    fn error_accounting_counts_up() {
        let acct = IoErrorAccounting::new();
        // Long half-life: no visible decay within the test.
        for i in 1..=5 {
            assert_eq!(acct.count_error(60_000_000), i);
        }
        assert_eq!(acct.level(60_000_000), 5);
    }
}
