//! Runtime configuration.
//!
//! Options are plain atomics grouped by scope (cache set, cached device,
//! cache device) with a textual get/set surface on top, so the admin tool
//! can read and write them by name without knowing the types.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use strum_macros::{Display, EnumIter, EnumString};

use crate::errcode::ErrCode;

pub const TIER_MAX: u8 = 4;

/// `writeback_percent` ceiling for cached devices. Tiering reuses the same
/// controller without this clamp.
pub const WRITEBACK_PERCENT_MAX: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum CacheMode {
    Writethrough,
    Writeback,
    Writearound,
    None,
}

impl CacheMode {
    fn to_u8(self) -> u8 {
        match self {
            CacheMode::Writethrough => 0,
            CacheMode::Writeback => 1,
            CacheMode::Writearound => 2,
            CacheMode::None => 3,
        }
    }

    fn from_u8(v: u8) -> CacheMode {
        match v {
            0 => CacheMode::Writethrough,
            1 => CacheMode::Writeback,
            2 => CacheMode::Writearound,
            _ => CacheMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum CacheReplacementPolicy {
    Lru,
    Fifo,
    Random,
}

fn parse_bool(val: &str) -> Result<bool, ErrCode> {
    match val {
        "0" | "false" | "off" => Ok(false),
        "1" | "true" | "on" => Ok(true),
        _ => Err(ErrCode::IO),
    }
}

fn parse_u64(val: &str) -> Result<u64, ErrCode> {
    val.parse().map_err(|_| ErrCode::IO)
}

/// Cache-set scoped options.
pub struct CacheSetOpts {
    pub congested_read_threshold_us: AtomicU64,
    pub congested_write_threshold_us: AtomicU64,
    pub io_error_limit: AtomicU64,
    pub io_error_halflife_us: AtomicU64,
    pub tiering_enabled: AtomicBool,
    pub tiering_percent: AtomicU64,
    pub copy_gc_enabled: AtomicBool,
}

impl CacheSetOpts {
    pub fn new() -> CacheSetOpts {
        CacheSetOpts {
            congested_read_threshold_us: AtomicU64::new(2000),
            congested_write_threshold_us: AtomicU64::new(20000),
            io_error_limit: AtomicU64::new(8),
            io_error_halflife_us: AtomicU64::new(10_000_000),
            tiering_enabled: AtomicBool::new(false),
            tiering_percent: AtomicU64::new(40),
            copy_gc_enabled: AtomicBool::new(false),
        }
    }

    pub fn set(&self, key: &str, val: &str) -> Result<(), ErrCode> {
        match key {
            "congested_read_threshold_us" => self
                .congested_read_threshold_us
                .store(parse_u64(val)?, Ordering::Relaxed),
            "congested_write_threshold_us" => self
                .congested_write_threshold_us
                .store(parse_u64(val)?, Ordering::Relaxed),
            "io_error_limit" => self.io_error_limit.store(parse_u64(val)?, Ordering::Relaxed),
            "io_error_halflife" => self
                .io_error_halflife_us
                .store(parse_u64(val)?, Ordering::Relaxed),
            "tiering_enabled" => self.tiering_enabled.store(parse_bool(val)?, Ordering::Relaxed),
            "tiering_percent" => {
                let v = parse_u64(val)?;
                if v > 100 {
                    return Err(ErrCode::IO);
                }
                self.tiering_percent.store(v, Ordering::Relaxed)
            }
            "copy_gc_enabled" => self.copy_gc_enabled.store(parse_bool(val)?, Ordering::Relaxed),
            _ => return Err(ErrCode::IO),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let v = match key {
            "congested_read_threshold_us" => {
                self.congested_read_threshold_us.load(Ordering::Relaxed).to_string()
            }
            "congested_write_threshold_us" => {
                self.congested_write_threshold_us.load(Ordering::Relaxed).to_string()
            }
            "io_error_limit" => self.io_error_limit.load(Ordering::Relaxed).to_string(),
            "io_error_halflife" => self.io_error_halflife_us.load(Ordering::Relaxed).to_string(),
            "tiering_enabled" => (self.tiering_enabled.load(Ordering::Relaxed) as u8).to_string(),
            "tiering_percent" => self.tiering_percent.load(Ordering::Relaxed).to_string(),
            "copy_gc_enabled" => (self.copy_gc_enabled.load(Ordering::Relaxed) as u8).to_string(),
            _ => return None,
        };
        Some(v)
    }

    pub const KEYS: &'static [&'static str] = &[
        "congested_read_threshold_us",
        "congested_write_threshold_us",
        "io_error_limit",
        "io_error_halflife",
        "tiering_enabled",
        "tiering_percent",
        "copy_gc_enabled",
    ];
}

impl Default for CacheSetOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached-device (backing device) scoped options.
pub struct CachedDevOpts {
    cache_mode: AtomicU8,
    /// Bytes of contiguous run above which requests bypass the cache.
    pub sequential_cutoff: AtomicU64,
    /// Sectors to prefetch on a cache miss.
    pub readahead: AtomicU64,
    pub writeback_percent: AtomicU64,
    pub writeback_running: AtomicBool,
    pub bypass_torture_test: AtomicBool,
}

impl CachedDevOpts {
    pub fn new() -> CachedDevOpts {
        CachedDevOpts {
            cache_mode: AtomicU8::new(CacheMode::Writethrough.to_u8()),
            sequential_cutoff: AtomicU64::new(4 << 20),
            readahead: AtomicU64::new(0),
            writeback_percent: AtomicU64::new(10),
            writeback_running: AtomicBool::new(true),
            bypass_torture_test: AtomicBool::new(false),
        }
    }

    pub fn cache_mode(&self) -> CacheMode {
        CacheMode::from_u8(self.cache_mode.load(Ordering::Relaxed))
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        self.cache_mode.store(mode.to_u8(), Ordering::Relaxed);
    }

    pub fn set(&self, key: &str, val: &str) -> Result<(), ErrCode> {
        match key {
            "cache_mode" => {
                let mode = CacheMode::from_str(val).map_err(|_| ErrCode::IO)?;
                self.set_cache_mode(mode)
            }
            "sequential_cutoff" => self
                .sequential_cutoff
                .store(parse_u64(val)?, Ordering::Relaxed),
            "readahead" => self.readahead.store(parse_u64(val)?, Ordering::Relaxed),
            "writeback_percent" => {
                let v = parse_u64(val)?.min(WRITEBACK_PERCENT_MAX);
                self.writeback_percent.store(v, Ordering::Relaxed)
            }
            "writeback_running" => self
                .writeback_running
                .store(parse_bool(val)?, Ordering::Relaxed),
            "bypass_torture_test" => self
                .bypass_torture_test
                .store(parse_bool(val)?, Ordering::Relaxed),
            _ => return Err(ErrCode::IO),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let v = match key {
            "cache_mode" => self.cache_mode().to_string(),
            "sequential_cutoff" => self.sequential_cutoff.load(Ordering::Relaxed).to_string(),
            "readahead" => self.readahead.load(Ordering::Relaxed).to_string(),
            "writeback_percent" => self.writeback_percent.load(Ordering::Relaxed).to_string(),
            "writeback_running" => {
                (self.writeback_running.load(Ordering::Relaxed) as u8).to_string()
            }
            "bypass_torture_test" => {
                (self.bypass_torture_test.load(Ordering::Relaxed) as u8).to_string()
            }
            _ => return None,
        };
        Some(v)
    }

    pub const KEYS: &'static [&'static str] = &[
        "cache_mode",
        "sequential_cutoff",
        "readahead",
        "writeback_percent",
        "writeback_running",
        "bypass_torture_test",
    ];
}

impl Default for CachedDevOpts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_text_forms() {
        assert_eq!(CacheMode::from_str("writeback").unwrap(), CacheMode::Writeback);
        assert_eq!(CacheMode::Writearound.to_string(), "writearound");
        assert!(CacheMode::from_str("bogus").is_err());
    }

    #[test]
    fn writeback_percent_clamped() {
        let o = CachedDevOpts::new();
        o.set("writeback_percent", "99").unwrap();
        assert_eq!(o.get("writeback_percent").unwrap(), "40");
        o.set("writeback_percent", "25").unwrap();
        assert_eq!(o.get("writeback_percent").unwrap(), "25");
    }

    #[test]
    fn set_get_roundtrip() {
        let o = CachedDevOpts::new();
        o.set("cache_mode", "writeback").unwrap();
        assert_eq!(o.cache_mode(), CacheMode::Writeback);
        o.set("sequential_cutoff", "1048576").unwrap();
        assert_eq!(o.get("sequential_cutoff").unwrap(), "1048576");
        assert!(o.set("nonsense", "1").is_err());

        let s = CacheSetOpts::new();
        s.set("copy_gc_enabled", "1").unwrap();
        assert_eq!(s.get("copy_gc_enabled").unwrap(), "1");
        s.set("tiering_percent", "55").unwrap();
        assert!(s.set("tiering_percent", "101").is_err());
    }

    #[test]
    fn every_listed_key_gettable() {
        let s = CacheSetOpts::new();
        for k in CacheSetOpts::KEYS {
            assert!(s.get(k).is_some(), "missing {k}");
        }
        let d = CachedDevOpts::new();
        for k in CachedDevOpts::KEYS {
            assert!(d.get(k).is_some(), "missing {k}");
        }
    }
}
