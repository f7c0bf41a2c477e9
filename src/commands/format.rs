use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use bcache_core::{CacheSet, Registry};

use crate::util::{fmt_sectors_human, parse_human_size};

/// Create a cache set over one or more cache devices.
#[derive(Parser, Debug)]
pub struct Cli {
    /// Bucket size (sectors of 512 bytes once parsed; accepts 64k, 1M, ...)
    #[arg(long, default_value = "64k")]
    bucket_size: String,

    /// Issue discards when buckets are invalidated
    #[arg(long)]
    discard: bool,

    /// Cache replacement policy
    #[arg(long, default_value = "lru")]
    cache_replacement_policy: String,

    /// Cache device(s)
    #[arg(required = true)]
    devices: Vec<PathBuf>,
}

pub fn cmd_format(registry: &Registry, argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let bucket_bytes = parse_human_size(&cli.bucket_size)?;
    if bucket_bytes < 4096 || !bucket_bytes.is_power_of_two() {
        bail!("bucket size must be a power of two >= 4k");
    }
    let bucket_sectors = (bucket_bytes >> 9) as u32;

    let mut devices = Vec::new();
    for path in &cli.devices {
        devices.push(super::open_device(path)?);
    }

    let cs = CacheSet::create(
        devices,
        bucket_sectors,
        bcache_core::btree::cache::DEFAULT_CAPACITY,
    )?;

    for ca in cs.caches_iter() {
        ca.set_option("cache_replacement_policy", &cli.cache_replacement_policy)?;
        if cli.discard {
            ca.set_option("discard", "1")?;
        }
    }

    println!("UUID:\t\t\t{}", cs.uuid);
    println!("bucket size:\t\t{}", fmt_sectors_human(bucket_sectors as u64));
    for (path, ca) in cli.devices.iter().zip(cs.caches_iter()) {
        println!(
            "dev {} ({}):\tnbuckets {} ({})",
            ca.dev_idx,
            path.display(),
            ca.nbuckets,
            fmt_sectors_human(ca.nbuckets * ca.bucket_size as u64),
        );
    }

    registry.register(cs.clone());
    cs.stop();
    Ok(())
}
