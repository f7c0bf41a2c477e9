use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::info;

use bcache_core::io::SECTOR_SHIFT;
use bcache_core::request::TaskHint;
use bcache_core::{
    cached_dev_submit_bio, Bio, BlockDevice, CacheSet, MemDevice, Registry,
};

use crate::util::{fmt_bytes_human, parse_human_size};

/// Exercise the request pipeline: format, attach, run a workload, report.
#[derive(Parser, Debug)]
pub struct Cli {
    /// Cache device file(s); omit for an in-memory cache
    #[arg(long)]
    cache: Vec<PathBuf>,

    /// Backing device file; omit for an in-memory backing device
    #[arg(long)]
    backing: Option<PathBuf>,

    /// In-memory cache size, when no --cache is given
    #[arg(long, default_value = "16M")]
    cache_size: String,

    /// In-memory backing size, when no --backing is given
    #[arg(long, default_value = "64M")]
    backing_size: String,

    /// Bucket size
    #[arg(long, default_value = "64k")]
    bucket_size: String,

    /// Cache mode: writethrough, writeback, writearound, none
    #[arg(long, default_value = "writethrough")]
    mode: String,

    /// Runtime options, key=value; routed to the cache set or the
    /// attached device by key
    #[arg(long = "option", short = 'o')]
    options: Vec<String>,

    /// Number of write I/Os
    #[arg(long, default_value_t = 256)]
    writes: u64,

    /// I/O size
    #[arg(long, default_value = "64k")]
    io_size: String,

    /// Sequential offsets instead of strided
    #[arg(long)]
    sequential: bool,

    /// Read everything back and verify
    #[arg(long)]
    verify: bool,

    /// Wait for background writeback to drain before reporting
    #[arg(long)]
    drain: bool,

    /// Dump statistics as JSON
    #[arg(long)]
    json: bool,

    /// Dump the journal debug log
    #[arg(long)]
    journal: bool,
}

fn apply_option(cs: &CacheSet, dc: &bcache_core::CachedDev, spec: &str) -> Result<()> {
    let (key, val) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("option must be key=value: {spec}"))?;
    if dc.opts.set(key, val).is_ok() || cs.opts.set(key, val).is_ok() {
        return Ok(());
    }
    for ca in cs.caches_iter() {
        if ca.set_option(key, val).is_ok() {
            return Ok(());
        }
    }
    bail!("unknown option {key}")
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761).wrapping_add(seed) >> 3) as u8)
        .collect()
}

pub fn cmd_io(registry: &Registry, argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let bucket_sectors = (parse_human_size(&cli.bucket_size)? >> 9) as u32;
    let io_sectors = (parse_human_size(&cli.io_size)? >> 9) as u32;
    if io_sectors == 0 {
        bail!("io size below one sector");
    }

    let cache_devs: Vec<Arc<dyn BlockDevice>> = if cli.cache.is_empty() {
        let sectors = parse_human_size(&cli.cache_size)? >> 9;
        vec![Arc::new(MemDevice::new(sectors))]
    } else {
        cli.cache
            .iter()
            .map(|p| super::open_device(p))
            .collect::<Result<_>>()?
    };
    let backing_dev: Arc<dyn BlockDevice> = match &cli.backing {
        Some(p) => super::open_device(p)?,
        None => {
            let sectors = parse_human_size(&cli.backing_size)? >> 9;
            Arc::new(MemDevice::new(sectors))
        }
    };

    let cs = CacheSet::create(
        cache_devs,
        bucket_sectors,
        bcache_core::btree::cache::DEFAULT_CAPACITY,
    )?;
    registry.register(cs.clone());
    let dc = CacheSet::attach(&cs, backing_dev, "backing0")?;
    dc.opts.set("cache_mode", &cli.mode)?;
    for spec in &cli.options {
        apply_option(&cs, &dc, spec)?;
    }

    let backing_sectors = dc.capacity_sectors();
    let span = backing_sectors.saturating_sub(io_sectors as u64);
    let task = TaskHint::default();
    let t0 = Instant::now();

    for i in 0..cli.writes {
        let sector = if cli.sequential {
            (i * io_sectors as u64) % span.max(1)
        } else {
            i.wrapping_mul(2654435761)
                .wrapping_mul(io_sectors as u64)
                % span.max(1)
        };
        let sector = sector - sector % 8;
        let data = payload((io_sectors as usize) << SECTOR_SHIFT, sector);
        let mut bio = Bio::write(sector, data);
        cached_dev_submit_bio(&cs, &dc, &mut bio, Some(&task))?;

        if cli.verify {
            let mut rd = Bio::read(sector, io_sectors);
            cached_dev_submit_bio(&cs, &dc, &mut rd, Some(&task))?;
            if rd.data != payload((io_sectors as usize) << SECTOR_SHIFT, sector) {
                bail!("verify failed at sector {sector}");
            }
        }
    }
    let elapsed = t0.elapsed();

    if cli.drain {
        let deadline = Instant::now() + Duration::from_secs(60);
        while dc.dirty_sectors() > 0 {
            if Instant::now() > deadline {
                bail!("writeback did not drain");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    info!(
        "{} writes of {} in {:.2?}",
        cli.writes,
        fmt_bytes_human((io_sectors as u64) << SECTOR_SHIFT),
        elapsed
    );

    let snap = cs.stats.snapshot();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snap)?);
    } else {
        println!("cache hits:\t\t{}", snap.cache_hits);
        println!("cache misses:\t\t{}", snap.cache_misses);
        println!("hit ratio:\t\t{}%", snap.cache_hit_ratio);
        println!("bypassed:\t\t{}", fmt_bytes_human(snap.sectors_bypassed << SECTOR_SHIFT));
        println!("sequential bypasses:\t{}", snap.bypass_sequential);
        println!("congestion bypasses:\t{}", snap.bypass_congested);
        println!("read races:\t\t{}", snap.cache_read_races);
        println!("dirty data:\t\t{}", fmt_bytes_human(dc.dirty_sectors() << SECTOR_SHIFT));

        for ca in cs.caches_iter() {
            let b = ca.bucket_stats();
            println!(
                "dev {}: free {} open {} cached {} dirty {} btree {} meta {}",
                ca.dev_idx, b.free, b.open, b.cached, b.dirty, b.btree, b.meta
            );
            let depths = ca.alloc.reserve_depths();
            println!(
                "dev {}: reserves prio {} btree {} movinggc {} none {}",
                ca.dev_idx, depths[0], depths[1], depths[2], depths[3]
            );

            let prios: Vec<u64> = {
                let buckets = ca.buckets.read();
                buckets
                    .iter()
                    .map(|b| b.prio[bcache_core::buckets::READ] as u64)
                    .collect()
            };
            let q = bcache_core::stats::quantiles(prios);
            println!("dev {}: read prio quantiles {:?}", ca.dev_idx, &q[..8]);

            let frag: Vec<u64> = {
                let buckets = ca.buckets.read();
                buckets.iter().map(|b| b.sectors_used() as u64).collect()
            };
            let q = bcache_core::stats::quantiles(frag);
            println!("dev {}: bucket fill quantiles {:?}", ca.dev_idx, &q[..8]);
        }

        let ts = bcache_core::stats::tree_stats(&cs);
        println!(
            "btree: {} nodes, {} keys, avg key size {}, {}% used",
            ts.nodes,
            ts.live_keys,
            fmt_bytes_human(ts.average_key_size << SECTOR_SHIFT),
            ts.btree_used_percent
        );
    }

    if cli.journal {
        print!("{}", cs.journal.debug_dump());
    }

    cs.stop();
    Ok(())
}
