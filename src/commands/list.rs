use anyhow::Result;
use clap::Parser;

use bcache_core::Registry;

use crate::util::fmt_sectors_human;

/// List cache sets registered in this process.
#[derive(Parser, Debug)]
pub struct Cli {}

pub fn cmd_list(registry: &Registry, argv: Vec<String>) -> Result<()> {
    let _cli = Cli::parse_from(argv);

    let sets = registry.list();
    if sets.is_empty() {
        println!("no cache sets registered");
        return Ok(());
    }
    for cs in sets {
        println!("{}", cs.uuid);
        for ca in cs.caches_iter() {
            println!(
                "  dev {}: {} buckets of {}",
                ca.dev_idx,
                ca.nbuckets,
                fmt_sectors_human(ca.bucket_size as u64)
            );
        }
        for dc in cs.cached_devs() {
            println!(
                "  backing {} (inode {}): {}, {:?}",
                dc.label,
                dc.inode,
                fmt_sectors_human(dc.capacity_sectors()),
                dc.state(),
            );
        }
    }
    Ok(())
}
