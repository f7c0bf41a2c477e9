use anyhow::{bail, Result};
use clap::Parser;

use bcache_core::opts::{CacheSetOpts, CachedDevOpts};

/// Validate a runtime option assignment and report its scope.
///
/// Options take effect on a running cache set (see `bcache io --option`);
/// this command checks the key and value against the option tables.
#[derive(Parser, Debug)]
pub struct Cli {
    /// Option name
    key: String,
    /// Option value
    value: String,
}

const CACHE_DEV_KEYS: &[&str] = &["discard", "cache_replacement_policy", "tier"];

pub fn cmd_set_option(argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let set_opts = CacheSetOpts::new();
    if set_opts.set(&cli.key, &cli.value).is_ok() {
        println!("cache set option: {}={}", cli.key, cli.value);
        return Ok(());
    }

    let dev_opts = CachedDevOpts::new();
    if dev_opts.set(&cli.key, &cli.value).is_ok() {
        println!("cached device option: {}={}", cli.key, cli.value);
        return Ok(());
    }

    if CACHE_DEV_KEYS.contains(&cli.key.as_str()) {
        println!("cache device option: {}={}", cli.key, cli.value);
        return Ok(());
    }

    if CacheSetOpts::KEYS.contains(&cli.key.as_str())
        || CachedDevOpts::KEYS.contains(&cli.key.as_str())
    {
        bail!("invalid value {:?} for option {}", cli.value, cli.key);
    }
    bail!("unknown option {}", cli.key)
}
