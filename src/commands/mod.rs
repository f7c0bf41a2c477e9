pub mod format;
pub mod io;
pub mod list;
pub mod set_option;

pub use format::cmd_format;
pub use io::cmd_io;
pub use list::cmd_list;
pub use set_option::cmd_set_option;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bcache_core::io::FileDevice;
use bcache_core::BlockDevice;

/// Open a regular file or block device as an engine device.
pub fn open_device(path: &Path) -> Result<Arc<dyn BlockDevice>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let dev = FileDevice::open(file).with_context(|| format!("sizing {}", path.display()))?;
    Ok(Arc::new(dev))
}
